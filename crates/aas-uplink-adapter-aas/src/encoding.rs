//! AAS Part 2 API encoding rules.
//!
//! Identifiers of Identifiables travel base64url-encoded without padding;
//! idShortPath elements are percent-encoded (square brackets are preserved
//! for list index notation).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

/// Characters percent-encoded inside an idShortPath element.
const PATH_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'\\');

/// Encode an AAS identifier for use in an API path.
#[must_use]
pub fn encode_identifier(id: &str) -> String {
    URL_SAFE_NO_PAD.encode(id.as_bytes())
}

/// Decode a base64url identifier.
///
/// # Errors
///
/// Returns error when the input is not valid base64url or not UTF-8.
pub fn decode_identifier(encoded: &str) -> Result<String, EncodingError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| EncodingError::Base64(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| EncodingError::Utf8(e.to_string()))
}

/// Percent-encode an idShortPath for use in an API path.
#[must_use]
pub fn encode_id_short_path(path: &str) -> String {
    utf8_percent_encode(path, PATH_ESCAPE).to_string()
}

/// Errors for identifier encoding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EncodingError {
    /// Input was not valid base64url
    #[error("base64 decode error: {0}")]
    Base64(String),
    /// Decoded bytes were not UTF-8
    #[error("UTF-8 decode error: {0}")]
    Utf8(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_roundtrip_without_padding() {
        for id in [
            "a",
            "urn:example:aas:asset1",
            "https://admin-shell.io/zvei/nameplate/2/0/Nameplate",
            "urn:example:with+plus/and/slashes",
        ] {
            let encoded = encode_identifier(id);
            assert!(!encoded.contains('='), "padding in {encoded}");
            assert!(!encoded.contains('+') && !encoded.contains('/'));
            assert_eq!(decode_identifier(&encoded).unwrap(), id);
        }
    }

    #[test]
    fn path_keeps_brackets_and_dots() {
        assert_eq!(
            encode_id_short_path("Components[0].SubComponents[1]"),
            "Components[0].SubComponents[1]"
        );
        assert_eq!(encode_id_short_path("TechnicalData.MaxTemperature"), "TechnicalData.MaxTemperature");
    }

    #[test]
    fn path_escapes_separators_and_spaces() {
        let encoded = encode_id_short_path("My Property/Sub<x>");
        assert!(encoded.contains("%20"));
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('<'));
    }

    #[test]
    fn invalid_base64_is_an_error() {
        assert!(decode_identifier("!!not-base64!!").is_err());
    }
}
