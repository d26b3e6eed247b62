//! Topic segment sanitisation for MQTT compliance.
//!
//! `+` and `#` are subscription wildcards and `/` is the level separator;
//! none may appear inside a published topic segment. Path segments are kept
//! verbatim in leaf records and only escaped here, at topic composition time.

/// Maximum length for a single topic segment.
pub const MAX_SEGMENT_LENGTH: usize = 64;

/// Fallback for segments that sanitise to nothing.
pub const UNNAMED: &str = "unnamed";

fn is_invalid(c: char) -> bool {
    matches!(c, '+' | '#' | '/' | '\0')
}

/// Sanitise a single topic segment.
///
/// Whitespace runs and MQTT special characters become `_`, consecutive
/// underscores collapse, leading/trailing underscores are stripped, and the
/// result is truncated to [`MAX_SEGMENT_LENGTH`] characters. Empty input
/// yields `"unnamed"`.
#[must_use]
pub fn sanitize_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut last_underscore = false;

    for c in segment.chars() {
        let mapped = if c.is_whitespace() || is_invalid(c) { '_' } else { c };
        if mapped == '_' {
            if last_underscore {
                continue;
            }
            last_underscore = true;
        } else {
            last_underscore = false;
        }
        out.push(mapped);
    }

    let trimmed: String = out.trim_matches('_').to_string();
    let truncated: String = trimmed.chars().take(MAX_SEGMENT_LENGTH).collect();
    let result = truncated.trim_end_matches('_').to_string();

    if result.is_empty() {
        UNNAMED.to_string()
    } else {
        result
    }
}

/// Sanitise an asset URI for use in system topics (`UNS/Sys/...`).
///
/// Strips URI schemes and replaces separators, so
/// `https://example.org/asset/pump-7` becomes `example.org_asset_pump-7`.
#[must_use]
pub fn sanitize_asset_id(asset_uri: &str) -> String {
    let stripped = asset_uri
        .strip_prefix("https://")
        .or_else(|| asset_uri.strip_prefix("http://"))
        .or_else(|| asset_uri.strip_prefix("urn:"))
        .unwrap_or(asset_uri);
    sanitize_segment(&stripped.replace([':', '/'], "_"))
}

/// Derive a default asset segment from the last path segment of an asset URI.
///
/// Used when the mapping configuration does not name the asset explicitly.
#[must_use]
pub fn asset_name_from_uri(asset_uri: &str) -> String {
    let tail = asset_uri.rsplit('/').next().unwrap_or(asset_uri);
    let tail = tail.rsplit('#').next().unwrap_or(tail);
    let tail = tail.rsplit(':').next().unwrap_or(tail);
    sanitize_segment(tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_becomes_underscore() {
        assert_eq!(sanitize_segment("My Device Name"), "My_Device_Name");
    }

    #[test]
    fn wildcards_are_escaped() {
        assert_eq!(sanitize_segment("Sensor+Temperature"), "Sensor_Temperature");
        assert_eq!(sanitize_segment("Level/SubLevel"), "Level_SubLevel");
        assert_eq!(sanitize_segment("a#b"), "a_b");
    }

    #[test]
    fn underscores_collapse_and_trim() {
        assert_eq!(sanitize_segment("__a  +  b__"), "a_b");
    }

    #[test]
    fn empty_becomes_unnamed() {
        assert_eq!(sanitize_segment(""), "unnamed");
        assert_eq!(sanitize_segment("///"), "unnamed");
    }

    #[test]
    fn long_segment_truncates() {
        let long = "x".repeat(200);
        assert_eq!(sanitize_segment(&long).chars().count(), MAX_SEGMENT_LENGTH);
    }

    #[test]
    fn asset_id_strips_scheme() {
        assert_eq!(
            sanitize_asset_id("https://example.org/asset/pump-7"),
            "example.org_asset_pump-7"
        );
        assert_eq!(sanitize_asset_id("urn:example:asset:1"), "example_asset_1");
    }

    #[test]
    fn asset_name_takes_uri_tail() {
        assert_eq!(asset_name_from_uri("https://example.org/assets/Robot7"), "Robot7");
        assert_eq!(asset_name_from_uri("urn:example:asset:pump1"), "pump1");
        assert_eq!(asset_name_from_uri("https://example.org/ids#Press02"), "Press02");
    }
}
