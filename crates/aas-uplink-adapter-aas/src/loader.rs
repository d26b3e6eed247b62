//! AAS environment loader for JSON documents on disk.
//!
//! AASX container unpacking is out of scope; the watcher feeds this loader
//! with JSON environment serialisations.

use aas_uplink_core::aas::Environment;
use std::path::Path;

/// Errors loading an environment document.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// File could not be read
    #[error("failed to read {0}: {1}")]
    Read(String, String),
    /// Document could not be parsed
    #[error("failed to parse {0}: {1}")]
    Parse(String, String),
}

/// Load an AAS environment from a JSON file.
///
/// # Errors
///
/// Returns error when the file cannot be read or is not a valid environment
/// document.
pub fn load_environment(path: &Path) -> Result<Environment, LoaderError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| LoaderError::Read(path.display().to_string(), e.to_string()))?;
    let env: Environment = serde_json::from_str(&raw)
        .map_err(|e| LoaderError::Parse(path.display().to_string(), e.to_string()))?;

    tracing::debug!(
        path = %path.display(),
        shells = env.asset_administration_shells.len(),
        submodels = env.submodels.len(),
        "Loaded AAS environment"
    );
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_environment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"assetAdministrationShells": [], "submodels": [{{"id": "urn:x:sm"}}]}}"#
        )
        .unwrap();

        let env = load_environment(file.path()).unwrap();
        assert_eq!(env.submodels.len(), 1);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            load_environment(Path::new("/nonexistent/env.json")),
            Err(LoaderError::Read(_, _))
        ));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            load_environment(file.path()),
            Err(LoaderError::Parse(_, _))
        ));
    }
}
