//! Settings-file loading.
//!
//! Component configs are plain `serde` structs owned by the crate that uses
//! them; this module only knows how to read one from disk.

use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::{Error, Result};

/// Read and deserialize a JSON settings file.
pub fn load_json_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)?;
    let config = serde_json::from_str(&raw).map_err(|source| Error::Settings {
        path: path.to_path_buf(),
        source,
    })?;
    info!("loaded settings from {}", path.display());
    Ok(config)
}

/// Like [`load_json_config`], but a missing path yields `T::default()`.
pub fn load_json_config_or_default<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match path {
        Some(path) => load_json_config(path),
        None => {
            debug!("no settings file given, using defaults");
            Ok(T::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        refresh_hz: f32,
        adaptive: bool,
    }

    fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("tether-{}-{name}", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_partial_settings_uses_defaults() {
        let path = temp_file("partial.json", r#"{ "adaptive": true }"#);
        let loaded: Sample = load_json_config(&path).unwrap();
        assert!(loaded.adaptive);
        assert_eq!(loaded.refresh_hz, 0.0);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_load_malformed_settings_is_settings_error() {
        let path = temp_file("broken.json", "{ not json");
        let result: Result<Sample> = load_json_config(&path);
        assert!(matches!(result, Err(Error::Settings { .. })));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_missing_path_defaults() {
        let loaded: Sample = load_json_config_or_default(None).unwrap();
        assert_eq!(loaded, Sample::default());
    }

    #[test]
    fn test_nonexistent_file_is_io_error() {
        let result: Result<Sample> =
            load_json_config(Path::new("/nonexistent/tether/settings.json"));
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
