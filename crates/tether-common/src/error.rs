//! Infrastructure errors shared by the Tether crates.
//!
//! Component crates keep their own error enums and wrap this one for
//! settings and lifecycle failures.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A settings value is out of range or inconsistent with another.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The settings file exists but does not parse.
    #[error("malformed settings file {}: {source}", path.display())]
    Settings {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Broken invariant, usually after a worker panicked.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Whether the error came from the operator's settings rather than the
    /// runtime.
    pub fn is_settings_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Settings { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_errors_are_classified() {
        assert!(Error::config("refresh_hz must be positive").is_settings_error());
        assert!(!Error::internal("ingest state lost").is_settings_error());

        let source = serde_json::from_str::<u32>("nope").unwrap_err();
        let err = Error::Settings {
            path: PathBuf::from("/etc/tether.json"),
            source,
        };
        assert!(err.is_settings_error());
        assert!(err.to_string().starts_with("malformed settings file /etc/tether.json"));
    }
}
