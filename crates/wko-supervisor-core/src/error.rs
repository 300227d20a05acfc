// ABOUTME: Error types for configuration loading.
// ABOUTME: Validation findings are data (see report.rs); only loading failures are errors.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading or interpreting a configuration document.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not well-formed JSON/TOML.
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// The file extension is neither `.json` nor `.toml`.
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(PathBuf),

    /// The document has fatal problems that block every worker.
    #[error("configuration is invalid: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_lists_every_error() {
        let err = ConfigError::Invalid(vec![
            "Port range start must be less than end".to_string(),
            "Port conflict".to_string(),
        ]);
        let text = err.to_string();
        assert!(text.contains("Port range start"));
        assert!(text.contains("; Port conflict"));
    }

    #[test]
    fn test_unsupported_format_names_path() {
        let err = ConfigError::UnsupportedFormat(PathBuf::from("workers.yaml"));
        assert!(err.to_string().contains("workers.yaml"));
    }
}
