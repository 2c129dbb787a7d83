//! Error types for the Forneus toolkit.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the Forneus toolkit.
#[derive(Error, Debug)]
pub enum Error {
    /// Artifact address could not be resolved in the registry.
    #[error("Artifact not found: {address}")]
    ArtifactNotFound {
        /// The requested artifact address.
        address: String,
    },

    /// Registry-level failure (corrupt manifest, bad name, publish failure).
    #[error("Registry error: {message}")]
    Registry {
        /// Error message.
        message: String,
    },

    /// Model loading error.
    #[error("Failed to load model: {message}")]
    ModelLoad {
        /// Error message.
        message: String,
    },

    /// Tokenization error.
    #[error("Tokenization error: {message}")]
    Tokenization {
        /// Error message.
        message: String,
    },

    /// A named submodule was not present in the model.
    #[error("Module not found: no module path ends with `{name}`")]
    ModuleNotFound {
        /// The module name suffix that was searched for.
        name: String,
    },

    /// Tensor shapes did not line up.
    #[error("Shape mismatch: {message}")]
    ShapeMismatch {
        /// Description of the mismatch.
        message: String,
    },

    /// A metric was computed before any data was accumulated.
    #[error("Metric `{metric}` has no accumulated data")]
    EmptyMetric {
        /// Metric name.
        metric: String,
    },

    /// Invalid configuration provided.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration error.
        message: String,
    },

    /// Dataset could not be read from disk.
    #[error("Failed to load dataset: {message}")]
    DatasetLoad {
        /// Error message.
        message: String,
    },

    /// Tensor backend error.
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl Error {
    /// Creates an internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a model load error.
    #[must_use]
    pub fn model_load(message: impl Into<String>) -> Self {
        Self::ModelLoad {
            message: message.into(),
        }
    }

    /// Creates a tokenization error.
    #[must_use]
    pub fn tokenization(message: impl Into<String>) -> Self {
        Self::Tokenization {
            message: message.into(),
        }
    }

    /// Creates a registry error.
    #[must_use]
    pub fn registry(message: impl Into<String>) -> Self {
        Self::Registry {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Returns `true` if the error means a requested artifact or module is absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ArtifactNotFound { .. } | Self::ModuleNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = Error::ArtifactNotFound {
            address: "alpaca:latest".to_string(),
        };
        assert_eq!(err.to_string(), "Artifact not found: alpaca:latest");
        assert!(err.is_not_found());

        let err = Error::model_load("missing config.json");
        assert_eq!(err.to_string(), "Failed to load model: missing config.json");
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
