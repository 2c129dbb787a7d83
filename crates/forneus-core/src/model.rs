//! Model source locations.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Source location for a model or tokenizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelSource {
    /// HuggingFace Hub model.
    HuggingFace {
        /// Repository ID (e.g., "meta-llama/Llama-2-7b-hf").
        repo_id: String,
        /// Optional revision (branch, tag, or commit).
        revision: Option<String>,
    },
    /// Local filesystem path.
    LocalPath {
        /// Path to the model directory.
        path: PathBuf,
    },
}

impl ModelSource {
    /// Creates a HuggingFace source.
    #[must_use]
    pub fn huggingface(repo_id: impl Into<String>) -> Self {
        Self::HuggingFace {
            repo_id: repo_id.into(),
            revision: None,
        }
    }

    /// Creates a HuggingFace source with a specific revision.
    #[must_use]
    pub fn huggingface_rev(repo_id: impl Into<String>, revision: impl Into<String>) -> Self {
        Self::HuggingFace {
            repo_id: repo_id.into(),
            revision: Some(revision.into()),
        }
    }

    /// Creates a local path source.
    #[must_use]
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::LocalPath { path: path.into() }
    }

    /// Interprets a `name_or_path` string the way pretrained loaders do:
    /// an existing directory is local, anything else is a Hub repository id.
    #[must_use]
    pub fn from_name_or_path(name_or_path: &str) -> Self {
        let path = Path::new(name_or_path);
        if path.is_dir() {
            Self::local(path)
        } else {
            Self::huggingface(name_or_path)
        }
    }
}

impl std::fmt::Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HuggingFace {
                repo_id,
                revision: Some(rev),
            } => write!(f, "{repo_id}@{rev}"),
            Self::HuggingFace { repo_id, .. } => write!(f, "{repo_id}"),
            Self::LocalPath { path } => write!(f, "{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_or_path() {
        let dir = tempfile::tempdir().unwrap();
        let local = ModelSource::from_name_or_path(dir.path().to_str().unwrap());
        assert_eq!(local, ModelSource::local(dir.path()));

        let hub = ModelSource::from_name_or_path("meta-llama/Llama-2-7b-hf");
        assert_eq!(hub, ModelSource::huggingface("meta-llama/Llama-2-7b-hf"));
        assert_eq!(hub.to_string(), "meta-llama/Llama-2-7b-hf");
    }
}
