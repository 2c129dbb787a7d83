//! Artifact drafts and published versions.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use forneus_core::artifact::validate_name;
use forneus_core::{ArtifactType, Error, Result, RunId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A source path staged into an artifact draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactEntry {
    /// Every file below `path`, copied into the artifact root.
    Dir {
        /// Source directory.
        path: PathBuf,
    },
    /// A single file stored under `name`.
    File {
        /// Source file.
        path: PathBuf,
        /// File name inside the artifact.
        name: String,
    },
}

/// An artifact draft waiting to be published to a registry.
#[derive(Debug, Clone)]
pub struct Artifact {
    name: String,
    artifact_type: ArtifactType,
    description: Option<String>,
    metadata: Map<String, Value>,
    aliases: Vec<String>,
    entries: Vec<ArtifactEntry>,
}

impl Artifact {
    /// Creates an empty draft.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registry`] if `name` is not a valid artifact name.
    pub fn new(name: impl Into<String>, artifact_type: impl Into<ArtifactType>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            artifact_type: artifact_type.into(),
            description: None,
            metadata: Map::new(),
            aliases: Vec::new(),
            entries: Vec::new(),
        })
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Merges metadata into the draft.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Adds extra aliases; `latest` is always applied on publish.
    #[must_use]
    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    /// Stages the contents of a directory.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` is not a directory.
    pub fn add_dir(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(Error::registry(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        self.entries.push(ArtifactEntry::Dir {
            path: path.to_path_buf(),
        });
        Ok(())
    }

    /// Stages a single file, stored under its own file name.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` is not a file.
    pub fn add_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .filter(|_| path.is_file())
            .ok_or_else(|| Error::registry(format!("{} is not a file", path.display())))?
            .to_string_lossy()
            .into_owned();
        self.entries.push(ArtifactEntry::File {
            path: path.to_path_buf(),
            name,
        });
        Ok(())
    }

    /// Artifact name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Artifact type.
    #[must_use]
    pub fn artifact_type(&self) -> &ArtifactType {
        &self.artifact_type
    }

    /// Description, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Metadata.
    #[must_use]
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Extra aliases.
    #[must_use]
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// Staged sources.
    #[must_use]
    pub fn entries(&self) -> &[ArtifactEntry] {
        &self.entries
    }
}

/// A published, immutable artifact version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactVersion {
    /// Unique id of this version.
    pub id: Uuid,
    /// Artifact name.
    pub name: String,
    /// Version number, starting at 0.
    pub version: u32,
    /// Artifact type.
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    /// Description given at publish time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form metadata given at publish time.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Run that published this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<RunId>,
    /// Publish time.
    pub created_at: DateTime<Utc>,
    /// Aliases currently pointing at this version.
    #[serde(skip)]
    pub aliases: Vec<String>,
    /// Registry directory holding the version's files.
    #[serde(skip)]
    pub files_dir: PathBuf,
}

impl ArtifactVersion {
    /// `name:vN`.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}:v{}", self.name, self.version)
    }

    /// Metadata value as a string, if present and a string.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_name_is_rejected() {
        assert!(Artifact::new("bad name", ArtifactType::Model).is_err());
        assert!(Artifact::new("abc123_sft", ArtifactType::Model).is_ok());
    }

    #[test]
    fn test_add_dir_requires_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "x").unwrap();

        let mut artifact = Artifact::new("data", "dataset").unwrap();
        assert!(artifact.add_dir(&file).is_err());
        artifact.add_dir(dir.path()).unwrap();
        artifact.add_file(&file).unwrap();
        assert_eq!(artifact.entries().len(), 2);
        assert_eq!(artifact.artifact_type(), &ArtifactType::Dataset);
    }
}
