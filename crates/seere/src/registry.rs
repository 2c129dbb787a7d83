//! Versioned artifact registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use forneus_core::{ArtifactAddress, ArtifactAlias, ArtifactType, Error, Result, RunId};
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::artifact::{Artifact, ArtifactEntry, ArtifactVersion};
use crate::run::RunRecord;

/// Storage backend for artifacts and run records.
pub trait ArtifactRegistry: Send + Sync {
    /// Resolves an address of the given type to a published version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArtifactNotFound`] if no such artifact or alias exists.
    fn resolve(&self, address: &ArtifactAddress, artifact_type: &ArtifactType) -> Result<ArtifactVersion>;

    /// Makes a local copy of a version's files and returns its directory.
    ///
    /// Repeated downloads of the same version reuse the cached copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be copied.
    fn download(&self, version: &ArtifactVersion) -> Result<PathBuf>;

    /// Publishes a draft as the next version of its artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be stored.
    fn publish(&self, artifact: &Artifact, producer: Option<&RunId>) -> Result<ArtifactVersion>;

    /// Reads a run record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registry`] if the run is unknown.
    fn run_record(&self, id: &RunId) -> Result<RunRecord>;

    /// Writes a run record, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn save_run_record(&self, record: &RunRecord) -> Result<()>;

    /// Directory that holds a run's history and media files.
    fn run_dir(&self, id: &RunId) -> PathBuf;
}

/// Filesystem registry rooted at a tracking directory.
///
/// ```text
/// <root>/artifacts/<type>/<name>/aliases.json
/// <root>/artifacts/<type>/<name>/v<N>/manifest.json
/// <root>/artifacts/<type>/<name>/v<N>/files/...
/// <root>/runs/<id>/run.json
/// <root>/cache/<name>-v<N>/...
/// ```
#[derive(Debug, Clone)]
pub struct LocalRegistry {
    root: PathBuf,
}

const ALIASES_FILE: &str = "aliases.json";
const MANIFEST_FILE: &str = "manifest.json";
const RUN_FILE: &str = "run.json";

impl LocalRegistry {
    /// Opens (creating if needed) a registry at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["artifacts", "runs", "cache"] {
            std::fs::create_dir_all(root.join(sub))?;
        }
        debug!(root = %root.display(), "Opened local registry");
        Ok(Self { root })
    }

    /// Registry root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_dir(&self, artifact_type: &ArtifactType, name: &str) -> PathBuf {
        self.root
            .join("artifacts")
            .join(artifact_type.as_str())
            .join(name)
    }

    fn read_aliases(dir: &Path) -> Result<BTreeMap<String, u32>> {
        let path = dir.join(ALIASES_FILE);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::registry(format!("corrupt {}: {e}", path.display())))
    }

    fn versions(dir: &Path) -> Result<Vec<u32>> {
        let mut versions = Vec::new();
        if !dir.exists() {
            return Ok(versions);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(n) = name
                .to_str()
                .and_then(|s| s.strip_prefix('v'))
                .and_then(|s| s.parse().ok())
            {
                versions.push(n);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    fn read_version(dir: &Path, version: u32, aliases: &BTreeMap<String, u32>) -> Result<ArtifactVersion> {
        let vdir = dir.join(format!("v{version}"));
        let content = std::fs::read_to_string(vdir.join(MANIFEST_FILE))?;
        let mut resolved: ArtifactVersion = serde_json::from_str(&content)
            .map_err(|e| Error::registry(format!("corrupt manifest in {}: {e}", vdir.display())))?;
        resolved.aliases = aliases
            .iter()
            .filter(|(_, v)| **v == version)
            .map(|(a, _)| a.clone())
            .collect();
        resolved.files_dir = vdir.join("files");
        Ok(resolved)
    }
}

impl ArtifactRegistry for LocalRegistry {
    fn resolve(&self, address: &ArtifactAddress, artifact_type: &ArtifactType) -> Result<ArtifactVersion> {
        let not_found = || Error::ArtifactNotFound {
            address: format!("{address} ({artifact_type})"),
        };
        let dir = self.artifact_dir(artifact_type, &address.name);
        if !dir.is_dir() {
            return Err(not_found());
        }

        let aliases = Self::read_aliases(&dir)?;
        let version = match &address.alias {
            ArtifactAlias::Version(n) => Some(*n).filter(|n| dir.join(format!("v{n}")).is_dir()),
            ArtifactAlias::Named(alias) => aliases.get(alias).copied(),
        }
        .ok_or_else(not_found)?;

        let resolved = Self::read_version(&dir, version, &aliases)?;
        debug!(address = %address, version = resolved.version, "Resolved artifact");
        Ok(resolved)
    }

    fn download(&self, version: &ArtifactVersion) -> Result<PathBuf> {
        let dir_name = format!("{}-v{}", version.name, version.version);
        let target = self.root.join("cache").join(&dir_name);
        if target.is_dir() {
            debug!(path = %target.display(), "Artifact already cached");
            return Ok(target);
        }

        let partial = self.root.join("cache").join(format!(".{dir_name}.partial"));
        if partial.exists() {
            std::fs::remove_dir_all(&partial)?;
        }
        copy_tree(&version.files_dir, &partial)?;
        std::fs::rename(&partial, &target)?;

        info!(artifact = %version.qualified_name(), path = %target.display(), "Downloaded artifact");
        Ok(target)
    }

    fn publish(&self, artifact: &Artifact, producer: Option<&RunId>) -> Result<ArtifactVersion> {
        let dir = self.artifact_dir(artifact.artifact_type(), artifact.name());
        std::fs::create_dir_all(&dir)?;

        let version = Self::versions(&dir)?.last().map_or(0, |v| v + 1);
        let vdir = dir.join(format!("v{version}"));
        let files = vdir.join("files");
        std::fs::create_dir_all(&files)?;

        for entry in artifact.entries() {
            match entry {
                ArtifactEntry::Dir { path } => copy_tree(path, &files)?,
                ArtifactEntry::File { path, name } => {
                    std::fs::copy(path, files.join(name))?;
                }
            }
        }

        let manifest = ArtifactVersion {
            id: Uuid::new_v4(),
            name: artifact.name().to_string(),
            version,
            artifact_type: artifact.artifact_type().clone(),
            description: artifact.description().map(str::to_string),
            metadata: artifact.metadata().clone(),
            producer: producer.cloned(),
            created_at: Utc::now(),
            aliases: Vec::new(),
            files_dir: files,
        };
        std::fs::write(
            vdir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest)?,
        )?;

        let mut aliases = Self::read_aliases(&dir)?;
        aliases.insert(ArtifactAlias::LATEST.to_string(), version);
        for alias in artifact.aliases() {
            aliases.insert(alias.clone(), version);
        }
        std::fs::write(dir.join(ALIASES_FILE), serde_json::to_string_pretty(&aliases)?)?;

        let published = Self::read_version(&dir, version, &aliases)?;
        info!(
            artifact = %published.qualified_name(),
            artifact_type = %published.artifact_type,
            aliases = ?published.aliases,
            "Published artifact"
        );
        Ok(published)
    }

    fn run_record(&self, id: &RunId) -> Result<RunRecord> {
        let path = self.run_dir(id).join(RUN_FILE);
        if !path.exists() {
            return Err(Error::registry(format!("unknown run `{id}`")));
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save_run_record(&self, record: &RunRecord) -> Result<()> {
        let dir = self.run_dir(&record.id);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(RUN_FILE), serde_json::to_string_pretty(record)?)?;
        Ok(())
    }

    fn run_dir(&self, id: &RunId) -> PathBuf {
        self.root.join("runs").join(id.as_str())
    }
}

/// Copies every file below `src` into `dst`, keeping relative paths.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| Error::registry(format!("walking {}: {e}", src.display())))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::internal(e.to_string()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged_dir(content: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("train")).unwrap();
        std::fs::write(dir.path().join("train/data.jsonl"), content).unwrap();
        dir
    }

    fn publish(registry: &LocalRegistry, content: &str, aliases: &[&str]) -> ArtifactVersion {
        let src = staged_dir(content);
        let mut artifact = Artifact::new("alpaca", ArtifactType::Dataset)
            .unwrap()
            .with_aliases(aliases.iter().copied());
        artifact.add_dir(src.path()).unwrap();
        registry.publish(&artifact, None).unwrap()
    }

    #[test]
    fn test_versions_and_latest_alias() {
        let root = tempfile::tempdir().unwrap();
        let registry = LocalRegistry::new(root.path()).unwrap();

        let v0 = publish(&registry, "{\"text\":\"a\"}\n", &["best"]);
        let v1 = publish(&registry, "{\"text\":\"b\"}\n", &[]);
        assert_eq!((v0.version, v1.version), (0, 1));
        assert_eq!(v1.aliases, vec!["latest".to_string()]);

        let latest = registry
            .resolve(&"alpaca".parse().unwrap(), &ArtifactType::Dataset)
            .unwrap();
        assert_eq!(latest.version, 1);
        assert_eq!(latest.id, v1.id);

        let best = registry
            .resolve(&"alpaca:best".parse().unwrap(), &ArtifactType::Dataset)
            .unwrap();
        assert_eq!(best.version, 0);

        let pinned = registry
            .resolve(&ArtifactAddress::version("alpaca", 0), &ArtifactType::Dataset)
            .unwrap();
        assert_eq!(pinned.aliases, vec!["best".to_string()]);
    }

    #[test]
    fn test_not_found() {
        let root = tempfile::tempdir().unwrap();
        let registry = LocalRegistry::new(root.path()).unwrap();
        publish(&registry, "{}\n", &[]);

        for (address, ty) in [
            ("missing", ArtifactType::Dataset),
            ("alpaca:v7", ArtifactType::Dataset),
            ("alpaca:nope", ArtifactType::Dataset),
            ("alpaca", ArtifactType::Model),
        ] {
            let err = registry.resolve(&address.parse().unwrap(), &ty).unwrap_err();
            assert!(err.is_not_found(), "{address}: {err}");
        }
    }

    #[test]
    fn test_download_copies_and_caches() {
        let root = tempfile::tempdir().unwrap();
        let registry = LocalRegistry::new(root.path()).unwrap();
        let version = publish(&registry, "{\"text\":\"a\"}\n", &[]);

        let dir = registry.download(&version).unwrap();
        assert_eq!(dir, root.path().join("cache/alpaca-v0"));
        assert_eq!(
            std::fs::read_to_string(dir.join("train/data.jsonl")).unwrap(),
            "{\"text\":\"a\"}\n"
        );
        assert_eq!(registry.download(&version).unwrap(), dir);
    }

    #[test]
    fn test_unknown_run() {
        let root = tempfile::tempdir().unwrap();
        let registry = LocalRegistry::new(root.path()).unwrap();
        assert!(registry.run_record(&RunId::from("abcdefgh")).is_err());
    }
}
