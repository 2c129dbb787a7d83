//! Artifact addressing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Category of a registered artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ArtifactType {
    /// A dataset in the on-disk dataset layout.
    Dataset,
    /// A model checkpoint (full weights or adapter).
    Model,
    /// Any other artifact type.
    Custom(String),
}

impl ArtifactType {
    /// Returns the type name as stored in the registry.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Dataset => "dataset",
            Self::Model => "model",
            Self::Custom(s) => s,
        }
    }
}

impl From<String> for ArtifactType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "dataset" => Self::Dataset,
            "model" => Self::Model,
            _ => Self::Custom(s),
        }
    }
}

impl From<&str> for ArtifactType {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<ArtifactType> for String {
    fn from(t: ArtifactType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Version selector of an artifact address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactAlias {
    /// An explicit version number (`v3`).
    Version(u32),
    /// A named alias (`latest`, `best`, ...).
    Named(String),
}

impl ArtifactAlias {
    /// The alias every newly published version receives.
    pub const LATEST: &'static str = "latest";

    fn parse(s: &str) -> Self {
        s.strip_prefix('v')
            .and_then(|n| n.parse::<u32>().ok())
            .map_or_else(|| Self::Named(s.to_string()), Self::Version)
    }
}

impl fmt::Display for ArtifactAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Version(n) => write!(f, "v{n}"),
            Self::Named(s) => f.write_str(s),
        }
    }
}

/// Parsed artifact reference of the form `[entity/][project/]name[:alias]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactAddress {
    /// Optional `entity/project` scope.
    pub scope: Option<String>,
    /// Artifact name.
    pub name: String,
    /// Version selector, `latest` when omitted.
    pub alias: ArtifactAlias,
}

impl ArtifactAddress {
    /// Creates an address for `name` at the `latest` alias.
    #[must_use]
    pub fn latest(name: impl Into<String>) -> Self {
        Self {
            scope: None,
            name: name.into(),
            alias: ArtifactAlias::Named(ArtifactAlias::LATEST.to_string()),
        }
    }

    /// Creates an address for an explicit version.
    #[must_use]
    pub fn version(name: impl Into<String>, version: u32) -> Self {
        Self {
            scope: None,
            name: name.into(),
            alias: ArtifactAlias::Version(version),
        }
    }
}

/// Validates an artifact name.
///
/// # Errors
///
/// Returns [`Error::Registry`] if the name is empty or contains characters other
/// than ASCII alphanumerics, `-`, `_` and `.`.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::registry(format!("invalid artifact name `{name}`")))
    }
}

impl FromStr for ArtifactAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (path, alias) = match s.rsplit_once(':') {
            Some((path, alias)) if !alias.is_empty() => (path, ArtifactAlias::parse(alias)),
            Some(_) => {
                return Err(Error::registry(format!("empty alias in address `{s}`")));
            }
            None => (s, ArtifactAlias::Named(ArtifactAlias::LATEST.to_string())),
        };
        let (scope, name) = match path.rsplit_once('/') {
            Some((scope, name)) => (Some(scope.to_string()), name),
            None => (None, path),
        };
        validate_name(name)?;
        Ok(Self {
            scope,
            name: name.to_string(),
            alias,
        })
    }
}

impl fmt::Display for ArtifactAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scope) = &self.scope {
            write!(f, "{scope}/")?;
        }
        write!(f, "{}:{}", self.name, self.alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_name() {
        let addr: ArtifactAddress = "alpaca_gpt4_splitted".parse().unwrap();
        assert_eq!(addr, ArtifactAddress::latest("alpaca_gpt4_splitted"));
        assert_eq!(addr.to_string(), "alpaca_gpt4_splitted:latest");
    }

    #[test]
    fn test_parse_scoped_version() {
        let addr: ArtifactAddress = "acme/alpaca_ft/model-abc123:v4".parse().unwrap();
        assert_eq!(addr.scope.as_deref(), Some("acme/alpaca_ft"));
        assert_eq!(addr.name, "model-abc123");
        assert_eq!(addr.alias, ArtifactAlias::Version(4));
    }

    #[test]
    fn test_parse_named_alias() {
        let addr: ArtifactAddress = "model:best".parse().unwrap();
        assert_eq!(addr.alias, ArtifactAlias::Named("best".into()));
        // `version` without a number is just a name
        let addr: ArtifactAddress = "model:version".parse().unwrap();
        assert_eq!(addr.alias, ArtifactAlias::Named("version".into()));
    }

    #[test]
    fn test_parse_rejects_bad_names() {
        assert!("".parse::<ArtifactAddress>().is_err());
        assert!("bad name:latest".parse::<ArtifactAddress>().is_err());
        assert!("model:".parse::<ArtifactAddress>().is_err());
        assert!("..".parse::<ArtifactAddress>().is_err());
    }

    #[test]
    fn test_artifact_type_serde() {
        let json = serde_json::to_string(&ArtifactType::Model).unwrap();
        assert_eq!(json, "\"model\"");
        let custom: ArtifactType = serde_json::from_str("\"eval-report\"").unwrap();
        assert_eq!(custom, ArtifactType::Custom("eval-report".into()));
    }
}
