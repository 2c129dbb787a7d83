//! On-disk datasets of JSON rows.
//!
//! A dataset directory holds `*.jsonl` files (one JSON object per line, files
//! read in name order) or one sub-directory per split laid out the same way.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use forneus_core::{Error, Result};
use serde_json::{Map, Value};
use tracing::debug;

/// One dataset row.
pub type Example = Map<String, Value>;

/// File written by [`Dataset::save_to_disk`].
pub const DATA_FILE: &str = "data.jsonl";

/// An ordered list of rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    rows: Vec<Example>,
}

impl Dataset {
    /// Wraps rows.
    #[must_use]
    pub fn from_rows(rows: Vec<Example>) -> Self {
        Self { rows }
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the dataset has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Example> {
        self.rows.get(index)
    }

    /// Iterates rows in order.
    pub fn iter(&self) -> impl Iterator<Item = &Example> {
        self.rows.iter()
    }

    /// New dataset with the rows at `indices`, in the given order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatasetLoad`] if an index is out of range.
    pub fn select(&self, indices: impl IntoIterator<Item = usize>) -> Result<Self> {
        let rows = indices
            .into_iter()
            .map(|i| {
                self.rows.get(i).cloned().ok_or_else(|| Error::DatasetLoad {
                    message: format!("index {i} out of range for {} rows", self.rows.len()),
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self { rows })
    }

    /// Writes the rows to `dir/data.jsonl`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_to_disk(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let mut file = File::create(dir.join(DATA_FILE))?;
        for row in &self.rows {
            writeln!(file, "{}", serde_json::to_string(row)?)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a Example;
    type IntoIter = std::slice::Iter<'a, Example>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// Result of [`load_from_disk`].
#[derive(Debug, Clone, PartialEq)]
pub enum LoadedDataset {
    /// A directory of row files.
    Single(Dataset),
    /// A directory of named split directories.
    Splits(BTreeMap<String, Dataset>),
}

impl LoadedDataset {
    /// Returns a split by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatasetLoad`] if the dataset has no such split.
    pub fn split(&self, name: &str) -> Result<&Dataset> {
        match self {
            Self::Splits(splits) => splits.get(name).ok_or_else(|| Error::DatasetLoad {
                message: format!(
                    "no split `{name}` (available: {})",
                    splits.keys().cloned().collect::<Vec<_>>().join(", ")
                ),
            }),
            Self::Single(_) => Err(Error::DatasetLoad {
                message: format!("dataset has no splits, cannot select `{name}`"),
            }),
        }
    }

    /// Split names, empty for a single dataset.
    #[must_use]
    pub fn split_names(&self) -> Vec<&str> {
        match self {
            Self::Splits(splits) => splits.keys().map(String::as_str).collect(),
            Self::Single(_) => Vec::new(),
        }
    }

    /// Writes the dataset in the layout [`load_from_disk`] reads.
    ///
    /// # Errors
    ///
    /// Returns an error if any file cannot be written.
    pub fn save_to_disk(&self, dir: &Path) -> Result<()> {
        match self {
            Self::Single(dataset) => dataset.save_to_disk(dir),
            Self::Splits(splits) => splits
                .iter()
                .try_for_each(|(name, dataset)| dataset.save_to_disk(&dir.join(name))),
        }
    }
}

/// Reads every line of a JSON Lines file.
///
/// # Errors
///
/// Returns [`Error::DatasetLoad`] naming the line that fails to parse.
pub fn load_jsonl(path: impl AsRef<Path>) -> Result<Vec<Value>> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut data = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value = serde_json::from_str(&line).map_err(|e| Error::DatasetLoad {
            message: format!("{}:{}: {e}", path.display(), i + 1),
        })?;
        data.push(value);
    }
    Ok(data)
}

fn jsonl_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "jsonl") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn load_rows(files: &[PathBuf]) -> Result<Dataset> {
    let mut rows = Vec::new();
    for file in files {
        for value in load_jsonl(file)? {
            match value {
                Value::Object(row) => rows.push(row),
                other => {
                    return Err(Error::DatasetLoad {
                        message: format!(
                            "{}: expected a JSON object per line, found {other}",
                            file.display()
                        ),
                    })
                }
            }
        }
    }
    Ok(Dataset::from_rows(rows))
}

/// Loads a dataset directory.
///
/// # Errors
///
/// Returns [`Error::DatasetLoad`] if the directory holds neither row files nor
/// split directories with row files.
pub fn load_from_disk(dir: impl AsRef<Path>) -> Result<LoadedDataset> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(Error::DatasetLoad {
            message: format!("{} is not a directory", dir.display()),
        });
    }

    let files = jsonl_files(dir)?;
    if !files.is_empty() {
        let dataset = load_rows(&files)?;
        debug!(dir = %dir.display(), rows = dataset.len(), "Loaded dataset");
        return Ok(LoadedDataset::Single(dataset));
    }

    let mut splits = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let files = jsonl_files(&path)?;
        if files.is_empty() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dataset = load_rows(&files)?;
        debug!(split = %name, rows = dataset.len(), "Loaded split");
        splits.insert(name, dataset);
    }

    if splits.is_empty() {
        return Err(Error::DatasetLoad {
            message: format!("no .jsonl files found in {}", dir.display()),
        });
    }
    Ok(LoadedDataset::Splits(splits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(text: &str) -> Example {
        let mut row = Map::new();
        row.insert("text".into(), json!(text));
        row
    }

    #[test]
    fn test_load_jsonl_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        std::fs::write(&path, "{\"a\":1}\n\n{\"a\":2}\n").unwrap();
        assert_eq!(load_jsonl(&path).unwrap(), vec![json!({"a": 1}), json!({"a": 2})]);
    }

    #[test]
    fn test_load_jsonl_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        std::fs::write(&path, "{\"a\":1}\nnot json\n").unwrap();
        let err = load_jsonl(&path).unwrap_err();
        assert!(err.to_string().contains("a.jsonl:2"), "{err}");
    }

    #[test]
    fn test_files_concatenate_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.jsonl"), "{\"text\":\"second\"}\n").unwrap();
        std::fs::write(dir.path().join("a.jsonl"), "{\"text\":\"first\"}\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let LoadedDataset::Single(ds) = load_from_disk(dir.path()).unwrap() else {
            panic!("expected a single dataset");
        };
        assert_eq!(ds, Dataset::from_rows(vec![row("first"), row("second")]));
    }

    #[test]
    fn test_split_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut splits = BTreeMap::new();
        splits.insert("train".to_string(), Dataset::from_rows(vec![row("a"), row("b")]));
        splits.insert("test".to_string(), Dataset::from_rows(vec![row("c")]));
        let original = LoadedDataset::Splits(splits);
        original.save_to_disk(dir.path()).unwrap();

        let loaded = load_from_disk(dir.path()).unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded.split_names(), vec!["test", "train"]);
        assert!(loaded.split("validation").is_err());
    }

    #[test]
    fn test_select_keeps_order_and_checks_bounds() {
        let ds = Dataset::from_rows(vec![row("a"), row("b"), row("c")]);
        assert_eq!(ds.select(0..2).unwrap(), Dataset::from_rows(vec![row("a"), row("b")]));
        assert!(ds.select(0..4).is_err());
    }

    #[test]
    fn test_empty_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_from_disk(dir.path()),
            Err(Error::DatasetLoad { .. })
        ));
    }
}
