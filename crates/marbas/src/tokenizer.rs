//! Tokenizer wrapper for text encoding/decoding.

use std::path::Path;

use forneus_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Token entry in `tokenizer_config.json`: a bare string or an added-token object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum TokenSpec {
    Plain(String),
    Added { content: String },
}

impl TokenSpec {
    fn content(&self) -> &str {
        match self {
            Self::Plain(s) | Self::Added { content: s } => s,
        }
    }
}

/// Subset of `tokenizer_config.json` that names the special tokens.
#[derive(Debug, Default, Deserialize)]
struct TokenizerConfigFile {
    #[serde(default)]
    bos_token: Option<TokenSpec>,
    #[serde(default)]
    eos_token: Option<TokenSpec>,
    #[serde(default)]
    pad_token: Option<TokenSpec>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Wrapper around tokenizers for encoding and decoding text.
#[derive(Clone)]
pub struct Tokenizer {
    inner: tokenizers::Tokenizer,
    bos_token: Option<String>,
    eos_token: Option<String>,
    pad_token: Option<String>,
    /// Other `tokenizer_config.json` keys, written back by [`Tokenizer::save_pretrained`].
    extra_config: Map<String, Value>,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("bos_token", &self.bos_token)
            .field("eos_token", &self.eos_token)
            .field("pad_token", &self.pad_token)
            .finish()
    }
}

impl Tokenizer {
    /// File holding the serialized tokenizer.
    pub const FILE_NAME: &'static str = "tokenizer.json";
    /// File holding special-token settings.
    pub const CONFIG_FILE: &'static str = "tokenizer_config.json";

    /// Loads a tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns an error if the tokenizer cannot be loaded.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| Error::Tokenization {
            message: e.to_string(),
        })?;

        Ok(Self::from_tokenizer(inner, TokenizerConfigFile::default()))
    }

    /// Loads a tokenizer from a checkpoint directory.
    ///
    /// Reads `tokenizer.json` and, when present, the special tokens named in
    /// `tokenizer_config.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if `tokenizer.json` is missing or invalid.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(Self::FILE_NAME);
        if !path.exists() {
            return Err(Error::tokenization(format!(
                "{} not found in {}",
                Self::FILE_NAME,
                dir.display()
            )));
        }
        let inner = tokenizers::Tokenizer::from_file(&path).map_err(|e| Error::Tokenization {
            message: e.to_string(),
        })?;

        let config_path = dir.join(Self::CONFIG_FILE);
        let config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            serde_json::from_str(&content).map_err(|e| {
                Error::tokenization(format!("Failed to parse {}: {e}", Self::CONFIG_FILE))
            })?
        } else {
            TokenizerConfigFile::default()
        };

        Ok(Self::from_tokenizer(inner, config))
    }

    /// Creates a wrapper from an existing tokenizer.
    fn from_tokenizer(inner: tokenizers::Tokenizer, config: TokenizerConfigFile) -> Self {
        let vocab = inner.get_vocab(true);
        let first_known = |candidates: &[&str]| {
            candidates
                .iter()
                .find(|c| vocab.contains_key(**c))
                .map(|c| (*c).to_string())
        };

        let bos_token = config
            .bos_token
            .as_ref()
            .map(|t| t.content().to_string())
            .or_else(|| first_known(&["<s>", "<|begin_of_text|>"]));

        let eos_token = config
            .eos_token
            .as_ref()
            .map(|t| t.content().to_string())
            .or_else(|| first_known(&["</s>", "<|end_of_text|>", "<|eot_id|>"]));

        let pad_token = config
            .pad_token
            .as_ref()
            .map(|t| t.content().to_string())
            .or_else(|| first_known(&["<pad>", "[PAD]"]));

        Self {
            inner,
            bos_token,
            eos_token,
            pad_token,
            extra_config: config.extra,
        }
    }

    /// Encodes text to token IDs.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding =
            self.inner
                .encode(text, add_special_tokens)
                .map_err(|e| Error::Tokenization {
                    message: e.to_string(),
                })?;

        Ok(encoding.get_ids().to_vec())
    }

    /// Decodes token IDs to text.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails.
    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| Error::Tokenization {
                message: e.to_string(),
            })
    }

    /// Uses the end-of-sequence token for padding.
    ///
    /// # Errors
    ///
    /// Returns an error if the tokenizer has no end-of-sequence token.
    pub fn set_pad_to_eos(&mut self) -> Result<()> {
        let eos = self
            .eos_token
            .clone()
            .ok_or_else(|| Error::tokenization("tokenizer has no end-of-sequence token"))?;
        let pad_id = self
            .inner
            .token_to_id(&eos)
            .ok_or_else(|| Error::tokenization(format!("`{eos}` is not in the vocabulary")))?;
        let mut padding = self.inner.get_padding().cloned().unwrap_or_default();
        padding.pad_id = pad_id;
        padding.pad_token.clone_from(&eos);
        self.inner.with_padding(Some(padding));
        self.pad_token = Some(eos);
        Ok(())
    }

    /// Writes `tokenizer.json` and `tokenizer_config.json` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be written.
    pub fn save_pretrained(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        self.inner
            .save(dir.join(Self::FILE_NAME), true)
            .map_err(|e| Error::Tokenization {
                message: e.to_string(),
            })?;

        let mut config = self.extra_config.clone();
        for (key, token) in [
            ("bos_token", &self.bos_token),
            ("eos_token", &self.eos_token),
            ("pad_token", &self.pad_token),
        ] {
            match token {
                Some(t) => config.insert(key.to_string(), Value::String(t.clone())),
                None => config.remove(key),
            };
        }
        std::fs::write(
            dir.join(Self::CONFIG_FILE),
            serde_json::to_string_pretty(&config)?,
        )?;
        Ok(())
    }

    /// Returns the vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Returns the token ID for a given token string.
    #[must_use]
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    /// Returns the token string for a given token ID.
    #[must_use]
    pub fn id_to_token(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }

    /// Beginning-of-sequence token.
    #[must_use]
    pub fn bos_token(&self) -> Option<&str> {
        self.bos_token.as_deref()
    }

    /// End-of-sequence token.
    #[must_use]
    pub fn eos_token(&self) -> Option<&str> {
        self.eos_token.as_deref()
    }

    /// Padding token.
    #[must_use]
    pub fn pad_token(&self) -> Option<&str> {
        self.pad_token.as_deref()
    }

    /// Beginning-of-sequence token ID.
    #[must_use]
    pub fn bos_token_id(&self) -> Option<u32> {
        self.bos_token.as_deref().and_then(|t| self.token_to_id(t))
    }

    /// End-of-sequence token ID.
    #[must_use]
    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token.as_deref().and_then(|t| self.token_to_id(t))
    }

    /// Padding token ID.
    #[must_use]
    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token.as_deref().and_then(|t| self.token_to_id(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::write_tiny_tokenizer;

    #[test]
    fn test_from_dir_reads_special_tokens() {
        let dir = tempfile::tempdir().unwrap();
        write_tiny_tokenizer(dir.path()).unwrap();

        let tokenizer = Tokenizer::from_dir(dir.path()).unwrap();
        assert_eq!(tokenizer.eos_token(), Some("</s>"));
        assert_eq!(tokenizer.bos_token(), Some("<s>"));
        assert_eq!(tokenizer.pad_token(), None);
        assert_eq!(tokenizer.eos_token_id(), Some(2));
    }

    #[test]
    fn test_pad_to_eos() {
        let dir = tempfile::tempdir().unwrap();
        write_tiny_tokenizer(dir.path()).unwrap();

        let mut tokenizer = Tokenizer::from_dir(dir.path()).unwrap();
        tokenizer.set_pad_to_eos().unwrap();
        assert_eq!(tokenizer.pad_token(), tokenizer.eos_token());
        assert_eq!(tokenizer.pad_token_id(), Some(2));
    }

    #[test]
    fn test_encode_decode() {
        let dir = tempfile::tempdir().unwrap();
        write_tiny_tokenizer(dir.path()).unwrap();
        let tokenizer = Tokenizer::from_dir(dir.path()).unwrap();

        let ids = tokenizer.encode("hello world", false).unwrap();
        assert_eq!(ids.len(), 2);
        let mut with_eos = ids.clone();
        with_eos.push(2);
        assert_eq!(tokenizer.decode(&with_eos, true).unwrap(), "hello world");
    }

    #[test]
    fn test_save_pretrained_round_trip() {
        let src = tempfile::tempdir().unwrap();
        write_tiny_tokenizer(src.path()).unwrap();
        let mut tokenizer = Tokenizer::from_dir(src.path()).unwrap();
        tokenizer.set_pad_to_eos().unwrap();

        let dst = tempfile::tempdir().unwrap();
        tokenizer.save_pretrained(dst.path()).unwrap();
        let reloaded = Tokenizer::from_dir(dst.path()).unwrap();
        assert_eq!(reloaded.pad_token(), Some("</s>"));
        assert_eq!(reloaded.vocab_size(), tokenizer.vocab_size());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Tokenizer::from_dir(dir.path()),
            Err(Error::Tokenization { .. })
        ));
    }
}
