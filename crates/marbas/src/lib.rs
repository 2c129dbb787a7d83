//! # Marbas
//!
//! *"The President of Hell teaches mechanical arts"*
//!
//! Marbas is the model runtime of the Forneus toolkit. It builds trainable
//! Llama-family causal language models on top of Candle, tracks which parameters
//! are trainable, attaches LoRA adapters, wraps tokenizers and decodes samples.
//!
//! ## Features
//!
//! - **Trainable weights**: every parameter lives in a [`candle_nn::VarMap`] and
//!   carries a trainability flag in the [`ParamStore`]
//! - **Checkpoints**: plain checkpoints and adapter-only checkpoints, loaded
//!   from a local directory or the Hugging Face Hub
//! - **Generation**: greedy and sampled decoding driven by a
//!   [`forneus_core::GenerationConfig`]
//!
//! ## Example
//!
//! ```ignore
//! use marbas::{CheckpointKind, ModelLoader};
//! use forneus_core::ModelOptions;
//!
//! let loader = ModelLoader::default_cache()?;
//! let dir = std::path::Path::new("models/abc123_sft");
//! let mut model = loader.load_model(dir, CheckpointKind::detect(dir)?, &ModelOptions::default())?;
//! let tokenizer = loader.load_tokenizer(model.name_or_path())?;
//! let config = model.generation_config().clone().with_max_new_tokens(64);
//! let text = marbas::generate_text(&mut model, &tokenizer, "Hello", &config)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod device;
pub mod generate;
pub mod loader;
pub mod lora;
pub mod models;
pub mod params;
pub mod sampler;
pub mod tokenizer;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::LlamaConfig;
pub use device::select_device;
pub use generate::{generate, generate_text};
pub use loader::{CheckpointKind, ModelFiles, ModelLoader, WeightFiles};
pub use lora::{LoraConfig, LoraLinear};
pub use models::CausalLm;
pub use params::ParamStore;
pub use sampler::Sampler;
pub use tokenizer::Tokenizer;
