//! # Ronove
//!
//! *"The Marquis who teaches rhetoric and the knowledge of tongues"*
//!
//! Ronove gathers the small utilities a supervised fine-tuning script needs
//! around an external trainer:
//!
//! - [`args`]: a command line generated from a flat configuration object
//! - [`store`]: datasets and checkpoints loaded from and saved to versioned
//!   artifacts
//! - [`metrics`]: streaming accuracy, flat cross-entropy and parameter counts
//! - [`callback`]: evaluation hooks that log metrics and sample generations
//! - [`freeze`]: partial fine-tuning by freezing all but the last layers
//!
//! ## Example
//!
//! ```ignore
//! use forneus_core::ModelOptions;
//! use ronove::{freeze, param_count, ArtifactStore};
//!
//! let store = ArtifactStore::new(registry, loader);
//! let loaded = store.load_model(Some(&mut run), "abc123_sft:latest", &ModelOptions::default())?;
//! let mut model = loaded.model;
//! freeze(&mut model, 8, true)?;
//! param_count(&model)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod args;
pub mod callback;
pub mod dataset;
pub mod freeze;
pub mod metrics;
pub mod store;

pub use args::{parse_args, str2bool, try_parse_args_from, ArgError};
pub use callback::{
    EvalContext, LogModel, SampleLogger, TrackerCallback, TrainerCallback, TrainerState,
};
pub use dataset::{load_from_disk, load_jsonl, Dataset, LoadedDataset};
pub use freeze::freeze;
pub use metrics::{
    flat_cross_entropy, param_count, token_accuracy, Accuracy, AccuracyScore, EvalPrediction,
    ParamCount, IGNORE_INDEX,
};
pub use store::{ArtifactOptions, ArtifactStore, LoadedModel, SavedModel};
