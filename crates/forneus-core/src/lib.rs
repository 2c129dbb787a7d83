//! # Forneus Core
//!
//! Core types shared across the Forneus fine-tuning toolkit.
//!
//! This crate provides the foundational pieces used by every other Forneus crate:
//! - The unified error type
//! - Flat configuration values with literal coercion
//! - Artifact addresses and types
//! - Generation settings and model sources

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod artifact;
pub mod error;
pub mod generation;
pub mod model;
pub mod types;
pub mod value;

pub use artifact::{ArtifactAddress, ArtifactAlias, ArtifactType};
pub use error::{Error, Result};
pub use generation::{GenerationConfig, TokenIds};
pub use model::ModelSource;
pub use types::*;
pub use value::{literal_eval, ConfigMap, ConfigValue};
