//! # Seere
//!
//! *"The Prince who brings things to pass in an instant"*
//!
//! Seere is the experiment tracker of the Forneus toolkit. A [`Run`] is an
//! explicit session handle: it records its configuration, appends metric rows
//! and result tables, and resolves or publishes versioned artifacts through an
//! [`ArtifactRegistry`].
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use seere::{LocalRegistry, Run, RunSettings};
//!
//! let registry = Arc::new(LocalRegistry::new("./tracking")?);
//! let mut run = Run::init(registry, RunSettings::new("alpaca_ft"))?;
//! let dataset = run.use_artifact("alpaca_gpt4_splitted:latest", "dataset")?;
//! let dir = run.registry().download(&dataset)?;
//! run.finish()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod artifact;
pub mod registry;
pub mod run;
pub mod table;

pub use artifact::{Artifact, ArtifactVersion};
pub use registry::{ArtifactRegistry, LocalRegistry};
pub use run::{Run, RunRecord, RunSettings, RunState};
pub use table::Table;
