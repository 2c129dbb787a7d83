//! Trainer hooks that report to an experiment run.
//!
//! The trainer itself lives outside this crate; it calls the hooks of every
//! registered [`TrainerCallback`] with an [`EvalContext`] borrowing its state,
//! the model and the active [`Run`].

use std::path::Path;
use std::str::FromStr;

use forneus_core::{ArtifactType, Error, GenerationConfig, Result};
use indicatif::{ProgressBar, ProgressStyle};
use marbas::{CausalLm, Tokenizer};
use seere::{Artifact, Run, Table};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::dataset::Dataset;

/// History key of the sample generation table.
pub const SAMPLES_KEY: &str = "sample_predictions";

/// Row field holding the prompt of an evaluation sample.
pub const TEXT_FIELD: &str = "text";

/// Progress of the training loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Optimizer steps taken.
    pub global_step: u64,
    /// Fractional epoch.
    pub epoch: f64,
}

/// Everything a hook may read or touch.
pub struct EvalContext<'a> {
    /// Trainer progress.
    pub state: &'a TrainerState,
    /// Metrics of the evaluation that just ran, keyed as the trainer reports
    /// them (`eval_loss`, ...).
    pub metrics: &'a Map<String, Value>,
    /// The model being trained.
    pub model: &'a mut CausalLm,
    /// The active run.
    pub run: &'a mut Run,
}

/// Hooks called by the training loop.
pub trait TrainerCallback {
    /// Called after each evaluation.
    ///
    /// # Errors
    ///
    /// Returns an error if logging fails.
    fn on_evaluate(&mut self, ctx: &mut EvalContext<'_>) -> Result<()>;

    /// Called after a checkpoint is written to `checkpoint_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if logging fails.
    fn on_save(&mut self, _ctx: &mut EvalContext<'_>, _checkpoint_dir: &Path) -> Result<()> {
        Ok(())
    }

    /// Called once the final model is written to `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if logging fails.
    fn on_train_end(&mut self, _ctx: &mut EvalContext<'_>, _output_dir: &Path) -> Result<()> {
        Ok(())
    }
}

/// When model weights are published as artifacts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogModel {
    /// Never.
    #[default]
    #[serde(rename = "false")]
    Disabled,
    /// Once, at the end of training.
    End,
    /// At every checkpoint.
    Checkpoint,
}

impl FromStr for LogModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "false" | "" => Ok(Self::Disabled),
            "end" => Ok(Self::End),
            "checkpoint" => Ok(Self::Checkpoint),
            other => Err(Error::invalid_config(format!(
                "log_model must be one of false, end, checkpoint; got `{other}`"
            ))),
        }
    }
}

/// Logs evaluation metrics to the run and publishes model weights according to
/// its [`LogModel`] policy.
#[derive(Debug, Clone, Default)]
pub struct TrackerCallback {
    log_model: LogModel,
}

impl TrackerCallback {
    /// Creates a tracker with the given publishing policy.
    #[must_use]
    pub fn new(log_model: LogModel) -> Self {
        Self { log_model }
    }

    /// The publishing policy.
    #[must_use]
    pub fn log_model(&self) -> LogModel {
        self.log_model
    }

    fn publish(
        ctx: &mut EvalContext<'_>,
        name: &str,
        dir: &Path,
        aliases: Vec<String>,
    ) -> Result<()> {
        let mut metadata = Map::new();
        metadata.insert("global_step".into(), json!(ctx.state.global_step));
        metadata.insert("epoch".into(), json!(ctx.state.epoch));
        let mut artifact = Artifact::new(name, ArtifactType::Model)?
            .with_metadata(metadata)
            .with_aliases(aliases);
        artifact.add_dir(dir)?;
        let version = ctx.run.log_artifact(&artifact)?;
        info!(artifact = %version.qualified_name(), "Published model weights");
        Ok(())
    }
}

impl TrainerCallback for TrackerCallback {
    fn on_evaluate(&mut self, ctx: &mut EvalContext<'_>) -> Result<()> {
        let mut row: Map<String, Value> = ctx
            .metrics
            .iter()
            .map(|(k, v)| {
                let name = k.strip_prefix("eval_").unwrap_or(k);
                (format!("eval/{name}"), v.clone())
            })
            .collect();
        row.insert("train/global_step".into(), json!(ctx.state.global_step));
        row.insert("train/epoch".into(), json!(ctx.state.epoch));
        debug!(metrics = ctx.metrics.len(), "Logging evaluation metrics");
        ctx.run.log(row)
    }

    fn on_save(&mut self, ctx: &mut EvalContext<'_>, checkpoint_dir: &Path) -> Result<()> {
        if self.log_model != LogModel::Checkpoint {
            return Ok(());
        }
        let name = format!("checkpoint-{}", ctx.run.id());
        let alias = format!("step-{}", ctx.state.global_step);
        Self::publish(ctx, &name, checkpoint_dir, vec![alias])
    }

    fn on_train_end(&mut self, ctx: &mut EvalContext<'_>, output_dir: &Path) -> Result<()> {
        if self.log_model != LogModel::End {
            return Ok(());
        }
        let name = format!("model-{}", ctx.run.id());
        Self::publish(ctx, &name, output_dir, Vec::new())
    }
}

/// Generates completions for a fixed set of evaluation prompts after every
/// evaluation and logs them as a table.
///
/// Table columns are `prompt`, `generation` and then one column per
/// generation setting, so every row records how it was produced.
#[derive(Debug)]
pub struct SampleLogger {
    base: TrackerCallback,
    samples: Dataset,
    tokenizer: Tokenizer,
    generation_config: GenerationConfig,
}

impl SampleLogger {
    /// Takes the first `num_samples` rows of `test_dataset` and the model's
    /// generation settings, capped at `max_new_tokens`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatasetLoad`] if the dataset has fewer than
    /// `num_samples` rows.
    pub fn new(
        model: &CausalLm,
        tokenizer: Tokenizer,
        test_dataset: &Dataset,
        num_samples: usize,
        max_new_tokens: u32,
        log_model: LogModel,
    ) -> Result<Self> {
        let samples = test_dataset.select(0..num_samples)?;
        let generation_config = model
            .generation_config()
            .clone()
            .with_max_new_tokens(max_new_tokens);
        Ok(Self {
            base: TrackerCallback::new(log_model),
            samples,
            tokenizer,
            generation_config,
        })
    }

    /// Generation settings used for every sample.
    #[must_use]
    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation_config
    }

    /// The evaluation prompts.
    #[must_use]
    pub fn samples(&self) -> &Dataset {
        &self.samples
    }

    /// Generates a completion of `prompt`, without the prompt.
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization or decoding fails.
    pub fn generate(&self, model: &mut CausalLm, prompt: &str) -> Result<String> {
        marbas::generate_text(model, &self.tokenizer, prompt, &self.generation_config)
    }

    /// Builds the sample table for the model's current weights.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatasetLoad`] if a sample has no `text` string, or a
    /// generation error.
    pub fn samples_table(&self, model: &mut CausalLm) -> Result<Table> {
        let settings = self.generation_config.to_dict();
        let mut table = Table::new(
            ["prompt", "generation"]
                .into_iter()
                .map(str::to_string)
                .chain(settings.keys().cloned()),
        );

        let progress = ProgressBar::new(self.samples.len() as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .map_err(|e| Error::internal(e.to_string()))?
                .progress_chars("#>-"),
        );
        progress.set_message("Generating samples");

        for example in &self.samples {
            let prompt = example
                .get(TEXT_FIELD)
                .and_then(Value::as_str)
                .ok_or_else(|| Error::DatasetLoad {
                    message: format!("sample has no `{TEXT_FIELD}` string"),
                })?;
            let generation = self.generate(model, prompt)?;

            let mut row = vec![json!(prompt), json!(generation)];
            row.extend(settings.values().cloned());
            table.add_data(row)?;
            progress.inc(1);
        }
        progress.finish_and_clear();

        Ok(table)
    }
}

impl TrainerCallback for SampleLogger {
    fn on_evaluate(&mut self, ctx: &mut EvalContext<'_>) -> Result<()> {
        self.base.on_evaluate(ctx)?;
        let table = self.samples_table(ctx.model)?;
        ctx.run.log_table(SAMPLES_KEY, &table)?;
        Ok(())
    }

    fn on_save(&mut self, ctx: &mut EvalContext<'_>, checkpoint_dir: &Path) -> Result<()> {
        self.base.on_save(ctx, checkpoint_dir)
    }

    fn on_train_end(&mut self, ctx: &mut EvalContext<'_>, output_dir: &Path) -> Result<()> {
        self.base.on_train_end(ctx, output_dir)
    }
}
