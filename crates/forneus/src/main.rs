//! # Forneus CLI
//!
//! *"The Marquis of the sea who teaches art and rhetoric"*
//!
//! Runs the fine-tuning baseline: loads the evaluation prompts and a model,
//! freezes the leading layers, logs sample generations to a tracked run and
//! optionally saves the model as an artifact.

use color_eyre::eyre::Result;

mod commands;
mod config;
mod logging;

fn main() -> Result<()> {
    color_eyre::install()?;

    let mut cfg = config::SftConfig::load()?;
    ronove::parse_args(&mut cfg)?;

    logging::init_logging(&cfg.log_level, cfg.json_logs);

    commands::baseline(&cfg)?;
    Ok(())
}
