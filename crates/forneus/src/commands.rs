//! The baseline run.

use std::sync::Arc;

use color_eyre::eyre::Result;
use forneus_core::RunId;
use marbas::{CausalLm, ModelLoader, Tokenizer};
use ronove::{
    freeze, param_count, ArtifactOptions, ArtifactStore, Dataset, EvalContext, LoadedDataset,
    LogModel, SampleLogger, TrainerCallback, TrainerState,
};
use seere::{ArtifactRegistry, LocalRegistry, Run, RunSettings};
use serde_json::{json, Map};
use tracing::{info, warn};

use crate::config::SftConfig;

fn eval_split<'a>(dataset: &'a LoadedDataset, split: &str) -> Result<&'a Dataset> {
    match dataset {
        LoadedDataset::Single(ds) => {
            warn!(split, "Dataset has no splits, sampling from all rows");
            Ok(ds)
        }
        LoadedDataset::Splits(_) => Ok(dataset.split(split)?),
    }
}

fn load_model(
    store: &ArtifactStore,
    run: &mut Run,
    cfg: &SftConfig,
) -> Result<(CausalLm, Tokenizer)> {
    let options = cfg.model_options()?;
    if let Some(address) = &cfg.model_at {
        let loaded = store.load_model(Some(run), address, &options)?;
        return Ok((loaded.model, loaded.tokenizer));
    }

    let model = store.loader().load_pretrained(&cfg.model_id, &options)?;
    let mut tokenizer = store.loader().load_tokenizer(&cfg.model_id)?;
    tokenizer.set_pad_to_eos()?;
    Ok((model, tokenizer))
}

/// Logs sample generations of the configured model to a new run, then
/// optionally saves the model. Returns the run id.
pub fn baseline(cfg: &SftConfig) -> Result<RunId> {
    let registry: Arc<dyn ArtifactRegistry> = Arc::new(LocalRegistry::new(&cfg.run_dir)?);
    let store = ArtifactStore::new(Arc::clone(&registry), ModelLoader::default_cache()?);
    let log_model: LogModel = cfg.log_model.parse()?;

    let mut run = Run::init(
        registry,
        RunSettings::new(&cfg.project).with_config(cfg.to_run_config()?),
    )?;

    let dataset = store.load_dataset(Some(&mut run), &cfg.dataset_at)?;
    let eval = eval_split(&dataset, &cfg.eval_split)?;

    let (mut model, tokenizer) = load_model(&store, &mut run, cfg)?;
    freeze(&mut model, cfg.n_freeze, cfg.freeze_embed)?;
    let counts = param_count(&model)?;
    let mut summary = Map::new();
    summary.insert("total_params_m".into(), json!(counts.total));
    summary.insert("trainable_params_m".into(), json!(counts.trainable));
    run.update_config(summary)?;

    let num_samples = cfg.num_samples.min(eval.len());
    if num_samples < cfg.num_samples {
        warn!(
            requested = cfg.num_samples,
            available = eval.len(),
            "Fewer evaluation rows than samples requested"
        );
    }
    let mut logger = SampleLogger::new(
        &model,
        tokenizer,
        eval,
        num_samples,
        cfg.max_new_tokens,
        log_model,
    )?;

    let state = TrainerState::default();
    let metrics = Map::new();
    logger.on_evaluate(&mut EvalContext {
        state: &state,
        metrics: &metrics,
        model: &mut model,
        run: &mut run,
    })?;

    if cfg.save_model {
        let options = ArtifactOptions::default()
            .with_description(format!("{} evaluated on {}", cfg.model_id, cfg.dataset_at))
            .with_metadata("model_id", cfg.model_id.clone());
        let saved = store.save_model(
            &mut run,
            &model,
            &cfg.model_name,
            &cfg.models_folder,
            log_model != LogModel::Disabled,
            options,
        )?;
        println!("Model saved to {}", saved.dir.display());
    }

    let id = run.id().clone();
    let dir = run.dir().to_path_buf();
    run.finish()?;
    info!(run_id = %id, "Baseline complete");
    println!("Run {id} logged to {}", dir.display());
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forneus_core::{ArtifactAddress, ArtifactType};
    use marbas::test_utils::write_tiny_checkpoint;
    use seere::Artifact;
    use std::collections::BTreeMap;

    fn rows(texts: &[&str]) -> Dataset {
        Dataset::from_rows(
            texts
                .iter()
                .map(|t| {
                    let mut row = Map::new();
                    row.insert("text".into(), json!(t));
                    row
                })
                .collect(),
        )
    }

    #[test]
    fn test_baseline_logs_samples_and_saves_model() {
        let root = tempfile::tempdir().unwrap();
        let pretrained = root.path().join("pretrained");
        write_tiny_checkpoint(&pretrained).unwrap();

        let registry = LocalRegistry::new(root.path().join("tracking")).unwrap();
        let data = root.path().join("data");
        let mut splits = BTreeMap::new();
        splits.insert("train".to_string(), rows(&["hello world"]));
        splits.insert("test".to_string(), rows(&["the quick fox", "lazy dog"]));
        LoadedDataset::Splits(splits).save_to_disk(&data).unwrap();
        let mut artifact = Artifact::new("alpaca_gpt4_splitted", ArtifactType::Dataset).unwrap();
        artifact.add_dir(&data).unwrap();
        registry.publish(&artifact, None).unwrap();

        let cfg = SftConfig {
            run_dir: root.path().join("tracking"),
            model_id: pretrained.to_string_lossy().into_owned(),
            n_freeze: 2,
            num_samples: 5,
            max_new_tokens: 2,
            save_model: true,
            log_model: "end".into(),
            models_folder: root.path().join("models"),
            ..SftConfig::default()
        };
        let id = baseline(&cfg).unwrap();

        let record = registry.run_record(&id).unwrap();
        assert_eq!(record.used, vec!["alpaca_gpt4_splitted:v0".to_string()]);
        assert!(record.config["trainable_params_m"].as_f64().unwrap() > 0.0);

        let address: ArtifactAddress = format!("{id}_baseline:latest").parse().unwrap();
        let saved = registry.resolve(&address, &ArtifactType::Model).unwrap();
        assert_eq!(saved.metadata_str("model_id"), Some(cfg.model_id.as_str()));
        assert!(root
            .path()
            .join("models")
            .join(format!("{id}_baseline"))
            .join("tokenizer.json")
            .exists());
    }
}
