//! Locating and loading pretrained checkpoints from disk or the Hugging Face Hub

use candle_core::{DType, Device};
use hf_hub::api::tokio::Api;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::causal_lm::{CausalLm, WeightInit};
use super::config::CausalLmConfig;

/// Model configuration file name
pub const CONFIG_FILENAME: &str = "config.json";
/// Tokenizer file name
pub const TOKENIZER_FILENAME: &str = "tokenizer.json";
/// Single-file weights name
pub const WEIGHTS_FILENAME: &str = "model.safetensors";
/// Index of a sharded checkpoint
pub const WEIGHTS_INDEX_FILENAME: &str = "model.safetensors.index.json";

/// Files making up a pretrained checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    /// `config.json`
    pub config: PathBuf,
    /// `tokenizer.json`
    pub tokenizer: PathBuf,
    /// One or more safetensors files
    pub weights: Vec<PathBuf>,
}

/// Shard file names listed in a `model.safetensors.index.json`
fn shard_names(index: &serde_json::Value) -> Result<Vec<String>> {
    let weight_map = index
        .get("weight_map")
        .and_then(|m| m.as_object())
        .ok_or_else(|| Error::model_loading("Weight index has no weight_map"))?;
    let shards: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();
    if shards.is_empty() {
        return Err(Error::model_loading("Weight index lists no shards"));
    }
    Ok(shards.into_iter().collect())
}

/// Find the checkpoint files inside a local directory
pub async fn resolve_local(dir: &Path) -> Result<ModelFiles> {
    if !fs::metadata(dir).await.map(|m| m.is_dir()).unwrap_or(false) {
        return Err(Error::invalid_input(format!(
            "Weights path {} is not a directory",
            dir.display()
        )));
    }

    let config = dir.join(CONFIG_FILENAME);
    if !fs::try_exists(&config).await? {
        return Err(Error::model_loading(format!(
            "No {} found in {}",
            CONFIG_FILENAME,
            dir.display()
        )));
    }
    let tokenizer = dir.join(TOKENIZER_FILENAME);
    if !fs::try_exists(&tokenizer).await? {
        return Err(Error::tokenizer(format!(
            "No {} found in {}",
            TOKENIZER_FILENAME,
            dir.display()
        )));
    }

    let single = dir.join(WEIGHTS_FILENAME);
    let index = dir.join(WEIGHTS_INDEX_FILENAME);
    let weights = if fs::try_exists(&single).await? {
        vec![single]
    } else if fs::try_exists(&index).await? {
        let content = fs::read_to_string(&index).await?;
        let index: serde_json::Value = serde_json::from_str(&content)?;
        shard_names(&index)?.into_iter().map(|name| dir.join(name)).collect()
    } else {
        return Err(Error::model_loading(format!(
            "No safetensors weights found in {}",
            dir.display()
        )));
    };

    debug!("Resolved {} weight file(s) in {}", weights.len(), dir.display());
    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

/// Download (or reuse cached) checkpoint files for a Hub model id
pub async fn fetch_from_hub(model_id: &str) -> Result<ModelFiles> {
    info!("Fetching {} from the Hugging Face Hub", model_id);
    let api = Api::new()?;
    let repo = api.model(model_id.to_string());

    let config = repo
        .get(CONFIG_FILENAME)
        .await
        .map_err(|e| Error::hub(format!("Failed to fetch config for {}: {}", model_id, e)))?;
    let tokenizer = repo
        .get(TOKENIZER_FILENAME)
        .await
        .map_err(|e| Error::hub(format!("Failed to fetch tokenizer for {}: {}", model_id, e)))?;

    let weights = match repo.get(WEIGHTS_FILENAME).await {
        Ok(path) => vec![path],
        Err(single_err) => {
            debug!("No single weights file ({}), trying sharded index", single_err);
            let index_path = repo.get(WEIGHTS_INDEX_FILENAME).await.map_err(|e| {
                Error::hub(format!("No safetensors weights for {}: {}", model_id, e))
            })?;
            let index: serde_json::Value =
                serde_json::from_str(&fs::read_to_string(&index_path).await?)?;
            let mut shards = Vec::new();
            for name in shard_names(&index)? {
                shards.push(repo.get(&name).await?);
            }
            shards
        }
    };

    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

/// Resolve a model name: an existing local directory, otherwise a Hub id
pub async fn resolve_model_name(model_name: &str) -> Result<ModelFiles> {
    let path = Path::new(model_name);
    if fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false) {
        debug!("Treating {} as a local checkpoint directory", model_name);
        resolve_local(path).await
    } else {
        fetch_from_hub(model_name).await
    }
}

/// Build a model from checkpoint files
pub async fn load_model(files: &ModelFiles, dtype: DType, device: &Device) -> Result<CausalLm> {
    let content = fs::read_to_string(&files.config).await?;
    let config: CausalLmConfig = serde_json::from_str(&content)?;
    if config.model_type != "llama" && config.model_type != "mistral" {
        warn!(
            "model_type {:?} is loaded with the llama decoder layout",
            config.model_type
        );
    }

    let mut model = CausalLm::new(config, dtype, device, WeightInit::Zeros)?;
    model.load_safetensors(files.weights.as_slice())?;
    info!(
        "Loaded model ({} parameters) from {} file(s)",
        model.parameter_counts().total,
        files.weights.len()
    );
    Ok(model)
}

/// Read a `tokenizer.json`
pub fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path)
        .map_err(|e| Error::tokenizer(format!("Failed to load {}: {}", path.display(), e)))
}

/// Write a tokenizer as `tokenizer.json` in `dir`
pub fn save_tokenizer(tokenizer: &Tokenizer, dir: &Path) -> Result<PathBuf> {
    let path = dir.join(TOKENIZER_FILENAME);
    tokenizer
        .save(&path, true)
        .map_err(|e| Error::tokenizer(format!("Failed to save {}: {}", path.display(), e)))?;
    Ok(path)
}
