use anyhow::{bail, Context, Result};
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Hub { model_id: String, revision: String },
    Local(PathBuf),
}

impl std::fmt::Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelSource::Hub { model_id, revision } => write!(f, "{}@{}", model_id, revision),
            ModelSource::Local(dir) => write!(f, "{}", dir.display()),
        }
    }
}

/// On-disk paths of everything needed to build the engine.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Resolves model files, downloading them into the hf-hub cache when needed.
    ///
    /// Blocking: call from a blocking thread.
    pub fn resolve(source: &ModelSource) -> Result<Self> {
        match source {
            ModelSource::Hub { model_id, revision } => Self::from_hub(model_id, revision),
            ModelSource::Local(dir) => Self::from_dir(dir),
        }
    }

    fn from_hub(model_id: &str, revision: &str) -> Result<Self> {
        tracing::info!(model_id, revision, "Fetching model files from the Hugging Face hub");

        let api = ApiBuilder::new()
            .with_progress(false)
            .build()
            .context("Failed to initialize Hugging Face hub client")?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        let config = fetch(&repo, CONFIG_FILE)?;
        let tokenizer = fetch(&repo, TOKENIZER_FILE)?;
        let tokenizer_config = match repo.get(TOKENIZER_CONFIG_FILE) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::debug!(error = %e, "No tokenizer_config.json, chat template unavailable");
                None
            }
        };

        let weights = match repo.get(SINGLE_WEIGHTS_FILE) {
            Ok(path) => vec![path],
            Err(single_err) => {
                tracing::debug!(error = %single_err, "No single weights file, trying sharded index");
                let index = fetch(&repo, WEIGHTS_INDEX_FILE)?;
                shard_names(&index)?
                    .iter()
                    .map(|name| fetch(&repo, name))
                    .collect::<Result<Vec<_>>>()?
            }
        };

        tracing::info!(shards = weights.len(), "Model files ready");
        Ok(Self {
            config,
            tokenizer,
            tokenizer_config,
            weights,
        })
    }

    fn from_dir(dir: &Path) -> Result<Self> {
        tracing::info!(dir = %dir.display(), "Using model files from local directory");

        let config = require(dir, CONFIG_FILE)?;
        let tokenizer = require(dir, TOKENIZER_FILE)?;
        let tokenizer_config = Some(dir.join(TOKENIZER_CONFIG_FILE)).filter(|p| p.is_file());

        let single = dir.join(SINGLE_WEIGHTS_FILE);
        let weights = if single.is_file() {
            vec![single]
        } else {
            let index = require(dir, WEIGHTS_INDEX_FILE).with_context(|| {
                format!("Neither {} nor {} found", SINGLE_WEIGHTS_FILE, WEIGHTS_INDEX_FILE)
            })?;
            shard_names(&index)?
                .iter()
                .map(|name| require(dir, name))
                .collect::<Result<Vec<_>>>()?
        };

        Ok(Self {
            config,
            tokenizer,
            tokenizer_config,
            weights,
        })
    }
}

fn fetch(repo: &ApiRepo, file: &str) -> Result<PathBuf> {
    repo.get(file)
        .with_context(|| format!("Failed to download {}", file))
}

fn require(dir: &Path, file: &str) -> Result<PathBuf> {
    let path = dir.join(file);
    if !path.is_file() {
        bail!("Missing model file: {}", path.display());
    }
    Ok(path)
}

/// Unique shard file names referenced by a safetensors index, in sorted order.
fn shard_names(index_path: &Path) -> Result<BTreeSet<String>> {
    let raw = fs::read_to_string(index_path)
        .with_context(|| format!("Failed to read {}", index_path.display()))?;
    let index: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid JSON in {}", index_path.display()))?;

    let weight_map = index
        .get("weight_map")
        .and_then(|m| m.as_object())
        .with_context(|| format!("No weight_map in {}", index_path.display()))?;

    let names: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str())
        .map(|s| s.to_string())
        .collect();

    if names.is_empty() {
        bail!("Empty weight_map in {}", index_path.display());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn local_dir_with_single_weights_file() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        touch(dir.path(), TOKENIZER_FILE, "{}");
        touch(dir.path(), SINGLE_WEIGHTS_FILE, "");

        let files = ModelFiles::resolve(&ModelSource::Local(dir.path().to_path_buf())).unwrap();
        assert_eq!(files.weights, vec![dir.path().join(SINGLE_WEIGHTS_FILE)]);
        assert!(files.tokenizer_config.is_none());
    }

    #[test]
    fn local_dir_with_sharded_weights() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        touch(dir.path(), TOKENIZER_FILE, "{}");
        touch(dir.path(), TOKENIZER_CONFIG_FILE, "{}");
        touch(
            dir.path(),
            WEIGHTS_INDEX_FILE,
            r#"{"weight_map": {
                "a.weight": "model-00002-of-00002.safetensors",
                "b.weight": "model-00001-of-00002.safetensors",
                "c.weight": "model-00001-of-00002.safetensors"
            }}"#,
        );
        touch(dir.path(), "model-00001-of-00002.safetensors", "");
        touch(dir.path(), "model-00002-of-00002.safetensors", "");

        let files = ModelFiles::resolve(&ModelSource::Local(dir.path().to_path_buf())).unwrap();
        assert_eq!(
            files.weights,
            vec![
                dir.path().join("model-00001-of-00002.safetensors"),
                dir.path().join("model-00002-of-00002.safetensors"),
            ]
        );
        assert!(files.tokenizer_config.is_some());
    }

    #[test]
    fn missing_tokenizer_is_reported_by_name() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        touch(dir.path(), SINGLE_WEIGHTS_FILE, "");

        let err = ModelFiles::resolve(&ModelSource::Local(dir.path().to_path_buf())).unwrap_err();
        assert!(err.to_string().contains(TOKENIZER_FILE), "{}", err);
    }

    #[test]
    fn missing_weights_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        touch(dir.path(), TOKENIZER_FILE, "{}");

        assert!(ModelFiles::resolve(&ModelSource::Local(dir.path().to_path_buf())).is_err());
    }
}
