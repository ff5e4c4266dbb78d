//! Model and dataset resolution
//!
//! An identifier is either a local path or a HuggingFace Hub repository id.
//! Hub files are downloaded through `hf-hub` into its cache.

use crate::{Error, Result};
use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use std::path::{Path, PathBuf};

/// Weight file read from a model repository
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Model configuration file
pub const CONFIG_FILE: &str = "config.json";

/// Tokenizer definition file
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Tokenizer settings (special tokens)
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

/// Byte-level BPE vocabulary, used when no `tokenizer.json` is published
pub const VOCAB_FILE: &str = "vocab.json";

/// Byte-level BPE merges, paired with [`VOCAB_FILE`]
pub const MERGES_FILE: &str = "merges.txt";

/// Where the tokenizer definition comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenizerFiles {
    /// Serialized `tokenizers` pipeline
    Json(PathBuf),
    /// GPT-2 style vocabulary and merge list
    Bpe { vocab: PathBuf, merges: PathBuf },
}

/// Local files making up a model checkpoint
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: TokenizerFiles,
    pub tokenizer_config: Option<PathBuf>,
    pub weights: PathBuf,
}

impl ModelFiles {
    /// Collect checkpoint files from a local directory
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let required = |name: &str| {
            let path = dir.join(name);
            if path.is_file() {
                Ok(path)
            } else {
                Err(Error::Hub(format!(
                    "{name} not found in model directory {}",
                    dir.display()
                )))
            }
        };

        let tokenizer_json = dir.join(TOKENIZER_FILE);
        let tokenizer = if tokenizer_json.is_file() {
            TokenizerFiles::Json(tokenizer_json)
        } else {
            TokenizerFiles::Bpe {
                vocab: required(VOCAB_FILE)?,
                merges: required(MERGES_FILE)?,
            }
        };

        let tokenizer_config = dir.join(TOKENIZER_CONFIG_FILE);
        Ok(Self {
            config: required(CONFIG_FILE)?,
            tokenizer,
            tokenizer_config: tokenizer_config.is_file().then_some(tokenizer_config),
            weights: required(WEIGHTS_FILE)?,
        })
    }
}

/// HuggingFace Hub fetcher with local-path passthrough
#[derive(Debug, Clone, Default)]
pub struct HubFetcher {
    token: Option<String>,
    cache_dir: Option<PathBuf>,
    revision: Option<String>,
}

impl HubFetcher {
    /// Create a fetcher authenticated from `HF_TOKEN` when present
    pub fn new() -> Self {
        Self {
            token: Self::resolve_token(),
            ..Self::default()
        }
    }

    /// Read the access token from the environment
    pub fn resolve_token() -> Option<String> {
        std::env::var("HF_TOKEN").ok().filter(|t| !t.is_empty())
    }

    /// Set cache directory
    #[must_use]
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Pin a git revision (branch, tag, or commit)
    #[must_use]
    pub fn revision(mut self, rev: impl Into<String>) -> Self {
        self.revision = Some(rev.into());
        self
    }

    /// Resolve a model id or directory to its checkpoint files
    pub fn fetch_model(&self, model_id: &str) -> Result<ModelFiles> {
        let local = Path::new(model_id);
        if local.is_dir() {
            tracing::info!(path = %local.display(), "using local model directory");
            return ModelFiles::from_dir(local);
        }

        Self::parse_repo_id(model_id)?;
        tracing::info!(repo = model_id, "fetching model from the Hub");

        let api = self.api()?;
        let repo = api.repo(self.repo(model_id, RepoType::Model));
        let get = |file: &str| {
            repo.get(file)
                .map_err(|e| Error::Hub(format!("Failed to fetch {file} from {model_id}: {e}")))
        };

        let tokenizer = match repo.get(TOKENIZER_FILE) {
            Ok(path) => TokenizerFiles::Json(path),
            Err(e) => {
                tracing::debug!("no {TOKENIZER_FILE} in {model_id} ({e}), using {VOCAB_FILE} and {MERGES_FILE}");
                TokenizerFiles::Bpe {
                    vocab: get(VOCAB_FILE)?,
                    merges: get(MERGES_FILE)?,
                }
            }
        };

        Ok(ModelFiles {
            config: get(CONFIG_FILE)?,
            tokenizer,
            tokenizer_config: repo.get(TOKENIZER_CONFIG_FILE).ok(),
            weights: get(WEIGHTS_FILE)?,
        })
    }

    /// Resolve a dataset id or JSONL path to a local file
    pub fn fetch_dataset(&self, dataset: &str, file: &str) -> Result<PathBuf> {
        let local = Path::new(dataset);
        if local.is_file() {
            tracing::info!(path = %local.display(), "using local dataset file");
            return Ok(local.to_path_buf());
        }

        Self::parse_repo_id(dataset)?;
        tracing::info!(repo = dataset, file, "fetching dataset from the Hub");

        let api = self.api()?;
        api.repo(self.repo(dataset, RepoType::Dataset))
            .get(file)
            .map_err(|e| Error::Hub(format!("Failed to fetch {file} from {dataset}: {e}")))
    }

    fn api(&self) -> Result<Api> {
        let mut builder = ApiBuilder::new().with_token(self.token.clone());
        if let Some(dir) = &self.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        builder
            .build()
            .map_err(|e| Error::Hub(format!("Failed to initialize HF API: {e}")))
    }

    fn repo(&self, repo_id: &str, repo_type: RepoType) -> Repo {
        match &self.revision {
            Some(rev) => Repo::with_revision(repo_id.to_string(), repo_type, rev.clone()),
            None => Repo::new(repo_id.to_string(), repo_type),
        }
    }

    /// Validate an "org/name" repository id
    fn parse_repo_id(repo_id: &str) -> Result<(&str, &str)> {
        match repo_id.split_once('/') {
            Some((org, name)) if !org.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok((org, name))
            }
            _ => Err(Error::Hub(format!(
                "Invalid repository id {repo_id:?}: expected a local path or \"org/name\""
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_repo_id() {
        assert_eq!(
            HubFetcher::parse_repo_id("facebook/opt-125m").unwrap(),
            ("facebook", "opt-125m")
        );
        assert!(HubFetcher::parse_repo_id("opt-125m").is_err());
        assert!(HubFetcher::parse_repo_id("/opt").is_err());
        assert!(HubFetcher::parse_repo_id("a/b/c").is_err());
    }

    #[test]
    fn test_local_model_dir() {
        let dir = TempDir::new().unwrap();
        for file in [CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE] {
            std::fs::write(dir.path().join(file), b"{}").unwrap();
        }

        let files = HubFetcher::default()
            .fetch_model(dir.path().to_str().unwrap())
            .unwrap();
        assert_eq!(files.weights, dir.path().join(WEIGHTS_FILE));
        assert_eq!(
            files.tokenizer,
            TokenizerFiles::Json(dir.path().join(TOKENIZER_FILE))
        );
        assert!(files.tokenizer_config.is_none());
    }

    #[test]
    fn test_local_model_dir_with_bpe_files() {
        let dir = TempDir::new().unwrap();
        for file in [CONFIG_FILE, VOCAB_FILE, MERGES_FILE, WEIGHTS_FILE, TOKENIZER_CONFIG_FILE] {
            std::fs::write(dir.path().join(file), b"{}").unwrap();
        }

        let files = ModelFiles::from_dir(dir.path()).unwrap();
        assert!(matches!(files.tokenizer, TokenizerFiles::Bpe { .. }));
        assert!(files.tokenizer_config.is_some());
    }

    #[test]
    fn test_local_model_dir_missing_weights() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), b"{}").unwrap();
        std::fs::write(dir.path().join(TOKENIZER_FILE), b"{}").unwrap();

        let err = ModelFiles::from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Hub(ref m) if m.contains(WEIGHTS_FILE)));
    }

    #[test]
    fn test_local_dataset_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dolly.jsonl");
        std::fs::write(&path, b"").unwrap();

        let resolved = HubFetcher::default()
            .fetch_dataset(path.to_str().unwrap(), "ignored.jsonl")
            .unwrap();
        assert_eq!(resolved, path);
    }

    #[test]
    fn test_invalid_dataset_id() {
        let result = HubFetcher::default().fetch_dataset("not-a-path-or-repo", "x.jsonl");
        assert!(matches!(result, Err(Error::Hub(_))));
    }
}
