//! Tokenizer loading and special-token resolution

use crate::hub::{ModelFiles, TokenizerFiles};
use crate::{Error, Result};
use serde_json::Value;
use std::path::Path;
use tokenizers::models::bpe::BPE;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::processors::template::TemplateProcessing;
use tokenizers::{AddedToken, Tokenizer};

/// Fallback end-of-sequence token of byte-level BPE checkpoints
pub const DEFAULT_EOS_TOKEN: &str = "</s>";

/// Special tokens of OPT-style vocabularies, registered when present
const BPE_SPECIAL_TOKENS: [&str; 4] = ["<s>", "<pad>", "</s>", "<unk>"];

/// Tokenizer with resolved EOS and padding tokens
///
/// Padding reuses the EOS token, so padded positions and sequence ends
/// share one id.
pub struct TextTokenizer {
    inner: Tokenizer,
    eos_token: String,
    eos_id: u32,
}

impl TextTokenizer {
    /// Load the tokenizer of a checkpoint and resolve its EOS token
    ///
    /// A serialized `tokenizer.json` carries its own post-processor. A bare
    /// `vocab.json` + `merges.txt` pair gets its special tokens registered
    /// and, when `tokenizer_config.json` sets `add_bos_token`, a template
    /// that prepends the BOS token.
    pub fn load(files: &ModelFiles) -> Result<Self> {
        let tokenizer_config = match &files.tokenizer_config {
            Some(path) => Some(read_json(path)?),
            None => None,
        };

        let inner = match &files.tokenizer {
            TokenizerFiles::Json(path) => Tokenizer::from_file(path).map_err(|e| {
                Error::Tokenizer(format!("Failed to load {}: {e}", path.display()))
            })?,
            TokenizerFiles::Bpe { vocab, merges } => {
                let mut tokenizer = byte_level_bpe(vocab, merges)?;
                if let Some(config) = &tokenizer_config {
                    add_bos_template(&mut tokenizer, config)?;
                }
                tokenizer
            }
        };

        let config_eos = tokenizer_config
            .as_ref()
            .and_then(|config| special_token(config, "eos_token"));

        let (eos_token, eos_id) = match config_eos {
            Some(token) => {
                let id = inner.token_to_id(&token).ok_or_else(|| {
                    Error::Tokenizer(format!("EOS token {token:?} is not in the vocabulary"))
                })?;
                (token, id)
            }
            None => match read_json(&files.config)?.get("eos_token_id").and_then(Value::as_u64) {
                Some(id) => {
                    let id = u32::try_from(id).map_err(|_| {
                        Error::Tokenizer(format!("eos_token_id {id} out of range"))
                    })?;
                    let token = inner
                        .id_to_token(id)
                        .unwrap_or_else(|| DEFAULT_EOS_TOKEN.to_string());
                    (token, id)
                }
                None => {
                    let id = inner.token_to_id(DEFAULT_EOS_TOKEN).ok_or_else(|| {
                        Error::Tokenizer("No EOS token configured and </s> is unknown".to_string())
                    })?;
                    (DEFAULT_EOS_TOKEN.to_string(), id)
                }
            },
        };

        tracing::debug!(eos_token = %eos_token, eos_id, vocab = inner.get_vocab_size(true), "loaded tokenizer");
        Ok(Self::from_parts(inner, eos_token, eos_id))
    }

    /// Wrap an already built tokenizer
    pub fn from_parts(inner: Tokenizer, eos_token: String, eos_id: u32) -> Self {
        Self {
            inner,
            eos_token,
            eos_id,
        }
    }

    /// Encode one text
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| Error::Tokenizer(format!("Encoding failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encode many texts in order
    pub fn encode_batch<S: AsRef<str>>(&self, texts: &[S], add_special_tokens: bool) -> Result<Vec<Vec<u32>>> {
        texts
            .iter()
            .map(|t| self.encode(t.as_ref(), add_special_tokens))
            .collect()
    }

    pub fn eos_token(&self) -> &str {
        &self.eos_token
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    /// Padding token, identical to EOS
    pub fn pad_token(&self) -> &str {
        &self.eos_token
    }

    pub fn pad_id(&self) -> u32 {
        self.eos_id
    }

    /// Vocabulary size including added tokens
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

fn byte_level_bpe(vocab: &Path, merges: &Path) -> Result<Tokenizer> {
    let path_str = |p: &Path| {
        p.to_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Tokenizer(format!("Non UTF-8 path {}", p.display())))
    };

    let model = BPE::from_file(&path_str(vocab)?, &path_str(merges)?)
        .build()
        .map_err(|e| Error::Tokenizer(format!("Failed to build BPE model: {e}")))?;

    let mut tokenizer = Tokenizer::new(model);
    tokenizer.with_pre_tokenizer(Some(ByteLevel::default().add_prefix_space(false)));
    tokenizer.with_decoder(Some(ByteLevel::default()));

    let special: Vec<AddedToken> = BPE_SPECIAL_TOKENS
        .iter()
        .filter(|token| tokenizer.token_to_id(token).is_some())
        .map(|token| AddedToken::from(*token, true))
        .collect();
    tokenizer.add_special_tokens(&special);
    Ok(tokenizer)
}

/// Prepend the configured BOS token to every encoded text
fn add_bos_template(tokenizer: &mut Tokenizer, config: &Value) -> Result<()> {
    if !config
        .get("add_bos_token")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return Ok(());
    }

    let bos = special_token(config, "bos_token")
        .ok_or_else(|| Error::Tokenizer("add_bos_token is set without a bos_token".to_string()))?;
    let bos_id = tokenizer
        .token_to_id(&bos)
        .ok_or_else(|| Error::Tokenizer(format!("BOS token {bos:?} is not in the vocabulary")))?;

    let template = TemplateProcessing::builder()
        .try_single(format!("{bos} $A"))
        .map_err(|e| Error::Tokenizer(format!("Invalid BOS template: {e}")))?
        .special_tokens(vec![(bos.clone(), bos_id)])
        .build()
        .map_err(|e| Error::Tokenizer(format!("Invalid BOS template: {e}")))?;
    tokenizer.with_post_processor(Some(template));

    tracing::debug!(bos_token = %bos, bos_id, "prepending BOS token");
    Ok(())
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Special tokens are either plain strings or added-token objects
fn special_token(config: &Value, key: &str) -> Option<String> {
    match config.get(key)? {
        Value::String(token) => Some(token.clone()),
        Value::Object(token) => token.get("content")?.as_str().map(str::to_string),
        _ => None,
    }
}
