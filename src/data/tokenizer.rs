use std::path::Path;
use tokenizers::AddedToken;

/// Special tokens registered on top of the pretrained vocabulary.
pub const SPECIAL_TOKENS: [&str; 15] = [
    "<sep>",
    "<pad>",
    "<mask>",
    "<predict>",
    "<FIM_SUFFIX>",
    "<FIM_PREFIX>",
    "<FIM_MIDDLE>",
    "<commit_before>",
    "<commit_msg>",
    "<commit_after>",
    "<jupyter_start>",
    "<jupyter_text>",
    "<jupyter_code>",
    "<jupyter_output>",
    "<empty_output>",
];

pub const EOD_TOKEN: &str = "<eod>";
pub const SEP_TOKEN: &str = "<sep>";
pub const PAD_TOKEN: &str = "<pad>";

#[derive(Debug, thiserror::Error)]
pub enum TokenizerError {
    #[error("failed to load tokenizer from {path}: {message}")]
    Load { path: String, message: String },
    #[error("failed to save tokenizer to {path}: {message}")]
    Save { path: String, message: String },
    #[error("tokenizer is missing special token {0}")]
    MissingToken(&'static str),
    #[error("encoding failed: {0}")]
    Encode(String),
    #[error("decoding failed: {0}")]
    Decode(String),
}

pub trait Tokenizer: Send + Sync {
    fn encode(&self, value: &str) -> Result<Vec<usize>, TokenizerError>;
    fn decode(&self, tokens: &[usize]) -> Result<String, TokenizerError>;
    fn vocab_size(&self) -> usize;
    fn pad_token(&self) -> usize;
}

/// HuggingFace tokenizer with the fine-tuning special tokens registered.
#[derive(Clone)]
pub struct QaTokenizer {
    tokenizer: tokenizers::Tokenizer,
    pad_id: usize,
    sep_id: usize,
    eod_id: usize,
}

impl QaTokenizer {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TokenizerError> {
        let path = path.as_ref();
        let tokenizer =
            tokenizers::Tokenizer::from_file(path).map_err(|e| TokenizerError::Load {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        Self::new(tokenizer)
    }

    pub fn new(mut tokenizer: tokenizers::Tokenizer) -> Result<Self, TokenizerError> {
        let mut added: Vec<AddedToken> = SPECIAL_TOKENS
            .iter()
            .map(|token| AddedToken::from(*token, true))
            .collect();
        added.push(AddedToken::from(EOD_TOKEN, true));

        // Already-registered tokens are skipped by the tokenizer.
        let count = tokenizer.add_special_tokens(&added);
        tracing::debug!(count, "registered special tokens");

        let lookup = |token: &'static str| {
            tokenizer
                .token_to_id(token)
                .map(|id| id as usize)
                .ok_or(TokenizerError::MissingToken(token))
        };
        let pad_id = lookup(PAD_TOKEN)?;
        let sep_id = lookup(SEP_TOKEN)?;
        let eod_id = lookup(EOD_TOKEN)?;

        Ok(Self {
            tokenizer,
            pad_id,
            sep_id,
            eod_id,
        })
    }

    pub fn sep_token(&self) -> usize {
        self.sep_id
    }

    pub fn eod_token(&self) -> usize {
        self.eod_id
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TokenizerError> {
        let path = path.as_ref();
        self.tokenizer
            .save(path, true)
            .map_err(|e| TokenizerError::Save {
                path: path.display().to_string(),
                message: e.to_string(),
            })
    }
}

impl Tokenizer for QaTokenizer {
    fn encode(&self, value: &str) -> Result<Vec<usize>, TokenizerError> {
        // No BOS/EOS: the prompt template carries its own separator.
        let encoding = self
            .tokenizer
            .encode(value, false)
            .map_err(|e| TokenizerError::Encode(e.to_string()))?;
        Ok(encoding.get_ids().iter().map(|id| *id as usize).collect())
    }

    fn decode(&self, tokens: &[usize]) -> Result<String, TokenizerError> {
        let ids: Vec<u32> = tokens.iter().map(|id| *id as u32).collect();
        self.tokenizer
            .decode(&ids, true)
            .map_err(|e| TokenizerError::Decode(e.to_string()))
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    fn pad_token(&self) -> usize {
        self.pad_id
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": { "type": "Whitespace" },
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {
      "[UNK]": 0,
      "问题": 1,
      "回答": 2,
      "：": 3,
      "what": 4,
      "is": 5,
      "rust": 6,
      "a": 7,
      "language": 8,
      "hello": 9,
      "world": 10
    },
    "unk_token": "[UNK]"
  }
}"#;

    pub(crate) const BASE_VOCAB: usize = 11;

    /// Writes a small word-level tokenizer into `dir` and returns its path.
    pub(crate) fn write_test_tokenizer(dir: &Path) -> PathBuf {
        let path = dir.join("tokenizer.json");
        std::fs::write(&path, TOKENIZER_JSON).unwrap();
        path
    }

    pub(crate) fn test_tokenizer() -> QaTokenizer {
        let dir = tempfile::tempdir().unwrap();
        QaTokenizer::from_file(write_test_tokenizer(dir.path())).unwrap()
    }

    #[test]
    fn test_special_tokens_are_registered() {
        let tokenizer = test_tokenizer();

        assert_eq!(tokenizer.vocab_size(), BASE_VOCAB + SPECIAL_TOKENS.len() + 1);
        assert!(tokenizer.pad_token() >= BASE_VOCAB);
        assert_ne!(tokenizer.pad_token(), tokenizer.sep_token());
        assert_ne!(tokenizer.sep_token(), tokenizer.eod_token());
    }

    #[test]
    fn test_registration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tokenizer = QaTokenizer::from_file(write_test_tokenizer(dir.path())).unwrap();
        let saved = dir.path().join("saved.json");
        tokenizer.save(&saved).unwrap();

        let reloaded = QaTokenizer::from_file(&saved).unwrap();
        assert_eq!(reloaded.vocab_size(), tokenizer.vocab_size());
        assert_eq!(reloaded.pad_token(), tokenizer.pad_token());
        assert_eq!(reloaded.eod_token(), tokenizer.eod_token());
    }

    #[test]
    fn test_encode_keeps_separator_without_bos_eos() {
        let tokenizer = test_tokenizer();

        let tokens = tokenizer.encode("what is rust<sep>").unwrap();
        assert_eq!(tokens, vec![4, 5, 6, tokenizer.sep_token()]);

        let decoded = tokenizer.decode(&tokens).unwrap();
        assert_eq!(decoded, "what is rust");
    }

    #[test]
    fn test_missing_file() {
        let result = QaTokenizer::from_file("does/not/exist/tokenizer.json");
        assert!(matches!(result, Err(TokenizerError::Load { .. })));
    }
}
