use super::tokenizer::{Tokenizer, TokenizerError};
use burn::data::dataset::Dataset;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error("dataset {0} contains no records")]
    Empty(String),
    #[error("validation fraction must be in [0, 1), got {0}")]
    InvalidFraction(f64),
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
}

/// One question/answer pair as stored in the training file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QaRecord {
    pub question: String,
    pub answer: String,
}

/// Reads a JSON array of question/answer records.
pub fn load_records(path: impl AsRef<Path>) -> Result<Vec<QaRecord>, DataError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| DataError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let records: Vec<QaRecord> =
        serde_json::from_str(&content).map_err(|source| DataError::Json {
            path: path.display().to_string(),
            source,
        })?;

    tracing::info!(path = %path.display(), records = records.len(), "loaded dataset");
    Ok(records)
}

/// Deterministically splits records into (train, validation).
pub fn split(
    records: Vec<QaRecord>,
    validation_fraction: f64,
    seed: u64,
) -> Result<(Vec<QaRecord>, Vec<QaRecord>), DataError> {
    if !(0.0..1.0).contains(&validation_fraction) {
        return Err(DataError::InvalidFraction(validation_fraction));
    }
    if validation_fraction == 0.0 {
        return Ok((records, Vec::new()));
    }

    let mut records = records;
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    records.shuffle(&mut rng);

    let n_valid = (records.len() as f64 * validation_fraction).round() as usize;
    // Keep at least one training record.
    let n_valid = n_valid.min(records.len().saturating_sub(1));
    let valid = records.split_off(records.len() - n_valid);

    Ok((records, valid))
}

pub struct PromptTemplate;

impl PromptTemplate {
    pub fn training(record: &QaRecord) -> String {
        format!("问题：{}\n回答：{}<sep>", record.question, record.answer)
    }

    pub fn generation(question: &str) -> String {
        format!("问题：{}\n回答：", question)
    }
}

/// A tokenized prompt, padded to a fixed length.
#[derive(new, Clone, Debug)]
pub struct QaItem {
    pub input_ids: Vec<usize>,
    pub labels: Vec<usize>,
    pub attention_mask: Vec<u8>,
}

pub struct QaDataset {
    items: Vec<QaItem>,
}

impl QaDataset {
    pub fn new(
        records: &[QaRecord],
        tokenizer: &dyn Tokenizer,
        max_length: usize,
    ) -> Result<Self, DataError> {
        let items = records
            .iter()
            .map(|record| Self::tokenize(record, tokenizer, max_length))
            .collect::<Result<Vec<_>, _>>()?;

        let truncated = items
            .iter()
            .filter(|item| item.attention_mask.iter().all(|m| *m == 1))
            .count();
        if truncated > 0 {
            tracing::debug!(truncated, max_length, "prompts filling the whole context");
        }

        Ok(Self { items })
    }

    fn tokenize(
        record: &QaRecord,
        tokenizer: &dyn Tokenizer,
        max_length: usize,
    ) -> Result<QaItem, DataError> {
        let prompt = PromptTemplate::training(record);
        let mut input_ids = tokenizer.encode(&prompt)?;
        input_ids.truncate(max_length);

        let length = input_ids.len();
        let mut attention_mask = vec![1u8; length];
        attention_mask.resize(max_length, 0);
        input_ids.resize(max_length, tokenizer.pad_token());

        let labels = input_ids.clone();
        Ok(QaItem::new(input_ids, labels, attention_mask))
    }
}

impl Dataset<QaItem> for QaDataset {
    fn get(&self, index: usize) -> Option<QaItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}
