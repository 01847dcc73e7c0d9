mod batcher;
mod dataset;
pub mod tokenizer;

pub use batcher::{QaBatch, QaBatcher};
pub use dataset::{load_records, split, DataError, PromptTemplate, QaDataset, QaItem, QaRecord};
pub use tokenizer::{QaTokenizer, Tokenizer, TokenizerError};
