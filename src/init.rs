use crate::data::{QaTokenizer, Tokenizer, TokenizerError};
use crate::model::{CausalLmConfig, ModelError};
use crate::training::TOKENIZER_FILE;
use burn::{nn::transformer::TransformerEncoderConfig, prelude::*};
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("d_model {d_model} is not divisible by n_head {n_head}")]
    HeadMismatch { d_model: usize, n_head: usize },
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shape of a freshly initialised base model.
#[derive(Config, Debug)]
pub struct BaseModelArgs {
    pub d_model: usize,
    pub d_ff: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub max_seq_length: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
}

/// Writes a randomly initialised model directory sized to the tokenizer
/// (special tokens included).
pub fn init_base_model<B: Backend>(
    tokenizer_path: &Path,
    out_dir: &Path,
    args: &BaseModelArgs,
    device: &B::Device,
) -> Result<CausalLmConfig, InitError> {
    if args.n_head == 0 || args.d_model % args.n_head != 0 {
        return Err(InitError::HeadMismatch {
            d_model: args.d_model,
            n_head: args.n_head,
        });
    }

    let tokenizer = QaTokenizer::from_file(tokenizer_path)?;

    let transformer =
        TransformerEncoderConfig::new(args.d_model, args.d_ff, args.n_head, args.n_layer)
            .with_norm_first(true)
            .with_dropout(args.dropout);
    let config = CausalLmConfig::new(
        transformer,
        tokenizer.vocab_size(),
        tokenizer.pad_token(),
        args.max_seq_length,
    );

    fs::create_dir_all(out_dir)?;
    config.init::<B>(device).save(out_dir, &config)?;
    tokenizer.save(out_dir.join(TOKENIZER_FILE))?;

    tracing::info!(
        out_dir = %out_dir.display(),
        vocab_size = config.vocab_size,
        "initialised base model"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tokenizer::tests::{write_test_tokenizer, BASE_VOCAB};
    use crate::data::tokenizer::SPECIAL_TOKENS;
    use crate::model::CausalLm;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_init_sizes_vocab_to_tokenizer() {
        let root = tempfile::tempdir().unwrap();
        let tokenizer = write_test_tokenizer(root.path());
        let out = root.path().join("base");
        let device = Default::default();

        let config = init_base_model::<TestBackend>(
            &tokenizer,
            &out,
            &BaseModelArgs::new(16, 32, 1, 2, 8),
            &device,
        )
        .unwrap();
        assert_eq!(config.vocab_size, BASE_VOCAB + SPECIAL_TOKENS.len() + 1);

        let (_, loaded) = CausalLm::<TestBackend>::load(&out, &device).unwrap();
        assert_eq!(loaded.pad_token, config.pad_token);
        assert!(out.join(TOKENIZER_FILE).exists());
    }

    #[test]
    fn test_init_rejects_bad_heads() {
        let root = tempfile::tempdir().unwrap();
        let tokenizer = write_test_tokenizer(root.path());

        let result = init_base_model::<TestBackend>(
            &tokenizer,
            &root.path().join("base"),
            &BaseModelArgs::new(10, 32, 1, 3, 8),
            &Default::default(),
        );
        assert!(matches!(result, Err(InitError::HeadMismatch { .. })));
    }
}
