use crate::data::QaBatch;
use burn::{
    nn::{
        attention::generate_autoregressive_mask,
        transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput},
        Embedding, EmbeddingConfig, Linear, LinearConfig,
    },
    prelude::*,
    record::{CompactRecorder, RecorderError},
    tensor::{
        activation::{log_softmax, softmax},
        backend::AutodiffBackend,
        TensorData,
    },
    train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep},
};
use rand::Rng;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model";

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("failed to read model config {path}: {message}")]
    Config { path: String, message: String },
    #[error("failed to write model config {path}: {source}")]
    ConfigWrite {
        path: String,
        source: std::io::Error,
    },
    #[error("model weights: {0:?}")]
    Record(RecorderError),
    #[error("tensor data: {0:?}")]
    Data(burn::tensor::DataError),
    #[error("prompt is empty")]
    EmptyPrompt,
}

#[derive(Config)]
pub struct CausalLmConfig {
    pub transformer: TransformerEncoderConfig,
    pub vocab_size: usize,
    pub pad_token: usize,
    pub max_seq_length: usize,
}

impl CausalLmConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> CausalLm<B> {
        let output = LinearConfig::new(self.transformer.d_model, self.vocab_size).init(device);
        let transformer = self.transformer.init(device);
        let embedding_token =
            EmbeddingConfig::new(self.vocab_size, self.transformer.d_model).init(device);
        let embedding_pos =
            EmbeddingConfig::new(self.max_seq_length, self.transformer.d_model).init(device);

        CausalLm {
            transformer,
            embedding_token,
            embedding_pos,
            output,
            vocab_size: self.vocab_size,
            pad_token: self.pad_token,
            max_seq_length: self.max_seq_length,
        }
    }

    pub fn config_path(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE)
    }

    pub fn load_from_dir(dir: &Path) -> Result<Self, ModelError> {
        let path = Self::config_path(dir);
        Self::load(&path).map_err(|e| ModelError::Config {
            path: path.display().to_string(),
            message: format!("{e:?}"),
        })
    }

    pub fn save_to_dir(&self, dir: &Path) -> Result<(), ModelError> {
        let path = Self::config_path(dir);
        self.save(&path).map_err(|source| ModelError::ConfigWrite {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Decoder-only language model: a transformer stack run under a causal mask.
#[derive(Module, Debug)]
pub struct CausalLm<B: Backend> {
    transformer: TransformerEncoder<B>,
    embedding_token: Embedding<B>,
    embedding_pos: Embedding<B>,
    output: Linear<B>,
    vocab_size: usize,
    pad_token: usize,
    max_seq_length: usize,
}

impl<B: Backend> CausalLm<B> {
    /// Loads `config.json` and the recorded weights from a model directory.
    pub fn load(dir: &Path, device: &B::Device) -> Result<(Self, CausalLmConfig), ModelError> {
        let config = CausalLmConfig::load_from_dir(dir)?;
        let model = config
            .init::<B>(device)
            .load_file(dir.join(WEIGHTS_FILE), &CompactRecorder::new(), device)
            .map_err(ModelError::Record)?;
        Ok((model, config))
    }

    pub fn save(self, dir: &Path, config: &CausalLmConfig) -> Result<(), ModelError> {
        config.save_to_dir(dir)?;
        self.save_file(dir.join(WEIGHTS_FILE), &CompactRecorder::new())
            .map_err(ModelError::Record)?;
        Ok(())
    }

    pub fn max_seq_length(&self) -> usize {
        self.max_seq_length
    }

    fn logits(
        &self,
        inputs: Tensor<B, 2, Int>,
        mask_pad: Option<Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 3> {
        let [batch_size, seq_length] = inputs.dims();
        let device = &self.devices()[0];

        let index_positions = Tensor::arange(0..seq_length as i64, device)
            .reshape([1, seq_length])
            .repeat_dim(0, batch_size);

        let embedding_positions = self.embedding_pos.forward(index_positions);
        let embedding_tokens = self.embedding_token.forward(inputs);
        let embedding = embedding_positions + embedding_tokens;

        let mask_attn = generate_autoregressive_mask::<B>(batch_size, seq_length, device);
        let mut input = TransformerEncoderInput::new(embedding).mask_attn(mask_attn);
        if let Some(mask_pad) = mask_pad {
            input = input.mask_pad(mask_pad);
        }

        self.output.forward(self.transformer.forward(input))
    }

    pub fn forward(&self, item: QaBatch<B>) -> ClassificationOutput<B> {
        let [batch_size, seq_length] = item.tokens_inputs.dims();
        let device = &self.devices()[0];

        let inputs = item.tokens_inputs.to_device(device);
        let targets = item.targets.to_device(device);
        let mask_pad = item.mask_pad.to_device(device);

        let output = self.logits(inputs, Some(mask_pad));
        let output_flatten = output.reshape([batch_size * seq_length, self.vocab_size]);
        let targets_flatten = targets.reshape([batch_size * seq_length]);

        let loss = causal_lm_loss(output_flatten.clone(), targets_flatten.clone(), self.pad_token);

        ClassificationOutput {
            loss,
            output: output_flatten,
            targets: targets_flatten,
        }
    }

    /// Samples up to `max_new_tokens` continuation tokens for `prompt`.
    ///
    /// Generation stops before any token in `stop_tokens`; the stop token is
    /// not part of the result. A non-positive temperature decodes greedily.
    pub fn generate<R: Rng>(
        &self,
        prompt: &[usize],
        max_new_tokens: usize,
        temperature: f64,
        stop_tokens: &[usize],
        rng: &mut R,
    ) -> Result<Vec<usize>, ModelError> {
        if prompt.is_empty() {
            return Err(ModelError::EmptyPrompt);
        }
        let device = &self.devices()[0];
        let mut sequence = prompt.to_vec();
        let mut generated = Vec::new();

        for _ in 0..max_new_tokens {
            // Crop the context to the positional table
            let start = sequence.len().saturating_sub(self.max_seq_length);
            let context: Vec<i64> = sequence[start..].iter().map(|t| *t as i64).collect();
            let seq_len = context.len();

            let inputs = Tensor::<B, 2, Int>::from_data(
                TensorData::new(context, [1, seq_len]),
                device,
            );
            let logits = self.logits(inputs, None);
            let last_logits = logits
                .slice([0..1, (seq_len - 1)..seq_len, 0..self.vocab_size])
                .reshape([1, self.vocab_size]);

            let next = if temperature <= 0.0 {
                self.argmax(last_logits)?
            } else {
                let probs = softmax(last_logits / temperature, 1);
                self.sample_multinomial(probs, rng)?
            };

            if stop_tokens.contains(&next) {
                break;
            }
            sequence.push(next);
            generated.push(next);
        }

        Ok(generated)
    }

    fn argmax(&self, logits: Tensor<B, 2>) -> Result<usize, ModelError> {
        let index: Vec<i64> = logits
            .argmax(1)
            .into_data()
            .convert::<i64>()
            .to_vec()
            .map_err(ModelError::Data)?;
        Ok(index.first().copied().unwrap_or_default() as usize)
    }

    fn sample_multinomial<R: Rng>(
        &self,
        probs: Tensor<B, 2>,
        rng: &mut R,
    ) -> Result<usize, ModelError> {
        let [_, vocab_size] = probs.dims();
        let probs: Vec<f32> = probs
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(ModelError::Data)?;

        let rand_val: f32 = rng.gen();
        let mut cumsum = 0.0;
        for (token_idx, p) in probs.iter().take(vocab_size).enumerate() {
            cumsum += p;
            if rand_val < cumsum {
                return Ok(token_idx);
            }
        }
        Ok(vocab_size - 1)
    }
}

/// Cross-entropy averaged over the non-pad targets only, so the value does
/// not depend on how far a batch is padded.
pub fn causal_lm_loss<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
    pad_token: usize,
) -> Tensor<B, 1> {
    let [num_targets] = targets.dims();

    let log_probs = log_softmax(logits, 1)
        .gather(1, targets.clone().reshape([num_targets, 1]))
        .reshape([num_targets]);
    let weights = targets.not_equal_elem(pad_token as i64).float();

    // Clamped so an all-pad batch yields zero instead of NaN
    let count = weights.clone().sum().clamp_min(1.0);
    (log_probs * weights).sum().neg() / count
}

impl<B: AutodiffBackend> TrainStep<QaBatch<B>, ClassificationOutput<B>> for CausalLm<B> {
    fn step(&self, item: QaBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward(item);
        let grads = item.loss.backward();
        TrainOutput::new(self, grads, item)
    }
}

impl<B: Backend> ValidStep<QaBatch<B>, ClassificationOutput<B>> for CausalLm<B> {
    fn step(&self, item: QaBatch<B>) -> ClassificationOutput<B> {
        self.forward(item)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::{QaBatcher, QaItem};
    use burn::backend::ndarray::NdArray;
    use burn::data::dataloader::batcher::Batcher;
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;

    pub(crate) fn tiny_config(vocab_size: usize, pad_token: usize) -> CausalLmConfig {
        let transformer = TransformerEncoderConfig::new(16, 32, 2, 1).with_dropout(0.0);
        CausalLmConfig::new(transformer, vocab_size, pad_token, 16)
    }

    #[test]
    fn test_forward_loss() {
        let device = Default::default();
        let model = tiny_config(20, 19).init::<TestBackend>(&device);
        let batcher = QaBatcher::<TestBackend>::new(device);

        let items = vec![
            QaItem::new(vec![1, 2, 3, 19], vec![1, 2, 3, 19], vec![1, 1, 1, 0]),
            QaItem::new(vec![4, 5, 6, 7], vec![4, 5, 6, 7], vec![1, 1, 1, 1]),
        ];
        let output = model.forward(batcher.batch(items));

        assert_eq!(output.output.dims(), [6, 20]);
        assert_eq!(output.targets.dims(), [6]);
        let loss: f32 = output.loss.into_scalar();
        assert!(loss.is_finite() && loss > 0.0);
    }

    fn uniform_loss(real_targets: &[i64], length: usize, vocab_size: usize, pad: i64) -> f32 {
        let device = Default::default();
        let mut targets = real_targets.to_vec();
        targets.resize(length, pad);

        let logits = Tensor::<TestBackend, 2>::zeros([length, vocab_size], &device);
        let targets =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(targets, [length]), &device);
        causal_lm_loss(logits, targets, pad as usize).into_scalar()
    }

    #[test]
    fn test_loss_of_uniform_logits_is_log_vocab() {
        let expected = (20f32).ln();

        for length in [2, 3, 64, 511] {
            let loss = uniform_loss(&[4, 7], length, 20, 19);
            assert!(
                (loss - expected).abs() < 1e-4,
                "length {length}: loss {loss}, expected {expected}"
            );
        }
    }

    #[test]
    fn test_loss_of_all_pad_targets_is_zero() {
        let loss = uniform_loss(&[], 4, 20, 19);
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn test_loss_ignores_pad_targets() {
        let device = Default::default();
        // Confident on token 3, so only the unpadded position contributes.
        let logits = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![0.0f32, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 2.0], [2, 4]),
            &device,
        );
        let targets =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(vec![3i64, 0], [2]), &device);
        let loss: f32 = causal_lm_loss(logits, targets, 0).into_scalar();

        let expected = -(2f32.exp() / (3.0 + 2f32.exp())).ln();
        assert!((loss - expected).abs() < 1e-5, "loss {loss}, expected {expected}");
    }

    #[test]
    fn test_forward_loss_is_independent_of_padding() {
        let device = Default::default();
        let model = tiny_config(20, 19).init::<TestBackend>(&device);
        let batcher = QaBatcher::<TestBackend>::new(device);

        let padded = |length: usize| {
            let mut ids = vec![1, 2, 3, 4];
            let mask: Vec<u8> = (0..length).map(|i| u8::from(i < ids.len())).collect();
            ids.resize(length, 19);
            QaItem::new(ids.clone(), ids, mask)
        };

        let short: f32 = model.forward(batcher.batch(vec![padded(6)])).loss.into_scalar();
        let long: f32 = model.forward(batcher.batch(vec![padded(16)])).loss.into_scalar();
        assert!((short - long).abs() < 1e-4, "short {short}, long {long}");
    }

    #[test]
    fn test_generate_respects_limits() {
        let device = Default::default();
        let model = tiny_config(20, 19).init::<TestBackend>(&device);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        // Longer than the positional table; context gets cropped.
        let prompt: Vec<usize> = (0..24).map(|i| i % 18).collect();
        let generated = model.generate(&prompt, 5, 0.8, &[], &mut rng).unwrap();
        assert_eq!(generated.len(), 5);
        assert!(generated.iter().all(|t| *t < 20));

        let greedy = model.generate(&[1, 2], 3, 0.0, &[], &mut rng).unwrap();
        let again = model.generate(&[1, 2], 3, 0.0, &[], &mut rng).unwrap();
        assert_eq!(greedy, again);

        // Stopping on the first greedy token yields nothing.
        let stopped = model.generate(&[1, 2], 3, 0.0, &[greedy[0]], &mut rng).unwrap();
        assert!(stopped.is_empty());

        assert!(matches!(
            model.generate(&[], 3, 0.0, &[], &mut rng),
            Err(ModelError::EmptyPrompt)
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = tiny_config(20, 19);
        let model = config.init::<TestBackend>(&device);

        model.save(dir.path(), &config).unwrap();
        assert!(dir.path().join(CONFIG_FILE).exists());
        assert!(dir.path().join("model.mpk").exists());

        let (loaded, loaded_config) = CausalLm::<TestBackend>::load(dir.path(), &device).unwrap();
        assert_eq!(loaded_config.vocab_size, 20);
        assert_eq!(loaded.max_seq_length(), 16);

        assert!(CausalLm::<TestBackend>::load(&dir.path().join("missing"), &device).is_err());
    }
}
