use crate::data::{
    load_records, split, DataError, QaBatch, QaBatcher, QaDataset, QaTokenizer, Tokenizer,
    TokenizerError,
};
use crate::model::{CausalLm, ModelError};
use crate::perplexity::PerplexityMetric;
use crate::progress::ProgressIndicator;
use crate::session::{is_non_empty_dir, RunMetadata};
use burn::{
    backend::{libtorch::LibTorchDevice, Autodiff, LibTorch},
    config::Config,
    data::dataloader::{DataLoader, DataLoaderBuilder},
    grad_clipping::GradientClippingConfig,
    lr_scheduler::linear::{LinearLrScheduler, LinearLrSchedulerConfig},
    module::AutodiffModule,
    optim::AdamConfig,
    prelude::*,
    record::CompactRecorder,
    tensor::{backend::AutodiffBackend, f16},
    train::{
        checkpoint::KeepLastNCheckpoints,
        metric::{AccuracyMetric, LossMetric},
        LearnerBuilder,
    },
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const TRAINING_ARGS_FILE: &str = "training_args.json";

pub type FullBackend = Autodiff<LibTorch<f32>>;
pub type HalfBackend = Autodiff<LibTorch<f16>>;

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("invalid training arguments: {0}")]
    InvalidArgs(String),
    #[error("output directory {0} is not empty; enable overwrite_output_dir to reuse it")]
    OutputDirNotEmpty(PathBuf),
    #[error("tokenizer has {tokenizer} tokens but the model vocabulary holds {model}")]
    VocabMismatch { tokenizer: usize, model: usize },
    #[error("tokenizer pad id {tokenizer} differs from the model pad id {model}")]
    PadMismatch { tokenizer: usize, model: usize },
    #[error("max_length {max_length} exceeds the model context of {max_seq_length} (+1)")]
    ContextTooLong {
        max_length: usize,
        max_seq_length: usize,
    },
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Hyperparameters of a fine-tuning run.
#[derive(Config, Debug)]
pub struct TrainingArgs {
    #[config(default = "String::from(\"./finetuned_model\")")]
    pub output_dir: String,
    #[config(default = true)]
    pub overwrite_output_dir: bool,
    #[config(default = 3)]
    pub num_train_epochs: usize,
    #[config(default = 2)]
    pub per_device_train_batch_size: usize,
    /// Checkpoints are written at epoch boundaries; this only triggers a
    /// warning when an epoch is longer than the interval.
    #[config(default = 10_000)]
    pub save_steps: usize,
    #[config(default = 2)]
    pub save_total_limit: usize,
    #[config(default = true)]
    pub prediction_loss_only: bool,
    /// Half precision; `None` enables it when CUDA is available.
    pub fp16: Option<bool>,
    #[config(default = 5e-5)]
    pub learning_rate: f64,
    #[config(default = 1.0)]
    pub max_grad_norm: f32,
    #[config(default = 512)]
    pub max_length: usize,
    #[config(default = 0.0)]
    pub validation_fraction: f64,
    #[config(default = 2)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingArgs {
    pub fn validate(&self) -> Result<(), TrainError> {
        if self.num_train_epochs == 0 {
            return Err(TrainError::InvalidArgs("num_train_epochs must be > 0".into()));
        }
        if self.per_device_train_batch_size == 0 {
            return Err(TrainError::InvalidArgs(
                "per_device_train_batch_size must be > 0".into(),
            ));
        }
        if self.save_total_limit == 0 {
            return Err(TrainError::InvalidArgs("save_total_limit must be > 0".into()));
        }
        if self.max_length < 2 {
            return Err(TrainError::InvalidArgs("max_length must be at least 2".into()));
        }
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return Err(TrainError::InvalidArgs(format!(
                "validation_fraction must be in [0, 1), got {}",
                self.validation_fraction
            )));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(TrainError::InvalidArgs(format!(
                "learning_rate must be in (0, 1], got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precision {
    Full,
    Half,
}

impl Precision {
    /// Half precision needs a CUDA device; left unset it follows the device.
    pub fn resolve(fp16: Option<bool>, device: &LibTorchDevice) -> Result<Self, TrainError> {
        let cuda = matches!(device, LibTorchDevice::Cuda(_));
        match fp16 {
            Some(true) if !cuda => Err(TrainError::InvalidArgs(format!(
                "fp16 requires a CUDA device, got {device:?}"
            ))),
            Some(true) => Ok(Precision::Half),
            Some(false) => Ok(Precision::Full),
            None if cuda => Ok(Precision::Half),
            None => Ok(Precision::Full),
        }
    }
}

#[derive(Debug)]
pub struct FinetuneReport {
    pub output_dir: PathBuf,
    pub records: usize,
    pub final_loss: Option<f64>,
    pub precision: Precision,
}

/// Fine-tunes the model in `model_dir` on the records in `data_path` and
/// writes the result to `args.output_dir`.
pub fn finetune(
    model_dir: &Path,
    data_path: &Path,
    args: &TrainingArgs,
    device: LibTorchDevice,
) -> Result<FinetuneReport, TrainError> {
    let precision = Precision::resolve(args.fp16, &device)?;
    tracing::info!(?device, ?precision, "selected backend");

    match precision {
        Precision::Full => run::<FullBackend>(model_dir, data_path, args, precision, device),
        Precision::Half => run::<HalfBackend>(model_dir, data_path, args, precision, device),
    }
}

pub(crate) fn run<B: AutodiffBackend>(
    model_dir: &Path,
    data_path: &Path,
    args: &TrainingArgs,
    precision: Precision,
    device: B::Device,
) -> Result<FinetuneReport, TrainError> {
    args.validate()?;
    let output_dir = PathBuf::from(&args.output_dir);
    if !args.overwrite_output_dir && is_non_empty_dir(&output_dir)? {
        return Err(TrainError::OutputDirNotEmpty(output_dir));
    }

    let records = load_records(data_path)?;
    if records.is_empty() {
        return Err(DataError::Empty(data_path.display().to_string()).into());
    }
    let total_records = records.len();

    let tokenizer = QaTokenizer::from_file(model_dir.join(TOKENIZER_FILE))?;
    B::seed(args.seed);
    let (model, model_config) = CausalLm::<B>::load(model_dir, &device)?;

    if tokenizer.vocab_size() > model_config.vocab_size {
        return Err(TrainError::VocabMismatch {
            tokenizer: tokenizer.vocab_size(),
            model: model_config.vocab_size,
        });
    }
    if tokenizer.pad_token() != model_config.pad_token {
        return Err(TrainError::PadMismatch {
            tokenizer: tokenizer.pad_token(),
            model: model_config.pad_token,
        });
    }
    if args.max_length > model_config.max_seq_length + 1 {
        return Err(TrainError::ContextTooLong {
            max_length: args.max_length,
            max_seq_length: model_config.max_seq_length,
        });
    }

    let (train_records, valid_records) = split(records, args.validation_fraction, args.seed)?;
    let dataset_train = QaDataset::new(&train_records, &tokenizer, args.max_length)?;
    let dataset_valid = QaDataset::new(&valid_records, &tokenizer, args.max_length)?;
    tracing::info!(
        train = train_records.len(),
        valid = valid_records.len(),
        max_length = args.max_length,
        "prepared datasets"
    );

    let steps_per_epoch = train_records.len().div_ceil(args.per_device_train_batch_size);
    if steps_per_epoch > args.save_steps {
        tracing::warn!(
            steps_per_epoch,
            save_steps = args.save_steps,
            "checkpoints are only written at epoch boundaries"
        );
    }

    fs::create_dir_all(&output_dir)?;
    let start_time = Instant::now();

    let dataloader_train = build_loader::<B>(dataset_train, args, &device);
    let dataloader_valid = build_loader::<B::InnerBackend>(dataset_valid, args, &device);

    let optimizer = AdamConfig::new()
        .with_epsilon(1e-8)
        .with_grad_clipping(Some(GradientClippingConfig::Norm(args.max_grad_norm)))
        .init();
    let lr_scheduler = lr_scheduler(args, steps_per_epoch);

    let mut builder = LearnerBuilder::new(&args.output_dir)
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new());
    if !args.prediction_loss_only {
        builder = builder
            .metric_train_numeric(AccuracyMetric::new().with_pad_token(tokenizer.pad_token()))
            .metric_valid_numeric(AccuracyMetric::new().with_pad_token(tokenizer.pad_token()))
            .metric_train_numeric(PerplexityMetric::new())
            .metric_valid_numeric(PerplexityMetric::new());
    }

    let learner = builder
        .with_file_checkpointer(CompactRecorder::new())
        .with_checkpointing_strategy(KeepLastNCheckpoints::new(args.save_total_limit))
        .with_application_logger(None)
        .renderer(ProgressIndicator::new())
        .devices(vec![device.clone()])
        .num_epochs(args.num_train_epochs)
        .build(model, optimizer, lr_scheduler);

    tracing::info!(
        epochs = args.num_train_epochs,
        batch_size = args.per_device_train_batch_size,
        learning_rate = args.learning_rate,
        total_steps = steps_per_epoch * args.num_train_epochs,
        "starting fine-tuning"
    );
    let model = learner.fit(dataloader_train, dataloader_valid);

    let eval_dataset = QaDataset::new(&train_records, &tokenizer, args.max_length)?;
    let eval_loader = build_loader::<B::InnerBackend>(eval_dataset, args, &device);
    let final_loss = mean_loss(&model.valid(), eval_loader);

    model.save(&output_dir, &model_config)?;
    tokenizer.save(output_dir.join(TOKENIZER_FILE))?;
    args.save(output_dir.join(TRAINING_ARGS_FILE))?;

    let mut metadata = RunMetadata::new(
        model_dir,
        data_path,
        total_records,
        args.num_train_epochs,
    );
    metadata.set_duration(format!("{:.2?}", start_time.elapsed()));
    if let Some(loss) = final_loss {
        metadata.set_final_loss(loss);
    }
    metadata.save(&output_dir)?;

    tracing::info!(output_dir = %output_dir.display(), ?final_loss, "saved fine-tuned model");

    Ok(FinetuneReport {
        output_dir,
        records: total_records,
        final_loss,
        precision,
    })
}

/// Linear decay from `learning_rate` to zero over every optimizer step of
/// the run.
fn lr_scheduler(args: &TrainingArgs, steps_per_epoch: usize) -> LinearLrScheduler {
    let total_steps = (steps_per_epoch * args.num_train_epochs).max(1);
    LinearLrSchedulerConfig::new(args.learning_rate, 0.0, total_steps).init()
}

fn build_loader<B: Backend>(
    dataset: QaDataset,
    args: &TrainingArgs,
    device: &B::Device,
) -> Arc<dyn DataLoader<QaBatch<B>>> {
    let mut builder = DataLoaderBuilder::new(QaBatcher::<B>::new(device.clone()))
        .batch_size(args.per_device_train_batch_size)
        .shuffle(args.seed);
    if args.num_workers > 0 {
        builder = builder.num_workers(args.num_workers);
    }
    builder.build(dataset)
}

/// Mean loss over every batch of `loader`, `None` when it yields nothing.
fn mean_loss<B: Backend>(
    model: &CausalLm<B>,
    loader: Arc<dyn DataLoader<QaBatch<B>>>,
) -> Option<f64> {
    let losses: Vec<f64> = loader
        .iter()
        .map(|batch| model.forward(batch).loss.into_scalar().elem::<f64>())
        .collect();

    if losses.is_empty() {
        None
    } else {
        Some(losses.iter().sum::<f64>() / losses.len() as f64)
    }
}
