#[macro_use]
extern crate derive_new;

use anyhow::{Context, Result};
use burn::backend::libtorch::LibTorchDevice;
use burn::backend::LibTorch;
use burn::config::Config;
use rand::SeedableRng;
use std::path::Path;

pub mod cli;
pub mod data;
pub mod init;
pub mod model;
pub mod perplexity;
pub mod progress;
pub mod session;
pub mod training;

use cli::*;
use data::{PromptTemplate, QaTokenizer, Tokenizer};
use init::BaseModelArgs;
use model::CausalLm;
use training::{TrainingArgs, TOKENIZER_FILE};

type InferenceBackend = LibTorch<f32>;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Init {
            tokenizer,
            out_dir,
            d_model,
            d_ff,
            n_layer,
            n_head,
            max_seq_length,
            dropout,
        } => {
            let args = BaseModelArgs::new(d_model, d_ff, n_layer, n_head, max_seq_length)
                .with_dropout(dropout);
            let config = init::init_base_model::<InferenceBackend>(
                &tokenizer,
                &out_dir,
                &args,
                &LibTorchDevice::Cpu,
            )
            .context("Failed to initialise base model")?;
            println!(
                "Base model written to {} (vocab size {})",
                out_dir.display(),
                config.vocab_size
            );
        }

        Commands::Finetune {
            model,
            data,
            args,
            output_dir,
            no_overwrite,
            epochs,
            batch_size,
            learning_rate,
            max_length,
            save_total_limit,
            validation_fraction,
            num_workers,
            seed,
            fp16,
            full_metrics,
            device,
        } => {
            let mut training_args = match &args {
                Some(path) => TrainingArgs::load(path).map_err(|e| {
                    anyhow::anyhow!("Failed to load training args {}: {e:?}", path.display())
                })?,
                None => TrainingArgs::new(),
            };
            let overrides = Overrides {
                output_dir,
                no_overwrite,
                epochs,
                batch_size,
                learning_rate,
                max_length,
                save_total_limit,
                validation_fraction,
                num_workers,
                seed,
                fp16,
                full_metrics,
            };
            overrides.apply(&mut training_args);

            let report = training::finetune(&model, &data, &training_args, resolve_device(device))
                .context("Fine-tuning failed")?;

            println!("\nFine-tuning completed!");
            println!("{}", "-".repeat(60));
            println!("  Records:    {}", report.records);
            println!("  Precision:  {:?}", report.precision);
            match report.final_loss {
                Some(loss) => println!("  Train loss: {:.4} (PPL {:.4})", loss, loss.exp()),
                None => println!("  Train loss: n/a"),
            }
            println!("  Saved to:   {}", report.output_dir.display());
            println!("{}", "-".repeat(60));
        }

        Commands::Generate {
            model,
            question,
            num_tokens,
            temperature,
            seed,
            device,
        } => {
            let answer = answer(&model, &question, num_tokens, temperature, seed, device)?;
            println!("{}", answer);
        }

        Commands::List { models_dir } => {
            let runs = session::list_runs(&models_dir)
                .with_context(|| format!("Failed to read {}", models_dir.display()))?;
            println!("\nFine-tuned models:");
            if runs.is_empty() {
                println!("No fine-tuned models found.");
            } else {
                println!(
                    "{:<32} {:<16} {:<10} {:<8} {:<8} {:<10} {:<24}",
                    "Directory", "Timestamp", "Duration", "Records", "Epochs", "Loss", "Base model"
                );
                println!("{}", "-".repeat(112));
                for run in runs {
                    let metadata = &run.metadata;
                    println!(
                        "{:<32} {:<16} {:<10} {:<8} {:<8} {:<10.4} {:<24}",
                        run.dir.display(),
                        metadata.get_timestamp(),
                        metadata.get_duration().as_deref().unwrap_or(""),
                        metadata.get_records(),
                        metadata.get_epochs(),
                        metadata.get_final_loss().unwrap_or(f64::NAN),
                        metadata.get_base_model(),
                    );
                }
            }
        }
    }
    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::from_default_env().add_directive(format!("qa_finetune={}", level).parse()?);

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}

fn resolve_device(choice: DeviceChoice) -> LibTorchDevice {
    match choice {
        DeviceChoice::Cpu => LibTorchDevice::Cpu,
        DeviceChoice::Cuda => LibTorchDevice::Cuda(0),
        DeviceChoice::Mps => LibTorchDevice::Mps,
        DeviceChoice::Auto => {
            if tch::Cuda::is_available() {
                LibTorchDevice::Cuda(0)
            } else if tch::utils::has_mps() {
                LibTorchDevice::Mps
            } else {
                LibTorchDevice::Cpu
            }
        }
    }
}

fn answer(
    model_dir: &Path,
    question: &str,
    num_tokens: usize,
    temperature: f64,
    seed: Option<u64>,
    device: DeviceChoice,
) -> Result<String> {
    let device = resolve_device(device);
    let tokenizer = QaTokenizer::from_file(model_dir.join(TOKENIZER_FILE))
        .context("Failed to load tokenizer")?;
    let (model, _) = CausalLm::<InferenceBackend>::load(model_dir, &device)
        .with_context(|| format!("Failed to load model from {}", model_dir.display()))?;

    let prompt = tokenizer.encode(&PromptTemplate::generation(question))?;
    let mut rng = match seed {
        Some(s) => rand::rngs::StdRng::seed_from_u64(s),
        None => rand::rngs::StdRng::from_entropy(),
    };

    let stop = [tokenizer.sep_token(), tokenizer.eod_token()];
    let generated = model.generate(&prompt, num_tokens, temperature, &stop, &mut rng)?;
    tracing::debug!(
        prompt = prompt.len(),
        context = model.max_seq_length(),
        generated = generated.len(),
        "generated answer"
    );

    Ok(tokenizer.decode(&generated)?)
}

/// Command-line values layered over the loaded or default training args.
struct Overrides {
    output_dir: Option<String>,
    no_overwrite: bool,
    epochs: Option<usize>,
    batch_size: Option<usize>,
    learning_rate: Option<f64>,
    max_length: Option<usize>,
    save_total_limit: Option<usize>,
    validation_fraction: Option<f64>,
    num_workers: Option<usize>,
    seed: Option<u64>,
    fp16: Option<bool>,
    full_metrics: bool,
}

impl Overrides {
    fn apply(self, args: &mut TrainingArgs) {
        if let Some(output_dir) = self.output_dir {
            args.output_dir = output_dir;
        }
        if self.no_overwrite {
            args.overwrite_output_dir = false;
        }
        if let Some(epochs) = self.epochs {
            args.num_train_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            args.per_device_train_batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            args.learning_rate = learning_rate;
        }
        if let Some(max_length) = self.max_length {
            args.max_length = max_length;
        }
        if let Some(limit) = self.save_total_limit {
            args.save_total_limit = limit;
        }
        if let Some(fraction) = self.validation_fraction {
            args.validation_fraction = fraction;
        }
        if let Some(num_workers) = self.num_workers {
            args.num_workers = num_workers;
        }
        if let Some(seed) = self.seed {
            args.seed = seed;
        }
        if self.fp16.is_some() {
            args.fp16 = self.fp16;
        }
        if self.full_metrics {
            args.prediction_loss_only = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_only_touch_given_values() {
        let mut args = TrainingArgs::new();
        let overrides = Overrides {
            output_dir: Some("out".into()),
            no_overwrite: true,
            epochs: Some(5),
            batch_size: None,
            learning_rate: None,
            max_length: Some(128),
            save_total_limit: None,
            validation_fraction: None,
            num_workers: None,
            seed: None,
            fp16: Some(false),
            full_metrics: true,
        };
        overrides.apply(&mut args);

        assert_eq!(args.output_dir, "out");
        assert!(!args.overwrite_output_dir);
        assert_eq!(args.num_train_epochs, 5);
        assert_eq!(args.per_device_train_batch_size, 2);
        assert_eq!(args.max_length, 128);
        assert_eq!(args.fp16, Some(false));
        assert!(!args.prediction_loss_only);
    }

    #[test]
    fn test_cli_parses_finetune() {
        let cli = Cli::try_parse_from([
            "qa-finetune",
            "finetune",
            "--model",
            "base",
            "--epochs",
            "1",
            "--device",
            "cpu",
        ])
        .unwrap();

        match cli.command {
            Commands::Finetune {
                data,
                epochs,
                device,
                ..
            } => {
                assert_eq!(data, Path::new("finetune_data.json"));
                assert_eq!(epochs, Some(1));
                assert!(matches!(device, DeviceChoice::Cpu));
            }
            _ => panic!("expected finetune"),
        }
    }
}
