pub use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum DeviceChoice {
    /// CUDA when available, then MPS on macOS, else CPU
    Auto,
    Cpu,
    Cuda,
    Mps,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a randomly initialised base model sized to a tokenizer
    Init {
        /// Path to a HuggingFace tokenizer.json
        #[arg(short, long)]
        tokenizer: PathBuf,

        /// Directory to write the base model to
        #[arg(short, long)]
        out_dir: PathBuf,

        /// Model embedding dimension
        #[arg(long, default_value_t = 256)]
        d_model: usize,

        /// Model feed-forward dimension
        #[arg(long, default_value_t = 1024)]
        d_ff: usize,

        /// Number of transformer layers
        #[arg(long, default_value_t = 4)]
        n_layer: usize,

        /// Number of attention heads
        #[arg(long, default_value_t = 4)]
        n_head: usize,

        /// Context length
        #[arg(long, default_value_t = 512)]
        max_seq_length: usize,

        /// Dropout rate
        #[arg(long, default_value_t = 0.1)]
        dropout: f64,
    },

    /// Fine-tune a model directory on question/answer records
    Finetune {
        /// Pretrained model directory (config.json, model.mpk, tokenizer.json)
        #[arg(short, long)]
        model: PathBuf,

        /// JSON array of {"question", "answer"} records
        #[arg(short, long, default_value = "finetune_data.json")]
        data: PathBuf,

        /// JSON file with training arguments; flags below override it
        #[arg(long)]
        args: Option<PathBuf>,

        /// Directory for the fine-tuned model and checkpoints
        #[arg(short, long)]
        output_dir: Option<String>,

        /// Refuse to write into a non-empty output directory
        #[arg(long)]
        no_overwrite: bool,

        /// Number of training epochs
        #[arg(long)]
        epochs: Option<usize>,

        /// Batch size for training
        #[arg(long)]
        batch_size: Option<usize>,

        /// Learning rate
        #[arg(long)]
        learning_rate: Option<f64>,

        /// Prompt length after truncation and padding
        #[arg(long)]
        max_length: Option<usize>,

        /// Checkpoints kept on disk
        #[arg(long)]
        save_total_limit: Option<usize>,

        /// Fraction of records held out for validation
        #[arg(long)]
        validation_fraction: Option<f64>,

        /// Data loading worker threads
        #[arg(long)]
        num_workers: Option<usize>,

        /// Seed for shuffling and initialisation
        #[arg(long)]
        seed: Option<u64>,

        /// Force half precision on or off (default: on with CUDA)
        #[arg(long)]
        fp16: Option<bool>,

        /// Also report accuracy and perplexity
        #[arg(long)]
        full_metrics: bool,

        #[arg(long, value_enum, default_value_t = DeviceChoice::Auto)]
        device: DeviceChoice,
    },

    /// Answer a question with a model directory
    Generate {
        /// Model directory
        #[arg(short, long)]
        model: PathBuf,

        /// Question to answer
        #[arg(short, long)]
        question: String,

        /// Maximum number of tokens to generate
        #[arg(short, long, default_value_t = 100)]
        num_tokens: usize,

        /// Sampling temperature; 0 decodes greedily
        #[arg(short, long, default_value_t = 0.8)]
        temperature: f64,

        /// Sampling seed
        #[arg(long)]
        seed: Option<u64>,

        #[arg(long, value_enum, default_value_t = DeviceChoice::Auto)]
        device: DeviceChoice,
    },

    /// List fine-tuned models under a directory
    List {
        /// Directory containing fine-tuned model directories
        #[arg(long, default_value = ".")]
        models_dir: PathBuf,
    },
}
