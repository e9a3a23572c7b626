use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use babble_engine::evaluate::EvalOptions;
use babble_engine::{
    FileStore, GenerationParams, JobStatus, ModelHandle, NGramTable, Store, TrainRequest, Trainer,
    TrainerConfig, WordValidator, neural,
};

/// babble: hybrid markov/neural text generator.
#[derive(Parser, Debug)]
#[command(name = "babble")]
#[command(about = "Train and sample a hybrid markov/neural character model", long_about = None)]
struct Cli {
    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Data directory holding the engine state
    #[arg(long, global = true, default_value = "babble-data")]
    data_dir: PathBuf,

    /// Optional dictionary word list for the validator (one word per line)
    #[arg(long, global = true)]
    dict_file: Option<PathBuf>,

    /// Optional word-frequency list for the validator (word<TAB>zipf)
    #[arg(long, global = true)]
    freq_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a training job over a text file and follow its progress.
    Train {
        /// Input text file (raw text; it is normalized on ingestion)
        input: PathBuf,

        /// Neural training epochs
        #[arg(short, long, default_value = "5")]
        epochs: usize,

        /// Ingestion block size in symbols
        #[arg(short, long)]
        block_size: Option<usize>,

        /// Training seed (fixed seed reproduces the loss trajectory)
        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// Generate text from the trained models.
    Generate {
        /// Starting prompt
        #[arg(short, long, default_value = "")]
        prompt: String,

        /// Symbols to generate
        #[arg(short = 'n', long, default_value = "200")]
        length: usize,

        /// Sampling temperature (> 0)
        #[arg(short, long, default_value = "1.0")]
        temperature: f32,

        /// Nucleus sampling threshold in (0, 1]
        #[arg(long)]
        top_p: Option<f32>,

        /// Neural blend weight in [0, 1]
        #[arg(long, default_value = "0.5")]
        neural_weight: f32,

        #[arg(long, default_value = "0.2")]
        bigram_weight: f32,

        #[arg(long, default_value = "0.3")]
        trigram_weight: f32,

        #[arg(long, default_value = "0.5")]
        tetragram_weight: f32,

        /// Sampling seed
        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// Monte Carlo validity evaluation of the current models.
    Eval {
        /// Number of generations to sample
        #[arg(short, long, default_value = "50")]
        samples: usize,

        /// Symbols per sample
        #[arg(short = 'n', long, default_value = "100")]
        length: usize,

        #[arg(short, long, default_value = "0.8")]
        temperature: f32,

        #[arg(long, default_value = "0.5")]
        neural_weight: f32,

        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// Show corpus, n-gram and checkpoint statistics.
    Stats,

    /// Delete all engine state (corpus, counts, checkpoints, jobs).
    Reset {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "babble=debug,babble_engine=debug"
    } else {
        "babble=info,babble_engine=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = Arc::new(
        FileStore::open(&cli.data_dir)
            .with_context(|| format!("failed to open data dir {:?}", cli.data_dir))?,
    );
    let validator = WordValidator::with_resources(cli.dict_file.as_deref(), cli.freq_file.as_deref());
    tracing::debug!("word validator tier: {}", validator.tier());

    match cli.command {
        Commands::Train {
            input,
            epochs,
            block_size,
            seed,
        } => {
            let text = std::fs::read_to_string(&input)
                .with_context(|| format!("failed to read {input:?}"))?;
            let trainer = Trainer::new(store, validator, TrainerConfig::default())?;
            let id = trainer.submit(TrainRequest {
                text,
                block_size,
                epochs,
                seed,
            })?;
            println!("job {id}");

            let mut last = (0u8, String::new());
            let finished = loop {
                let job = trainer
                    .job(&id)?
                    .context("job record vanished from the store")?;
                if (job.progress, job.message.clone()) != last {
                    println!("[{:>3}%] {}", job.progress, job.message);
                    last = (job.progress, job.message.clone());
                }
                if job.status.is_terminal() {
                    break job;
                }
                std::thread::sleep(Duration::from_millis(250));
            };
            trainer.shutdown();
            if finished.status == JobStatus::Error {
                bail!(
                    "training failed: {}",
                    finished
                        .error
                        .unwrap_or_else(|| "unknown error".to_string())
                );
            }
        }

        Commands::Generate {
            prompt,
            length,
            temperature,
            top_p,
            neural_weight,
            bigram_weight,
            trigram_weight,
            tetragram_weight,
            seed,
        } => {
            let table = NGramTable::load(&*store)?;
            let handle = ModelHandle::load(&*store, neural::config())?;
            let model = handle.current();
            if model.is_none() {
                tracing::warn!("no checkpoint found; generating from n-gram counts only");
            }
            let generator =
                babble_engine::Generator::new(&table, model.as_deref(), &validator);

            let result = generator.generate(&GenerationParams {
                prompt: babble_engine::alphabet::normalize(&prompt),
                max_len: length,
                temperature,
                top_p,
                neural_weight,
                bigram_weight,
                trigram_weight,
                tetragram_weight,
                seed,
            })?;

            println!("{}", result.text);
            let valid = result.valid_mask.iter().filter(|&&v| v).count();
            println!("-- {valid}/{} valid words", result.valid_mask.len());
        }

        Commands::Eval {
            samples,
            length,
            temperature,
            neural_weight,
            seed,
        } => {
            let table = NGramTable::load(&*store)?;
            let handle = ModelHandle::load(&*store, neural::config())?;
            let model = handle.current();
            let generator =
                babble_engine::Generator::new(&table, model.as_deref(), &validator);

            let report = babble_engine::evaluate::run(
                &generator,
                &EvalOptions {
                    samples,
                    params: GenerationParams {
                        max_len: length,
                        temperature,
                        neural_weight,
                        seed,
                        ..GenerationParams::default()
                    },
                },
            )?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Stats => {
            let stats = store.corpus_stats()?;
            println!(
                "corpus: {} entries, {} symbols",
                stats.entries, stats.total_chars
            );

            let table = NGramTable::load(&*store)?;
            for order in [2u8, 3, 4] {
                println!(
                    "order {order}: {} distinct contexts",
                    table.context_count(order)?
                );
            }

            let checkpoints = store.list_checkpoints(10)?;
            if checkpoints.is_empty() {
                println!("no checkpoints");
            }
            for meta in checkpoints {
                println!(
                    "checkpoint {} epochs={} loss={:.4}{}",
                    meta.id,
                    meta.epochs,
                    meta.loss,
                    if meta.is_best { " [best]" } else { "" }
                );
            }

            for job in store.list_jobs()? {
                println!(
                    "job {} {:?} {}% {}",
                    job.id, job.status, job.progress, job.message
                );
            }
        }

        Commands::Reset { yes } => {
            if !yes {
                bail!("refusing to wipe {:?} without --yes", cli.data_dir);
            }
            store.reset()?;
            println!("engine state reset");
        }
    }

    Ok(())
}
