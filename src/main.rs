use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use causal_tune::engine::{CausalEngine, CausalLoraEngine, Engine, EngineOptions};
use causal_tune::logging::{self, init_logging};
use causal_tune::model::{load_model, resolve_model_name};
use causal_tune::training::{self, load_jsonl, Collator, TextRecord, Trainer, SUMMARY_FILENAME};
use causal_tune::utils::{format_parameter_count, select_device, DeviceType};
use causal_tune::RunConfig;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "causal-tune")]
#[command(about = "Fine-tune causal language models in full precision, 8-bit or with LoRA", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "CAUSAL_TUNE_JSON_LOGS")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune a model
    Train {
        /// Run configuration (.json, .yaml or .yml)
        #[arg(short, long)]
        config: PathBuf,

        /// Override the model name or Hub id
        #[arg(long)]
        model: Option<String>,

        /// Override the checkpoint directory
        #[arg(long)]
        weights_path: Option<PathBuf>,

        /// Load the base in 8-bit
        #[arg(long)]
        load_8bit: bool,

        /// Train every weight instead of LoRA adapters
        #[arg(long)]
        no_lora: bool,

        /// Override the number of epochs
        #[arg(long)]
        epochs: Option<usize>,

        /// Override the learning rate
        #[arg(long)]
        learning_rate: Option<f64>,

        /// Override the output directory
        #[arg(short, long, env = "CAUSAL_TUNE_OUTPUT_DIR")]
        output_dir: Option<PathBuf>,
    },

    /// Report validation accuracy of a model or trained adapter
    Evaluate {
        /// Run configuration (.json, .yaml or .yml)
        #[arg(short, long)]
        config: PathBuf,

        /// Directory with a saved LoRA adapter to evaluate
        #[arg(long)]
        adapter: Option<PathBuf>,
    },

    /// Print the configuration and parameter counts of a checkpoint
    Inspect {
        /// Local checkpoint directory or Hub model id
        #[arg(short, long)]
        model: String,

        /// Device (auto, cpu, cuda, metal)
        #[arg(long, default_value = "cpu")]
        device: String,
    },

    /// Validate a run configuration file
    ValidateConfig {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.json)?;

    match cli.command {
        Commands::Train {
            config,
            model,
            weights_path,
            load_8bit,
            no_lora,
            epochs,
            learning_rate,
            output_dir,
        } => {
            let mut run = RunConfig::from_file(&config).context("Failed to load configuration file")?;
            if model.is_some() {
                run.model.name = model;
            }
            if weights_path.is_some() {
                run.model.weights_path = weights_path;
            }
            run.model.load_8bit |= load_8bit;
            if no_lora {
                run.lora.enabled = false;
            }
            if let Some(epochs) = epochs {
                run.training.num_epochs = epochs;
            }
            if let Some(lr) = learning_rate {
                run.training.learning_rate = lr;
            }
            if let Some(dir) = output_dir {
                run.output_dir = dir;
            }
            run.validate().context("Invalid configuration after applying overrides")?;
            train(run).await?;
        }

        Commands::Evaluate { config, adapter } => {
            let run = RunConfig::from_file(&config).context("Failed to load configuration file")?;
            evaluate(run, adapter.as_deref()).await?;
        }

        Commands::Inspect { model, device } => {
            inspect(&model, &device).await?;
        }

        Commands::ValidateConfig { file } => {
            validate_config(&file)?;
        }
    }

    Ok(())
}

async fn read_records(path: Option<&Path>, what: &str) -> Result<Option<Vec<TextRecord>>> {
    match path {
        Some(path) => {
            let records = load_jsonl(path)
                .await
                .with_context(|| format!("Failed to read {} data from {}", what, path.display()))?;
            info!("Loaded {} {} records", records.len(), what);
            Ok(Some(records))
        }
        None => Ok(None),
    }
}

async fn train(run: RunConfig) -> Result<()> {
    let Some(train_records) = read_records(run.data.train.as_deref(), "training").await? else {
        bail!("data.train must be set to train");
    };
    let validation = read_records(run.data.validation.as_deref(), "validation").await?;
    let options = run.model.engine_options()?;

    if run.lora.enabled {
        let engine = CausalLoraEngine::load(options, run.lora.target_modules.clone())
            .await
            .context("Failed to load model")?;
        fit(&engine, &run, &train_records, validation.as_deref())
    } else {
        let engine = CausalEngine::load(options).await.context("Failed to load model")?;
        fit(&engine, &run, &train_records, validation.as_deref())
    }
}

fn fit<E: Engine>(
    engine: &E,
    run: &RunConfig,
    train: &[TextRecord],
    validation: Option<&[TextRecord]>,
) -> Result<()> {
    let mut trainer = Trainer::new(engine, run.training.clone())?;
    let summary = trainer.train(train, validation)?;

    engine
        .save(&run.output_dir)
        .with_context(|| format!("Failed to save to {}", run.output_dir.display()))?;
    summary.save(run.output_dir.join(SUMMARY_FILENAME))?;

    logging::success(&format!(
        "Trained {} steps, saved to {}",
        summary.global_step,
        run.output_dir.display()
    ));
    if let Some(best) = summary.best_accuracy {
        logging::info(&format!("Best validation accuracy: {:.4}", best));
    }
    Ok(())
}

async fn evaluate(run: RunConfig, adapter: Option<&Path>) -> Result<()> {
    let Some(records) = read_records(run.data.validation.as_deref(), "validation").await? else {
        bail!("data.validation must be set to evaluate");
    };
    let base = CausalEngine::load(run.model.engine_options()?)
        .await
        .context("Failed to load model")?;

    let accuracy = match adapter {
        Some(dir) => {
            let engine = CausalLoraEngine::from_adapter_dir(base, dir)
                .with_context(|| format!("Failed to load adapter from {}", dir.display()))?;
            score(&engine, &run, &records)?
        }
        None => score(&base, &run, &records)?,
    };
    logging::success(&format!("Validation accuracy: {:.4} over {} records", accuracy, records.len()));
    Ok(())
}

fn score<E: Engine>(engine: &E, run: &RunConfig, records: &[TextRecord]) -> Result<f64> {
    let collator = Collator::new(engine.tokenizer().clone(), run.training.max_length)?;
    Ok(training::evaluate(engine, &collator, records, run.training.batch_size)?)
}

async fn inspect(model: &str, device: &str) -> Result<()> {
    let device = select_device(device.parse::<DeviceType>()?, 0)?;
    let files = resolve_model_name(model)
        .await
        .with_context(|| format!("Failed to resolve {}", model))?;
    let model = load_model(&files, causal_tune::utils::default_dtype(&device), &device).await?;
    let config = model.config();
    let counts = model.parameter_counts();

    println!("Model:            {}", config.model_type);
    println!("Layers:           {}", config.num_hidden_layers);
    println!("Hidden size:      {}", config.hidden_size);
    println!("MLP size:         {}", config.intermediate_size);
    println!(
        "Heads (q / kv):   {} / {}",
        config.num_attention_heads,
        config.kv_heads()
    );
    println!("Vocabulary:       {}", config.vocab_size);
    println!("Context length:   {}", config.max_position_embeddings);
    println!("Tied embeddings:  {}", config.tie_word_embeddings);
    println!("Weight files:     {}", files.weights.len());
    println!(
        "Parameters:       {} ({})",
        format_parameter_count(counts.total),
        counts.total
    );
    Ok(())
}

fn validate_config(path: &Path) -> Result<()> {
    info!("Validating configuration file: {}", path.display());
    match RunConfig::from_file(path) {
        Ok(config) => {
            logging::success("Configuration is valid");
            logging::info(&format!(
                "Model: {}",
                config
                    .model
                    .weights_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .or(config.model.name.clone())
                    .unwrap_or_default()
            ));
            logging::info(&format!(
                "Mode: {}{}",
                if config.lora.enabled { "LoRA" } else { "full fine-tuning" },
                if config.model.load_8bit { ", 8-bit base" } else { "" }
            ));
            logging::info(&format!(
                "Training: {} epochs, batch size {}, lr {:e}",
                config.training.num_epochs, config.training.batch_size, config.training.learning_rate
            ));
            Ok(())
        }
        Err(e) => {
            logging::warning(&format!("Configuration is invalid: {}", e));
            Err(e.into())
        }
    }
}
