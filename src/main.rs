//! codecshard CLI
//!
//! Encode (text, audio) datasets into sharded gzip JSONL archives.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use codecshard::assemble::inspect_output;
use codecshard::cancel::{install_interrupt_handler, CancelToken};
use codecshard::codec::QuantizerFactory;
use codecshard::config::{Config, SAMPLE_CONFIG};
use codecshard::device::detect_accelerators;
use codecshard::error::PipelineError;
use codecshard::orchestrator::Pipeline;

#[derive(Parser)]
#[command(name = "codecshard")]
#[command(about = "Encode audio datasets into sharded codec-token archives", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the number of reader threads
    #[arg(long, global = true)]
    num_readers: Option<usize>,

    /// Override the number of workers (skips accelerator detection)
    #[arg(long, global = true)]
    num_gpu_units: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the encoding pipeline (default if no command specified)
    Run,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },

    /// Verify the shards in a directory and print their manifest
    Inspect {
        /// Directory holding *.jsonl.gz shards
        dir: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        None | Some(Commands::Run) => {
            if let Err(e) = run_command(&cli) {
                if let Some(PipelineError::Interrupted { stragglers }) =
                    e.downcast_ref::<PipelineError>()
                {
                    tracing::error!(stragglers, "run interrupted");
                    std::process::exit(130);
                }
                return Err(e);
            }
        }

        Some(Commands::Validate) => {
            validate_command(&cli)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            std::fs::write(output, SAMPLE_CONFIG)?;
            tracing::info!("Generated sample configuration at {}", output.display());
        }

        Some(Commands::Inspect { dir }) => {
            let manifest = inspect_output(dir)?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::from_file(&cli.config)?;

    // Apply overrides
    if let Some(n) = cli.num_readers {
        config.base_settings.num_readers = n;
    }
    if let Some(n) = cli.num_gpu_units {
        config.base_settings.num_gpu_units = Some(n);
    }

    config.validate()?;
    Ok(config)
}

fn run_command(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;

    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone())?;

    let codec = config.base_settings.codec();
    tracing::info!(
        model = %codec.model_id,
        sample_rate = codec.sample_rate,
        layers = codec.num_layers,
        "using codec"
    );
    let factory = Arc::new(QuantizerFactory::new(codec));
    let pipeline = Pipeline::new(config.base_settings.clone(), factory)?
        .with_save_settings(config.save_settings.clone())
        .with_cancel_token(cancel);

    let metrics = pipeline.metrics();
    let result = pipeline.run(&config.datasets);
    metrics.finish();
    metrics.print();
    let report = result?;

    for ds in &report.datasets {
        tracing::info!(
            dataset = %ds.dataset,
            records = ds.records_written(),
            dropped = ds.items_dropped(),
            files = ds.files().count(),
            bytes = ds.total_bytes(),
            "done"
        );
    }
    if let Some(archive) = &report.archive {
        tracing::info!(
            manifest = %archive.manifest_path.display(),
            archive = ?archive.archive_path,
            "archive ready"
        );
    }
    Ok(())
}

fn validate_command(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let codec = config.base_settings.codec();

    println!("Configuration is valid!");
    println!();
    println!("Codec: {} ({} Hz, {} layers)", codec.model_id, codec.sample_rate, codec.num_layers);
    println!("Readers: {}", config.base_settings.num_readers);
    match config.base_settings.num_gpu_units {
        Some(n) => println!("Workers: {n}"),
        None => println!("Workers: {} (detected)", detect_accelerators()),
    }
    println!("Queue size: {}", config.base_settings.qsize);
    println!("Lines per file: {}", config.base_settings.lines_per_file);
    println!("Output: {}", config.base_settings.out_dir.display());
    if let Some(local) = &config.save_settings.local {
        println!("Archive: {}", local.display());
    }
    println!("Datasets:");
    for ds in &config.datasets {
        println!("  - {} <- {}", ds.describe(), ds.data_files);
    }
    Ok(())
}
