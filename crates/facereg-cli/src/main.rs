use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facereg_core::{EncodingStore, OnnxPipeline, Recognizer, RecognizerConfig, RecognizerError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "facereg", about = "Register labelled face photos and recognise them later")]
struct Cli {
    /// JSON config file (`sqlite`, `encodings_dir`, `model_dir`, `tolerance`)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the face in a photo under a name
    Enroll {
        /// Name of the person in the photo
        #[arg(short, long)]
        name: String,
        /// Photo containing exactly one face
        photo: PathBuf,
    },
    /// Name every face in a photo
    Identify {
        /// Photo to check
        photo: PathBuf,
    },
    /// List registered people
    List,
    /// Print the effective configuration
    Config,
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Enroll { name, photo } => {
            let recognizer = open_recognizer(&config)?;
            let bytes = read_photo(&photo)?;
            if recognizer.ingest(&name, &bytes)? {
                println!("person {name} with photo {} uploaded", photo.display());
            } else {
                eprintln!("not one person: {} must show exactly one face", photo.display());
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Identify { photo } => {
            let recognizer = open_recognizer(&config)?;
            recognizer.refresh_if_stale()?;
            let bytes = read_photo(&photo)?;
            match recognizer.query(&bytes) {
                Ok(names) => println!("{}", serde_json::to_string(&names)?),
                Err(RecognizerError::NoKnownFaces) => {
                    eprintln!("no known people in database");
                    return Ok(ExitCode::FAILURE);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::List => {
            let store = EncodingStore::open(&config.encodings_dir, &config.index_path)?;
            let records = store.list_all()?;
            if records.is_empty() {
                println!("No people registered");
            }
            for record in records {
                println!("{}\t{}", record.name, record.embedding_ref);
            }
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn open_recognizer(config: &Config) -> Result<Recognizer<OnnxPipeline>> {
    let store = EncodingStore::open(&config.encodings_dir, &config.index_path)
        .context("opening encoding store")?;
    let pipeline = OnnxPipeline::load(&config.model_dir).with_context(|| {
        format!("loading face models from {}", config.model_dir.display())
    })?;
    Ok(Recognizer::new(
        store,
        pipeline,
        RecognizerConfig {
            tolerance: config.tolerance,
        },
    ))
}

fn read_photo(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading photo {}", path.display()))
}
