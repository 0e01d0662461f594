mod config;
mod worker;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use facematch_core::types::EncodingSetError;
use facematch_core::{Embedding, EncodingSet, FaceEngine, FaceMatcher, ModelRegistry, ModelSelector};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "facematch", about = "Face detection ensemble and embedding matcher")]
struct Cli {
    /// TOML config file (defaults to $FACEMATCH_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Pipeline name, overriding the config (e.g. "all_models", "insightface")
    #[arg(short, long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect and encode every face in one image
    Encode {
        image: PathBuf,
        /// Write the JSON result here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Score query encodings against a gallery of stored photos
    Match {
        /// JSON array of embeddings, or a single flat embedding
        #[arg(short, long)]
        query: PathBuf,
        /// JSON object mapping photo id to its embeddings
        #[arg(short, long)]
        gallery: PathBuf,
        #[arg(short, long)]
        tolerance: Option<f32>,
    },
    /// Process photos through the engine worker, one status line each
    Process {
        images: Vec<PathBuf>,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Show which backend runtimes are available and the resolved pipeline
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(model) = cli.model {
        config.engine.model = model;
    }
    tracing::debug!(model = %config.engine.model, model_dir = %config.engine.model_dir.display(), "configuration loaded");

    match cli.command {
        Commands::Encode { image, out } => {
            let engine = build_engine(&config)?;
            let bytes = std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
            let processed = engine
                .process_image(&bytes)
                .with_context(|| format!("processing {}", image.display()))?;
            let json = serde_json::to_string_pretty(&processed)?;
            match out {
                Some(path) => std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?,
                None => println!("{json}"),
            }
        }
        Commands::Match { query, gallery, tolerance } => {
            let query = read_json::<QueryEncodings>(&query)?
                .into_set()
                .context("invalid query encodings")?;
            let gallery: BTreeMap<String, EncodingSet> = read_json(&gallery)?;
            let gallery: Vec<(String, EncodingSet)> = gallery.into_iter().collect();

            let matcher = FaceMatcher::new(tolerance.unwrap_or(config.engine.tolerance));
            let matches = matcher.search(query.as_slice(), &gallery);
            tracing::info!(photos = gallery.len(), matched = matches.len(), "search finished");
            println!("{}", serde_json::to_string_pretty(&matches)?);
        }
        Commands::Process { images, timeout_secs } => {
            let timeout = Duration::from_secs(timeout_secs.unwrap_or(config.timeout_secs));
            let engine = build_engine(&config)?;
            let handle = worker::spawn_engine(engine, timeout)?;

            for path in images {
                let photo = path.display().to_string();
                let report = match std::fs::read(&path) {
                    Ok(bytes) => handle.process_photo(&photo, bytes).await?,
                    // An unreadable file fails that photo, not the batch.
                    Err(e) => worker::failed_report(&photo, format!("cannot read file: {e}"))?,
                };
                println!("{}", serde_json::to_string(&report)?);
            }
        }
        Commands::Models => {
            let registry = Arc::new(ModelRegistry::new(config.engine.model_dir.clone()));
            println!("model directory: {}", registry.model_dir().display());
            for (runtime, present) in registry.report() {
                let mark = if present { "available" } else { "missing" };
                println!("  {:<18} {mark}", runtime.name());
            }

            let selector = ModelSelector::new(registry, config.engine.detect_options());
            match selector.resolve(&config.engine.model) {
                Ok(spec) => println!("{}", serde_json::to_string_pretty(&spec)?),
                Err(e) => println!("pipeline {:?}: {e}", config.engine.model),
            }
        }
    }

    Ok(())
}

/// Query file contents: a full set, or one embedding as stored by older
/// registrations.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QueryEncodings {
    Set(EncodingSet),
    Single(Embedding),
}

impl QueryEncodings {
    fn into_set(self) -> Result<EncodingSet, EncodingSetError> {
        match self {
            QueryEncodings::Set(set) => Ok(set),
            QueryEncodings::Single(embedding) => EncodingSet::new(vec![embedding]),
        }
    }
}

fn build_engine(config: &Config) -> Result<FaceEngine> {
    let registry = Arc::new(ModelRegistry::new(config.engine.model_dir.clone()));
    let selector = ModelSelector::new(registry.clone(), config.engine.detect_options());
    let engine = FaceEngine::build(&registry, &selector, &config.engine.model)
        .with_context(|| format!("building pipeline {:?}", config.engine.model))?;
    tracing::info!(
        pipeline = %engine.spec().kind,
        detectors = ?engine.spec().detectors,
        encoder = %engine.spec().encoder,
        "engine ready"
    );
    Ok(engine)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
