mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use imgtag_ai::{FeatureExtractor, PixelPoolExtractor};
use imgtag_core::ServiceConfig;
use imgtag_host::ImageTagService;
use imgtag_store::{JsonlMirror, Mirror};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imgtag", version, about = "Image tagging by transfer learning")]
struct Cli {
    /// TOML config file; every key is optional.
    #[arg(long, global = true, env = "IMGTAG_CONFIG")]
    config: Option<PathBuf>,

    /// Managed image directory (overrides `images_dir`).
    #[arg(long, global = true, env = "IMGTAG_IMAGES_DIR")]
    images_dir: Option<PathBuf>,

    /// Training manifest (overrides `manifest`).
    #[arg(long, global = true, env = "IMGTAG_MANIFEST")]
    manifest: Option<PathBuf>,

    /// ONNX network used as the feature extractor.
    #[cfg(feature = "onnx")]
    #[arg(long, global = true, env = "IMGTAG_ONNX_MODEL")]
    onnx_model: Option<PathBuf>,

    /// Output whose activations are the embedding.
    #[cfg(feature = "onnx")]
    #[arg(long, global = true)]
    onnx_output: Option<String>,

    /// Mirror into this DuckDB file instead of the JSON-lines log.
    #[cfg(feature = "duckdb")]
    #[arg(long, global = true, env = "IMGTAG_DUCKDB")]
    duckdb: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train on the manifest, publish and save the model
    Train,
    /// Score the saved model against the test manifest
    Evaluate,
    /// Classify an image file
    Classify {
        image: PathBuf,
        /// Also copy the image into the store as an unlabeled sample
        #[arg(long)]
        ingest: bool,
    },
    /// Label a sample already in the image directory
    Add {
        path: String,
        label: String,
        /// Confidence of the prediction being confirmed
        #[arg(long)]
        score: Option<f32>,
    },
    /// Replace the label of a known sample
    Correct { path: String, label: String },
    /// Copy an image file into the store
    Ingest {
        image: PathBuf,
        #[arg(long)]
        label: Option<String>,
    },
    /// Replay mirror writes left over from partial failures
    Reconcile,
    /// Print the mirror tables
    Mirror {
        /// Only this table (samples, predictions, corrections)
        #[arg(long)]
        table: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tracing::info!("imgtag v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli)?;
    let extractor = open_extractor(&cli)?;
    let mirror = open_mirror(&cli, &config)?;
    let service = ImageTagService::open(config, extractor, mirror)
        .context("opening image tag service")?;

    match cli.command {
        Command::Train => cmd_train(&service).await,
        Command::Evaluate => cmd_evaluate(&service).await,
        Command::Classify { image, ingest } => cmd_classify(&service, &image, ingest).await,
        Command::Add { path, label, score } => {
            let committed = service
                .add_labeled_sample(&path, &label, score)
                .await
                .with_context(|| format!("labeling {path}"))?;
            println!(
                "{}\t{}\t({})",
                committed.path,
                label,
                committed.state.as_str()
            );
            Ok(())
        }
        Command::Correct { path, label } => {
            let record = service
                .correct_label(&path, &label)
                .await
                .with_context(|| format!("correcting {path}"))?;
            println!(
                "{}: {} -> {}",
                record.sample_path,
                record.old_label.as_deref().unwrap_or("(unlabeled)"),
                record.new_label
            );
            Ok(())
        }
        Command::Ingest { image, label } => cmd_ingest(&service, &image, label.as_deref()).await,
        Command::Reconcile => {
            let outcome = service.reconcile().await.context("replaying mirror writes")?;
            println!(
                "Replayed {} pending write(s), {} dropped, {} remaining",
                outcome.replayed, outcome.dropped, outcome.remaining
            );
            Ok(())
        }
        Command::Mirror { table } => {
            let export = service
                .workflow()
                .mirror()
                .export()
                .context("exporting mirror tables")?;
            report::print_mirror(&export, table.as_deref())
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ServiceConfig> {
    let mut config = match &cli.config {
        Some(path) => ServiceConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    if let Some(dir) = &cli.images_dir {
        config.images_dir = dir.clone();
    }
    if let Some(manifest) = &cli.manifest {
        config.manifest = manifest.clone();
    }
    Ok(config)
}

#[cfg(feature = "onnx")]
fn open_extractor(cli: &Cli) -> anyhow::Result<Arc<dyn FeatureExtractor>> {
    match &cli.onnx_model {
        Some(path) => {
            let extractor = imgtag_ai::OnnxExtractor::load(path, cli.onnx_output.as_deref())
                .with_context(|| format!("loading ONNX model {}", path.display()))?;
            Ok(Arc::new(extractor))
        }
        None => Ok(Arc::new(PixelPoolExtractor::default())),
    }
}

#[cfg(not(feature = "onnx"))]
fn open_extractor(_cli: &Cli) -> anyhow::Result<Arc<dyn FeatureExtractor>> {
    Ok(Arc::new(PixelPoolExtractor::default()))
}

#[cfg(feature = "duckdb")]
fn open_mirror(cli: &Cli, config: &ServiceConfig) -> anyhow::Result<Arc<dyn Mirror>> {
    if let Some(path) = &cli.duckdb {
        let mirror = imgtag_store::DuckMirror::open_persistent(path)
            .with_context(|| format!("opening DuckDB mirror {}", path.display()))?;
        return Ok(Arc::new(mirror));
    }
    open_jsonl(config)
}

#[cfg(not(feature = "duckdb"))]
fn open_mirror(_cli: &Cli, config: &ServiceConfig) -> anyhow::Result<Arc<dyn Mirror>> {
    open_jsonl(config)
}

fn open_jsonl(config: &ServiceConfig) -> anyhow::Result<Arc<dyn Mirror>> {
    let mirror = JsonlMirror::open(&config.mirror_path)
        .with_context(|| format!("opening mirror log {}", config.mirror_path.display()))?;
    Ok(Arc::new(mirror))
}

async fn cmd_train(service: &ImageTagService) -> anyhow::Result<()> {
    let manifest = &service.config().manifest;
    eprintln!("  Training from {}...", manifest.display());
    let run = service
        .train_now()
        .await
        .with_context(|| format!("training from {}", manifest.display()))?;
    report::print_training(&run, &service.config().model_path);
    Ok(())
}

async fn cmd_evaluate(service: &ImageTagService) -> anyhow::Result<()> {
    if service.model().is_none() {
        bail!(
            "no model at {}; run `imgtag train` first",
            service.config().model_path.display()
        );
    }
    match service.evaluate().await.context("evaluating model")? {
        Some(report) => println!("{report}"),
        None => eprintln!("  No test manifest configured."),
    }
    Ok(())
}

async fn cmd_classify(service: &ImageTagService, image: &Path, ingest: bool) -> anyhow::Result<()> {
    let bytes = std::fs::read(image).with_context(|| format!("reading {}", image.display()))?;
    let name = file_name(image)?;
    if ingest {
        let (prediction, committed) = service
            .classify_and_ingest(name, bytes)
            .await
            .with_context(|| format!("classifying {}", image.display()))?;
        report::print_prediction(&prediction);
        println!("Stored as {} ({})", committed.path, committed.state.as_str());
    } else {
        let prediction = service
            .classify(&image.display().to_string(), bytes)
            .await
            .with_context(|| format!("classifying {}", image.display()))?;
        report::print_prediction(&prediction);
    }
    Ok(())
}

async fn cmd_ingest(
    service: &ImageTagService,
    image: &Path,
    label: Option<&str>,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(image).with_context(|| format!("reading {}", image.display()))?;
    let name = file_name(image)?;
    let committed = match label {
        Some(label) => service.ingest_labeled(name, bytes, label).await,
        None => service.ingest_unlabeled(name, bytes).await,
    }
    .with_context(|| format!("ingesting {}", image.display()))?;
    println!(
        "{}\t{}\t({})",
        committed.path,
        committed.label.as_deref().unwrap_or("-"),
        committed.state.as_str()
    );
    Ok(())
}

fn file_name(path: &Path) -> anyhow::Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))
}
