use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};
use url::Url;
use vision_hub::{
    Exporter, ModelSource, PipelineConfig, PipelineContext, Preprocess, Synset,
    config::{DEFAULT_CACHE_DIR, DEFAULT_IMAGE_URL, DEFAULT_MODEL},
    export::DEFAULT_ARTIFACT,
    hub,
};

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Log as JSON lines instead of the human readable format.
    #[arg(long, env = "HUB_EXPORT_JSON", global = true)]
    json: bool,

    #[command(flatten)]
    export: ExportArgs,

    /// Without a command, run the export pipeline.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(ClapArgs)]
struct ExportArgs {
    /// Name of the pretrained model in the hub.
    #[arg(long, env = "HUB_EXPORT_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    /// Local ONNX file used instead of downloading `--model`.
    #[arg(long, env = "HUB_EXPORT_MODEL_PATH")]
    model_path: Option<PathBuf>,

    /// Sample image to classify, saved under its URL basename in the working directory.
    #[arg(long, env = "HUB_EXPORT_IMAGE_URL", default_value = DEFAULT_IMAGE_URL)]
    image_url: Url,

    /// Where the traced artifact is written.
    #[arg(short, long, env = "HUB_EXPORT_OUTPUT", default_value = DEFAULT_ARTIFACT)]
    output: PathBuf,

    /// Directory keeping downloaded models between runs.
    #[arg(long, env = "HUB_EXPORT_CACHE_DIR", default_value = DEFAULT_CACHE_DIR)]
    cache_dir: PathBuf,

    /// `synset.txt` naming the output classes.
    #[arg(long, env = "HUB_EXPORT_LABELS")]
    labels: Option<PathBuf>,

    /// Without `--labels`, download the hub's ImageNet class names into the cache.
    #[arg(long, env = "HUB_EXPORT_HUB_LABELS")]
    hub_labels: bool,

    /// Skip reloading the artifact to compare its scores.
    #[arg(long, env = "HUB_EXPORT_NO_VERIFY")]
    no_verify: bool,

    /// Append the step durations of this run to a CSV file.
    #[arg(long, env = "HUB_EXPORT_TIMINGS")]
    timings: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Classify a local image with a previously exported artifact.
    Classify {
        #[arg(short, long, default_value = DEFAULT_ARTIFACT)]
        artifact: PathBuf,

        #[arg(short, long)]
        image: PathBuf,

        #[arg(long)]
        labels: Option<PathBuf>,

        /// Number of classes to print, best first.
        #[arg(long, default_value = "1")]
        top: usize,
    },

    /// List the models known to the hub.
    Models,
}

impl ExportArgs {
    fn into_config(self) -> PipelineConfig {
        let model = match self.model_path {
            Some(path) => ModelSource::Path {
                name: self.model,
                path,
            },
            None => ModelSource::Hub(self.model),
        };
        PipelineConfig {
            model,
            image_url: self.image_url,
            cache_dir: self.cache_dir,
            artifact: self.output,
            labels: self.labels,
            hub_labels: self.hub_labels,
            verify_export: !self.no_verify,
            ..Default::default()
        }
    }
}

fn run_export(args: ExportArgs) -> anyhow::Result<()> {
    let timings_csv = args.timings.clone();
    let config = args.into_config();
    info!(
        "exporting {} with sample {} to {}",
        config.model.name(),
        config.image_url,
        config.artifact.display()
    );
    let report = PipelineContext::init(config)?.run()?;
    info!("pipeline took {}ms", report.timings.total().as_millis());
    if let Some(diff) = report.round_trip_diff {
        info!("artifact reproduces the model within {diff}");
    }
    info!(
        "wrote {} ({}) and {}",
        report.artifact.artifact.display(),
        utils::format_bytes(report.artifact.bytes),
        report.artifact.record_path.display()
    );
    if let Some(path) = timings_csv {
        report
            .timings
            .flush_csv(&path)
            .with_context(|| format!("writing timings to {}", path.display()))?;
    }
    println!("{}", report.summary_line());
    Ok(())
}

/// One `index - score[ - label]` line per class, best first.
fn classify(
    artifact: &Path,
    image: &Path,
    labels: Option<&Path>,
    top: usize,
) -> anyhow::Result<Vec<String>> {
    let model = Exporter::new().reload(artifact)?;
    let synset = labels.map(Synset::from_path).transpose()?;
    let input = Preprocess::imagenet().apply_path(image)?;
    let scores = model.infer(&input)?;
    let lines = scores
        .top_k(top.max(1))
        .into_iter()
        .map(|prediction| {
            let line = format!("{} - {:.4}", prediction.index, prediction.score);
            match synset.as_ref().and_then(|s| s.label(prediction.index)) {
                Some(label) => format!("{line} - {label}"),
                None => line,
            }
        })
        .collect();
    Ok(lines)
}

fn list_models() {
    for entry in hub::ENTRIES {
        println!("{}\t{}\t{}", entry.name, entry.description, entry.url);
    }
}

fn setup_logging(json: bool) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_target(true);
    let installed = if json {
        tracing::subscriber::set_global_default(
            builder
                .json()
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .finish(),
        )
    } else {
        tracing::subscriber::set_global_default(builder.compact().finish())
    };
    installed.context("setting up logging")
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(args.json)?;

    match args.command {
        None => run_export(args.export),
        Some(Command::Classify {
            artifact,
            image,
            labels,
            top,
        }) => {
            for line in classify(&artifact, &image, labels.as_deref(), top)? {
                println!("{line}");
            }
            Ok(())
        }
        Some(Command::Models) => {
            list_models();
            Ok(())
        }
    }
}
