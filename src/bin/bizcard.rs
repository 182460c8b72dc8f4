//! CLI binary for bizcard-ingest.
//!
//! `bizcard serve` runs the HTTP endpoint; `bizcard ingest` pushes local
//! image files through the same pipeline without a server.

use anyhow::{bail, Context, Result};
use bizcard_ingest::pipeline::extract::{resolve_provider, LlmCompletion};
use bizcard_ingest::pipeline::persist::{BlobStore, GcsBlobStore, GcsConfig, LocalBlobStore};
use bizcard_ingest::pipeline::recognize::{
    LlmVisionRecognizer, TextRecognizer, VisionApiRecognizer, VisionConfig,
};
use bizcard_ingest::pipeline::sink::{
    HttpRecordSink, HttpSinkConfig, JsonlRecordSink, RecordSink, SinkAuth,
};
use bizcard_ingest::{
    serve, AppState, CanonicalFieldSet, IngestConfig, IngestObserver, Ingestor, PipelineState,
    ServerConfig, UnknownFieldPolicy,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Serve POST /ocr on :8080, images in GCS, rows to a SheetDB sheet
  BUCKET_NAME=cards GOOGLE_VISION_API_KEY=... SHEETDB_API_URL=https://sheetdb.io/api/v1/xxxx \
    bizcard serve --storage gcs

  # Fully local: images in ./uploads, OCR by a vision LLM, rows in cards.jsonl
  bizcard serve --storage local --recognizer llm --sink jsonl

  # One-shot ingestion of a folder of scans, JSON to stdout
  bizcard --sink jsonl --recognizer llm ingest scans/*.jpg --json

ENVIRONMENT VARIABLES:
  PORT                    HTTP port (default 8080)
  CORS_ORIGIN             Allowed origin (default any)
  BUCKET_NAME             GCS bucket for uploaded images
  GCS_ACCESS_TOKEN        OAuth2 token for GCS (and Vision, if no API key)
  GOOGLE_VISION_API_KEY   Cloud Vision API key
  SHEETDB_API_URL         Sink endpoint receiving POST {"data": [row]}
  OPENAI_API_KEY          Key for the extraction model (or ANTHROPIC_API_KEY, …)
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID

  A .env file in the working directory is loaded first if present.
"#;

/// Ingest business-card images into a spreadsheet.
#[derive(Parser, Debug)]
#[command(
    name = "bizcard",
    version,
    about = "Ingest business-card images into a spreadsheet via OCR and an LLM",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "BIZCARD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "BIZCARD_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (POST /ocr, GET /health).
    Serve(ServeArgs),
    /// Run image files through the pipeline once and print the results.
    Ingest(IngestArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Interface to bind.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Allowed CORS origin; "*" allows any.
    #[arg(long, env = "CORS_ORIGIN")]
    cors_origin: Option<String>,

    /// Maximum upload size in MiB.
    #[arg(long, env = "BIZCARD_MAX_UPLOAD_MB", default_value_t = 10,
          value_parser = clap::value_parser!(u64).range(1..=100))]
    max_upload_mb: u64,
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// Image files to ingest.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Print each result as a JSON line instead of a summary.
    #[arg(long)]
    json: bool,

    /// Number of files processed at once.
    #[arg(short, long, env = "BIZCARD_CONCURRENCY", default_value_t = 4,
          value_parser = clap::value_parser!(u64).range(1..=32))]
    concurrency: u64,

    /// Disable the progress spinner.
    #[arg(long)]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Where uploaded images are stored.
    #[arg(long, global = true, env = "BIZCARD_STORAGE", value_enum, default_value = "gcs")]
    storage: StorageArg,

    /// GCS bucket name.
    #[arg(long, global = true, env = "BUCKET_NAME")]
    bucket: Option<String>,

    /// OAuth2 access token for Google Cloud APIs.
    #[arg(long, global = true, env = "GCS_ACCESS_TOKEN", hide_env_values = true)]
    gcs_token: Option<String>,

    /// Directory for `--storage local`.
    #[arg(long, global = true, env = "BIZCARD_STORAGE_DIR", default_value = "uploads")]
    storage_dir: PathBuf,

    /// OCR backend.
    #[arg(long, global = true, env = "BIZCARD_RECOGNIZER", value_enum, default_value = "vision")]
    recognizer: RecognizerArg,

    /// Cloud Vision API key.
    #[arg(long, global = true, env = "GOOGLE_VISION_API_KEY", hide_env_values = true)]
    vision_api_key: Option<String>,

    /// Comma-separated OCR language hints, e.g. "ja,en".
    #[arg(long, global = true, env = "BIZCARD_LANGUAGE_HINTS", value_delimiter = ',')]
    language_hints: Vec<String>,

    /// Where structured rows are appended.
    #[arg(long, global = true, env = "BIZCARD_SINK", value_enum, default_value = "http")]
    sink: SinkArg,

    /// Sink endpoint for `--sink http`.
    #[arg(long, global = true, env = "SHEETDB_API_URL")]
    sink_url: Option<String>,

    /// Bearer token for the sink.
    #[arg(long, global = true, env = "SHEETDB_API_TOKEN", hide_env_values = true)]
    sink_token: Option<String>,

    /// Basic-auth user for the sink (SheetDB API key).
    #[arg(long, global = true, env = "SHEETDB_USER")]
    sink_user: Option<String>,

    /// Basic-auth password for the sink (SheetDB API secret).
    #[arg(long, global = true, env = "SHEETDB_PASSWORD", hide_env_values = true)]
    sink_password: Option<String>,

    /// Output file for `--sink jsonl`.
    #[arg(long, global = true, env = "BIZCARD_SINK_FILE", default_value = "cards.jsonl")]
    sink_file: PathBuf,

    /// LLM model ID for extraction (and `--recognizer llm`).
    #[arg(long, global = true, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Comma-separated canonical field list, in column order.
    #[arg(long, global = true, env = "BIZCARD_FIELDS")]
    fields: Option<String>,

    /// Keys the model invents: drop, or preserve under raw_json.
    #[arg(
        long,
        global = true,
        env = "BIZCARD_UNKNOWN_FIELDS",
        value_enum,
        default_value = "drop"
    )]
    unknown_fields: UnknownFieldPolicy,

    /// Timeout in seconds for each external API call.
    #[arg(long, global = true, env = "BIZCARD_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Max LLM output tokens for extraction.
    #[arg(long, global = true, env = "BIZCARD_MAX_TOKENS", default_value_t = 1024)]
    max_tokens: usize,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StorageArg {
    Gcs,
    Local,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RecognizerArg {
    Vision,
    Llm,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SinkArg {
    Http,
    Jsonl,
}

// ── Progress ─────────────────────────────────────────────────────────────

/// Spinner showing the latest transition of any in-flight file.
struct SpinnerObserver {
    bar: ProgressBar,
}

impl SpinnerObserver {
    fn new(total: usize) -> Arc<Self> {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  {pos}/{len}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Ingesting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl IngestObserver for SpinnerObserver {
    fn on_transition(&self, job: &str, _from: &PipelineState, to: &PipelineState) {
        match to {
            PipelineState::Completed => {
                self.bar.println(format!("  {} {}", green("✓"), job));
                self.bar.inc(1);
            }
            PipelineState::Failed { cause, .. } => {
                self.bar
                    .println(format!("  {} {}  {}", red("✗"), job, red(cause)));
                self.bar.inc(1);
            }
            _ => self.bar.set_message(format!("{job}: {to}")),
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let show_progress = matches!(&cli.command, Command::Ingest(a) if !a.no_progress && !a.json)
        && !cli.quiet;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let ingestor = build_ingestor(&cli.pipeline)?;

    match cli.command {
        Command::Serve(args) => {
            let config = ServerConfig {
                host: args.host,
                port: args.port,
                cors_origin: args.cors_origin,
                body_limit: (args.max_upload_mb * 1024 * 1024) as usize,
            };
            serve(AppState::new(ingestor), &config)
                .await
                .context("Server failed")?;
        }
        Command::Ingest(args) => run_ingest(ingestor, args, show_progress, cli.quiet).await?,
    }
    Ok(())
}

async fn run_ingest(
    ingestor: Ingestor,
    args: IngestArgs,
    show_progress: bool,
    quiet: bool,
) -> Result<()> {
    let spinner = show_progress.then(|| SpinnerObserver::new(args.files.len()));
    let ingestor = match &spinner {
        Some(observer) => ingestor.with_observer(observer.clone()),
        None => ingestor,
    };
    let ingestor = Arc::new(ingestor);

    let results: Vec<_> = stream::iter(args.files.iter().cloned())
        .map(|path| {
            let ingestor = ingestor.clone();
            async move {
                let result = ingestor.ingest_path(&path).await;
                (path, result)
            }
        })
        .buffer_unordered(args.concurrency as usize)
        .collect()
        .await;

    if let Some(spinner) = &spinner {
        spinner.bar.finish_and_clear();
    }

    let mut failed = 0usize;
    for (path, result) in &results {
        match result {
            Ok(output) => {
                if args.json {
                    let line = serde_json::to_string(&output.response())
                        .context("Failed to serialise result")?;
                    println!("{line}");
                } else if !quiet {
                    eprintln!(
                        "{} {}  →  {}  {}",
                        green("✔"),
                        path.display(),
                        output.locator,
                        dim(&format!("{}ms", output.stats.total_ms)),
                    );
                    if let Some(reason) = &output.degraded {
                        eprintln!("   {}", dim(&format!("extraction degraded: {reason}")));
                    }
                }
            }
            Err(e) => {
                failed += 1;
                eprintln!("{} {}  [{}] {}", red("✘"), path.display(), e.kind(), e);
            }
        }
    }

    if failed > 0 {
        bail!("{failed}/{} file(s) failed", results.len());
    }
    Ok(())
}

/// Map CLI args onto the pipeline config and adapters.
fn build_ingestor(args: &PipelineArgs) -> Result<Ingestor> {
    let mut builder = IngestConfig::builder()
        .unknown_fields(args.unknown_fields)
        .api_timeout_secs(args.api_timeout)
        .max_tokens(args.max_tokens);
    if let Some(ref list) = args.fields {
        builder = builder.fields(CanonicalFieldSet::parse_list(list).context("Invalid --fields")?);
    }
    if let Some(ref model) = args.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider.clone());
    }
    let mut config = builder.build().context("Invalid configuration")?;

    // One provider serves both extraction and LLM recognition.
    let provider = resolve_provider(&config).context("Failed to resolve LLM provider")?;
    config.provider = Some(provider.clone());
    let config = Arc::new(config);

    let store: Arc<dyn BlobStore> = match args.storage {
        StorageArg::Gcs => {
            let Some(ref bucket) = args.bucket else {
                bail!("--storage gcs requires BUCKET_NAME (or --bucket)");
            };
            let mut gcs = GcsConfig::new(bucket.clone());
            gcs.access_token = args.gcs_token.clone();
            gcs.timeout_secs = args.api_timeout;
            Arc::new(GcsBlobStore::new(gcs).context("Failed to configure GCS")?)
        }
        StorageArg::Local => Arc::new(
            LocalBlobStore::open(&args.storage_dir)
                .with_context(|| format!("Failed to open {}", args.storage_dir.display()))?,
        ),
    };

    let recognizer: Arc<dyn TextRecognizer> = match args.recognizer {
        RecognizerArg::Vision => {
            if args.vision_api_key.is_none() && args.gcs_token.is_none() {
                bail!("--recognizer vision requires GOOGLE_VISION_API_KEY or GCS_ACCESS_TOKEN");
            }
            let vision = VisionConfig {
                api_key: args.vision_api_key.clone(),
                access_token: args.gcs_token.clone(),
                language_hints: args.language_hints.clone(),
                timeout_secs: args.api_timeout,
                ..Default::default()
            };
            Arc::new(
                VisionApiRecognizer::new(vision, store.clone())
                    .context("Failed to configure Cloud Vision")?,
            )
        }
        RecognizerArg::Llm => Arc::new(LlmVisionRecognizer::new(
            provider.clone(),
            store.clone(),
            args.api_timeout,
        )),
    };

    let sink: Arc<dyn RecordSink> = match args.sink {
        SinkArg::Http => {
            let Some(ref url) = args.sink_url else {
                bail!("--sink http requires SHEETDB_API_URL (or --sink-url)");
            };
            let mut http = HttpSinkConfig::new(url.clone());
            http.timeout_secs = args.api_timeout;
            http.auth = match (&args.sink_token, &args.sink_user) {
                (Some(token), _) => SinkAuth::Bearer(token.clone()),
                (None, Some(user)) => SinkAuth::Basic {
                    username: user.clone(),
                    password: args.sink_password.clone().unwrap_or_default(),
                },
                (None, None) => SinkAuth::None,
            };
            Arc::new(HttpRecordSink::new(http).context("Failed to configure sink")?)
        }
        SinkArg::Jsonl => Arc::new(JsonlRecordSink::new(&args.sink_file)),
    };

    let completion = Arc::new(LlmCompletion::new(provider, &config));
    Ok(Ingestor::new(config, store, recognizer, completion, sink))
}
