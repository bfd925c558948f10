use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use safereturn_core::{
    Decision, DecisionPipeline, GalleryBuilder, GalleryHandle, GalleryLoad, IdentityStore,
    OnnxExtractor, Threshold,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "safereturn", about = "Safe Return face recognition CLI")]
struct Cli {
    /// Talk to the daemon on the session bus instead of the system bus
    #[arg(
        long,
        global = true,
        env = "SAFE_RETURN_SESSION_BUS",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    session: bool,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize a face in an image, in-process
    Recognize {
        image: PathBuf,
        #[command(flatten)]
        local: LocalArgs,
    },
    /// Build the gallery and list its reference entries
    Gallery {
        #[command(flatten)]
        local: LocalArgs,
    },
    /// List the identity table
    Identities {
        #[arg(long, env = "SAFE_RETURN_IDENTITY_TABLE")]
        identity_table: PathBuf,
    },
    /// Show daemon status
    Status,
    /// Ask the daemon to re-scan its gallery
    Reload,
    /// Recognize a face in an image via the daemon
    RemoteRecognize { image: PathBuf },
}

#[derive(Args)]
struct LocalArgs {
    /// Directory of reference photos
    #[arg(long, env = "SAFE_RETURN_GALLERY_DIR")]
    gallery_dir: PathBuf,
    /// CSV or spreadsheet mapping identifiers to names
    #[arg(long, env = "SAFE_RETURN_IDENTITY_TABLE")]
    identity_table: PathBuf,
    /// Minimum confidence for a match, in [0, 1]
    #[arg(long, env = "SAFE_RETURN_CONFIDENCE_THRESHOLD", default_value_t = 0.6)]
    threshold: f32,
    /// Directory containing det_10g.onnx and w600k_r50.onnx
    #[arg(long, env = "SAFE_RETURN_MODEL_DIR")]
    model_dir: Option<PathBuf>,
    /// Skip the representation cache
    #[arg(long)]
    no_cache: bool,
}

// D-Bus proxy. `#[zbus::proxy]` generates `RecognizerProxy` (async) and a
// blocking variant; the CLI already runs on tokio so only the async one is used.
#[zbus::proxy(
    interface = "org.safereturn.Recognizer1",
    default_service = "org.safereturn.Recognizer1",
    default_path = "/org/safereturn/Recognizer1"
)]
trait Recognizer {
    async fn recognize(&self, image: Vec<u8>) -> zbus::Result<String>;
    async fn reload_gallery(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

/// Identity store, extractor and freshly built gallery for in-process commands.
struct Local {
    pipeline: DecisionPipeline,
    extractor: OnnxExtractor,
    load: GalleryLoad,
}

fn load_local(args: &LocalArgs) -> Result<Local> {
    let threshold = Threshold::new(args.threshold)?;
    let identities = IdentityStore::load(&args.identity_table).with_context(|| {
        format!("failed to load identity table {}", args.identity_table.display())
    })?;
    let model_dir = args
        .model_dir
        .clone()
        .unwrap_or_else(safereturn_core::default_model_dir);
    let mut extractor = OnnxExtractor::load(&model_dir)
        .with_context(|| format!("failed to load models from {}", model_dir.display()))?;

    let mut builder = GalleryBuilder::new(&args.gallery_dir).identities(&identities);
    if !args.no_cache {
        builder = builder.cache(args.gallery_dir.join(".representations.json"));
    }
    let load = builder.build(&mut extractor)?;
    tracing::debug!(
        dir = %args.gallery_dir.display(),
        entries = load.index.len(),
        cache_hits = load.cache_hits,
        "local gallery loaded"
    );
    for warning in &load.warnings {
        eprintln!("warning: {warning}");
    }

    let pipeline = DecisionPipeline::new(
        Arc::new(GalleryHandle::new(load.index.clone())),
        Arc::new(identities),
        threshold,
    );
    Ok(Local {
        pipeline,
        extractor,
        load,
    })
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_decision(decision: &Decision, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(decision)?);
        return Ok(());
    }
    if decision.matched {
        println!(
            "{} ({}), confidence {:.3}",
            decision.display_name.as_deref().unwrap_or("-"),
            decision.identifier.as_deref().unwrap_or("-"),
            decision.confidence
        );
        if decision.degraded {
            println!("note: identifier has no record in the identity table");
        }
    } else if decision.inconclusive {
        println!("{}", decision.message);
    } else {
        println!("{} (best confidence {:.3})", decision.message, decision.confidence);
    }
    Ok(())
}

async fn connect(session: bool) -> Result<RecognizerProxy<'static>> {
    tracing::debug!(session, "connecting to safereturnd");
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    RecognizerProxy::new(&conn)
        .await
        .context("safereturnd is not reachable")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Recognize { image, local } => {
            let bytes = read_image(&image)?;
            let mut local = load_local(&local)?;
            let decision = local.pipeline.decide(&mut local.extractor, &bytes)?;
            print_decision(&decision, cli.json)?;
        }
        Commands::Gallery { local } => {
            let local = load_local(&local)?;
            let index = &local.load.index;
            if cli.json {
                let entries: Vec<_> = index
                    .entries()
                    .iter()
                    .map(|e| serde_json::json!({ "identifier": e.identifier, "source": e.source }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in index.entries() {
                    println!("{}\t{}", entry.identifier, entry.source.display());
                }
                println!(
                    "{} entries, {} identifiers, {} from cache",
                    index.len(),
                    index.identifiers().len(),
                    local.load.cache_hits
                );
            }
        }
        Commands::Identities { identity_table } => {
            let store = IdentityStore::load(&identity_table).with_context(|| {
                format!("failed to load identity table {}", identity_table.display())
            })?;
            if cli.json {
                let records: Vec<_> = store
                    .records()
                    .map(|r| {
                        serde_json::json!({ "identifier": r.identifier, "name": r.display_name })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for record in store.records() {
                    println!("{}\t{}", record.identifier, record.display_name);
                }
            }
        }
        Commands::Status => {
            let proxy = connect(cli.session).await?;
            println!("{}", proxy.status().await?);
        }
        Commands::Reload => {
            let proxy = connect(cli.session).await?;
            println!("{}", proxy.reload_gallery().await?);
        }
        Commands::RemoteRecognize { image } => {
            let bytes = read_image(&image)?;
            let proxy = connect(cli.session).await?;
            tracing::debug!(image = %image.display(), bytes = bytes.len(), "sending image");
            let reply = proxy.recognize(bytes).await?;
            let decision: Decision =
                serde_json::from_str(&reply).context("daemon returned malformed decision")?;
            print_decision(&decision, cli.json)?;
        }
    }

    Ok(())
}
