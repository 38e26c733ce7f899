use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowforge_backends::{create_backends, EchoBackend};
use flowforge_core::config::AppConfig;
use flowforge_core::frame::encode_frame;
use flowforge_core::graph::{GraphSubmission, MediaFamily};
use flowforge_core::traits::RunStore;
use flowforge_core::types::{RunId, RunStatus};
use flowforge_engine::{Engine, HandlerRegistry, RunView};
use flowforge_gateway::{AppState, GatewayServer};
use flowforge_store::SqliteStore;

#[derive(Parser)]
#[command(
    name = "flowforge",
    version,
    about = "Run media generation graphs in dependency order"
)]
struct Cli {
    /// Path to config file (default: ./flowforge.toml, then ~/.flowforge/config.toml)
    #[arg(short, long, env = "FLOWFORGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Override gateway.bind
        #[arg(long)]
        bind: Option<String>,
    },
    /// Validate a graph file and print the report
    Validate {
        /// Graph JSON: {projectId, nodes, edges}
        graph: PathBuf,
    },
    /// Run a graph file, printing progress frames to stdout (Ctrl-C cancels)
    Run {
        /// Graph JSON: {projectId, nodes, edges}
        graph: PathBuf,
        /// Serve every generation family with the offline echo backend
        #[arg(long)]
        echo: bool,
    },
    /// Rebuild a finished run from the store
    Replay {
        run_id: String,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries frames and reports.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("flowforge=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "flowforge", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::discover(cli.config.as_deref()).context("loading config")?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { graph } => {
            let submission = read_submission(&graph)?;
            let report = Engine::validate(&submission);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                anyhow::bail!("{}", report.summary());
            }
            let levels = Engine::plan(&submission)?;
            info!(levels = levels.len(), nodes = submission.nodes.len(), "Graph is valid");
        }
        Commands::Run { graph, echo } => {
            let submission = read_submission(&graph)?;
            let store = open_store(&config)?;
            let engine = Engine::new(
                build_registry(&config, echo)?,
                store,
                config.engine.clone(),
            );
            run_to_stdout(&engine, submission).await?;
        }
        Commands::Replay { run_id } => {
            let store = open_store(&config)?;
            let run_id = RunId::from_string(&run_id);
            let run = store
                .get_run(&run_id)
                .await?
                .with_context(|| format!("run {} not found", run_id))?;
            let events = store.run_events(&run_id).await?;
            let view = RunView::from_record(&run, &events);
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::Serve { bind } => {
            let mut gateway = config.gateway.clone();
            if let Some(bind) = bind {
                gateway.bind = bind;
            }
            let store = open_store(&config)?;
            let engine = Engine::new(
                build_registry(&config, false)?,
                store.clone(),
                config.engine.clone(),
            );
            info!(bind = %gateway.bind, "Starting gateway");
            let server = GatewayServer::new(AppState {
                config: gateway,
                engine,
                runs: store.clone(),
                graphs: store,
            });

            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn read_submission(path: &Path) -> anyhow::Result<GraphSubmission> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<SqliteStore>> {
    let path = config.store_path();
    let store = SqliteStore::open(&path)
        .with_context(|| format!("opening store at {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Local handlers plus one backend per configured family, or echo for all.
fn build_registry(config: &AppConfig, echo: bool) -> anyhow::Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::with_local_handlers();
    if echo {
        for family in MediaFamily::ALL {
            registry.register(family.kind(), EchoBackend::new(family, None));
        }
        return Ok(registry);
    }

    for (kind, backend) in create_backends(&config.backends)? {
        info!(kind = %kind, backend = backend.name(), "Backend registered");
        registry.register_arc(kind, backend);
    }
    for family in MediaFamily::ALL {
        if config.backends.get(family).is_none() {
            warn!(family = family.as_str(), "No backend configured; nodes of this family will fail");
        }
    }
    Ok(registry)
}

async fn run_to_stdout(engine: &Engine, submission: GraphSubmission) -> anyhow::Result<()> {
    let mut handle = engine.start(submission)?;
    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, canceling run");
            cancel.cancel();
        }
    });

    while let Some(event) = handle.next_event().await {
        print!("{}", encode_frame(&event)?);
    }

    let outcome = handle.wait().await?;
    info!(
        run_id = %outcome.run_id,
        status = %outcome.status,
        completed = outcome.completed_nodes,
        total = outcome.total_nodes,
        "Run ended"
    );
    match outcome.status {
        RunStatus::Failed => anyhow::bail!(
            "run {} failed: {}",
            outcome.run_id,
            outcome.error.unwrap_or_default()
        ),
        _ => Ok(()),
    }
}
