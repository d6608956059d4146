mod config;

use assay_gateway::{sign_payload, AuthConfig, GatewayServer, WebhookNotifier};
use assay_orchestrator::{spawn_sweeper, CapabilityRegistry, HttpWorkerTransport, Orchestrator};
use assay_resilience::{CircuitBreaker, GuardedLlm, HttpLlmBackend, ShutdownCoordinator};
use clap::{Parser, Subcommand, ValueEnum};
use config::AssayConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "assay.toml";

#[derive(Parser)]
#[command(name = "assay", about = "Assay: QA agent orchestrator")]
struct Cli {
    /// Path to config file (defaults to ./assay.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator gateway
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Inspect the capability registry
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },
    /// Print the X-Signature value for a webhook body
    Sign {
        /// Shared callback secret
        #[arg(long)]
        secret: String,
        /// File holding the exact request body
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum AgentsAction {
    /// List registered agents and their aliases
    List,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AssayConfig> {
    let mut config = match path {
        Some(path) => AssayConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            AssayConfig::load(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => AssayConfig::default(),
    };
    config.apply_env(|name| std::env::var(name).ok());
    Ok(config)
}

fn load_registry(config: &AssayConfig) -> anyhow::Result<CapabilityRegistry> {
    let registry = match &config.agents_file {
        Some(path) => CapabilityRegistry::load(path)?,
        None => CapabilityRegistry::with_defaults()?,
    };
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await,
        Commands::Agents {
            action: AgentsAction::List,
        } => {
            let registry = load_registry(&config)?;
            for agent in registry.list_all() {
                println!(
                    "{:<24} {:<10} {:<22} {}",
                    agent.key,
                    agent.complexity_class.to_string(),
                    agent.queue_name,
                    agent.route_aliases.join(", ")
                );
            }
            Ok(())
        }
        Commands::Sign { secret, file } => {
            let body = tokio::fs::read(&file).await.map_err(|e| {
                anyhow::anyhow!("Failed to read body file '{}': {}", file.display(), e)
            })?;
            println!("{}", sign_payload(&secret, &body)?);
            Ok(())
        }
    }
}

async fn serve(config: AssayConfig, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);

    info!("Starting Assay gateway on {host}:{port}");

    let registry = Arc::new(load_registry(&config)?);
    info!(agents = registry.len(), "Capability registry loaded");

    let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
    let transport = Arc::new(HttpWorkerTransport::new(
        config.workers.base_url.clone(),
        Duration::from_secs(config.workers.request_timeout_secs),
    )?);
    let notifier = Arc::new(WebhookNotifier::new(Duration::from_secs(
        config.webhook.timeout_secs,
    ))?);
    let shutdown = ShutdownCoordinator::new();

    let mut builder = Orchestrator::builder(registry, transport)
        .config(config.orchestrator.clone())
        .breaker(breaker.clone())
        .retry(config.retry.clone())
        .notifier(notifier)
        .shutdown(shutdown.clone());
    if let Some(llm) = config.llm.clone() {
        info!(model = %llm.model, "Verification commentary enabled");
        let timeout = Duration::from_secs(llm.timeout_secs);
        builder = builder.llm(Arc::new(GuardedLlm::new(
            Arc::new(HttpLlmBackend::new(llm)),
            breaker,
            config.retry.clone(),
            timeout,
        )));
    }
    let orchestrator = builder.build()?;

    let sweeper = spawn_sweeper(
        orchestrator.store().clone(),
        Duration::from_secs(config.orchestrator.sweep_interval_secs),
        shutdown.clone(),
    );

    let auth_config = AuthConfig::new(config.server.api_keys.clone());
    if auth_config.is_enabled() {
        info!(keys = config.server.api_keys.len(), "API key auth enabled");
    }
    let app = GatewayServer::build_with_auth(orchestrator, auth_config);

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.trigger();
        }
    });

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Assay gateway listening on {addr}");

    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.triggered().await })
        .await?;

    let grace = Duration::from_secs(config.orchestrator.shutdown_grace_secs);
    if shutdown.drain(grace).await {
        info!("Shutdown complete");
    } else {
        warn!(
            in_flight = shutdown.in_flight(),
            grace_secs = grace.as_secs(),
            "Grace period elapsed with sessions still running"
        );
    }
    sweeper.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
