// ABOUTME: Main entry point for one troupe persona agent
// ABOUTME: Brings up logging, config, state store, platform, control surface, and the runtime

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use troupe::{
    conductor::ConductorClient, config::Config, control, control::ControlState, metrics, platform,
    runtime::AgentRuntime, scheduler, session::StateStore,
};

#[derive(Parser)]
#[command(name = "troupe", about = "One persona agent of the troupe")]
struct Args {
    /// Path to the persona's TOML config
    #[arg(long, short, default_value = "troupe.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Log panics before they take the process down
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("PANIC: {}", panic_info);
        eprintln!(
            "Backtrace:\n{:?}",
            std::backtrace::Backtrace::force_capture()
        );
    }));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Missing mandatory configuration is fatal: an agent without credentials
    // or a conductor address cannot do anything useful
    let config = Arc::new(Config::load(&args.config)?);

    tracing::info!(
        persona = %config.persona.name,
        handle = config.persona.handle,
        platform = %config.platform.kind,
        conductor = %config.conductor.url,
        control_port = config.control.port,
        roster = config.roster.len(),
        "Configuration loaded"
    );

    let metrics_handle = metrics::init_metrics()?;

    let store = StateStore::open(&config.state.path)?;
    let identities = Arc::new(config.identity_table()?);

    // The platform connection must be ready (identity resolution complete)
    // before anything else starts serving
    let platform = platform::connect(&config).await?;
    if platform.bot_handle() != 0 && platform.bot_handle() != config.persona.handle {
        tracing::warn!(
            configured = config.persona.handle,
            platform = platform.bot_handle(),
            "Configured handle does not match the platform's — mentions of this persona may be missed"
        );
    }

    let conductor = ConductorClient::http(&config.conductor)?;

    let runtime = AgentRuntime::new(
        platform,
        Arc::clone(&identities),
        store.clone(),
        conductor.clone(),
        Arc::clone(&config),
    );
    let handle = runtime.handle();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Control surface: bound only now, after platform readiness — the
    // one-way gate callers rely on
    let control_state = ControlState {
        runtime: handle.clone(),
        store: store.clone(),
        conductor: conductor.clone(),
        identities: Arc::clone(&identities),
        config: Arc::clone(&config),
        metrics_handle,
    };
    let addr = format!("{}:{}", config.control.host, config.control.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind control surface on {}", addr))?;
    tokio::spawn(async move {
        if let Err(e) = control::serve(control_state, listener).await {
            tracing::error!(error = %e, "Control surface failed");
        }
    });

    if !config.schedule.is_empty() {
        tokio::spawn(scheduler::run_scheduler(
            Arc::clone(&config),
            handle,
            conductor,
            store.clone(),
            shutdown_rx.clone(),
        ));
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received — shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    runtime.run(shutdown_rx).await
}
