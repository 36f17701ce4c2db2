//! CLI binary for parlance.

use clap::{Parser, Subcommand};
use parlance::audio::{AudioCapture, CpalPlayer};
use parlance::pipeline::{PipelineContext, capture_service, core_service_definitions, monitor_service};
use parlance::server::{AppState, ConnectionManager, router, run_ui_forwarder};
use parlance::services::ServiceManager;
use parlance::DialogueConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Parlance: real-time spoken-dialogue engine.
#[derive(Parser)]
#[command(name = "parlance", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Run the dialogue engine and its control API.
    Serve {
        /// Start capture immediately instead of waiting for the
        /// system/start request.
        #[arg(long)]
        autostart: bool,
    },

    /// List available audio devices.
    Devices,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("parlance=info,tower=warn,hyper=warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = if let Some(ref path) = cli.config {
        DialogueConfig::from_file(path)?
    } else {
        DialogueConfig::default()
    };

    match cli.command.unwrap_or(Command::Serve { autostart: false }) {
        Command::Serve { autostart } => serve(config, autostart).await,
        Command::Devices => list_devices(),
    }
}

async fn serve(config: DialogueConfig, autostart: bool) -> anyhow::Result<()> {
    println!("parlance v{}", env!("CARGO_PKG_VERSION"));

    let bind = format!("{}:{}", config.server.host, config.server.port);
    let shutdown_wait = Duration::from_secs(config.services.shutdown_wait_secs);

    let (ctx, ui_messages_rx) = PipelineContext::new(config);
    let connections = ConnectionManager::new();
    let forwarder_cancel = CancellationToken::new();
    tokio::spawn(run_ui_forwarder(
        ui_messages_rx,
        Arc::clone(&connections),
        forwarder_cancel.clone(),
    ));

    // Bring up the model-backed stages; a required failure tears down
    // whatever already started and aborts the process.
    let mut manager = ServiceManager::new(shutdown_wait);
    manager.start_services(core_service_definitions(&ctx)).await?;

    if autostart {
        manager.start_service(monitor_service(&ctx)).await?;
        manager.start_service(capture_service(&ctx)).await?;
        info!("capture autostarted, session {}", ctx.registry.current_session_id());
    }

    let manager = Arc::new(tokio::sync::Mutex::new(manager));
    let state = AppState {
        ctx,
        manager: Arc::clone(&manager),
        connections,
    };

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("control API listening on http://{bind}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    forwarder_cancel.cancel();
    manager.lock().await.stop_all().await;
    Ok(())
}

/// Resolve when Ctrl+C or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C"),
        () = terminate => info!("received SIGTERM"),
    }
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in AudioCapture::list_input_devices()? {
        println!("  {name}");
    }
    println!("Output devices:");
    for name in CpalPlayer::list_output_devices()? {
        println!("  {name}");
    }
    Ok(())
}
