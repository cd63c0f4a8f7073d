//! procwrap daemon.
//!
//! Serves a small built-in router on the listeners described by a TOML file,
//! under signal supervision:
//!
//! ```text
//! SIGHUP           reload TLS material
//! SIGUSR1/SIGUSR2  log and keep running
//! SIGTERM/SIGINT   graceful stop, exit with its outcome
//! SIGQUIT          immediate exit with an error
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use axum::routing::get;
use axum::Router;
use clap::Parser;

use procwrap::config::{load_config, WrapperConfig};
use procwrap::observability::logging;
use procwrap::{Error, Exit, HttpServer, ServerStop, Signal, SignalHandlers, StopToken, Supervisor};

#[derive(Parser)]
#[command(name = "procwrap")]
#[command(about = "Serve HTTP under process signal supervision", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "procwrap.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();

    tracing::info!("procwrap v{} starting", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %err, "Exiting with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = load_config(&cli.config)?;
    tracing::info!(
        path = %cli.config.display(),
        listeners = config.listeners.len(),
        tls = config.tls.is_some(),
        socket_activation = config.socket_activation,
        "Configuration loaded"
    );

    let server = HttpServer::try_build(config.steps(router()))?;
    for binding in server.bindings() {
        tracing::info!(listener = %binding, "Serving");
    }
    let (start, stop) = server.into_parts();

    let supervisor = Supervisor::register(handlers(&config, stop))?;
    supervisor
        .exec(&StopToken::new(), move |_scope| start.start())
        .await?;
    Ok(())
}

fn router() -> Router {
    Router::new()
        .route("/", get(|| async { "procwrap\n" }))
        .route("/health", get(|| async { "ok\n" }))
}

fn handlers(config: &WrapperConfig, stop: ServerStop) -> SignalHandlers<Error> {
    let tls = config.tls.clone();
    let reload_stop = stop.clone();
    let shutdown_timeout = config.shutdown_timeout();

    let graceful = move |exit: Exit<Error>| {
        let stop = stop.clone();
        async move {
            tracing::info!("Stopping gracefully");
            stop.stop_and_exit(&StopToken::with_timeout(shutdown_timeout), exit)
                .await;
        }
    };

    SignalHandlers::<Error>::new()
        .on(Signal::Hangup, move |_exit| {
            let stop = reload_stop.clone();
            let tls = tls.clone();
            async move {
                let Some(tls) = tls else {
                    tracing::info!("SIGHUP received, no TLS material to reload");
                    return;
                };
                match stop.reload_tls(&tls.cert_path, &tls.key_path) {
                    Ok(()) => tracing::info!("TLS material reloaded"),
                    Err(err) => tracing::error!(error = %err, "TLS reload failed, keeping previous material"),
                }
            }
        })
        .on(Signal::User1, |_exit| async {
            tracing::info!(signal = %Signal::User1, "Signal received");
        })
        .on(Signal::User2, |_exit| async {
            tracing::info!(signal = %Signal::User2, "Signal received");
        })
        .on(Signal::Terminate, graceful.clone())
        .on(Signal::Interrupt, graceful)
        .on(Signal::Quit, |exit: Exit<Error>| async move {
            exit.fail(Error::Aborted("received SIGQUIT".into()));
        })
}
