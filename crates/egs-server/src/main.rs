//! egs-server binary entry point.
//!
//! Guest service answering eryph guest services sessions.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use egs_core::auth::Signer;
use egs_core::transport::create_server_endpoint;
use egs_server::{Cli, GuestAuthenticator, SocketServer, load_host_key, status};

fn main() {
    let cli = Cli::parse();

    let log_format = cli.log_format.into();
    if let Err(e) = egs_core::init_logging(cli.verbose, cli.log_file.as_deref(), log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "egs-server starting");

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(cli)) {
        error!(error = %e, "Service failed");
        eprintln!("egs-server: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> egs_core::Result<()> {
    let host_key = load_host_key(cli.host_key.as_deref())?;
    let authenticator = Arc::new(GuestAuthenticator::new(cli.client_key_provider()));

    let listener = create_server_endpoint(cli.scope.into(), &cli.service_id, cli.backlog)?;
    info!(
        address = %listener.local_description(),
        scope = ?cli.scope,
        service_id = %cli.service_id,
        "Listening"
    );

    let server = SocketServer::new(host_key.public_key().clone(), authenticator);
    let publisher = cli.status_publisher();
    status::announce(publisher.as_ref());

    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run(listener).await })
    };

    shutdown_signal().await;
    info!("Shutting down");

    status::withdraw(publisher.as_ref());
    server.dispose().await;
    match runner.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Accept loop panicked");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
