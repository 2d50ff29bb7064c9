//! termgate server binary entry point.
//!
//! WebSocket front door for SSH, telnet and local command sessions.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use termgate_server::exec::CommandResolver;
use termgate_server::{Cli, Gateway, ws};

fn main() {
    let cli = Cli::parse();

    let log_format = cli.log_format.into();
    if let Err(e) = termgate_core::init_logging(cli.verbose, cli.log_file.as_deref(), log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "termgate starting");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> std::io::Result<()> {
    let config = cli.gateway_config();
    if config.allow_local_shell {
        warn!("Local shell route enabled");
    }
    if config.debug {
        info!(dir = %config.log_dir.display(), "Writing transcripts for every session");
    }

    let resolver = Arc::new(CommandResolver::discover(cli.tools_dir.clone()));
    let gateway = Arc::new(Gateway::new(config, resolver));
    let app = ws::router(gateway, cli.static_dir.clone());

    let addr = cli.socket_addr();
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Listening");
    axum::serve(listener, app).await
}
