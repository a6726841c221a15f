//! cok: expose a local HTTP server through a cok gateway.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cok_client::control::{ClientConfig, ControlChannelClient};
use cok_client::forward::Forwarder;
use cok_core::CircuitBreakerConfig;

#[derive(Parser, Debug)]
#[command(name = "cok")]
#[command(about = "Expose a local HTTP server through a cok gateway")]
struct Args {
    /// Gateway control endpoint, host:port.
    #[arg(long, short = 's', default_value = "localhost:5000")]
    server: String,

    /// Subdomain to request; omit to use the one bound to the API key.
    #[arg(long, short = 'n')]
    subdomain: Option<String>,

    /// API key for the handshake.
    #[arg(long, short = 'k', env = "COK_API_KEY")]
    api_key: String,

    /// Local server host.
    #[arg(long, default_value = "127.0.0.1")]
    local_host: String,

    /// Local server port.
    #[arg(long, short = 'p', default_value_t = 3000)]
    local_port: u16,

    /// Verbose logging (debug level).
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(args))
}

async fn run(args: Args) -> ExitCode {
    let forwarder = match Forwarder::new(
        args.local_host.clone(),
        args.local_port,
        CircuitBreakerConfig::default(),
    ) {
        Ok(forwarder) => forwarder,
        Err(err) => {
            error!(error = %err, "failed to build forwarder");
            return ExitCode::FAILURE;
        }
    };

    let mut config = ClientConfig::new(args.server.clone(), args.api_key);
    config.requested_subdomain = args.subdomain;

    info!(
        server = %args.server,
        local = %format!("{}:{}", args.local_host, args.local_port),
        "starting tunnel client"
    );

    let client = Arc::new(ControlChannelClient::new(config, forwarder));

    let signal_client = client.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, disconnecting");
            signal_client.disconnect();
        }
    });

    match client.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "tunnel client failed");
            ExitCode::FAILURE
        }
    }
}
