use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use edge_detour::{Gateway, Route, StrategyConfig, route, server};
use http::Uri;
use n0_error::{Result, StdResultExt};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
enum Cli {
    /// Run the gateway with configuration from the environment.
    Serve {
        #[clap(short, long, default_value = "127.0.0.1:8787")]
        listen: SocketAddr,
    },
    /// Print how a request path would be routed.
    Resolve {
        /// Request path, e.g. `/your-auth-token/https/example.com/`.
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = StrategyConfig::from_env()?;
    let default_level = if config.debug_mode { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match Cli::parse() {
        Cli::Serve { listen } => {
            let gateway = Gateway::with_defaults(config.connect_timeout)?;
            let listener = TcpListener::bind(listen).await?;
            info!(
                addr = %listener.local_addr()?,
                strategy = %config.strategy,
                fallback = %config.fallback,
                "gateway listening"
            );
            tokio::select! {
                res = server::serve(listener, gateway, Arc::new(config)) => res?,
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Cli::Resolve { path } => {
            let uri = Uri::try_from(path.as_str()).std_context("invalid request path")?;
            match route(&uri, &config) {
                Route::Dns { strategy } => println!("dns {strategy}"),
                Route::Proxy { destination } => println!("proxy {destination}"),
            }
        }
    }
    Ok(())
}
