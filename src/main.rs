//! inference-router CLI: HTTP gateway only (single `serve` subcommand).
//!
//! Logging: set `RUST_LOG=inference_router=info` (or `debug`) to see router
//! logs on stderr.

mod cli;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use async_inference_router::providers::HttpProviderClients;
use async_inference_router::store::RedisStore;
use async_inference_router::{RouterConfig, RouterCore};

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("inference_router=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let mut config = RouterConfig::from_env();

    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }

            let store = RedisStore::new(&config.store)?;
            let providers = HttpProviderClients::new(config.providers.clone());
            let core = Arc::new(RouterCore::new(config, Arc::new(store), Arc::new(providers)));

            async_inference_router::gateway::run_http(core).await
        }
    }
}
