use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "inference-router")]
#[command(about = "Front-door inference router: classification, cache/coalescer, premium quota, and provider fan-out.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP server (POST /infer, GET /health).
    Serve {
        /// Listen address; overrides BIND_ADDR/PORT when set.
        #[arg(long)]
        bind: Option<String>,
    },
}
