mod config;
mod connection;
mod server;

use anyhow::Result;
use clap::Parser;

use crate::config::{Args, load_runtime_config};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "thalassad=info,libthalassa=info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = load_runtime_config(&args)?;
    server::run(cfg).await
}
