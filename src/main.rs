// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use microchat::engine::{self, LoadOptions};
use microchat::paths::ModelLocation;
use microchat::server::{Server, DEFAULT_PORT};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "microchat")]
#[command(version = VERSION)]
#[command(about = "Local LLM chat backend. One model, one machine, no cloud.")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address to bind to (use 127.0.0.1 for local-only access)
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Override the model download URL
    #[arg(long)]
    model_url: Option<String>,

    /// Context window size in tokens
    #[arg(long, default_value_t = 4096)]
    context_size: u32,

    /// Inference threads
    #[arg(long, default_value_t = 4)]
    threads: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let location = ModelLocation::resolve()
        .context("failed to resolve the model storage directory for this OS")?;

    match location.size_bytes() {
        Some(bytes) => {
            tracing::info!(
                path = %location.full_path.display(),
                size_gb = format!("{:.2}", bytes as f64 / 1024.0 / 1024.0 / 1024.0),
                "model file present"
            );
        }
        None => {
            tracing::info!(
                path = %location.full_path.display(),
                "model file not downloaded yet"
            );
        }
    }

    let mut server = Server::new(location, engine::default_engine())
        .with_port(cli.port)
        .with_bind_address(cli.bind)
        .with_load_options(LoadOptions {
            context_size: cli.context_size,
            thread_count: cli.threads,
        });

    if let Some(url) = cli.model_url {
        server = server.with_model_url(url);
    }

    server.start().await
}
