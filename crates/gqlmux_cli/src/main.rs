//! Main entry point for the gqlmux CLI.

use clap::Parser;
use gqlmux_cli::Cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gqlmux=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let code = gqlmux_cli::run(cli).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
