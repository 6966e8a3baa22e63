use clap::Parser;
use resource_archive::{cli, config};
use tracing::error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() {
    enable_tracing();

    let cli = cli::Cli::parse();
    if let Err(err) = cli::run(cli).await {
        error!("{err}");
        std::process::exit(1);
    }
}

/// Initializes logging using [`tracing_subscriber`]. `RUST_LOG` overrides
/// the `DEBUG`-derived default filter.
fn enable_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config::log_filter()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();
}
