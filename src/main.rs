//! This file defines the acoustic-views binary entry point.

use acoustic_views::app;
use acoustic_views::cli;
use acoustic_views::metrics;
use acoustic_views::server;
use acoustic_views::tracing;

/// Application entry point
#[tokio::main]
async fn main() {
    let args = cli::parse();
    tracing::init_tracing(&args);
    ::tracing::debug!(?args, "parsed command line arguments");
    metrics::register_metrics();
    let service = app::service(&args);
    server::serve(&args, service).await;
    tracing::shutdown_tracing();
}
