use clap::Parser;
use std::process::ExitCode;

use stoker::app::App;
use stoker::cli::Args;
use stoker::telemetry::TelemetryRegistry;
use stoker::worker::WorkerRegistry;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // The binary runs a bare node: staging, leadership, pruning, and any
    // configured cron entries. Embedders register workers on the registry
    // and run queues through the library instead.
    let registry = WorkerRegistry::new();
    let telemetry = TelemetryRegistry::new();

    let app = match App::new(&args, registry, telemetry).await {
        Ok(app) => app,
        Err(error) => {
            eprintln!("failed to start: {error:#}");
            return ExitCode::FAILURE;
        }
    };

    app.run().await
}
