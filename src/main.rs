use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use modelport::convert;

/// Convert a trained model archive into a self-contained JSON document for
/// the target inference runtime.
#[derive(Parser, Debug)]
#[command(name = "modelport", version)]
struct Args {
    /// Trained model archive (ZIP with manifest and weight blobs)
    model: PathBuf,

    /// Destination path for the converted JSON document
    output: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(err) = convert(&args.model, &args.output) {
        tracing::error!("conversion failed: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
