//! Image classifier CLI.
//!
//! Reads `runtime.toml` (or the path given as first argument) and classifies
//! the images given after it, or replays the configured frames directory as a
//! stream. Results are printed as JSON lines.

use imageclassifier::start_runtime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    start_runtime().await
}
