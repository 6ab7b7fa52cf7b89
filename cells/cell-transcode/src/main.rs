//! pixelcell transcode cell (pxc-cell-transcode)
//!
//! Reads length-prefixed JSON requests on stdin and writes responses on
//! stdout. Logs go to stderr.

use std::rc::Rc;

use cell_transcode::{WorkerConfig, WorkerRuntime};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use tokio::task::LocalSet;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = WorkerConfig::from_env();
    tracing::info!(?config, "transcode cell starting");

    let runtime = WorkerRuntime::new(&config).map_err(|e| eyre!("failed to start worker: {e}"))?;

    LocalSet::new()
        .run_until(Rc::new(runtime).serve_stream(tokio::io::stdin(), tokio::io::stdout()))
        .await?;

    tracing::info!("input closed, exiting");
    Ok(())
}
