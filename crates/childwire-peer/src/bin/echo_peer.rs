//! Child process that answers every request with its own body.
//!
//! Speaks the childwire protocol on stdin/stdout; logs go to stderr.

use std::sync::Arc;

use anyhow::Context;
use childwire_peer::{Echo, run_peer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    childwire::init_tracing();

    let exit = run_peer(Arc::new(Echo), tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("echo peer failed")?;

    tracing::info!(?exit, "Echo peer exiting");
    Ok(())
}
