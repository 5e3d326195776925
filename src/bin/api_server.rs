// HTTP query API over the current catalog snapshot.

use anyhow::Result;
use streaming_compare::api::ApiServer;
use streaming_compare::tracing::{init_tracing, DEFAULT_FILTER};
use streaming_compare::util::env as env_util;

#[actix_web::main]
async fn main() -> Result<()> {
    // Load dotenv/env once (safe to call multiple times)
    env_util::init_env();
    init_tracing(DEFAULT_FILTER)?;

    tracing::info!("initializing streaming-compare API server");

    let server = ApiServer::from_env()?;
    server.run().await
}
