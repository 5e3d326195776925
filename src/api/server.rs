// API server implementation using actix-web

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::api::handlers::AppState;
use crate::api::{middleware, routes};
use crate::database_ops::{MemorySnapshotStore, PgSnapshotStore, SnapshotStore};
use crate::query::SnapshotHandle;
use crate::realtime::spawn_snapshot_watcher;
use crate::util::db::Db;
use crate::util::env as env_util;

pub struct ApiServer {
    pub host: String,
    pub port: u16,
    pub allowed_origins: String,
    /// Serve a snapshot from a JSON file instead of the database.
    pub demo_snapshot_path: Option<PathBuf>,
    pub poll_every: Duration,
}

impl ApiServer {
    /// Create server from environment variables
    pub fn from_env() -> Result<Self> {
        env_util::init_env();

        let host = env_util::env_opt("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = env_util::env_opt("API_PORT")
            .unwrap_or_else(|| "8080".to_string())
            .parse()
            .context("Invalid API_PORT")?;

        let allowed_origins = env_util::env_opt("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000,http://localhost:8501".to_string());

        Ok(Self {
            host,
            port,
            allowed_origins,
            demo_snapshot_path: env_util::env_opt("DEMO_SNAPSHOT_PATH").map(PathBuf::from),
            poll_every: Duration::from_secs(env_util::env_parse("SNAPSHOT_POLL_SECS", 60u64).max(1)),
        })
    }

    async fn open_store(&self) -> Result<(Arc<dyn SnapshotStore>, Option<PgPool>)> {
        if let Some(path) = &self.demo_snapshot_path {
            let store = MemorySnapshotStore::from_json_file(path)
                .await
                .with_context(|| format!("load demo snapshot {}", path.display()))?;
            tracing::info!(path = %path.display(), "serving demo snapshot");
            let store: Arc<dyn SnapshotStore> = Arc::new(store);
            return Ok((store, None));
        }
        let db = Db::from_env().await?;
        let store: Arc<dyn SnapshotStore> = Arc::new(PgSnapshotStore::new(&db));
        Ok((store, Some(db.pool.clone())))
    }

    /// Start the HTTP server
    pub async fn run(self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.host, self.port);
        let (store, listen_pool) = self.open_store().await?;

        let handle = SnapshotHandle::empty();
        if let Err(e) = handle.refresh_from(store.as_ref()).await {
            tracing::warn!(error = %e, "initial snapshot load failed; serving empty data until the next reload");
        }

        let cancel = CancellationToken::new();
        let watcher = spawn_snapshot_watcher(
            store.clone(),
            handle.clone(),
            listen_pool,
            self.poll_every,
            cancel.clone(),
        );

        tracing::info!(
            host = %self.host,
            port = %self.port,
            snapshot_id = handle.version(),
            "starting streaming-compare API server"
        );

        let state = web::Data::new(AppState::new(handle, store));
        let allowed_origins = self.allowed_origins.clone();

        let served = HttpServer::new(move || {
            let (logger, compress) = middleware::setup_middleware();
            let cors = middleware::setup_cors(&allowed_origins);

            App::new()
                .app_data(state.clone())
                .wrap(logger)
                .wrap(compress)
                .wrap(cors)
                .configure(routes::configure_routes)
        })
        .bind(&bind_addr)
        .with_context(|| format!("Failed to bind to {}", bind_addr))?
        .run()
        .await
        .context("HTTP server error");

        cancel.cancel();
        if let Err(e) = watcher.await {
            tracing::warn!(error = %e, "snapshot watcher ended abnormally");
        }
        served
    }
}
