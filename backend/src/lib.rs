use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::{Json, Router};
use hunt_core::api::ApiResponse;
use hunt_core::ChallengeCatalog;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod config;
pub mod relay;
pub mod router;
pub mod scoring;
pub mod store;
pub mod telemetry;

use crate::config::Config;
use crate::relay::Relay;
use crate::router::{Request, RpcParams};
use crate::scoring::ScoringEngine;
use crate::store::{MemoryStore, Repository, StoreError, Tables};

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn Repository>,
    catalog: Arc<ChallengeCatalog>,
    scoring: ScoringEngine,
    relay: Relay,
    persist_path: Option<PathBuf>,
    persist_lock: Arc<Mutex<()>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }
}

impl AppState {
    pub fn new(store: Arc<dyn Repository>) -> Self {
        Self {
            store,
            catalog: Arc::new(ChallengeCatalog::default()),
            scoring: ScoringEngine::default(),
            relay: Relay::default(),
            persist_path: None,
            persist_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Loads the tables from `path` when it holds a snapshot and writes every
    /// mutation back to it. A missing file starts empty; an unreadable one is
    /// an error so the only copy is never overwritten.
    pub async fn with_persistence(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let tables = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let tables: Tables = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing snapshot {}", path.display()))?;
                info!(
                    path = %path.display(),
                    players = tables.players.len(),
                    links = tables.qr_links.len(),
                    "loaded tables"
                );
                tables
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Tables::default(),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("reading snapshot {}", path.display())))
            }
        };
        let mut state = Self::new(Arc::new(MemoryStore::from_tables(tables)));
        state.persist_path = Some(path);
        Ok(state)
    }

    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut state = match &config.persist_path {
            Some(path) => Self::with_persistence(path.clone()).await?,
            None => Self::default(),
        };
        if let Some(path) = &config.catalog_path {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading catalog {}", path.display()))?;
            let catalog: ChallengeCatalog = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing catalog {}", path.display()))?;
            info!(path = %path.display(), challenges = catalog.len(), "catalog loaded");
            state = state.with_catalog(catalog);
        }
        Ok(state
            .with_relay(Relay::new(config.relay_upstream.clone()))
            .with_lock_timeout(config.lock_timeout))
    }

    pub fn with_catalog(mut self, catalog: ChallengeCatalog) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }

    pub fn with_relay(mut self, relay: Relay) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.scoring = ScoringEngine::new(timeout);
        self
    }

    pub fn store(&self) -> &dyn Repository {
        self.store.as_ref()
    }

    /// Snapshot and write happen under one lock so a stale snapshot never
    /// lands after a newer one. The file is replaced by rename.
    async fn persist(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        if let Err(err) = self.write_snapshot(path).await {
            warn!(path = %path.display(), error = %err, "persist error");
        }
    }

    async fn write_snapshot(&self, path: &Path) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(&self.store.snapshot()?)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(rpc))
        .route("/healthz", get(health))
        .route("/api/ingresso", post(relay::ingresso))
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE])
                .allow_origin(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Domain failures are reported in the body; the status code stays 200.
async fn rpc(
    State(state): State<AppState>,
    params: Result<Query<RpcParams>, QueryRejection>,
) -> Json<ApiResponse> {
    let params = match params {
        Ok(Query(params)) => params,
        Err(rejection) => return Json(ApiResponse::error(rejection.body_text())),
    };
    let request = match Request::from_params(params) {
        Ok(request) => request,
        Err(err) => return Json(ApiResponse::error(err.to_string())),
    };

    let mutates = request.mutates();
    match router::dispatch(&state, request).await {
        Ok(reply) => {
            if mutates {
                state.persist().await;
            }
            Json(reply.into())
        }
        Err(err) => {
            warn!(error = %err, "request failed");
            Json(ApiResponse::error(err.to_string()))
        }
    }
}
