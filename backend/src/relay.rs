//! Form relay: forwards a JSON body verbatim to a fixed upstream endpoint.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::AppState;

pub const RELAY_FAILURE_MESSAGE: &str = "Falha no servidor intermediário.";

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay upstream is not configured")]
    NotConfigured,
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

#[derive(Clone, Debug)]
pub struct Relay {
    http: reqwest::Client,
    upstream: Option<String>,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Relay {
    pub fn new(upstream: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, upstream }
    }

    pub async fn forward(&self, body: &Value) -> Result<Value, RelayError> {
        let upstream = self.upstream.as_deref().ok_or(RelayError::NotConfigured)?;
        let response = self.http.post(upstream).json(body).send().await?;
        Ok(response.json::<Value>().await?)
    }
}

pub async fn ingresso(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let request_id = Uuid::new_v4();
    match state.relay.forward(&body).await {
        Ok(result) => {
            info!(%request_id, "relayed submission");
            (StatusCode::OK, Json(result)).into_response()
        }
        Err(err) => {
            error!(%request_id, error = %err, "relay to upstream failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "erro", "mensagem": RELAY_FAILURE_MESSAGE })),
            )
                .into_response()
        }
    }
}
