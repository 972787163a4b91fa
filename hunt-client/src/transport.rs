use std::time::Duration;

use async_trait::async_trait;
use hunt_core::api::ApiResponse;

use crate::ClientError;

pub type QueryPairs = Vec<(&'static str, String)>;

/// One query-string request against the game endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, query: QueryPairs) -> Result<ApiResponse, ClientError>;
}

pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, query: QueryPairs) -> Result<ApiResponse, ClientError> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&query)
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        response
            .json::<ApiResponse>()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))
    }
}
