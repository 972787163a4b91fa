//! Configuration from environment variables.

use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::scoring::DEFAULT_LOCK_TIMEOUT;

#[derive(Debug, Clone)]
pub struct Config {
    /// `PORT`, default 3000, bound on 0.0.0.0.
    pub addr: SocketAddr,
    /// `PERSIST_PATH`: JSON snapshot of the player and QR-link tables.
    pub persist_path: Option<PathBuf>,
    /// `CATALOG_PATH`: JSON challenge catalog keyed by group number.
    pub catalog_path: Option<PathBuf>,
    /// `RELAY_UPSTREAM_URL`: target of `POST /api/ingresso`.
    pub relay_upstream: Option<String>,
    /// `SCORING_LOCK_TIMEOUT_MS`, default 5000.
    pub lock_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let port = get("PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(3000);
        let lock_timeout = get("SCORING_LOCK_TIMEOUT_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_LOCK_TIMEOUT);

        Self {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            persist_path: get("PERSIST_PATH").map(PathBuf::from),
            catalog_path: get("CATALOG_PATH").map(PathBuf::from),
            relay_upstream: get("RELAY_UPSTREAM_URL"),
            lock_timeout,
        }
    }
}
