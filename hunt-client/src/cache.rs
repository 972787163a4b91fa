//! Key/value cache that keeps the last fetched entities for offline fallback.
//!
//! Each entry records the minute of the hour it was saved at.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Timelike;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Player,
    Ranking,
    ChallengeList,
    LastChallengedTagId,
    PlayerPhone,
}

impl CacheKey {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheKey::Player => "player",
            CacheKey::Ranking => "ranking",
            CacheKey::ChallengeList => "challengeList",
            CacheKey::LastChallengedTagId => "lastChallengedTagID",
            CacheKey::PlayerPhone => "playerphone",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CachedValue {
    pub value: Value,
    pub saved_minute: u32,
}

pub trait Clock: Send + Sync {
    /// Minute of the current hour, 0..=59.
    fn minute(&self) -> u32;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn minute(&self) -> u32 {
        chrono::Local::now().minute()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub u32);

impl Clock for FixedClock {
    fn minute(&self) -> u32 {
        self.0
    }
}

pub struct Cache {
    path: Option<PathBuf>,
    entries: HashMap<String, CachedValue>,
    clock: Arc<dyn Clock>,
}

impl Cache {
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            path: None,
            entries: HashMap::new(),
            clock,
        }
    }

    /// Opens a file-backed cache. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "discarding unreadable cache");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self {
            path: Some(path),
            entries,
            clock,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn entry(&self, key: CacheKey) -> Option<&CachedValue> {
        self.entries.get(key.as_str())
    }

    /// Typed read; an entry that no longer matches `T` reads as absent.
    pub fn get<T: DeserializeOwned>(&self, key: CacheKey) -> Option<T> {
        self.entry(key)
            .and_then(|cached| serde_json::from_value(cached.value.clone()).ok())
    }

    pub fn put<T: Serialize>(&mut self, key: CacheKey, value: &T) -> Result<(), ClientError> {
        let cached = CachedValue {
            value: serde_json::to_value(value)?,
            saved_minute: self.clock.minute(),
        };
        self.entries.insert(key.as_str().to_string(), cached);
        self.flush()
    }

    pub fn remove(&mut self, key: CacheKey) -> Result<(), ClientError> {
        self.entries.remove(key.as_str());
        self.flush()
    }

    fn flush(&self) -> Result<(), ClientError> {
        if let Some(path) = &self.path {
            std::fs::write(path, serde_json::to_vec_pretty(&self.entries)?)?;
        }
        Ok(())
    }
}
