//! Accept/skip mutations.
//!
//! Mutations are serialized per challenged phone, with a bounded wait for the
//! lock. Reads elsewhere are not synchronized against these writes.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use hunt_core::api::Reply;
use hunt_core::{Phone, Player};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::router::RpcError;
use crate::store::Repository;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ScoringEngine {
    locks: Arc<DashMap<Phone, Arc<Mutex<()>>>>,
    timeout: Duration,
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl ScoringEngine {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn lock(&self, phone: &str) -> Result<OwnedMutexGuard<()>, RpcError> {
        let mutex = self.locks.entry(phone.to_string()).or_default().clone();
        tokio::time::timeout(self.timeout, mutex.lock_owned())
            .await
            .map_err(|_| RpcError::LockTimeout)
    }

    pub async fn accept(
        &self,
        store: &dyn Repository,
        challenger_phone: &str,
        tag_id: &str,
        points: i64,
    ) -> Result<Reply, RpcError> {
        let player = self
            .mutate(store, challenger_phone, tag_id, |challenged| {
                hunt_core::accept_challenge(challenged, challenger_phone, points)
            })
            .await?;
        info!(challenged = %player.phone, score = player.score, points, "challenge accepted");
        Ok(Reply::ChallengeAccepted {
            challenged: player.phone.clone(),
            points,
            player,
        })
    }

    pub async fn skip(
        &self,
        store: &dyn Repository,
        challenger_phone: &str,
        tag_id: &str,
        penalty: i64,
    ) -> Result<Reply, RpcError> {
        let mut outcome = None;
        let player = self
            .mutate(store, challenger_phone, tag_id, |challenged| {
                outcome = Some(hunt_core::skip_challenge(
                    challenged,
                    challenger_phone,
                    penalty,
                ));
            })
            .await?;
        info!(
            challenged = %player.phone,
            score = player.score,
            skip_points = player.skip_points,
            ?outcome,
            "challenge skipped"
        );
        Ok(Reply::ChallengeSkipped {
            challenged: player.phone.clone(),
            points: penalty,
            player,
        })
    }

    /// Resolves the challenged player through the tag's link, then applies
    /// `apply` and persists it while holding that player's lock.
    async fn mutate<F>(
        &self,
        store: &dyn Repository,
        challenger_phone: &str,
        tag_id: &str,
        apply: F,
    ) -> Result<Player, RpcError>
    where
        F: FnOnce(&mut Player),
    {
        if store.find_player_by_phone(challenger_phone)?.is_none() {
            return Err(RpcError::NotFound("challenger not found".into()));
        }
        let link = store
            .find_qr_link(tag_id)?
            .ok_or_else(|| RpcError::NotFound("no player linked to this tagID".into()))?;
        let challenged_phone = link.phone.trim().to_string();

        let _guard = self.lock(&challenged_phone).await?;
        debug!(%challenged_phone, "scoring lock acquired");
        let mut challenged = store
            .find_player_by_phone(&challenged_phone)?
            .ok_or_else(|| RpcError::NotFound("challenged player not found".into()))?;
        apply(&mut challenged);
        store.upsert_player(&challenged)?;
        Ok(challenged)
    }
}
