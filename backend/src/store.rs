//! Row-oriented player and QR-link tables.
//!
//! Every lookup is a full scan over the rows, matching the flat-table storage
//! the game was designed around.

use hunt_core::{Player, QrLink};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage format error: {0}")]
    Format(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Storage seam for the router and scoring engine.
pub trait Repository: Send + Sync {
    fn find_player_by_phone(&self, phone: &str) -> Result<Option<Player>, StoreError>;
    /// Replaces the row with the same phone or appends a new one.
    fn upsert_player(&self, player: &Player) -> Result<(), StoreError>;
    fn find_qr_link(&self, tag_id: &str) -> Result<Option<QrLink>, StoreError>;
    fn find_qr_link_by_phone(&self, phone: &str) -> Result<Option<QrLink>, StoreError>;
    /// Repoints the phone's existing link row to the new tag, or appends one.
    fn upsert_qr_link(&self, link: &QrLink) -> Result<(), StoreError>;
    /// Data rows in table order.
    fn list_players(&self) -> Result<Vec<Player>, StoreError>;
    fn snapshot(&self) -> Result<Tables, StoreError>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tables {
    #[serde(default)]
    pub players: Vec<Player>,
    #[serde(default)]
    pub qr_links: Vec<QrLink>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tables(tables: Tables) -> Self {
        Self {
            tables: RwLock::new(tables),
        }
    }
}

impl Repository for MemoryStore {
    fn find_player_by_phone(&self, phone: &str) -> Result<Option<Player>, StoreError> {
        let phone = phone.trim();
        Ok(self
            .tables
            .read()
            .players
            .iter()
            .find(|p| p.phone.trim() == phone)
            .cloned())
    }

    fn upsert_player(&self, player: &Player) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        match tables
            .players
            .iter_mut()
            .find(|p| p.phone.trim() == player.phone.trim())
        {
            Some(row) => *row = player.clone(),
            None => tables.players.push(player.clone()),
        }
        Ok(())
    }

    fn find_qr_link(&self, tag_id: &str) -> Result<Option<QrLink>, StoreError> {
        let tag_id = tag_id.trim();
        Ok(self
            .tables
            .read()
            .qr_links
            .iter()
            .find(|l| l.tag_id.trim() == tag_id)
            .cloned())
    }

    fn find_qr_link_by_phone(&self, phone: &str) -> Result<Option<QrLink>, StoreError> {
        let phone = phone.trim();
        Ok(self
            .tables
            .read()
            .qr_links
            .iter()
            .find(|l| l.phone.trim() == phone)
            .cloned())
    }

    fn upsert_qr_link(&self, link: &QrLink) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let tag_id = link.tag_id.trim();
        let phone = link.phone.trim();
        // A tag binds at most one phone.
        tables
            .qr_links
            .retain(|l| l.tag_id.trim() != tag_id || l.phone.trim() == phone);
        match tables.qr_links.iter_mut().find(|l| l.phone.trim() == phone) {
            Some(row) => row.tag_id = link.tag_id.clone(),
            None => tables.qr_links.push(link.clone()),
        }
        Ok(())
    }

    fn list_players(&self) -> Result<Vec<Player>, StoreError> {
        Ok(self.tables.read().players.clone())
    }

    fn snapshot(&self) -> Result<Tables, StoreError> {
        Ok(self.tables.read().clone())
    }
}
