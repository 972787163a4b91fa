//! Client flow for a scanned QR tag: fetch a challenge, accept or skip it by
//! swipe, and show the player's home with the ranking.

pub mod cache;
pub mod flow;
pub mod transport;

pub use cache::{Cache, CacheKey, CachedValue, Clock, FixedClock, SystemClock};
pub use flow::{FlowController, FlowState, HomeView, Scan, ShownChallenge, UndoHandle};
pub use transport::{HttpTransport, QueryPairs, Transport};

use thiserror::Error;

/// Digits required in a phone number, area code included.
pub const PHONE_DIGITS: usize = 11;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{0}")]
    Validation(String),
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache format error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no tag has been scanned")]
    NoScan,
}

/// Strips everything but digits and checks the length.
pub fn normalize_phone(raw: &str) -> Result<String, ClientError> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() != PHONE_DIGITS {
        return Err(ClientError::Validation(format!(
            "phone must have exactly {PHONE_DIGITS} digits including area code"
        )));
    }
    Ok(digits)
}

pub fn validate_registration(nickname: &str, phone: &str) -> Result<(String, String), ClientError> {
    let nickname = nickname.trim();
    let phone = normalize_phone(phone);
    match (nickname.is_empty(), phone) {
        (false, Ok(phone)) => Ok((nickname.to_string(), phone)),
        (true, Ok(_)) => Err(ClientError::Validation("nickname is required".into())),
        (false, Err(err)) => Err(err),
        (true, Err(err)) => Err(ClientError::Validation(format!(
            "nickname is required; {err}"
        ))),
    }
}
