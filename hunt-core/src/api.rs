//! Wire types shared by the backend router and the client.
//!
//! Every reply is a JSON object carrying either a `status` discriminator or
//! a single `error` message.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{ChallengeList, CoreError, Player, RankingEntry};

/// Named handlers reachable through the `function_` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    AcceptChallenge,
    SkipChallenge,
    GetRanking,
    GetPlayer,
}

impl Function {
    pub fn as_str(self) -> &'static str {
        match self {
            Function::AcceptChallenge => "acceptChallenge",
            Function::SkipChallenge => "skipChallenge",
            Function::GetRanking => "getRanking",
            Function::GetPlayer => "getPlayer",
        }
    }
}

impl FromStr for Function {
    type Err = CoreError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "acceptChallenge" => Ok(Function::AcceptChallenge),
            "skipChallenge" => Ok(Function::SkipChallenge),
            "getRanking" => Ok(Function::GetRanking),
            "getPlayer" => Ok(Function::GetPlayer),
            other => Err(CoreError::UnknownFunction(other.to_string())),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status")]
pub enum Reply {
    #[serde(rename = "needs_registration")]
    NeedsRegistration {
        #[serde(rename = "tagID")]
        tag_id: String,
    },
    #[serde(rename = "player_registered_or_updated")]
    PlayerRegisteredOrUpdated { player: Player },
    #[serde(rename = "challengeList")]
    ChallengeList {
        #[serde(rename = "challengeList")]
        challenge_list: ChallengeList,
        player: Player,
    },
    #[serde(rename = "player_found")]
    PlayerFound { player: Player },
    #[serde(rename = "challenge_accepted")]
    ChallengeAccepted {
        challenged: String,
        points: i64,
        player: Player,
    },
    #[serde(rename = "challenge_skipped")]
    ChallengeSkipped {
        challenged: String,
        points: i64,
        player: Player,
    },
    #[serde(rename = "ranking_success")]
    RankingSuccess {
        ranking: Vec<RankingEntry>,
        total: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ApiResponse {
    Ok(Reply),
    Error { error: String },
}

impl ApiResponse {
    pub fn error(message: impl Into<String>) -> Self {
        ApiResponse::Error {
            error: message.into(),
        }
    }
}

impl From<Reply> for ApiResponse {
    fn from(reply: Reply) -> Self {
        ApiResponse::Ok(reply)
    }
}
