//! Query-string RPC: parameter parsing, request dispatch and the default
//! scan/registration flow.

use hunt_core::api::{Function, Reply};
use hunt_core::{
    accept_points, rank_players, ranking_limit, skip_penalty, ChallengeCatalog, CoreError, Player,
    QrLink, Reference,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::store::{Repository, StoreError};
use crate::AppState;

/// Raw query parameters, named as the client sends them.
#[derive(Debug, Default, Deserialize)]
pub struct RpcParams {
    #[serde(rename = "function_")]
    pub function: Option<String>,
    #[serde(rename = "tagID")]
    pub tag_id: Option<String>,
    pub phone: Option<String>,
    #[serde(rename = "nickName")]
    pub nickname: Option<String>,
    pub reference: Option<String>,
    #[serde(rename = "challengerPhone")]
    pub challenger_phone: Option<String>,
    pub points: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub phone: String,
    pub nickname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// No `function_` selector: QR scan, registration or challenge fetch.
    Scan {
        tag_id: String,
        registration: Option<Registration>,
        reference: Option<String>,
    },
    AcceptChallenge {
        challenger_phone: String,
        tag_id: String,
        points: i64,
    },
    SkipChallenge {
        challenger_phone: String,
        tag_id: String,
        penalty: i64,
    },
    GetRanking {
        limit: usize,
    },
    GetPlayer {
        phone: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("scoring lock timed out")]
    LockTimeout,
    #[error("{0}")]
    Core(#[from] CoreError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Request {
    pub fn from_params(params: RpcParams) -> Result<Self, RpcError> {
        let tag_id = clean(params.tag_id);
        let phone = clean(params.phone);

        let Some(name) = clean(params.function) else {
            let tag_id = tag_id.ok_or_else(|| RpcError::Validation("tagID is required".into()))?;
            let registration = match (phone, clean(params.nickname)) {
                (Some(phone), Some(nickname)) => Some(Registration { phone, nickname }),
                _ => None,
            };
            return Ok(Request::Scan {
                tag_id,
                registration,
                reference: clean(params.reference),
            });
        };

        let function: Function = name
            .parse()
            .map_err(|_| RpcError::UnknownFunction(name.clone()))?;
        let request = match function {
            Function::AcceptChallenge | Function::SkipChallenge => {
                let (Some(challenger_phone), Some(tag_id)) =
                    (clean(params.challenger_phone), tag_id)
                else {
                    return Err(RpcError::Validation(
                        "challengerPhone and tagID are required".into(),
                    ));
                };
                let points = params.points.as_deref();
                if function == Function::AcceptChallenge {
                    Request::AcceptChallenge {
                        challenger_phone,
                        tag_id,
                        points: accept_points(points),
                    }
                } else {
                    Request::SkipChallenge {
                        challenger_phone,
                        tag_id,
                        penalty: skip_penalty(points),
                    }
                }
            }
            Function::GetRanking => Request::GetRanking {
                limit: ranking_limit(params.limit.as_deref()),
            },
            Function::GetPlayer => Request::GetPlayer {
                phone: phone
                    .ok_or_else(|| RpcError::Validation("parameter 'phone' is required".into()))?,
            },
        };
        Ok(request)
    }

    /// Whether a successful dispatch may have written to the tables.
    pub fn mutates(&self) -> bool {
        match self {
            Request::Scan { registration, .. } => registration.is_some(),
            Request::AcceptChallenge { .. } | Request::SkipChallenge { .. } => true,
            Request::GetRanking { .. } | Request::GetPlayer { .. } => false,
        }
    }
}

pub async fn dispatch(state: &AppState, request: Request) -> Result<Reply, RpcError> {
    let store = state.store.as_ref();
    match request {
        Request::Scan {
            tag_id,
            registration,
            reference,
        } => scan(
            store,
            &state.catalog,
            &tag_id,
            registration,
            reference.as_deref(),
        ),
        Request::AcceptChallenge {
            challenger_phone,
            tag_id,
            points,
        } => {
            state
                .scoring
                .accept(store, &challenger_phone, &tag_id, points)
                .await
        }
        Request::SkipChallenge {
            challenger_phone,
            tag_id,
            penalty,
        } => {
            state
                .scoring
                .skip(store, &challenger_phone, &tag_id, penalty)
                .await
        }
        Request::GetRanking { limit } => ranking(store, limit),
        Request::GetPlayer { phone } => player(store, &phone),
    }
}

/// Tag lookup always comes first; registration data and the reference are
/// only consulted once the link state is known.
pub fn scan(
    store: &dyn Repository,
    catalog: &ChallengeCatalog,
    tag_id: &str,
    registration: Option<Registration>,
    reference: Option<&str>,
) -> Result<Reply, RpcError> {
    let link = store.find_qr_link(tag_id)?;
    debug!(%tag_id, linked = link.is_some(), "scan");

    let Some(link) = link else {
        let Some(Registration { phone, nickname }) = registration else {
            info!(%tag_id, "unlinked tag without registration data");
            return Ok(Reply::NeedsRegistration {
                tag_id: tag_id.to_string(),
            });
        };

        let player = match store.find_player_by_phone(&phone)? {
            Some(existing) => {
                debug!(%phone, "player exists, nickname kept");
                existing
            }
            None => {
                let created = Player::new(phone.clone(), nickname);
                store.upsert_player(&created)?;
                info!(%phone, "player registered");
                created
            }
        };
        store.upsert_qr_link(&QrLink {
            tag_id: tag_id.to_string(),
            phone: phone.clone(),
        })?;
        info!(%tag_id, %phone, "tag linked");
        return Ok(Reply::PlayerRegisteredOrUpdated { player });
    };

    let player = store.find_player_by_phone(&link.phone)?.ok_or_else(|| {
        warn!(%tag_id, phone = %link.phone, "tag linked to a missing player");
        RpcError::NotFound("player not found".into())
    })?;

    match reference {
        Some(raw) => {
            let reference = Reference::parse(raw)?;
            Ok(Reply::ChallengeList {
                challenge_list: catalog.list_for(reference),
                player,
            })
        }
        None => Ok(Reply::PlayerFound { player }),
    }
}

pub fn ranking(store: &dyn Repository, limit: usize) -> Result<Reply, RpcError> {
    let ranking = rank_players(store.list_players()?, limit);
    Ok(Reply::RankingSuccess {
        total: ranking.len(),
        ranking,
    })
}

pub fn player(store: &dyn Repository, phone: &str) -> Result<Reply, RpcError> {
    store
        .find_player_by_phone(phone)?
        .map(|player| Reply::PlayerFound { player })
        .ok_or_else(|| RpcError::NotFound("player not found".into()))
}
