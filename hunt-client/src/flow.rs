//! Scan-to-home state machine.
//!
//! ```text
//! Loading -> NeedsRegistration | RecoveryNeeded | ChallengeShown | PlayerHome | Error
//! ChallengeShown -> SwipePending -> (undo) ChallengeShown
//!                                -> (window elapsed) PlayerHome | Error
//! ```
//!
//! Every transition is driven by one awaited request/response pair. The undo
//! window is the only wait that can be cut short.

use std::sync::Arc;
use std::time::Duration;

use hunt_core::api::{ApiResponse, Function, Reply};
use hunt_core::{
    classify_swipe, pick_challenge, ChallengeEntry, ChallengeList, Player, RankingEntry,
    Reference, SwipeIntent,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheKey, Clock};
use crate::transport::Transport;
use crate::{normalize_phone, validate_registration, ClientError};

pub const UNDO_WINDOW: Duration = Duration::from_secs(6);
pub const HOME_RANKING_LIMIT: usize = 400;

/// What the tag URL carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub tag_id: String,
    pub base_reference: Option<String>,
}

impl Scan {
    pub fn new(tag_id: impl Into<String>, base_reference: Option<&str>) -> Self {
        Self {
            tag_id: tag_id.into().trim().to_string(),
            base_reference: base_reference.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShownChallenge {
    pub tag_id: String,
    pub reference: Reference,
    pub entry: ChallengeEntry,
    /// Challenge text with line breaks rendered.
    pub text: String,
    pub description: String,
}

impl ShownChallenge {
    fn new(tag_id: &str, reference: Reference, entry: ChallengeEntry) -> Self {
        Self {
            tag_id: tag_id.to_string(),
            reference,
            text: entry.challenge_text(),
            description: entry.description_text(),
            entry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeView {
    pub player: Option<Player>,
    pub ranking: Vec<RankingEntry>,
    /// Set when either part came from the cache instead of the server.
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    Loading,
    NeedsRegistration { tag_id: String },
    /// The tag is linked but this device has no player; ask for the phone.
    RecoveryNeeded { tag_id: String },
    ChallengeShown(ShownChallenge),
    SwipePending {
        shown: ShownChallenge,
        intent: SwipeIntent,
    },
    PlayerHome(HomeView),
    Error { message: String, retryable: bool },
}

/// Cancels a pending swipe before its window elapses.
#[derive(Debug, Clone)]
pub struct UndoHandle(CancellationToken);

impl UndoHandle {
    pub fn undo(&self) {
        self.0.cancel();
    }
}

struct Session {
    scan: Scan,
    reference: Reference,
}

/// The request a retryable failure interrupted.
#[derive(Debug, Clone)]
enum Step {
    FetchChallenge,
    Register { nickname: String, phone: String },
    Recover { phone: String },
    Answer { intent: SwipeIntent, shown: ShownChallenge },
}

pub struct FlowController {
    transport: Arc<dyn Transport>,
    cache: Cache,
    clock: Arc<dyn Clock>,
    rng: ChaCha8Rng,
    undo_window: Duration,
    state: FlowState,
    session: Option<Session>,
    pending: Option<CancellationToken>,
    step: Option<Step>,
}

impl FlowController {
    pub fn new(transport: Arc<dyn Transport>, cache: Cache) -> Self {
        Self {
            transport,
            clock: cache.clock(),
            cache,
            rng: ChaCha8Rng::from_entropy(),
            undo_window: UNDO_WINDOW,
            state: FlowState::Loading,
            session: None,
            pending: None,
            step: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    pub fn with_undo_window(mut self, window: Duration) -> Self {
        self.undo_window = window;
        self
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Time-rotated group of the current scan.
    pub fn reference(&self) -> Option<Reference> {
        self.session.as_ref().map(|s| s.reference)
    }

    pub async fn load(&mut self, scan: Scan) -> &FlowState {
        self.cancel_pending();
        let reference = Reference::rotated(scan.base_reference.as_deref(), self.clock.minute());
        debug!(tag_id = %scan.tag_id, %reference, "scan loaded");
        self.state = FlowState::Loading;

        let duplicate = !scan.tag_id.is_empty()
            && self.cache.get::<String>(CacheKey::LastChallengedTagId).as_deref()
                == Some(scan.tag_id.as_str());
        self.session = Some(Session { scan, reference });

        if duplicate {
            info!("tag already challenged, showing home");
            self.enter_home().await;
        } else {
            self.fetch_challenge().await;
        }
        &self.state
    }

    /// Re-sends the request that failed in transit. An answered challenge is
    /// resubmitted as-is rather than replaced by a new pick.
    pub async fn retry(&mut self) -> &FlowState {
        let retryable = matches!(
            self.state,
            FlowState::Error {
                retryable: true,
                ..
            }
        );
        if !retryable {
            return &self.state;
        }
        self.state = FlowState::Loading;
        match self.step.clone() {
            Some(Step::FetchChallenge) | None => self.fetch_challenge().await,
            Some(Step::Register { nickname, phone }) => {
                self.submit_registration(nickname, phone).await
            }
            Some(Step::Recover { phone }) => self.fetch_local_player(phone).await,
            Some(Step::Answer { intent, shown }) => self.answer(intent, shown).await,
        }
        &self.state
    }

    pub async fn register(
        &mut self,
        nickname: &str,
        phone: &str,
    ) -> Result<&FlowState, ClientError> {
        let (nickname, phone) = validate_registration(nickname, phone)?;
        if self.session.is_none() {
            return Err(ClientError::NoScan);
        }
        self.submit_registration(nickname, phone).await;
        Ok(&self.state)
    }

    async fn submit_registration(&mut self, nickname: String, phone: String) {
        let Some(session) = &self.session else {
            self.fail(ClientError::NoScan.to_string(), false);
            return;
        };
        self.step = Some(Step::Register {
            nickname: nickname.clone(),
            phone: phone.clone(),
        });
        let query = vec![
            ("tagID", session.scan.tag_id.clone()),
            ("reference", session.reference.key()),
            ("nickName", nickname),
            ("phone", phone),
        ];
        self.state = FlowState::Loading;

        match self.transport.call(query).await {
            Ok(ApiResponse::Ok(Reply::PlayerRegisteredOrUpdated { player })) => {
                info!(phone = %player.phone, "registered");
                self.remember_player(&player);
                self.enter_home().await;
            }
            Ok(ApiResponse::Ok(other)) => self.unexpected(&other),
            Ok(ApiResponse::Error { error }) => self.fail(error, false),
            Err(err) => self.fail(err.to_string(), true),
        }
    }

    /// Restores the local player from its phone number.
    pub async fn recover(&mut self, phone: &str) -> Result<&FlowState, ClientError> {
        let phone = normalize_phone(phone)?;
        self.fetch_local_player(phone).await;
        Ok(&self.state)
    }

    async fn fetch_local_player(&mut self, phone: String) {
        self.step = Some(Step::Recover {
            phone: phone.clone(),
        });
        self.state = FlowState::Loading;
        let query = vec![
            ("function_", Function::GetPlayer.as_str().to_string()),
            ("phone", phone),
        ];
        match self.transport.call(query).await {
            Ok(ApiResponse::Ok(Reply::PlayerFound { player })) => {
                self.remember_player(&player);
                self.enter_home().await;
            }
            Ok(ApiResponse::Ok(other)) => self.unexpected(&other),
            Ok(ApiResponse::Error { error }) => self.fail(error, false),
            Err(err) => self.fail(err.to_string(), true),
        }
    }

    /// Horizontal drag released at `delta_x`. Past the threshold the answer is
    /// held for the undo window; call [`settle_swipe`](Self::settle_swipe) to
    /// wait it out.
    pub fn swipe(&mut self, delta_x: f64) -> Option<UndoHandle> {
        let FlowState::ChallengeShown(shown) = &self.state else {
            return None;
        };
        let intent = classify_swipe(delta_x)?;
        let token = CancellationToken::new();
        self.state = FlowState::SwipePending {
            shown: shown.clone(),
            intent,
        };
        self.pending = Some(token.clone());
        debug!(?intent, "swipe pending");
        Some(UndoHandle(token))
    }

    pub async fn settle_swipe(&mut self) -> &FlowState {
        let FlowState::SwipePending { shown, intent } = self.state.clone() else {
            return &self.state;
        };
        let token = self.pending.take().unwrap_or_default();

        tokio::select! {
            _ = token.cancelled() => {
                debug!("swipe undone");
                self.state = FlowState::ChallengeShown(shown);
                return &self.state;
            }
            _ = tokio::time::sleep(self.undo_window) => {}
        }

        self.answer(intent, shown).await;
        &self.state
    }

    pub async fn refresh_home(&mut self) -> &FlowState {
        self.enter_home().await;
        &self.state
    }

    async fn fetch_challenge(&mut self) {
        let Some(session) = &self.session else {
            self.fail(ClientError::NoScan.to_string(), false);
            return;
        };
        self.step = Some(Step::FetchChallenge);
        let query = vec![
            ("reference", session.reference.key()),
            ("tagID", session.scan.tag_id.clone()),
        ];
        match self.transport.call(query).await {
            Ok(ApiResponse::Ok(reply)) => self.apply_scan_reply(reply).await,
            Ok(ApiResponse::Error { error }) => self.fail(error, false),
            Err(err) => self.fail(err.to_string(), true),
        }
    }

    async fn apply_scan_reply(&mut self, reply: Reply) {
        match reply {
            Reply::NeedsRegistration { tag_id } => {
                self.state = FlowState::NeedsRegistration { tag_id };
            }
            Reply::ChallengeList {
                mut challenge_list, ..
            } => {
                let Some(session) = &self.session else {
                    return;
                };
                let tag_id = session.scan.tag_id.clone();
                let reference = session.reference;
                let base = Reference::rotated(session.scan.base_reference.as_deref(), 0);
                if self.cache.get::<Player>(CacheKey::Player).is_none() {
                    self.state = FlowState::RecoveryNeeded { tag_id };
                    return;
                }
                let rotated_empty = challenge_list
                    .get(&reference.key())
                    .map_or(true, Vec::is_empty);
                if rotated_empty && base != reference && !challenge_list.contains_key(&base.key()) {
                    debug!(%reference, %base, "rotated group empty, fetching base group");
                    match self.fetch_group(&tag_id, base).await {
                        Ok(group) => challenge_list.extend(group),
                        Err(err) => {
                            let retryable = matches!(err, ClientError::Transport(_));
                            self.fail(err.to_string(), retryable);
                            return;
                        }
                    }
                }
                self.remember(CacheKey::ChallengeList, &challenge_list);
                self.show_challenge(&challenge_list);
            }
            Reply::PlayerRegisteredOrUpdated { player } => {
                self.remember_player(&player);
                self.enter_home().await;
            }
            Reply::PlayerFound { .. } => self.enter_home().await,
            other => self.unexpected(&other),
        }
    }

    /// Asks for a single group of the scanned tag.
    async fn fetch_group(
        &self,
        tag_id: &str,
        reference: Reference,
    ) -> Result<ChallengeList, ClientError> {
        let query = vec![
            ("reference", reference.key()),
            ("tagID", tag_id.to_string()),
        ];
        match self.transport.call(query).await? {
            ApiResponse::Ok(Reply::ChallengeList { challenge_list, .. }) => Ok(challenge_list),
            ApiResponse::Ok(_) => Ok(ChallengeList::new()),
            ApiResponse::Error { error } => Err(ClientError::Validation(error)),
        }
    }

    fn show_challenge(&mut self, list: &ChallengeList) {
        let Some(session) = &self.session else {
            return;
        };
        let reference = session.reference;
        let base = Reference::rotated(session.scan.base_reference.as_deref(), 0);
        let tag_id = session.scan.tag_id.clone();
        match pick_challenge(list, reference, base, &mut self.rng) {
            Some(entry) => {
                self.state =
                    FlowState::ChallengeShown(ShownChallenge::new(&tag_id, reference, entry.clone()));
            }
            None => self.fail(format!("no challenge available for group {reference}"), false),
        }
    }

    async fn answer(&mut self, intent: SwipeIntent, shown: ShownChallenge) {
        let Some(challenger_phone) = self.local_phone() else {
            self.fail("register before answering challenges".into(), false);
            return;
        };
        self.step = Some(Step::Answer {
            intent,
            shown: shown.clone(),
        });
        let query = vec![
            ("function_", intent.function().as_str().to_string()),
            ("challengerPhone", challenger_phone),
            ("tagID", shown.tag_id.clone()),
            ("points", shown.entry.points.to_string()),
        ];
        self.state = FlowState::Loading;

        match self.transport.call(query).await {
            Ok(ApiResponse::Ok(
                Reply::ChallengeAccepted { .. } | Reply::ChallengeSkipped { .. },
            )) => {
                info!(tag_id = %shown.tag_id, ?intent, "challenge answered");
                self.remember(CacheKey::LastChallengedTagId, &shown.tag_id);
                self.enter_home().await;
            }
            Ok(ApiResponse::Ok(other)) => self.unexpected(&other),
            Ok(ApiResponse::Error { error }) => self.fail(error, false),
            Err(err) => self.fail(err.to_string(), true),
        }
    }

    /// Fetches player and ranking together; each falls back to its cached
    /// copy when the server cannot answer.
    async fn enter_home(&mut self) {
        let transport = self.transport.clone();
        let phone = self.local_phone();

        let player_call = async {
            match &phone {
                Some(phone) => Some(
                    transport
                        .call(vec![
                            ("function_", Function::GetPlayer.as_str().to_string()),
                            ("phone", phone.clone()),
                        ])
                        .await,
                ),
                None => None,
            }
        };
        let ranking_call = transport.call(vec![
            ("function_", Function::GetRanking.as_str().to_string()),
            ("limit", HOME_RANKING_LIMIT.to_string()),
        ]);
        let (player_res, ranking_res) = futures::join!(player_call, ranking_call);

        let mut stale = false;
        let player = match player_res {
            Some(Ok(ApiResponse::Ok(Reply::PlayerFound { player }))) => {
                self.remember(CacheKey::Player, &player);
                Some(player)
            }
            Some(other) => {
                warn!(response = ?other, "player fetch failed, using cache");
                stale = true;
                self.cache.get(CacheKey::Player)
            }
            None => self.cache.get(CacheKey::Player),
        };
        let ranking = match ranking_res {
            Ok(ApiResponse::Ok(Reply::RankingSuccess { ranking, .. })) => {
                self.remember(CacheKey::Ranking, &ranking);
                ranking
            }
            other => {
                warn!(response = ?other, "ranking fetch failed, using cache");
                stale = true;
                self.cache.get(CacheKey::Ranking).unwrap_or_default()
            }
        };

        self.state = FlowState::PlayerHome(HomeView {
            player,
            ranking,
            stale,
        });
    }

    fn local_phone(&self) -> Option<String> {
        self.cache
            .get::<String>(CacheKey::PlayerPhone)
            .or_else(|| self.cache.get::<Player>(CacheKey::Player).map(|p| p.phone))
            .filter(|phone| !phone.is_empty())
    }

    fn remember_player(&mut self, player: &Player) {
        self.remember(CacheKey::Player, player);
        self.remember(CacheKey::PlayerPhone, &player.phone);
    }

    fn remember<T: Serialize>(&mut self, key: CacheKey, value: &T) {
        if let Err(err) = self.cache.put(key, value) {
            warn!(key = key.as_str(), error = %err, "cache write failed");
        }
    }

    fn cancel_pending(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }

    fn unexpected(&mut self, reply: &Reply) {
        self.fail(format!("unexpected response: {reply:?}"), false);
    }

    fn fail(&mut self, message: String, retryable: bool) {
        warn!(%message, retryable, "flow error");
        self.state = FlowState::Error { message, retryable };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FixedClock;
    use crate::transport::QueryPairs;
    use async_trait::async_trait;
    use hunt_core::{rank_players, ChallengeCatalog};
    use std::collections::HashMap;
    use std::sync::Mutex;

    type Handler = Box<dyn Fn(&HashMap<String, String>) -> Result<ApiResponse, ClientError> + Send + Sync>;

    /// Records every call and answers through `handler`.
    struct MockTransport {
        calls: Mutex<Vec<HashMap<String, String>>>,
        handler: Handler,
    }

    impl MockTransport {
        fn new(
            handler: impl Fn(&HashMap<String, String>) -> Result<ApiResponse, ClientError>
                + Send
                + Sync
                + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                handler: Box::new(handler),
            })
        }

        fn calls(&self) -> Vec<HashMap<String, String>> {
            self.calls.lock().unwrap().clone()
        }

        fn functions(&self) -> Vec<String> {
            self.calls()
                .iter()
                .map(|c| c.get("function_").cloned().unwrap_or_else(|| "scan".into()))
                .collect()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn call(&self, query: QueryPairs) -> Result<ApiResponse, ClientError> {
            let params: HashMap<String, String> = query
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect();
            self.calls.lock().unwrap().push(params.clone());
            (self.handler)(&params)
        }
    }

    fn me() -> Player {
        Player::new("11999990000", "ana")
    }

    fn target() -> Player {
        Player::new("11888880000", "bia")
    }

    fn entry(challenge: &str, points: i64) -> ChallengeEntry {
        ChallengeEntry {
            challenge: challenge.into(),
            description: "line one<br>line two".into(),
            shareable: true,
            points,
        }
    }

    /// A well-behaved backend: tag-1 is linked to `target()`, the requested
    /// group holds one challenge, scoring always succeeds.
    fn server(params: &HashMap<String, String>) -> Result<ApiResponse, ClientError> {
        let reply = match params.get("function_").map(String::as_str) {
            None if params.get("nickName").is_some() => Reply::PlayerRegisteredOrUpdated {
                player: Player::new(params["phone"].clone(), params["nickName"].clone()),
            },
            None if params["tagID"] == "tag-1" => {
                let mut list = ChallengeList::new();
                list.insert(params["reference"].clone(), vec![entry("hop", 7)]);
                Reply::ChallengeList {
                    challenge_list: list,
                    player: target(),
                }
            }
            None => Reply::NeedsRegistration {
                tag_id: params["tagID"].clone(),
            },
            Some("getPlayer") => Reply::PlayerFound {
                player: Player {
                    phone: params["phone"].clone(),
                    ..me()
                },
            },
            Some("getRanking") => Reply::RankingSuccess {
                ranking: rank_players(vec![me(), target()], 400),
                total: 2,
            },
            Some("acceptChallenge") => Reply::ChallengeAccepted {
                challenged: target().phone,
                points: params["points"].parse().unwrap(),
                player: target(),
            },
            Some("skipChallenge") => Reply::ChallengeSkipped {
                challenged: target().phone,
                points: 5,
                player: target(),
            },
            Some(other) => return Ok(ApiResponse::error(format!("unknown function: {other}"))),
        };
        Ok(reply.into())
    }

    fn controller(transport: Arc<MockTransport>, minute: u32) -> FlowController {
        let cache = Cache::in_memory(Arc::new(FixedClock(minute)));
        FlowController::new(transport, cache)
            .with_seed(3)
            .with_undo_window(Duration::from_millis(10))
    }

    fn with_local_player(mut flow: FlowController) -> FlowController {
        flow.remember_player(&me());
        flow
    }

    #[tokio::test]
    async fn sends_time_rotated_reference() {
        let transport = MockTransport::new(server);
        let mut flow = controller(transport.clone(), 47);
        flow.load(Scan::new("tag-9", Some("3"))).await;

        assert_eq!(flow.reference().map(Reference::get), Some(5));
        assert_eq!(transport.calls()[0]["reference"], "5");
        assert_eq!(
            flow.state(),
            &FlowState::NeedsRegistration {
                tag_id: "tag-9".into()
            }
        );
    }

    #[tokio::test]
    async fn linked_tag_without_local_player_needs_recovery() {
        let transport = MockTransport::new(server);
        let mut flow = controller(transport.clone(), 0);
        flow.load(Scan::new("tag-1", Some("2"))).await;
        assert_eq!(
            flow.state(),
            &FlowState::RecoveryNeeded {
                tag_id: "tag-1".into()
            }
        );

        flow.recover("(11) 99999-0000").await.unwrap();
        match flow.state() {
            FlowState::PlayerHome(home) => {
                assert_eq!(home.player.as_ref().unwrap().phone, "11999990000");
                assert!(!home.stale);
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(
            flow.cache().get::<String>(CacheKey::PlayerPhone).as_deref(),
            Some("11999990000")
        );
    }

    #[tokio::test]
    async fn linked_tag_shows_challenge_from_rotated_group() {
        let transport = MockTransport::new(server);
        let mut flow = with_local_player(controller(transport.clone(), 20));
        flow.load(Scan::new("tag-1", Some("1"))).await;

        match flow.state() {
            FlowState::ChallengeShown(shown) => {
                assert_eq!(shown.reference.get(), 2);
                assert_eq!(shown.entry.challenge, "hop");
                assert_eq!(shown.description, "line one\nline two");
            }
            other => panic!("unexpected state {other:?}"),
        }
        let cached: ChallengeList = flow.cache().get(CacheKey::ChallengeList).unwrap();
        assert!(cached.contains_key("2"));
    }

    #[tokio::test]
    async fn swipe_right_accepts_after_undo_window() {
        let transport = MockTransport::new(server);
        let mut flow = with_local_player(controller(transport.clone(), 0));
        flow.load(Scan::new("tag-1", None)).await;

        assert!(flow.swipe(40.0).is_none());
        assert!(matches!(flow.state(), FlowState::ChallengeShown(_)));

        let _undo = flow.swipe(120.0).unwrap();
        assert!(matches!(
            flow.state(),
            FlowState::SwipePending {
                intent: SwipeIntent::Accept,
                ..
            }
        ));
        flow.settle_swipe().await;

        let accept = transport
            .calls()
            .into_iter()
            .find(|c| c.get("function_").map(String::as_str) == Some("acceptChallenge"))
            .unwrap();
        assert_eq!(accept["challengerPhone"], "11999990000");
        assert_eq!(accept["tagID"], "tag-1");
        assert_eq!(accept["points"], "7");
        assert!(matches!(flow.state(), FlowState::PlayerHome(_)));
        assert_eq!(
            flow.cache()
                .get::<String>(CacheKey::LastChallengedTagId)
                .as_deref(),
            Some("tag-1")
        );
    }

    #[tokio::test]
    async fn undo_returns_to_challenge_without_scoring() {
        let transport = MockTransport::new(server);
        let mut flow = with_local_player(controller(transport.clone(), 0))
            .with_undo_window(Duration::from_secs(60));
        flow.load(Scan::new("tag-1", None)).await;

        let undo = flow.swipe(-200.0).unwrap();
        undo.undo();
        flow.settle_swipe().await;

        assert!(matches!(flow.state(), FlowState::ChallengeShown(_)));
        assert!(!transport.functions().contains(&"skipChallenge".to_string()));
    }

    #[tokio::test]
    async fn already_challenged_tag_goes_straight_home() {
        let transport = MockTransport::new(server);
        let mut flow = with_local_player(controller(transport.clone(), 0));
        flow.remember(CacheKey::LastChallengedTagId, &"tag-1".to_string());

        flow.load(Scan::new("tag-1", Some("1"))).await;

        assert!(matches!(flow.state(), FlowState::PlayerHome(_)));
        let mut functions = transport.functions();
        functions.sort();
        assert_eq!(functions, vec!["getPlayer", "getRanking"]);
    }

    #[tokio::test]
    async fn transport_failure_is_retryable() {
        let attempts = Arc::new(Mutex::new(0));
        let counter = attempts.clone();
        let transport = MockTransport::new(move |params| {
            let mut n = counter.lock().unwrap();
            *n += 1;
            if *n == 1 {
                Err(ClientError::Transport("offline".into()))
            } else {
                server(params)
            }
        });
        let mut flow = controller(transport, 0);
        flow.load(Scan::new("tag-5", None)).await;
        assert!(matches!(
            flow.state(),
            FlowState::Error {
                retryable: true,
                ..
            }
        ));

        flow.retry().await;
        assert!(matches!(flow.state(), FlowState::NeedsRegistration { .. }));
    }

    #[tokio::test]
    async fn server_error_is_not_retryable() {
        let transport = MockTransport::new(|_| Ok(ApiResponse::error("player not found")));
        let mut flow = controller(transport.clone(), 0);
        flow.load(Scan::new("tag-5", None)).await;
        assert_eq!(
            flow.state(),
            &FlowState::Error {
                message: "player not found".into(),
                retryable: false
            }
        );
        flow.retry().await;
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn registration_validates_then_goes_home() {
        let transport = MockTransport::new(server);
        let mut flow = controller(transport.clone(), 0);
        flow.load(Scan::new("tag-new", Some("4"))).await;

        let err = flow.register("ana", "123").await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert_eq!(transport.calls().len(), 1);

        flow.register("ana", "11999990000").await.unwrap();
        let registration = &transport.calls()[1];
        assert_eq!(registration["tagID"], "tag-new");
        assert_eq!(registration["nickName"], "ana");
        assert!(matches!(flow.state(), FlowState::PlayerHome(_)));
        let cached: Player = flow.cache().get(CacheKey::Player).unwrap();
        assert_eq!(cached.nickname, "ana");
    }

    #[tokio::test]
    async fn home_falls_back_to_cache_when_offline() {
        let transport = MockTransport::new(|_| Err(ClientError::Transport("offline".into())));
        let mut flow = with_local_player(controller(transport, 0));
        flow.remember(CacheKey::Ranking, &rank_players(vec![me()], 10));

        flow.refresh_home().await;
        match flow.state() {
            FlowState::PlayerHome(home) => {
                assert!(home.stale);
                assert_eq!(home.player.as_ref().unwrap().nickname, "ana");
                assert_eq!(home.ranking.len(), 1);
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    /// Answers scans the way the backend does: one catalog group per request,
    /// keyed by the requested reference even when it is empty.
    fn catalog_server(
        catalog: ChallengeCatalog,
    ) -> impl Fn(&HashMap<String, String>) -> Result<ApiResponse, ClientError> + Send + Sync {
        move |params| {
            if params.get("function_").is_some() {
                return server(params);
            }
            let reference = Reference::parse(&params["reference"]).unwrap();
            Ok(Reply::ChallengeList {
                challenge_list: catalog.list_for(reference),
                player: target(),
            }
            .into())
        }
    }

    fn references_sent(transport: &MockTransport) -> Vec<String> {
        transport
            .calls()
            .iter()
            .filter(|c| !c.contains_key("function_"))
            .map(|c| c["reference"].clone())
            .collect()
    }

    #[tokio::test]
    async fn empty_rotated_group_falls_back_to_base_group() {
        let catalog = ChallengeCatalog::default()
            .with_group(Reference::new(3).unwrap(), vec![entry("base hop", 4)])
            .with_group(Reference::new(5).unwrap(), vec![]);
        let transport = MockTransport::new(catalog_server(catalog));
        let mut flow = with_local_player(controller(transport.clone(), 47));
        flow.load(Scan::new("tag-1", Some("3"))).await;

        match flow.state() {
            FlowState::ChallengeShown(shown) => {
                assert_eq!(shown.entry.challenge, "base hop");
                assert_eq!(shown.entry.points, 4);
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(references_sent(&transport), vec!["5", "3"]);
    }

    #[tokio::test]
    async fn empty_group_without_fallback_is_an_error() {
        let catalog = ChallengeCatalog::default().with_group(Reference::new(5).unwrap(), vec![]);
        let transport = MockTransport::new(catalog_server(catalog));
        let mut flow = with_local_player(controller(transport.clone(), 0));
        flow.load(Scan::new("tag-1", Some("5"))).await;

        assert_eq!(
            flow.state(),
            &FlowState::Error {
                message: "no challenge available for group 5".into(),
                retryable: false
            }
        );
        assert_eq!(references_sent(&transport), vec!["5"]);

        let mut flow = with_local_player(controller(
            MockTransport::new(catalog_server(ChallengeCatalog::default())),
            47,
        ));
        flow.load(Scan::new("tag-1", Some("3"))).await;
        assert!(matches!(
            flow.state(),
            FlowState::Error {
                retryable: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn retry_after_failed_answer_resends_same_answer() {
        let failed_once = Arc::new(Mutex::new(false));
        let flag = failed_once.clone();
        let transport = MockTransport::new(move |params| {
            let mut failed = flag.lock().unwrap();
            if params.get("function_").map(String::as_str) == Some("skipChallenge") && !*failed {
                *failed = true;
                return Err(ClientError::Transport("offline".into()));
            }
            server(params)
        });
        let mut flow = with_local_player(controller(transport.clone(), 0));
        flow.load(Scan::new("tag-1", None)).await;
        flow.swipe(-150.0).unwrap();
        flow.settle_swipe().await;
        assert!(matches!(
            flow.state(),
            FlowState::Error {
                retryable: true,
                ..
            }
        ));

        flow.retry().await;
        assert!(matches!(flow.state(), FlowState::PlayerHome(_)));
        let functions = transport.functions();
        assert_eq!(functions.iter().filter(|f| *f == "scan").count(), 1);
        assert_eq!(
            functions.iter().filter(|f| *f == "skipChallenge").count(),
            2
        );
        assert_eq!(
            flow.cache()
                .get::<String>(CacheKey::LastChallengedTagId)
                .as_deref(),
            Some("tag-1")
        );
    }

    #[tokio::test]
    async fn challenge_fetch_failure_waits_for_retry_even_with_cached_list() {
        let transport = MockTransport::new(|_| Err(ClientError::Transport("offline".into())));
        let mut flow = with_local_player(controller(transport, 0));
        let mut cached = ChallengeList::new();
        cached.insert("1".into(), vec![entry("stale hop", 2)]);
        flow.remember(CacheKey::ChallengeList, &cached);

        flow.load(Scan::new("tag-1", None)).await;
        assert!(matches!(
            flow.state(),
            FlowState::Error {
                retryable: true,
                ..
            }
        ));
    }
}
