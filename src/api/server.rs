//! Mining API server: template cache, long-poll engine, submit
//! pipeline, HTTP routes.
//!
//! # Cache discipline
//!
//! One lock protects the cached template, its invalidation signal,
//! and the pool-debounce clock. The cached template and the signal
//! are a pair: observers capture both atomically, and an invalidation
//! clears the slot *before* firing the signal, so no waiter can ever
//! observe a template whose signal has already fired. The signal is a
//! [`CancellationToken`] replaced with a fresh one after every fire:
//! cancel once, observe-cancel many times, re-arm.
//!
//! The lock is held across template construction on a cache miss
//! (snapshot reads only, so the critical section is short) but never
//! across the long-poll wait: waiters park on the signal and deadline
//! they captured under the lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::types::{Address, Block, V2BlockOutline};

use super::template::generate_block_template;
use super::types::{GetBlockTemplateRequest, GetBlockTemplateResponse, SubmitBlockRequest};
use super::{ChainManager, Error, Subscription, Syncer};

/// Default debounce window for pool-driven invalidations.
pub const DEFAULT_POOL_INVALIDATION_TIMEOUT: Duration = Duration::from_millis(200);

/// Tunables for [`Server::new`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Basic-auth password. `None` (or empty) disables the gate.
    pub password: Option<String>,
    /// Maximum age of a cached template before a request forces
    /// regeneration. `None` disables the limit.
    pub max_template_age: Option<Duration>,
    /// Minimum interval between two pool-driven invalidations.
    pub pool_invalidation_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions {
            password: None,
            max_template_age: None,
            pool_invalidation_timeout: DEFAULT_POOL_INVALIDATION_TIMEOUT,
        }
    }
}

struct TemplateCache {
    /// At most one cached template; `None` means "must regenerate".
    slot: Option<GetBlockTemplateResponse>,
    /// Fired when the slot is invalidated, then replaced. Paired with
    /// whatever template is live in `slot`.
    invalidated: CancellationToken,
    /// Last instant a pool change was allowed to invalidate.
    last_pool_invalidate: Option<tokio::time::Instant>,
}

struct Inner {
    payout_addr: Address,
    password: Option<String>,
    max_template_age: Option<Duration>,
    pool_invalidation_timeout: Duration,
    cache: Mutex<TemplateCache>,
    cm: Arc<dyn ChainManager>,
    syncer: Arc<dyn Syncer>,
}

/// The mining API server.
///
/// Cheap to clone; clones share the cache. The chain listeners stay
/// registered for as long as any clone is alive, so keep the server
/// (or its router) around while serving.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
    _listeners: Arc<Vec<Subscription>>,
}

impl Server {
    /// Creates the server and registers its two chain listeners
    /// (pool change, reorg). The listeners hold only a weak handle,
    /// so the chain manager never keeps a dropped server alive.
    pub fn new(
        cm: Arc<dyn ChainManager>,
        syncer: Arc<dyn Syncer>,
        payout_addr: Address,
        options: ServerOptions,
    ) -> Server {
        let inner = Arc::new(Inner {
            payout_addr,
            password: options.password.filter(|p| !p.is_empty()),
            max_template_age: options.max_template_age.filter(|d| !d.is_zero()),
            pool_invalidation_timeout: options.pool_invalidation_timeout,
            cache: Mutex::new(TemplateCache {
                slot: None,
                invalidated: CancellationToken::new(),
                last_pool_invalidate: None,
            }),
            cm,
            syncer,
        });

        let weak = Arc::downgrade(&inner);
        let pool_sub = inner.cm.on_pool_change(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                if inner.should_pool_change_invalidate() {
                    inner.invalidate_cached_template("pool change");
                }
            }
        }));

        let weak = Arc::downgrade(&inner);
        let reorg_sub = inner.cm.on_reorg(Box::new(move |tip| {
            if let Some(inner) = weak.upgrade() {
                debug!(height = tip.height, id = %tip.id, "tip changed");
                inner.invalidate_cached_template("reorg");
            }
        }));

        Server {
            inner,
            _listeners: Arc::new(vec![pool_sub, reorg_sub]),
        }
    }

    /// The two mining routes, ready to be nested under a mount
    /// prefix.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/getblocktemplate", post(get_block_template))
            .route("/submitblock", post(submit_block))
            .with_state(self.clone())
    }
}

impl Inner {
    fn lock_cache(&self) -> MutexGuard<'_, TemplateCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clears the slot and fires the signal, then installs a fresh
    /// one. A template and a fired signal are never paired: the slot
    /// is gone before any waiter wakes.
    fn invalidate_cached_template(&self, reason: &str) {
        let mut cache = self.lock_cache();
        cache.slot = None;
        cache.invalidated.cancel();
        cache.invalidated = CancellationToken::new();
        drop(cache);
        debug!(reason, "invalidated cached block template");
    }

    /// Debounce gate for pool-driven invalidations: at most one per
    /// `pool_invalidation_timeout` window. Reorgs bypass this.
    fn should_pool_change_invalidate(&self) -> bool {
        let mut cache = self.lock_cache();
        if let Some(last) = cache.last_pool_invalidate {
            if last.elapsed() < self.pool_invalidation_timeout {
                return false;
            }
        }
        cache.last_pool_invalidate = Some(tokio::time::Instant::now());
        true
    }

    /// Whether a cached template has outlived the configured max age.
    fn template_expired(&self, template: &GetBlockTemplateResponse) -> bool {
        match self.max_template_age {
            Some(max_age) => template_age(template) >= max_age,
            None => false,
        }
    }

    /// Time until the cached template reaches its max age, if one is
    /// configured.
    fn max_age_remaining(&self, template: &GetBlockTemplateResponse) -> Option<Duration> {
        self.max_template_age
            .map(|max_age| max_age.saturating_sub(template_age(template)))
    }

    /// The long-poll primitive.
    ///
    /// Returns the cached template (regenerating when the slot is
    /// empty or past its max age) as soon as its id differs from the
    /// caller's; otherwise parks on the invalidation signal and the
    /// max-age deadline captured under the lock. Caller cancellation
    /// is the future being dropped.
    async fn cached_or_fresh_template(
        &self,
        long_poll_id: &str,
    ) -> Result<GetBlockTemplateResponse, Error> {
        loop {
            let (template, invalidated, max_age_remaining) = {
                let mut cache = self.lock_cache();
                let template = match cache.slot.take() {
                    Some(t) if !self.template_expired(&t) => t,
                    _ => {
                        let t = generate_block_template(self.cm.as_ref(), self.payout_addr)?;
                        debug!(
                            longpollid = %t.long_poll_id,
                            height = t.height,
                            txns = t.transactions.len(),
                            "generated block template"
                        );
                        t
                    }
                };
                let max_age_remaining = self.max_age_remaining(&template);
                cache.slot = Some(template.clone());
                (template, cache.invalidated.clone(), max_age_remaining)
            };

            if template.long_poll_id != long_poll_id {
                return Ok(template);
            }

            match max_age_remaining {
                Some(remaining) => {
                    tokio::select! {
                        _ = invalidated.cancelled() => {}
                        _ = tokio::time::sleep(remaining) => {}
                    }
                }
                None => invalidated.cancelled().await,
            }
        }
    }

    /// The submit pipeline: hex decode, version-selected block
    /// decode, hand to the chain manager, broadcast. A broadcast
    /// failure is an error to the caller, but the block stays
    /// accepted.
    fn submit_raw_block(&self, raw_hex: &str) -> Result<(), Error> {
        let raw = hex::decode(raw_hex)
            .map_err(|e| Error::BadRequest(format!("couldn't decode block hex: {e}")))?;

        let cs = self.cm.tip_state();
        let block = if cs.block_version() == 2 {
            Block::from_v2_wire_bytes(&raw)?
        } else {
            Block::from_v1_wire_bytes(&raw)?
        };

        self.cm
            .add_blocks(vec![block.clone()])
            .map_err(Error::ChainReject)?;
        info!(id = %block.id(), "accepted submitted block");

        match V2BlockOutline::from_block(
            &block,
            &self.cm.pool_transactions(),
            &self.cm.v2_pool_transactions(),
        ) {
            Some(outline) => self.syncer.broadcast_v2_block_outline(outline),
            None => self.syncer.broadcast_header(block.header()),
        }
        .map_err(Error::Broadcast)
    }

    /// Basic-auth gate: the password must match, the username is
    /// ignored. With no password configured the gate is open.
    fn check_auth(&self, headers: &HeaderMap) -> Result<(), Error> {
        let Some(password) = &self.password else {
            return Ok(());
        };
        let authorized = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
            .and_then(|v| BASE64.decode(v).ok())
            .and_then(|v| String::from_utf8(v).ok())
            .and_then(|creds| {
                creds
                    .split_once(':')
                    .map(|(_user, pass)| pass == password.as_str())
            })
            .unwrap_or(false);
        if !authorized {
            return Err(Error::Unauthorized);
        }
        Ok(())
    }
}

fn template_age(template: &GetBlockTemplateResponse) -> Duration {
    let created = UNIX_EPOCH + Duration::from_secs(template.timestamp);
    SystemTime::now()
        .duration_since(created)
        .unwrap_or(Duration::ZERO)
}

fn decode_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(|e| Error::BadRequest(format!("invalid request: {e}")))
}

// Bodies are taken raw: the auth gate must run before any decoding.

async fn get_block_template(
    State(server): State<Server>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<GetBlockTemplateResponse>, Error> {
    server.inner.check_auth(&headers)?;
    let req: GetBlockTemplateRequest = decode_body(&body)?;
    let template = server
        .inner
        .cached_or_fresh_template(&req.long_poll_id)
        .await?;
    Ok(Json(template))
}

async fn submit_block(
    State(server): State<Server>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, Error> {
    server.inner.check_auth(&headers)?;
    let req: SubmitBlockRequest = decode_body(&body)?;
    let raw_hex = req.params.first().ok_or_else(|| {
        Error::BadRequest("expected block hex in request params array".to_string())
    })?;
    server.inner.submit_raw_block(raw_hex)?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::HeaderValue;

    use super::*;
    use crate::testutil::{self, test_addr};
    use crate::types::{Currency, Transaction};

    fn test_server(options: ServerOptions) -> (testutil::NodeHarness, Server) {
        let harness = testutil::NodeHarness::new(testutil::v1_network());
        let server = Server::new(
            harness.cm.clone(),
            harness.syncer.clone(),
            test_addr(1),
            options,
        );
        (harness, server)
    }

    fn pool_txn(tag: &[u8]) -> Transaction {
        Transaction {
            outputs: Vec::new(),
            miner_fee: Currency(1),
            arbitrary_data: tag.to_vec(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pool_invalidations_are_debounced() {
        let (_harness, server) = test_server(ServerOptions::default());
        let inner = &server.inner;
        assert!(inner.pool_invalidation_timeout > Duration::ZERO);

        // First change invalidates, an immediate second does not.
        assert!(inner.should_pool_change_invalidate());
        assert!(!inner.should_pool_change_invalidate());

        // After the window elapses the gate re-opens.
        tokio::time::advance(inner.pool_invalidation_timeout).await;
        assert!(inner.should_pool_change_invalidate());
    }

    #[tokio::test]
    async fn invalidation_clears_slot_and_rearms_signal() {
        let (_harness, server) = test_server(ServerOptions::default());
        let inner = &server.inner;

        let template = inner.cached_or_fresh_template("").await.unwrap();
        let signal = {
            let cache = inner.lock_cache();
            assert_eq!(
                cache.slot.as_ref().map(|t| t.long_poll_id.clone()),
                Some(template.long_poll_id.clone())
            );
            assert!(!cache.invalidated.is_cancelled());
            cache.invalidated.clone()
        };

        inner.invalidate_cached_template("test");
        let cache = inner.lock_cache();
        assert!(cache.slot.is_none());
        assert!(signal.is_cancelled());
        assert!(!cache.invalidated.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn long_poll_wakes_on_pool_change() {
        let (harness, server) = test_server(ServerOptions::default());

        let t0 = server.inner.cached_or_fresh_template("").await.unwrap();
        let inner = server.inner.clone();
        let id = t0.long_poll_id.clone();
        let waiter =
            tokio::spawn(async move { inner.cached_or_fresh_template(&id).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        harness.cm.add_pool_transactions(vec![pool_txn(b"wake")]);
        let t1 = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_ne!(t1.long_poll_id, t0.long_poll_id);
        assert_eq!(t1.transactions.len(), 1);
    }

    #[tokio::test]
    async fn auth_gate_matches_password_only() {
        let (_harness, server) = test_server(ServerOptions {
            password: Some("hunter2".into()),
            ..ServerOptions::default()
        });
        let inner = &server.inner;

        let mut headers = HeaderMap::new();
        assert!(inner.check_auth(&headers).is_err());

        let creds = |user: &str, pass: &str| {
            HeaderValue::from_str(&format!("Basic {}", BASE64.encode(format!("{user}:{pass}"))))
                .unwrap()
        };

        headers.insert(header::AUTHORIZATION, creds("", "wrong"));
        assert!(inner.check_auth(&headers).is_err());

        // Any username works; only the password matters.
        headers.insert(header::AUTHORIZATION, creds("somebody", "hunter2"));
        assert!(inner.check_auth(&headers).is_ok());

        headers.insert(header::AUTHORIZATION, creds("", "hunter2"));
        assert!(inner.check_auth(&headers).is_ok());
    }

    #[tokio::test]
    async fn empty_password_disables_auth() {
        let (_harness, server) = test_server(ServerOptions {
            password: Some(String::new()),
            ..ServerOptions::default()
        });
        assert!(server.inner.check_auth(&HeaderMap::new()).is_ok());
    }
}
