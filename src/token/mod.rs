//! Session token lifecycle
//!
//! The server hands every decoy response a fresh token. A client then opens
//! its upload and download legs carrying that token, and the legs meet in the
//! token's [`PairingState`]. A state leaves the registry exactly once: either
//! consumed when both legs are present, or evicted when its deadline passes.
//!
//! Two levels of locking:
//! - the registry map sits behind one `std::sync::Mutex`, held only for map
//!   operations and never across an await
//! - each state's leg slots sit behind their own `tokio::sync::Mutex`, so leg
//!   I/O for one client never stalls issuance or validation for another

use crate::crypto::random_token;
use crate::protocol::{ProtocolError, Role, DEFAULT_TOKEN_LEN};
use crate::transport::BoxedStream;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// A hijacked leg waiting for its sibling
pub struct Leg {
    /// The raw connection beneath the HTTP layer
    pub conn: BoxedStream,
    /// Bytes the HTTP parser had already read past the request head
    pub buffered: Bytes,
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    /// Client address reported by a fronting proxy
    pub forwarded_for: Option<String>,
}

impl std::fmt::Debug for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leg")
            .field("buffered", &self.buffered.len())
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Leg slots of one token
#[derive(Debug, Default)]
pub struct Slots {
    upload: Option<Leg>,
    download: Option<Leg>,
    evicted: bool,
}

impl Slots {
    /// Whether the state was evicted; a leg arriving now must close itself
    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    pub fn is_occupied(&self, role: Role) -> bool {
        self.slot(role).is_some()
    }

    /// Store a leg. Returns it back if the slot is taken or the state is evicted.
    pub fn store(&mut self, role: Role, leg: Leg) -> Result<(), Leg> {
        if self.evicted || self.is_occupied(role) {
            return Err(leg);
        }
        *self.slot_mut(role) = Some(leg);
        Ok(())
    }

    pub fn is_paired(&self) -> bool {
        self.upload.is_some() && self.download.is_some()
    }

    /// Take both legs as `(upload, download)` once both are present
    pub fn take_pair(&mut self) -> Option<(Leg, Leg)> {
        if !self.is_paired() {
            return None;
        }
        Some((self.upload.take()?, self.download.take()?))
    }

    fn slot(&self, role: Role) -> &Option<Leg> {
        match role {
            Role::Upload => &self.upload,
            Role::Download => &self.download,
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<Leg> {
        match role {
            Role::Upload => &mut self.upload,
            Role::Download => &mut self.download,
        }
    }
}

/// Per-token pairing state
#[derive(Debug)]
pub struct PairingState {
    token: String,
    deadline: Instant,
    slots: tokio::sync::Mutex<Slots>,
}

impl PairingState {
    fn new(token: String, deadline: Instant) -> Self {
        Self {
            token,
            deadline,
            slots: tokio::sync::Mutex::new(Slots::default()),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Exclusive access to the leg slots
    pub async fn slots(&self) -> tokio::sync::MutexGuard<'_, Slots> {
        self.slots.lock().await
    }

    /// Mark evicted and close whatever leg is still parked here
    async fn reclaim(&self) {
        let mut slots = self.slots.lock().await;
        slots.evicted = true;
        for (role, leg) in [
            (Role::Upload, slots.upload.take()),
            (Role::Download, slots.download.take()),
        ] {
            if let Some(leg) = leg {
                debug!(
                    "closing half-open {} leg of token {} from {:?}",
                    role, self.token, leg.peer_addr
                );
                drop(leg);
            }
        }
    }
}

/// Registry of outstanding tokens
#[derive(Debug)]
pub struct TokenRegistry {
    entries: Mutex<HashMap<String, Arc<PairingState>>>,
    ttl: Duration,
    token_len: usize,
}

impl TokenRegistry {
    /// Create a registry whose tokens live for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            token_len: DEFAULT_TOKEN_LEN,
        }
    }

    /// Set the length of issued tokens
    pub fn with_token_len(mut self, token_len: usize) -> Self {
        self.token_len = token_len;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<PairingState>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generate and register a new token
    pub fn issue(&self) -> String {
        let token = random_token(self.token_len);
        let state = Arc::new(PairingState::new(token.clone(), Instant::now() + self.ttl));

        if self.entries().insert(token.clone(), state).is_some() {
            warn!("token collision on {}, previous pairing state replaced", token);
        }
        trace!("issued token {}", token);
        token
    }

    /// Look up a live token. An expired entry is evicted on the way.
    pub async fn validate(&self, token: &str) -> Result<Arc<PairingState>, ProtocolError> {
        let now = Instant::now();
        let expired = {
            let mut entries = self.entries();
            let state = entries
                .get(token)
                .cloned()
                .ok_or(ProtocolError::TokenNotFound)?;
            if !state.is_expired(now) {
                return Ok(state);
            }
            entries.remove(token);
            state
        };

        trace!("token {} expired on lookup", token);
        expired.reclaim().await;
        Err(ProtocolError::TokenNotFound)
    }

    /// Remove a token for promotion
    pub fn consume(&self, token: &str) -> Option<Arc<PairingState>> {
        self.entries().remove(token)
    }

    /// Evict every expired entry, closing any half-open leg. Returns the count.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.entries().retain(|_, state| {
            if state.is_expired(now) {
                expired.push(Arc::clone(state));
                false
            } else {
                true
            }
        });

        for state in &expired {
            state.reclaim().await;
        }
        if !expired.is_empty() {
            debug!("swept {} expired token(s)", expired.len());
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.entries().contains_key(token)
    }

    /// Sweep every `interval` until `shutdown` flips to true
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            trace!("token sweeper stopped");
        })
    }
}
