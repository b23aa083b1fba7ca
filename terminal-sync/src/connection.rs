//! Connection manager
//!
//! Owns the lifecycle of the single streaming connection as an explicit
//! state machine. It never touches a socket: every transition records
//! [`ConnectionAction`]s (open, close, send, state change) that the driver
//! executes, and every transport event is tagged with the epoch of the
//! connection it came from so late events from a dead socket are dropped.
//!
//! ```text
//!  Disconnected ──connect──▶ Connecting ──opened──▶ Connected
//!                               ▲   │                  │
//!                    backoff    │   │failed     lost / │heartbeat timeout
//!                    elapsed    │   ▼                  ▼
//!                            Reconnecting ◀────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use rand::rngs::StdRng;
use terminal_core::{ClientRequest, ConnectionState, TopicKey, TopicState};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::backoff::BackoffPolicy;
use crate::clock::millis;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

/// Credentials presented when opening the stream
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Where and how to connect
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: Url,
    pub credentials: Credentials,
}

/// Handle to one wire-level topic subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicHandle {
    id: u64,
    topic: TopicKey,
}

impl TopicHandle {
    pub fn topic(&self) -> &TopicKey {
        &self.topic
    }
}

/// Wire-level state of one topic
#[derive(Debug, Clone, PartialEq)]
pub struct TopicSubscription {
    pub topic: TopicKey,
    pub state: TopicState,
    /// Consecutive failed subscribe attempts
    pub attempts: u32,
    /// When the next subscribe retry is due
    pub retry_at: Option<u64>,
    handle_id: u64,
    /// Failed above the wire while the server still streams it
    desynced: bool,
}

impl TopicSubscription {
    /// True while the server is expected to hold this subscription
    fn held_by_server(&self) -> bool {
        !matches!(self.state, TopicState::Error { .. }) || self.desynced
    }
}

/// Work the driver has to carry out on behalf of the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionAction {
    Open { endpoint: Endpoint, epoch: u64 },
    Close { epoch: u64 },
    Send { epoch: u64, request: ClientRequest },
    StateChanged(ConnectionState),
    TopicActive(TopicKey),
    TopicFailed { topic: TopicKey, reason: String },
}

/// State machine for the streaming connection and its topic table
pub struct ConnectionManager {
    state: ConnectionState,
    epoch: u64,
    attempt: u32,
    endpoint: Option<Endpoint>,
    last_heartbeat_ms: Option<u64>,
    next_probe_at: Option<u64>,
    probe_deadline: Option<u64>,
    reconnect_at: Option<u64>,
    connect_deadline: Option<u64>,
    /// Ordered so batched requests are deterministic
    topics: BTreeMap<TopicKey, TopicSubscription>,
    next_handle_id: u64,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    backoff: BackoffPolicy,
    max_subscribe_attempts: u32,
    rng: StdRng,
    actions: Vec<ConnectionAction>,
}

impl ConnectionManager {
    pub fn new(config: &SyncConfig, rng: StdRng) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            epoch: 0,
            attempt: 0,
            endpoint: None,
            last_heartbeat_ms: None,
            next_probe_at: None,
            probe_deadline: None,
            reconnect_at: None,
            connect_deadline: None,
            topics: BTreeMap::new(),
            next_handle_id: 1,
            connect_timeout: config.connect_timeout,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            backoff: config.backoff,
            max_subscribe_attempts: config.max_subscribe_attempts.max(1),
            rng,
            actions: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Consecutive failed connection attempts
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn last_heartbeat_ms(&self) -> Option<u64> {
        self.last_heartbeat_ms
    }

    pub fn topic(&self, topic: &TopicKey) -> Option<&TopicSubscription> {
        self.topics.get(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &TopicSubscription> {
        self.topics.values()
    }

    /// Drain the actions recorded since the last call
    pub fn take_actions(&mut self) -> Vec<ConnectionAction> {
        std::mem::take(&mut self.actions)
    }

    /// True when `epoch` belongs to the live connection
    pub fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch && matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start connecting to `endpoint`
    pub fn connect(&mut self, endpoint: Endpoint, now: u64) {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Closed => {}
            state => {
                debug!("[Sync WS] connect() ignored in state {:?}", state);
                return;
            }
        }

        info!("[Sync WS] Connecting to {}", endpoint.url);
        self.endpoint = Some(endpoint);
        self.attempt = 0;
        self.open_next_epoch(now);
    }

    /// Transport for `epoch` finished its handshake
    pub fn on_opened(&mut self, epoch: u64, now: u64) {
        if epoch != self.epoch || self.state != ConnectionState::Connecting {
            debug!("[Sync WS] Ignoring open of stale epoch {} (current {})", epoch, self.epoch);
            return;
        }

        info!("[Sync WS] Connected (epoch {}, after {} failed attempts)", epoch, self.attempt);
        self.attempt = 0;
        self.connect_deadline = None;
        self.last_heartbeat_ms = Some(now);
        self.next_probe_at = Some(now + millis(self.heartbeat_interval));
        self.probe_deadline = None;
        self.set_state(ConnectionState::Connected);

        // One batched request for everything the consumers still want
        let mut resubscribe = Vec::new();
        for subscription in self.topics.values_mut() {
            if matches!(subscription.state, TopicState::Pending | TopicState::Active) {
                subscription.state = TopicState::Pending;
                subscription.attempts = 0;
                subscription.retry_at = None;
                resubscribe.push(subscription.topic.clone());
            } else if subscription.desynced {
                // Stays in Error until a fresh snapshot restores it
                resubscribe.push(subscription.topic.clone());
            }
        }
        if !resubscribe.is_empty() {
            info!("[Sync WS] Subscribing to {} topics", resubscribe.len());
            self.push_send(ClientRequest::Subscribe { topics: resubscribe });
        }
    }

    /// Transport for `epoch` failed to open or was lost
    pub fn on_closed(&mut self, epoch: u64, reason: &str, now: u64) {
        if epoch != self.epoch {
            debug!("[Sync WS] Ignoring close of stale epoch {}: {}", epoch, reason);
            return;
        }
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                warn!("[Sync WS] Connection lost (epoch {}): {}", epoch, reason);
                self.schedule_reconnect(now);
            }
            _ => debug!("[Sync WS] Close in state {:?} ignored: {}", self.state, reason),
        }
    }

    /// Shut the connection down for good
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        info!("[Sync WS] Closing connection");
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            self.actions.push(ConnectionAction::Close { epoch: self.epoch });
        }
        self.clear_timers();
        self.set_state(ConnectionState::Closed);
    }

    fn schedule_reconnect(&mut self, now: u64) {
        let delay = self.backoff.delay(self.attempt, &mut self.rng);
        self.attempt = self.attempt.saturating_add(1);
        self.clear_timers();
        self.reconnect_at = Some(now + millis(delay));

        for subscription in self.topics.values_mut() {
            subscription.retry_at = None;
            if subscription.state == TopicState::Active {
                subscription.state = TopicState::Pending;
            }
        }

        info!(
            "[Sync WS] Reconnecting in {:?} (attempt {})",
            delay, self.attempt
        );
        self.set_state(ConnectionState::Reconnecting);
    }

    fn open_next_epoch(&mut self, now: u64) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        self.epoch += 1;
        self.reconnect_at = None;
        self.connect_deadline = Some(now + millis(self.connect_timeout));
        self.set_state(ConnectionState::Connecting);
        self.actions.push(ConnectionAction::Open {
            endpoint,
            epoch: self.epoch,
        });
    }

    fn clear_timers(&mut self) {
        self.next_probe_at = None;
        self.probe_deadline = None;
        self.reconnect_at = None;
        self.connect_deadline = None;
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.actions.push(ConnectionAction::StateChanged(state));
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Earliest time at which [`Self::on_timer`] has work to do
    pub fn next_deadline(&self) -> Option<u64> {
        let topic_retry = if self.state == ConnectionState::Connected {
            self.topics.values().filter_map(|s| s.retry_at).min()
        } else {
            None
        };
        [
            self.reconnect_at,
            self.connect_deadline,
            self.next_probe_at,
            self.probe_deadline,
            topic_retry,
        ]
            .into_iter()
            .flatten()
            .min()
    }

    /// Fire every timer due at `now`
    pub fn on_timer(&mut self, now: u64) {
        match self.state {
            ConnectionState::Reconnecting => {
                if self.reconnect_at.is_some_and(|at| at <= now) {
                    self.open_next_epoch(now);
                }
            }
            ConnectionState::Connecting => {
                if self.connect_deadline.is_some_and(|at| at <= now) {
                    warn!(
                        "[Sync WS] Connect (epoch {}) not open within {:?}, retrying",
                        self.epoch, self.connect_timeout
                    );
                    self.actions.push(ConnectionAction::Close { epoch: self.epoch });
                    self.schedule_reconnect(now);
                }
            }
            ConnectionState::Connected => {
                if self.probe_deadline.is_some_and(|at| at <= now) {
                    warn!(
                        "[Sync WS] No heartbeat ack within {:?}, forcing reconnect",
                        self.heartbeat_timeout
                    );
                    self.actions.push(ConnectionAction::Close { epoch: self.epoch });
                    self.schedule_reconnect(now);
                    return;
                }

                if self.next_probe_at.is_some_and(|at| at <= now) {
                    self.push_send(ClientRequest::Heartbeat { timestamp: now as i64 });
                    self.next_probe_at = Some(now + millis(self.heartbeat_interval));
                    if self.probe_deadline.is_none() {
                        self.probe_deadline = Some(now + millis(self.heartbeat_timeout));
                    }
                }

                let due: Vec<TopicKey> = self
                    .topics
                    .values_mut()
                    .filter(|s| s.retry_at.is_some_and(|at| at <= now))
                    .map(|s| {
                        s.retry_at = None;
                        s.topic.clone()
                    })
                    .collect();
                if !due.is_empty() {
                    debug!("[Sync WS] Retrying subscribe for {} topics", due.len());
                    self.push_send(ClientRequest::Subscribe { topics: due });
                }
            }
            _ => {}
        }
    }

    /// Liveness probe acknowledged
    pub fn on_heartbeat_ack(&mut self, epoch: u64, now: u64) {
        if !self.is_current(epoch) {
            return;
        }
        self.last_heartbeat_ms = Some(now);
        self.probe_deadline = None;
    }

    // ========================================================================
    // Topics
    // ========================================================================

    /// Register a wire subscription for `topic`
    ///
    /// The request goes out immediately when connected, otherwise with the
    /// batch sent on the next successful connect.
    pub fn subscribe(&mut self, topic: TopicKey) -> TopicHandle {
        if let Some(existing) = self.topics.get_mut(&topic) {
            if matches!(existing.state, TopicState::Error { .. }) {
                existing.state = TopicState::Pending;
                existing.attempts = 0;
                existing.retry_at = None;
                existing.desynced = false;
                let handle = TopicHandle {
                    id: existing.handle_id,
                    topic: topic.clone(),
                };
                if self.state == ConnectionState::Connected {
                    self.push_send(ClientRequest::Subscribe { topics: vec![topic] });
                }
                return handle;
            }
            return TopicHandle {
                id: existing.handle_id,
                topic,
            };
        }

        let id = self.next_handle_id;
        self.next_handle_id += 1;
        self.topics.insert(
            topic.clone(),
            TopicSubscription {
                topic: topic.clone(),
                state: TopicState::Pending,
                attempts: 0,
                retry_at: None,
                handle_id: id,
                desynced: false,
            },
        );
        if self.state == ConnectionState::Connected {
            self.push_send(ClientRequest::Subscribe {
                topics: vec![topic.clone()],
            });
        }
        TopicHandle { id, topic }
    }

    /// Tear down the wire subscription behind `handle`
    ///
    /// A subscribe still in flight is cancelled: the topic leaves the table
    /// and its late acknowledgment is ignored. Returns false for stale handles.
    pub fn unsubscribe(&mut self, handle: &TopicHandle) -> bool {
        match self.topics.get(&handle.topic) {
            Some(subscription) if subscription.handle_id == handle.id => {}
            _ => return false,
        }
        let removed = self.topics.remove(&handle.topic);
        if self.state == ConnectionState::Connected && removed.is_some_and(|s| s.held_by_server()) {
            self.push_send(ClientRequest::Unsubscribe {
                topics: vec![handle.topic.clone()],
            });
        }
        true
    }

    pub fn on_subscription_ack(&mut self, epoch: u64, topic: &TopicKey) {
        if !self.is_current(epoch) {
            return;
        }
        match self.topics.get_mut(topic) {
            Some(subscription) if subscription.desynced => {
                debug!("[Sync WS] {} resubscribed, waiting for a snapshot", topic);
            }
            Some(subscription) => {
                if subscription.state != TopicState::Active {
                    subscription.state = TopicState::Active;
                    subscription.attempts = 0;
                    subscription.retry_at = None;
                    self.actions.push(ConnectionAction::TopicActive(topic.clone()));
                }
            }
            None => debug!("[Sync WS] Late subscribe ack for {} ignored", topic),
        }
    }

    /// Server refused or failed the subscription for `topic`
    pub fn on_subscription_error(&mut self, epoch: u64, topic: &TopicKey, reason: &str, now: u64) {
        if !self.is_current(epoch) {
            return;
        }
        let Some(subscription) = self.topics.get_mut(topic) else {
            return;
        };

        subscription.attempts += 1;
        if subscription.attempts >= self.max_subscribe_attempts {
            error!(
                "[Sync WS] Giving up on {} after {} attempts: {}",
                topic, subscription.attempts, reason
            );
            subscription.state = TopicState::Error {
                reason: reason.to_string(),
            };
            subscription.retry_at = None;
            self.actions.push(ConnectionAction::TopicFailed {
                topic: topic.clone(),
                reason: reason.to_string(),
            });
        } else {
            let delay = self.backoff.delay(subscription.attempts - 1, &mut self.rng);
            warn!(
                "[Sync WS] Subscribe to {} failed ({}), retrying in {:?}",
                topic, reason, delay
            );
            subscription.state = TopicState::Pending;
            subscription.retry_at = Some(now + millis(delay));
        }
    }

    /// Mark a topic unusable for a reason found above the wire (e.g. resync exhaustion)
    pub fn fail_topic(&mut self, topic: &TopicKey, reason: &str) {
        let Some(subscription) = self.topics.get_mut(topic) else {
            return;
        };
        // A wire refusal already left the server without the subscription
        subscription.desynced = subscription.held_by_server();
        subscription.state = TopicState::Error {
            reason: reason.to_string(),
        };
        subscription.retry_at = None;
        self.actions.push(ConnectionAction::TopicFailed {
            topic: topic.clone(),
            reason: reason.to_string(),
        });
    }

    /// Bring a failed topic back once fresh data arrived for it
    pub fn restore_topic(&mut self, topic: &TopicKey) {
        if let Some(subscription) = self.topics.get_mut(topic) {
            if matches!(subscription.state, TopicState::Error { .. }) {
                subscription.state = TopicState::Active;
                subscription.attempts = 0;
                subscription.desynced = false;
                self.actions.push(ConnectionAction::TopicActive(topic.clone()));
            }
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Queue a request on the live connection
    pub fn send(&mut self, request: ClientRequest) -> SyncResult<()> {
        if self.state != ConnectionState::Connected {
            return Err(SyncError::NotConnected);
        }
        self.push_send(request);
        Ok(())
    }

    fn push_send(&mut self, request: ClientRequest) {
        self.actions.push(ConnectionAction::Send {
            epoch: self.epoch,
            request,
        });
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state)
            .field("epoch", &self.epoch)
            .field("attempt", &self.attempt)
            .field("topics", &self.topics.len())
            .finish()
    }
}
