//! Sync engine core
//!
//! [`SyncCore`] wires the connection manager, multiplexer, sequencer and
//! store into one deterministic state machine. It performs no I/O: every
//! input is a method call stamped with the injected [`Clock`], and every
//! side effect is returned as an [`Effect`] for the driver to execute.
//! Tests drive it directly with a [`crate::clock::ManualClock`].

mod driver;
mod transport;

pub use driver::{SyncEngine, SyncHandle};
pub use transport::{Transport, TransportEvent, TransportLink, TransportSink, WsTransport};

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use terminal_core::{
    ClientRequest, ConnectionState, InboundMessage, MutationVerdict, SubscriptionStatus, TopicKey,
    TopicState,
};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::connection::{ConnectionAction, ConnectionManager, Credentials, Endpoint};
use crate::error::SyncError;
use crate::inbound::InboundFrame;
use crate::multiplexer::{Acquired, Multiplexer, Subscription};
use crate::sequencer::{DeltaDecision, ResyncAction, Sequencer};
use crate::snapshot::{EntitySnapshot, SnapshotError};
use crate::store::{Mutation, NormalizedStore, PendingMutation, Query, Revert, Selector};

/// Notifications published to engine listeners
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ConnectionState(ConnectionState),
    TopicState { topic: TopicKey, state: TopicState },
    MutationReverted(Revert),
    /// Server error not tied to a subscription
    ServerError { code: Option<String>, message: String },
}

/// Side effect requested by the core
#[derive(Debug, Clone)]
pub enum Effect {
    Open { endpoint: Endpoint, epoch: u64 },
    Close { epoch: u64 },
    Send { epoch: u64, request: ClientRequest },
    FetchSnapshot { topic: TopicKey },
    Publish(SyncEvent),
}

/// Point-in-time view of the engine for status surfaces
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: ConnectionState,
    pub epoch: u64,
    pub reconnect_attempt: u32,
    pub last_heartbeat_ms: Option<u64>,
    pub topics: Vec<TopicStatus>,
    pub entities: usize,
    pub pending_mutations: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicStatus {
    pub topic: TopicKey,
    #[serde(flatten)]
    pub state: TopicState,
    pub subscribers: usize,
    pub last_seq: Option<u64>,
    pub resyncing: bool,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            epoch: 0,
            reconnect_attempt: 0,
            last_heartbeat_ms: None,
            topics: Vec::new(),
            entities: 0,
            pending_mutations: 0,
        }
    }
}

/// Deterministic synchronization state machine
pub struct SyncCore {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    connection: ConnectionManager,
    multiplexer: Multiplexer,
    sequencer: Sequencer,
    store: NormalizedStore,
    effects: Vec<Effect>,
}

impl SyncCore {
    pub fn new(config: SyncConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_rng(config, clock, StdRng::from_os_rng())
    }

    /// Build a core whose jitter is reproducible
    pub fn with_seed(config: SyncConfig, clock: Arc<dyn Clock>, seed: u64) -> Self {
        Self::with_rng(config, clock, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: SyncConfig, clock: Arc<dyn Clock>, mut rng: StdRng) -> Self {
        let connection = ConnectionManager::new(&config, StdRng::from_rng(&mut rng));
        let sequencer = Sequencer::new(&config, StdRng::from_rng(&mut rng));
        Self {
            multiplexer: Multiplexer::new(config.teardown_debounce),
            store: NormalizedStore::new(config.optimistic_timeout),
            connection,
            sequencer,
            clock,
            config,
            effects: Vec::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.multiplexer
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn store(&self) -> &NormalizedStore {
        &self.store
    }

    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Drain the effects recorded since the last call
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn connect(&mut self) {
        let endpoint = Endpoint {
            url: self.config.stream_url.clone(),
            credentials: Credentials {
                api_key: self.config.api_key.clone(),
            },
        };
        let now = self.now();
        self.connection.connect(endpoint, now);
        self.flush();
    }

    pub fn close(&mut self) {
        self.connection.close();
        self.flush();
    }

    pub fn on_transport_opened(&mut self, epoch: u64) {
        let now = self.now();
        self.connection.on_opened(epoch, now);
        self.flush();
    }

    pub fn on_transport_closed(&mut self, epoch: u64, reason: &str) {
        let now = self.now();
        self.connection.on_closed(epoch, reason, now);
        self.flush();
    }

    // ========================================================================
    // Consumer commands
    // ========================================================================

    /// Register interest in `topic`
    pub fn acquire(&mut self, topic: TopicKey) -> Subscription {
        let (subscription, acquired) = self.multiplexer.acquire(topic.clone());
        if acquired == Acquired::First {
            let handle = self.connection.subscribe(topic.clone());
            self.multiplexer.attach_wire(&topic, handle);
            self.sequencer.remove(&topic);
            if self.config.snapshot_url.is_some() {
                self.effects.push(Effect::FetchSnapshot { topic });
            }
        }
        self.flush();
        subscription
    }

    pub fn release(&mut self, subscription: &Subscription) {
        let now = self.now();
        self.multiplexer.release(subscription, now);
        // A zero debounce tears down right away
        self.on_timer();
    }

    pub fn select(&mut self, query: Query) -> Selector {
        self.store.select(query)
    }

    /// Apply `mutation` optimistically and send it to the server
    pub fn submit(&mut self, mutation: Mutation) -> PendingMutation {
        if self.connection.state() != ConnectionState::Connected {
            warn!("[Sync] Mutation for {} rejected while disconnected", mutation.key);
            return PendingMutation::rejected(SyncError::NotConnected);
        }

        let now = self.now();
        let request_fields = mutation.fields.clone();
        let topic = TopicKey::from(&mutation.key);
        let pending = self.store.submit_optimistic(mutation, now);
        let request = ClientRequest::Submit {
            correlation_id: pending.correlation_id.clone(),
            topic,
            fields: request_fields,
        };
        if let Err(e) = self.connection.send(request) {
            if let Some(revert) = self.store.reconcile(&pending.correlation_id, Err(e)) {
                self.effects.push(Effect::Publish(SyncEvent::MutationReverted(revert)));
            }
        }
        self.flush();
        pending
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Process a batch of inbound frames; selectors are notified once at the end
    pub fn on_frames(&mut self, frames: Vec<InboundFrame>) {
        let now = self.now();
        for frame in frames {
            if !self.connection.is_current(frame.epoch) {
                debug!("[Sync] Dropping frame from stale epoch {}", frame.epoch);
                continue;
            }
            self.on_message(frame.epoch, frame.message, now);
        }
        self.flush();
    }

    pub fn on_frame(&mut self, frame: InboundFrame) {
        self.on_frames(vec![frame]);
    }

    fn on_message(&mut self, epoch: u64, message: InboundMessage, now: u64) {
        match message {
            InboundMessage::Snapshot {
                topic,
                seq,
                fields,
                timestamp,
            } => {
                self.adopt_snapshot(EntitySnapshot {
                    topic,
                    seq,
                    fields,
                    timestamp,
                });
            }
            InboundMessage::Delta {
                topic,
                first_seq,
                seq,
                fields,
                timestamp,
            } => {
                if !self.multiplexer.contains(&topic) {
                    debug!("[Sync] Delta for unsubscribed {} dropped", topic);
                    return;
                }
                match self.sequencer.on_delta(&topic, first_seq, seq, now) {
                    DeltaDecision::Apply => {
                        self.store.apply_delta(&topic.entity_key(), fields, seq, timestamp);
                    }
                    DeltaDecision::Stale { last_seq } => {
                        debug!("[Sync] Stale delta {} for {} (last {})", seq, topic, last_seq);
                    }
                    DeltaDecision::Resync { .. } => self.request_resync(topic),
                    DeltaDecision::AwaitingSnapshot => {}
                }
            }
            InboundMessage::HeartbeatAck { .. } => {
                self.connection.on_heartbeat_ack(epoch, now);
            }
            InboundMessage::SubscriptionAck { topic, status } => match status {
                SubscriptionStatus::Subscribed => self.connection.on_subscription_ack(epoch, &topic),
                SubscriptionStatus::Unsubscribed => debug!("[Sync] Unsubscribed from {}", topic),
            },
            InboundMessage::MutationAck {
                correlation_id,
                verdict,
            } => {
                let outcome = match verdict {
                    MutationVerdict::Accepted => Ok(()),
                    MutationVerdict::Rejected { reason } => Err(SyncError::MutationRejected(
                        reason.unwrap_or_else(|| "rejected by server".to_string()),
                    )),
                };
                if let Some(revert) = self.store.reconcile(&correlation_id, outcome) {
                    self.effects.push(Effect::Publish(SyncEvent::MutationReverted(revert)));
                }
            }
            InboundMessage::Error {
                topic: Some(topic),
                message,
                ..
            } => {
                self.connection.on_subscription_error(epoch, &topic, &message, now);
            }
            InboundMessage::Error {
                topic: None,
                code,
                message,
            } => {
                warn!("[Sync] Server error {:?}: {}", code, message);
                self.effects
                    .push(Effect::Publish(SyncEvent::ServerError { code, message }));
            }
        }
    }

    /// Snapshot fetched over REST
    pub fn on_snapshot_fetched(&mut self, topic: TopicKey, result: Result<EntitySnapshot, SnapshotError>) {
        match result {
            Ok(snapshot) => self.adopt_snapshot(snapshot),
            Err(e) => warn!("[Sync] Snapshot fetch for {} failed: {}", topic, e),
        }
        self.flush();
    }

    fn adopt_snapshot(&mut self, snapshot: EntitySnapshot) {
        let topic = snapshot.topic;
        if !self.multiplexer.contains(&topic) {
            debug!("[Sync] Snapshot for unsubscribed {} dropped", topic);
            return;
        }
        let recovered = self.sequencer.has_failed(&topic);
        if self
            .store
            .apply_snapshot(topic.entity_key(), snapshot.seq, snapshot.fields, snapshot.timestamp)
        {
            self.sequencer.on_snapshot(&topic, snapshot.seq);
            if recovered {
                info!("[Sync] {} recovered by snapshot", topic);
                self.connection.restore_topic(&topic);
            }
        }
    }

    fn request_resync(&mut self, topic: TopicKey) {
        if self.config.snapshot_url.is_some() {
            self.effects.push(Effect::FetchSnapshot {
                topic: topic.clone(),
            });
        }
        if self
            .connection
            .send(ClientRequest::Resync {
                topics: vec![topic.clone()],
            })
            .is_err()
        {
            debug!("[Sync] Resync of {} deferred until reconnect", topic);
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Earliest time at which [`Self::on_timer`] has work to do
    pub fn next_deadline(&self) -> Option<u64> {
        [
            self.connection.next_deadline(),
            self.multiplexer.next_deadline(),
            self.sequencer.next_deadline(),
            self.store.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fire every timer due now
    pub fn on_timer(&mut self) {
        let now = self.now();
        self.connection.on_timer(now);

        for teardown in self.multiplexer.on_timer(now) {
            if let Some(wire) = &teardown.wire {
                self.connection.unsubscribe(wire);
            }
            self.sequencer.remove(&teardown.topic);
        }

        for action in self.sequencer.on_timer(now) {
            match action {
                ResyncAction::Request(topic) => self.request_resync(topic),
                ResyncAction::Failed { topic, attempts } => {
                    let reason = SyncError::ResyncFailed {
                        topic: topic.to_string(),
                        attempts,
                    };
                    self.connection.fail_topic(&topic, &reason.to_string());
                }
            }
        }

        for revert in self.store.expire(now) {
            self.effects.push(Effect::Publish(SyncEvent::MutationReverted(revert)));
        }

        self.flush();
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn status(&self) -> EngineStatus {
        let topics = self
            .connection
            .topics()
            .map(|subscription| TopicStatus {
                topic: subscription.topic.clone(),
                state: subscription.state.clone(),
                subscribers: self.multiplexer.refcount(&subscription.topic),
                last_seq: self.sequencer.last_seq(&subscription.topic),
                resyncing: self.sequencer.is_resyncing(&subscription.topic),
            })
            .collect();

        EngineStatus {
            state: self.connection.state(),
            epoch: self.connection.epoch(),
            reconnect_attempt: self.connection.attempt(),
            last_heartbeat_ms: self.connection.last_heartbeat_ms(),
            topics,
            entities: self.store.len(),
            pending_mutations: self.store.pending_mutations(),
        }
    }

    /// Translate connection actions into effects and publish store changes
    fn flush(&mut self) {
        for action in self.connection.take_actions() {
            let effect = match action {
                ConnectionAction::Open { endpoint, epoch } => Effect::Open { endpoint, epoch },
                ConnectionAction::Close { epoch } => Effect::Close { epoch },
                ConnectionAction::Send { epoch, request } => Effect::Send { epoch, request },
                ConnectionAction::StateChanged(state) => {
                    Effect::Publish(SyncEvent::ConnectionState(state))
                }
                ConnectionAction::TopicActive(topic) => Effect::Publish(SyncEvent::TopicState {
                    topic,
                    state: TopicState::Active,
                }),
                ConnectionAction::TopicFailed { topic, reason } => {
                    Effect::Publish(SyncEvent::TopicState {
                        topic,
                        state: TopicState::Error { reason },
                    })
                }
            };
            self.effects.push(effect);
        }
        self.store.dispatch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use terminal_core::{FieldMap, FieldValue};

    fn core() -> (SyncCore, ManualClock) {
        let clock = ManualClock::new(0);
        let core = SyncCore::with_seed(SyncConfig::default(), Arc::new(clock.clone()), 1);
        (core, clock)
    }

    fn topic() -> TopicKey {
        "instrument:EURUSD".parse().unwrap()
    }

    fn snapshot(seq: u64, price: i64) -> InboundFrame {
        let mut fields = FieldMap::new();
        fields.insert("price".to_string(), FieldValue::from(price));
        InboundFrame {
            epoch: 1,
            message: InboundMessage::Snapshot {
                topic: topic(),
                seq,
                fields,
                timestamp: Utc::now(),
            },
        }
    }

    fn connected_core() -> (SyncCore, ManualClock) {
        let (mut core, clock) = core();
        core.connect();
        core.on_transport_opened(1);
        core.take_effects();
        (core, clock)
    }

    #[test]
    fn test_connect_emits_open_and_state() {
        let (mut core, _) = core();
        core.connect();
        let effects = core.take_effects();
        assert!(effects.iter().any(|e| matches!(e, Effect::Open { epoch: 1, .. })));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Publish(SyncEvent::ConnectionState(ConnectionState::Connecting))
        )));
    }

    #[test]
    fn test_submit_while_disconnected_rolls_back() {
        let (mut core, _) = core();
        let pending = core.submit(Mutation::field(topic().entity_key(), "qty", dec!(1)));
        let outcome = pending.outcome.blocking_recv().unwrap();
        assert_eq!(
            outcome,
            crate::store::MutationOutcome::RolledBack {
                reason: SyncError::NotConnected
            }
        );
        assert_eq!(core.store().pending_mutations(), 0);
    }

    #[test]
    fn test_frames_for_unsubscribed_topics_are_dropped() {
        let (mut core, _) = connected_core();
        core.on_frame(snapshot(10, 100));
        assert!(core.store().get(&topic().entity_key()).is_none());
    }

    #[test]
    fn test_stale_epoch_frames_are_dropped() {
        let (mut core, clock) = connected_core();
        let _sub = core.acquire(topic());
        core.on_transport_closed(1, "reset");
        clock.advance(Duration::from_secs(2));
        core.on_timer();
        core.on_transport_opened(2);

        core.on_frame(snapshot(10, 100));
        assert!(core.store().get(&topic().entity_key()).is_none());
    }

    #[test]
    fn test_server_error_for_topic_counts_as_subscribe_failure() {
        let (mut core, _) = connected_core();
        let _sub = core.acquire(topic());
        core.on_frame(InboundFrame {
            epoch: 1,
            message: InboundMessage::Error {
                topic: Some(topic()),
                code: None,
                message: "busy".to_string(),
            },
        });
        assert_eq!(core.connection().topic(&topic()).unwrap().attempts, 1);
    }

    #[test]
    fn test_status_reports_topics() {
        let (mut core, _) = connected_core();
        let _a = core.acquire(topic());
        let _b = core.acquire(topic());
        core.on_frame(snapshot(10, 100));

        let status = core.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.topics.len(), 1);
        assert_eq!(status.topics[0].subscribers, 2);
        assert_eq!(status.topics[0].last_seq, Some(10));
        assert_eq!(status.entities, 1);
    }
}
