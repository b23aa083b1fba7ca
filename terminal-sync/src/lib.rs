//! Real-time sync engine for the trading terminal
//!
//! Keeps a normalized store of instruments, positions and deal tickets in
//! step with a streaming feed. Many consumers share a handful of wire
//! subscriptions, sequence gaps are repaired with resyncs, local writes are
//! applied optimistically and rolled back on rejection or timeout, and a
//! flash engine turns value changes into short-lived cell highlights.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod flash;
pub mod inbound;
pub mod multiplexer;
pub mod sequencer;
pub mod snapshot;
pub mod store;

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use connection::{ConnectionAction, ConnectionManager, Credentials, Endpoint, TopicHandle};
pub use engine::{
    Effect, EngineStatus, SyncCore, SyncEngine, SyncEvent, SyncHandle, TopicStatus, Transport,
    TransportEvent, TransportLink, TransportSink, WsTransport,
};
pub use error::{SyncError, SyncResult};
pub use flash::{CellKey, FlashDirection, FlashEngine, FlashState};
pub use inbound::{InboundChannel, InboundFrame, InboundQueue};
pub use multiplexer::{Multiplexer, Subscription};
pub use sequencer::{DeltaDecision, Sequencer};
pub use snapshot::{EntitySnapshot, RestSnapshotClient, SnapshotError, SnapshotSource};
pub use store::{
    Mutation, MutationOutcome, NormalizedStore, PendingMutation, Query, Revert, Selection, Selector,
};
