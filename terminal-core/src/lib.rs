//! Core types for the trading terminal
//!
//! This crate defines the shared data structures used across the terminal:
//! the streaming wire protocol, normalized entity records, and typed views
//! over positions and deal tickets.

pub mod entity;
pub mod error;
pub mod position;
pub mod websocket;

pub use entity::{fields_from_json, EntityKey, EntityKind, EntityRecord, FieldMap, FieldValue};
pub use error::{TerminalError, TerminalResult};
pub use position::{DealStatus, DealTicket, Position, Side};
pub use websocket::{
    ClientRequest, ConnectionState, EnvelopeType, InboundMessage, MutationVerdict,
    SubscriptionStatus, TopicKey, TopicState, WireEnvelope,
};
