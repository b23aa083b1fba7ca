//! Error types for the sync engine

use terminal_core::TerminalError;
use thiserror::Error;

/// Errors surfaced by the sync engine to its consumers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Not connected")]
    NotConnected,

    #[error("Subscription to {topic} failed: {reason}")]
    SubscriptionFailed { topic: String, reason: String },

    #[error("Resync of {topic} failed after {attempts} attempts")]
    ResyncFailed { topic: String, attempts: u32 },

    #[error("Mutation rejected: {0}")]
    MutationRejected(String),

    #[error("Mutation not confirmed within {timeout_ms}ms")]
    MutationTimeout { timeout_ms: u64 },

    #[error("Sync engine has shut down")]
    EngineClosed,

    #[error(transparent)]
    Terminal(#[from] TerminalError),
}

pub type SyncResult<T> = Result<T, SyncError>;
