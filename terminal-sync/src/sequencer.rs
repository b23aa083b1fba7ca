//! Per-topic sequence tracking
//!
//! Decides for every inbound delta whether it extends the baseline, is a
//! duplicate, or reveals a gap. A gap starts exactly one resync for the
//! topic; until the resync snapshot lands every further delta is discarded
//! and no second request goes out. Unanswered resyncs are retried with
//! backoff and eventually reported as failed.

use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::StdRng;
use terminal_core::TopicKey;
use tracing::{debug, error, warn};

use crate::backoff::BackoffPolicy;
use crate::clock::millis;
use crate::config::SyncConfig;

/// What to do with an inbound delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaDecision {
    /// Contiguous with the baseline, merge it
    Apply,
    /// Already covered by the baseline
    Stale { last_seq: u64 },
    /// Gap or missing baseline; a resync was just started
    Resync { expected: Option<u64>, received: u64 },
    /// A resync is already outstanding for this topic
    AwaitingSnapshot,
}

/// Resync work that came due on a timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncAction {
    /// Ask for a fresh snapshot again
    Request(TopicKey),
    /// Retries exhausted
    Failed { topic: TopicKey, attempts: u32 },
}

#[derive(Debug, Clone)]
struct Resync {
    attempts: u32,
    /// When the outstanding request is considered lost
    deadline: Option<u64>,
    /// When the next request goes out
    retry_at: Option<u64>,
    failed: bool,
}

#[derive(Debug, Clone, Default)]
struct TopicSequence {
    last_seq: Option<u64>,
    resync: Option<Resync>,
}

/// Sequence numbers and resync bookkeeping for every live topic
pub struct Sequencer {
    topics: HashMap<TopicKey, TopicSequence>,
    resync_timeout: Duration,
    max_resync_attempts: u32,
    backoff: BackoffPolicy,
    rng: StdRng,
}

impl Sequencer {
    pub fn new(config: &SyncConfig, rng: StdRng) -> Self {
        Self {
            topics: HashMap::new(),
            resync_timeout: config.resync_timeout,
            max_resync_attempts: config.max_resync_attempts.max(1),
            backoff: config.backoff,
            rng,
        }
    }

    /// Last applied sequence number for `topic`
    pub fn last_seq(&self, topic: &TopicKey) -> Option<u64> {
        self.topics.get(topic).and_then(|t| t.last_seq)
    }

    pub fn is_resyncing(&self, topic: &TopicKey) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|t| t.resync.as_ref().is_some_and(|r| !r.failed))
    }

    /// True once a resync for `topic` ran out of attempts
    pub fn has_failed(&self, topic: &TopicKey) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|t| t.resync.as_ref().is_some_and(|r| r.failed))
    }

    /// A snapshot always establishes a new baseline
    pub fn on_snapshot(&mut self, topic: &TopicKey, seq: u64) {
        let entry = self.topics.entry(topic.clone()).or_default();
        if entry.resync.take().is_some() {
            debug!("[Sync Seq] {} resynced at seq {}", topic, seq);
        }
        entry.last_seq = Some(seq);
    }

    /// Classify a delta covering `first_seq..=seq`
    ///
    /// A coalesced delta applies when its range starts at or before the
    /// next expected number and extends past the baseline.
    pub fn on_delta(&mut self, topic: &TopicKey, first_seq: u64, seq: u64, now: u64) -> DeltaDecision {
        let timeout = millis(self.resync_timeout);
        let entry = self.topics.entry(topic.clone()).or_default();

        if entry.resync.is_some() {
            return DeltaDecision::AwaitingSnapshot;
        }

        let decision = match entry.last_seq {
            None => DeltaDecision::Resync {
                expected: None,
                received: first_seq,
            },
            Some(last) if seq <= last => return DeltaDecision::Stale { last_seq: last },
            Some(last) if first_seq <= last + 1 => {
                entry.last_seq = Some(seq);
                return DeltaDecision::Apply;
            }
            Some(last) => DeltaDecision::Resync {
                expected: Some(last + 1),
                received: first_seq,
            },
        };

        warn!(
            "[Sync Seq] Gap on {}: expected {:?}, received {}; requesting resync",
            topic,
            entry.last_seq.map(|s| s + 1),
            first_seq
        );
        entry.resync = Some(Resync {
            attempts: 1,
            deadline: Some(now + timeout),
            retry_at: None,
            failed: false,
        });
        decision
    }

    /// Forget everything about a torn down topic
    pub fn remove(&mut self, topic: &TopicKey) {
        self.topics.remove(topic);
    }

    /// Resync attempts still outstanding
    pub fn resync_attempts(&self, topic: &TopicKey) -> u32 {
        self.topics
            .get(topic)
            .and_then(|t| t.resync.as_ref())
            .map_or(0, |r| r.attempts)
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.topics
            .values()
            .filter_map(|t| t.resync.as_ref())
            .filter_map(|r| match (r.deadline, r.retry_at) {
                (_, Some(at)) => Some(at),
                (Some(at), None) => Some(at),
                (None, None) => None,
            })
            .min()
    }

    /// Advance resync timers
    pub fn on_timer(&mut self, now: u64) -> Vec<ResyncAction> {
        let timeout = millis(self.resync_timeout);
        let mut actions = Vec::new();

        for (topic, sequence) in self.topics.iter_mut() {
            let Some(resync) = sequence.resync.as_mut() else {
                continue;
            };
            if resync.failed {
                continue;
            }

            if resync.retry_at.is_some_and(|at| at <= now) {
                resync.retry_at = None;
                resync.attempts += 1;
                resync.deadline = Some(now + timeout);
                debug!("[Sync Seq] Resync attempt {} for {}", resync.attempts, topic);
                actions.push(ResyncAction::Request(topic.clone()));
                continue;
            }

            if resync.deadline.is_some_and(|at| at <= now) {
                resync.deadline = None;
                if resync.attempts >= self.max_resync_attempts {
                    error!(
                        "[Sync Seq] Resync of {} failed after {} attempts",
                        topic, resync.attempts
                    );
                    resync.failed = true;
                    actions.push(ResyncAction::Failed {
                        topic: topic.clone(),
                        attempts: resync.attempts,
                    });
                } else {
                    let delay = self.backoff.delay(resync.attempts - 1, &mut self.rng);
                    warn!(
                        "[Sync Seq] Resync of {} timed out, retrying in {:?}",
                        topic, delay
                    );
                    resync.retry_at = Some(now + millis(delay));
                }
            }
        }

        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn sequencer() -> Sequencer {
        let config = SyncConfig {
            resync_timeout: Duration::from_secs(5),
            max_resync_attempts: 2,
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 0.0),
            ..SyncConfig::default()
        };
        Sequencer::new(&config, StdRng::seed_from_u64(7))
    }

    fn topic() -> TopicKey {
        "instrument:EURUSD".parse().unwrap()
    }

    #[test]
    fn test_contiguous_deltas_apply() {
        let mut seq = sequencer();
        seq.on_snapshot(&topic(), 10);

        assert_eq!(seq.on_delta(&topic(), 11, 11, 0), DeltaDecision::Apply);
        assert_eq!(seq.on_delta(&topic(), 12, 12, 0), DeltaDecision::Apply);
        assert_eq!(seq.last_seq(&topic()), Some(12));
    }

    #[test]
    fn test_duplicates_are_stale() {
        let mut seq = sequencer();
        seq.on_snapshot(&topic(), 10);

        assert_eq!(seq.on_delta(&topic(), 10, 10, 0), DeltaDecision::Stale { last_seq: 10 });
        assert_eq!(seq.on_delta(&topic(), 3, 3, 0), DeltaDecision::Stale { last_seq: 10 });
        assert_eq!(seq.last_seq(&topic()), Some(10));
    }

    #[test]
    fn test_coalesced_range_applies() {
        let mut seq = sequencer();
        seq.on_snapshot(&topic(), 10);

        assert_eq!(seq.on_delta(&topic(), 11, 14, 0), DeltaDecision::Apply);
        assert_eq!(seq.last_seq(&topic()), Some(14));
    }

    #[test]
    fn test_gap_requests_exactly_one_resync() {
        let mut seq = sequencer();
        seq.on_snapshot(&topic(), 10);

        assert_eq!(
            seq.on_delta(&topic(), 13, 13, 0),
            DeltaDecision::Resync { expected: Some(11), received: 13 }
        );
        assert_eq!(seq.on_delta(&topic(), 14, 14, 0), DeltaDecision::AwaitingSnapshot);
        assert_eq!(seq.on_delta(&topic(), 20, 20, 0), DeltaDecision::AwaitingSnapshot);
        assert!(seq.is_resyncing(&topic()));

        seq.on_snapshot(&topic(), 20);
        assert!(!seq.is_resyncing(&topic()));
        assert_eq!(seq.on_delta(&topic(), 21, 21, 0), DeltaDecision::Apply);
    }

    #[test]
    fn test_delta_without_baseline_resyncs() {
        let mut seq = sequencer();
        assert_eq!(
            seq.on_delta(&topic(), 5, 5, 0),
            DeltaDecision::Resync { expected: None, received: 5 }
        );
    }

    #[test]
    fn test_resync_timeout_retries_then_fails() {
        let mut seq = sequencer();
        seq.on_snapshot(&topic(), 1);
        seq.on_delta(&topic(), 5, 5, 0);
        assert_eq!(seq.next_deadline(), Some(5_000));

        // Timeout, back off for one second, then ask again
        assert!(seq.on_timer(5_000).is_empty());
        assert_eq!(seq.next_deadline(), Some(6_000));
        assert_eq!(seq.on_timer(6_000), vec![ResyncAction::Request(topic())]);
        assert_eq!(seq.resync_attempts(&topic()), 2);

        assert_eq!(
            seq.on_timer(11_000),
            vec![ResyncAction::Failed { topic: topic(), attempts: 2 }]
        );
        assert!(seq.has_failed(&topic()));
        assert_eq!(seq.next_deadline(), None);
        assert_eq!(seq.on_delta(&topic(), 6, 6, 11_000), DeltaDecision::AwaitingSnapshot);

        // A late snapshot still recovers the topic
        seq.on_snapshot(&topic(), 30);
        assert!(!seq.has_failed(&topic()));
    }
}
