//! Subscription multiplexer
//!
//! Many consumers may watch the same topic; the wire only ever carries one
//! subscription per topic. The multiplexer reference-counts consumers and
//! debounces teardown so a consumer that releases and re-acquires within
//! the debounce window never causes an unsubscribe/subscribe round trip.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use terminal_core::TopicKey;
use tracing::{debug, info};

use crate::clock::millis;
use crate::connection::TopicHandle;

/// A consumer's claim on a topic
///
/// Released through [`Multiplexer::release`]; releasing twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    topic: TopicKey,
}

impl Subscription {
    pub fn topic(&self) -> &TopicKey {
        &self.topic
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Result of acquiring a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// First consumer; the topic has to be subscribed on the wire
    First,
    /// Joined an existing wire subscription
    Shared { refcount: usize },
    /// Re-acquired inside the teardown window; the pending teardown is cancelled
    Revived,
}

/// Result of releasing a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// Unknown or already released subscription
    Unknown,
    /// Other consumers remain
    Shared { refcount: usize },
    /// Last consumer gone; teardown fires at the given time unless re-acquired
    TeardownScheduled { at: u64 },
}

/// A topic whose teardown came due
#[derive(Debug, Clone)]
pub struct Teardown {
    pub topic: TopicKey,
    pub wire: Option<TopicHandle>,
}

#[derive(Debug, Default)]
struct TopicEntry {
    subscribers: HashSet<u64>,
    teardown_at: Option<u64>,
    wire: Option<TopicHandle>,
}

/// Reference counts of consumer interest per topic
#[derive(Debug)]
pub struct Multiplexer {
    topics: HashMap<TopicKey, TopicEntry>,
    next_id: u64,
    debounce: Duration,
}

impl Multiplexer {
    pub fn new(debounce: Duration) -> Self {
        Self {
            topics: HashMap::new(),
            next_id: 1,
            debounce,
        }
    }

    /// Register a consumer for `topic`
    pub fn acquire(&mut self, topic: TopicKey) -> (Subscription, Acquired) {
        let id = self.next_id;
        self.next_id += 1;

        let acquired = match self.topics.get_mut(&topic) {
            Some(entry) => {
                entry.subscribers.insert(id);
                if entry.teardown_at.take().is_some() {
                    debug!("[Sync Mux] Teardown of {} cancelled", topic);
                    Acquired::Revived
                } else {
                    Acquired::Shared {
                        refcount: entry.subscribers.len(),
                    }
                }
            }
            None => {
                let mut entry = TopicEntry::default();
                entry.subscribers.insert(id);
                self.topics.insert(topic.clone(), entry);
                info!("[Sync Mux] First subscriber for {}", topic);
                Acquired::First
            }
        };

        (Subscription { id, topic }, acquired)
    }

    /// Record the wire subscription backing `topic`
    pub fn attach_wire(&mut self, topic: &TopicKey, handle: TopicHandle) {
        if let Some(entry) = self.topics.get_mut(topic) {
            entry.wire = Some(handle);
        }
    }

    pub fn release(&mut self, subscription: &Subscription, now: u64) -> Released {
        let Some(entry) = self.topics.get_mut(&subscription.topic) else {
            return Released::Unknown;
        };
        if !entry.subscribers.remove(&subscription.id) {
            return Released::Unknown;
        }

        if entry.subscribers.is_empty() {
            let at = now + millis(self.debounce);
            entry.teardown_at = Some(at);
            debug!(
                "[Sync Mux] Last subscriber left {}, teardown in {:?}",
                subscription.topic, self.debounce
            );
            Released::TeardownScheduled { at }
        } else {
            Released::Shared {
                refcount: entry.subscribers.len(),
            }
        }
    }

    pub fn refcount(&self, topic: &TopicKey) -> usize {
        self.topics.get(topic).map_or(0, |e| e.subscribers.len())
    }

    /// True while the topic is subscribed or lingering in its teardown window
    pub fn contains(&self, topic: &TopicKey) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &TopicKey> {
        self.topics.keys()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.topics.values().filter_map(|e| e.teardown_at).min()
    }

    /// Remove every topic whose teardown window elapsed
    pub fn on_timer(&mut self, now: u64) -> Vec<Teardown> {
        let due: Vec<TopicKey> = self
            .topics
            .iter()
            .filter(|(_, e)| e.subscribers.is_empty() && e.teardown_at.is_some_and(|at| at <= now))
            .map(|(topic, _)| topic.clone())
            .collect();

        due.into_iter()
            .filter_map(|topic| {
                let entry = self.topics.remove(&topic)?;
                info!("[Sync Mux] Tearing down {}", topic);
                Some(Teardown {
                    topic,
                    wire: entry.wire,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic() -> TopicKey {
        "instrument:EURUSD".parse().unwrap()
    }

    #[test]
    fn test_shared_topic_counts_consumers() {
        let mut mux = Multiplexer::new(Duration::from_millis(250));
        let (a, first) = mux.acquire(topic());
        let (b, second) = mux.acquire(topic());

        assert_eq!(first, Acquired::First);
        assert_eq!(second, Acquired::Shared { refcount: 2 });
        assert_ne!(a, b);

        assert_eq!(mux.release(&a, 0), Released::Shared { refcount: 1 });
        assert_eq!(mux.refcount(&topic()), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut mux = Multiplexer::new(Duration::from_millis(250));
        let (a, _) = mux.acquire(topic());
        let (_b, _) = mux.acquire(topic());

        mux.release(&a, 0);
        assert_eq!(mux.release(&a, 0), Released::Unknown);
        assert_eq!(mux.refcount(&topic()), 1);
    }

    #[test]
    fn test_teardown_after_debounce() {
        let mut mux = Multiplexer::new(Duration::from_millis(250));
        let (a, _) = mux.acquire(topic());

        assert_eq!(mux.release(&a, 1_000), Released::TeardownScheduled { at: 1_250 });
        assert!(mux.on_timer(1_249).is_empty());
        assert!(mux.contains(&topic()));

        let teardowns = mux.on_timer(1_250);
        assert_eq!(teardowns.len(), 1);
        assert_eq!(teardowns[0].topic, topic());
        assert!(!mux.contains(&topic()));
    }

    #[test]
    fn test_reacquire_cancels_teardown() {
        let mut mux = Multiplexer::new(Duration::from_millis(250));
        let (a, _) = mux.acquire(topic());
        mux.release(&a, 0);

        let (_b, acquired) = mux.acquire(topic());
        assert_eq!(acquired, Acquired::Revived);
        assert_eq!(mux.next_deadline(), None);
        assert!(mux.on_timer(10_000).is_empty());
    }

    #[test]
    fn test_release_after_teardown_is_noop() {
        let mut mux = Multiplexer::new(Duration::ZERO);
        let (a, _) = mux.acquire(topic());
        mux.release(&a, 0);
        mux.on_timer(0);

        assert_eq!(mux.release(&a, 5), Released::Unknown);
        let (_, acquired) = mux.acquire(topic());
        assert_eq!(acquired, Acquired::First);
    }
}
