//! Bounded inbound queue with delta coalescing
//!
//! Decoded frames wait here between the socket reader and the engine task.
//! Once the queue reaches its watermark, a delta is folded into its topic's
//! most recent queued delta when the two are contiguous, so a burst on a hot
//! topic costs one slot instead of many. Snapshots and acknowledgments are
//! never folded. A full queue refuses the frame and the reader waits for
//! the engine to drain, which stops it reading the socket.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use terminal_core::InboundMessage;
use tokio::sync::Notify;
use tracing::debug;

/// A decoded frame tagged with the connection it arrived on
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub epoch: u64,
    pub message: InboundMessage,
}

/// Outcome of offering a frame to the queue
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    Queued,
    /// Merged into an already queued delta
    Coalesced,
    /// No room; the frame is handed back
    Full(InboundFrame),
}

/// Bounded FIFO of inbound frames
#[derive(Debug)]
pub struct InboundQueue {
    frames: VecDeque<InboundFrame>,
    capacity: usize,
    watermark: usize,
    coalesced: u64,
}

impl InboundQueue {
    pub fn new(capacity: usize, watermark: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            watermark: watermark.min(capacity),
            coalesced: 0,
        }
    }

    pub fn push(&mut self, frame: InboundFrame) -> Enqueued {
        let frame = if self.frames.len() >= self.watermark {
            match self.try_coalesce(frame) {
                None => return Enqueued::Coalesced,
                Some(frame) => frame,
            }
        } else {
            frame
        };

        if self.frames.len() >= self.capacity {
            return Enqueued::Full(frame);
        }
        self.frames.push_back(frame);
        Enqueued::Queued
    }

    /// Fold `frame` into the topic's latest queued delta.
    ///
    /// Hands the frame back when it cannot be merged.
    fn try_coalesce(&mut self, frame: InboundFrame) -> Option<InboundFrame> {
        let InboundMessage::Delta {
            topic,
            first_seq,
            seq,
            fields,
            timestamp,
        } = &frame.message
        else {
            return Some(frame);
        };

        let latest = self
            .frames
            .iter_mut()
            .rev()
            .find(|queued| queued.epoch == frame.epoch && queued.message.topic() == Some(topic));

        match latest {
            Some(InboundFrame {
                message:
                    InboundMessage::Delta {
                        seq: queued_seq,
                        fields: queued_fields,
                        timestamp: queued_timestamp,
                        ..
                    },
                ..
            }) if *first_seq == *queued_seq + 1 => {
                queued_fields.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                *queued_seq = *seq;
                *queued_timestamp = *timestamp;
                self.coalesced += 1;
                None
            }
            _ => Some(frame),
        }
    }

    /// Take up to `max` frames in arrival order
    pub fn drain(&mut self, max: usize) -> Vec<InboundFrame> {
        let n = max.min(self.frames.len());
        self.frames.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }

    /// Deltas folded away since creation
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }
}

/// Queue shared between the socket reader and the engine task
#[derive(Debug, Clone)]
pub struct InboundChannel {
    inner: Arc<ChannelInner>,
}

#[derive(Debug)]
struct ChannelInner {
    queue: Mutex<InboundQueue>,
    /// Signalled when frames become available
    readable: Notify,
    /// Signalled when the engine drained frames
    writable: Notify,
}

impl InboundChannel {
    pub fn new(capacity: usize, watermark: usize) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                queue: Mutex::new(InboundQueue::new(capacity, watermark)),
                readable: Notify::new(),
                writable: Notify::new(),
            }),
        }
    }

    /// Enqueue a frame, waiting for room while the queue is full
    pub async fn push(&self, mut frame: InboundFrame) {
        loop {
            // Register interest before checking so a drain in between is not missed
            let writable = self.inner.writable.notified();
            let outcome = self.inner.queue.lock().push(frame);
            match outcome {
                Enqueued::Queued | Enqueued::Coalesced => {
                    self.inner.readable.notify_one();
                    return;
                }
                Enqueued::Full(rejected) => {
                    debug!("[Sync Inbound] Queue full, pausing reader");
                    frame = rejected;
                    self.inner.readable.notify_one();
                    writable.await;
                }
            }
        }
    }

    /// Wait until at least one frame is queued
    pub async fn readable(&self) {
        loop {
            let readable = self.inner.readable.notified();
            if !self.inner.queue.lock().is_empty() {
                return;
            }
            readable.await;
        }
    }

    /// Take up to `max` frames and wake a blocked reader
    pub fn drain(&self, max: usize) -> Vec<InboundFrame> {
        let frames = self.inner.queue.lock().drain(max);
        if !frames.is_empty() {
            self.inner.writable.notify_waiters();
        }
        frames
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }

    pub fn coalesced(&self) -> u64 {
        self.inner.queue.lock().coalesced()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use terminal_core::{FieldMap, FieldValue, TopicKey};

    fn topic(s: &str) -> TopicKey {
        s.parse().unwrap()
    }

    fn delta(topic_key: &str, seq: u64, field: &str, value: FieldValue) -> InboundFrame {
        let mut fields = FieldMap::new();
        fields.insert(field.to_string(), value);
        InboundFrame {
            epoch: 1,
            message: InboundMessage::Delta {
                topic: topic(topic_key),
                first_seq: seq,
                seq,
                fields,
                timestamp: Utc::now(),
            },
        }
    }

    fn snapshot(topic_key: &str, seq: u64) -> InboundFrame {
        InboundFrame {
            epoch: 1,
            message: InboundMessage::Snapshot {
                topic: topic(topic_key),
                seq,
                fields: FieldMap::new(),
                timestamp: Utc::now(),
            },
        }
    }

    #[test]
    fn test_no_coalescing_below_watermark() {
        let mut queue = InboundQueue::new(10, 5);
        queue.push(delta("instrument:EURUSD", 1, "bid", dec!(1.1).into()));
        queue.push(delta("instrument:EURUSD", 2, "bid", dec!(1.2).into()));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.coalesced(), 0);
    }

    #[test]
    fn test_contiguous_deltas_merge_at_watermark() {
        let mut queue = InboundQueue::new(10, 1);
        queue.push(delta("instrument:EURUSD", 11, "bid", dec!(1.1).into()));
        assert_eq!(
            queue.push(delta("instrument:EURUSD", 12, "ask", dec!(1.3).into())),
            Enqueued::Coalesced
        );
        assert_eq!(
            queue.push(delta("instrument:EURUSD", 13, "bid", dec!(1.2).into())),
            Enqueued::Coalesced
        );

        assert_eq!(queue.len(), 1);
        match queue.drain(1).remove(0).message {
            InboundMessage::Delta { first_seq, seq, fields, .. } => {
                assert_eq!((first_seq, seq), (11, 13));
                assert_eq!(fields["bid"], FieldValue::Number(dec!(1.2)));
                assert_eq!(fields["ask"], FieldValue::Number(dec!(1.3)));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_gapped_delta_is_not_merged() {
        let mut queue = InboundQueue::new(10, 1);
        queue.push(delta("instrument:EURUSD", 11, "bid", dec!(1.1).into()));
        assert_eq!(
            queue.push(delta("instrument:EURUSD", 13, "bid", dec!(1.2).into())),
            Enqueued::Queued
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_snapshot_is_never_merged() {
        let mut queue = InboundQueue::new(10, 1);
        queue.push(snapshot("instrument:EURUSD", 10));
        queue.push(delta("instrument:EURUSD", 11, "bid", dec!(1.1).into()));
        queue.push(snapshot("instrument:EURUSD", 20));
        assert_eq!(queue.len(), 3);

        // The latest message for the topic is a snapshot, so nothing folds
        queue.push(delta("instrument:EURUSD", 21, "bid", dec!(1.2).into()));
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_other_topics_keep_their_slot() {
        let mut queue = InboundQueue::new(10, 1);
        queue.push(delta("instrument:EURUSD", 1, "bid", dec!(1).into()));
        queue.push(delta("instrument:GBPUSD", 1, "bid", dec!(2).into()));
        queue.push(delta("instrument:EURUSD", 2, "bid", dec!(3).into()));

        let frames = queue.drain(10);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].message.topic(), Some(&topic("instrument:EURUSD")));
    }

    #[test]
    fn test_full_queue_hands_frame_back() {
        let mut queue = InboundQueue::new(2, 2);
        queue.push(snapshot("instrument:A", 1));
        queue.push(snapshot("instrument:B", 1));
        assert!(queue.is_full());

        let outcome = queue.push(snapshot("instrument:C", 1));
        assert!(matches!(outcome, Enqueued::Full(_)));

        // Contiguous delta still fits by merging
        let mut queue = InboundQueue::new(1, 1);
        queue.push(delta("instrument:A", 1, "bid", dec!(1).into()));
        assert_eq!(queue.push(delta("instrument:A", 2, "bid", dec!(2).into())), Enqueued::Coalesced);
    }

    #[tokio::test]
    async fn test_reader_waits_while_full() {
        let channel = InboundChannel::new(1, 1);
        channel.push(snapshot("instrument:A", 1)).await;

        let writer = channel.clone();
        let blocked = tokio::spawn(async move {
            writer.push(snapshot("instrument:B", 1)).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        channel.readable().await;
        assert_eq!(channel.drain(10).len(), 1);
        blocked.await.unwrap();
        assert_eq!(channel.len(), 1);
    }
}
