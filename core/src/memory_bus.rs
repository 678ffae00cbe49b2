//! In-process bus for single-process mode and tests.
//!
//! Pure memory: a map from topic to an ordered log of entries, guarded by one
//! mutex. Blocking readers park on a [`Notify`] that publishers signal, so a
//! `read` with a block duration suspends without burning a thread. This is
//! the classic mutex+condvar design, expressed with tokio primitives.
//!
//! Handles created through [`MemoryBus::with_group`] share the same log but
//! read in consumer-group mode: each entry is delivered to at most one reader
//! of the group, tracked as pending until acknowledged, and redelivered once
//! its claim times out. Handles without a group tail-read, fanning the same
//! entries out to every reader.
//!
//! Cursors are zero-padded append sequence numbers, opaque to callers and
//! ordered by [`MemoryBus::compare`] like any other backend's.

use crate::bus::{Bus, BusEntry, BusError, BusMessage, Cursor, GroupIdentity};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Default claim timeout before an unacknowledged entry is redelivered.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(30);

const CURSOR_WIDTH: usize = 20;

fn encode_cursor(seq: u64) -> Cursor {
    Cursor::from(format!("{seq:0CURSOR_WIDTH$}"))
}

fn decode_cursor(topic: &str, cursor: &Cursor) -> Result<u64, BusError> {
    cursor
        .as_str()
        .parse::<u64>()
        .map_err(|_| BusError::InvalidCursor {
            topic: topic.to_string(),
            cursor: cursor.as_str().to_string(),
        })
}

/// One topic's append-only log.
#[derive(Debug, Default)]
struct TopicLog {
    /// Retained entries as `(sequence, message)` pairs in append order.
    entries: Vec<(u64, BusMessage)>,
    /// Sequence the next publish will take; sequences start at 1.
    next_seq: u64,
}

impl TopicLog {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 1,
        }
    }

    fn first_seq(&self) -> Option<u64> {
        self.entries.first().map(|(seq, _)| *seq)
    }

    fn get(&self, seq: u64) -> Option<&BusMessage> {
        let first = self.first_seq()?;
        if seq < first {
            return None;
        }
        let index = usize::try_from(seq - first).ok()?;
        self.entries.get(index).map(|(_, message)| message)
    }
}

/// Per-(topic, group) delivery bookkeeping.
#[derive(Debug)]
struct GroupState {
    /// Next sequence this group has not yet delivered.
    position: u64,
    /// Delivered-but-unacknowledged sequences and their delivery instants.
    pending: BTreeMap<u64, Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    topics: HashMap<String, TopicLog>,
    groups: HashMap<(String, String), GroupState>,
}

#[derive(Debug)]
struct Shared {
    inner: Mutex<Inner>,
    publish_notify: Notify,
}

/// The in-process [`Bus`] implementation.
///
/// Cheap to clone; clones share the underlying log, so a worker handle built
/// with [`with_group`](Self::with_group) and a gateway handle tail-reading
/// the same topics observe one store.
///
/// # Example
///
/// ```
/// use agent_mesh_core::{Bus, BusMessage, MemoryBus};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), agent_mesh_core::BusError> {
/// let bus = MemoryBus::new();
/// let first = bus.publish("chat:c1", &BusMessage::new("a".to_string())).await?;
/// bus.publish("chat:c1", &BusMessage::new("b".to_string())).await?;
///
/// let entries = bus.read("chat:c1", Some(&first), 10, None).await?;
/// assert_eq!(entries.len(), 1);
/// assert_eq!(entries[0].message.payload, "b");
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct MemoryBus {
    shared: Arc<Shared>,
    group: Option<GroupIdentity>,
    claim_timeout: Duration,
    max_len: Option<usize>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// Create an empty bus reading in tail mode.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                publish_notify: Notify::new(),
            }),
            group: None,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
            max_len: None,
        }
    }

    /// A handle over the same log that reads in consumer-group mode.
    ///
    /// A group's delivery position is registered at its first read of a
    /// topic; entries published before that are not delivered to the group.
    #[must_use]
    pub fn with_group(&self, identity: GroupIdentity) -> Self {
        let mut handle = self.clone();
        handle.group = Some(identity);
        handle
    }

    /// Override the claim timeout after which unacknowledged entries are
    /// redelivered (default 30s).
    #[must_use]
    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    /// Cap retained entries per topic, trimming the oldest on publish:
    /// the in-process analogue of `XADD MAXLEN ~`.
    #[must_use]
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Delivered-but-unacknowledged entry count for a `(topic, group)` pair.
    ///
    /// Exposed for tests and operational assertions; not part of [`Bus`].
    #[must_use]
    pub fn pending_count(&self, topic: &str, group: &str) -> usize {
        let inner = self.lock();
        inner
            .groups
            .get(&(topic.to_string(), group.to_string()))
            .map_or(0, |state| state.pending.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Collect one batch in group mode: timed-out pending entries first,
    /// then undelivered ones. Returns an empty batch when nothing is due.
    fn take_group_batch(
        inner: &mut Inner,
        topic: &str,
        identity: &GroupIdentity,
        limit: usize,
        claim_timeout: Duration,
        now: Instant,
    ) -> Vec<BusEntry> {
        let log = inner.topics.entry(topic.to_string()).or_insert_with(TopicLog::new);
        let state = inner
            .groups
            .entry((topic.to_string(), identity.group.clone()))
            .or_insert_with(|| GroupState {
                position: log.next_seq,
                pending: BTreeMap::new(),
            });

        let mut batch = Vec::new();

        // Redeliver entries whose claim expired; forget ones trimmed away.
        let expired: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, delivered_at)| now.duration_since(**delivered_at) >= claim_timeout)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            if batch.len() >= limit {
                break;
            }
            match log.get(seq) {
                Some(message) => {
                    state.pending.insert(seq, now);
                    batch.push(BusEntry {
                        cursor: encode_cursor(seq),
                        message: message.clone(),
                    });
                }
                None => {
                    state.pending.remove(&seq);
                }
            }
        }

        // Deliver new entries from the group's position.
        let mut seq = state.position.max(log.first_seq().unwrap_or(log.next_seq));
        while batch.len() < limit && seq < log.next_seq {
            if let Some(message) = log.get(seq) {
                state.pending.insert(seq, now);
                batch.push(BusEntry {
                    cursor: encode_cursor(seq),
                    message: message.clone(),
                });
            }
            seq += 1;
        }
        state.position = state.position.max(seq);

        batch
    }

    fn take_tail_batch(inner: &Inner, topic: &str, start_seq: u64, limit: usize) -> Vec<BusEntry> {
        let Some(log) = inner.topics.get(topic) else {
            return Vec::new();
        };
        let first = log.first_seq().unwrap_or(log.next_seq);
        let mut batch = Vec::new();
        let mut seq = start_seq.max(first);
        while batch.len() < limit && seq < log.next_seq {
            if let Some(message) = log.get(seq) {
                batch.push(BusEntry {
                    cursor: encode_cursor(seq),
                    message: message.clone(),
                });
            }
            seq += 1;
        }
        batch
    }
}

impl Bus for MemoryBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a BusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<Cursor, BusError>> + Send + 'a>> {
        Box::pin(async move {
            let cursor = {
                let mut inner = self.lock();
                let log = inner.topics.entry(topic.to_string()).or_insert_with(TopicLog::new);
                let seq = log.next_seq;
                log.entries.push((seq, message.clone()));
                log.next_seq += 1;
                if let Some(max_len) = self.max_len {
                    while log.entries.len() > max_len {
                        log.entries.remove(0);
                    }
                }
                encode_cursor(seq)
            };
            self.shared.publish_notify.notify_waiters();
            tracing::trace!(topic = %topic, cursor = %cursor, id = %message.id, "Published entry");
            Ok(cursor)
        })
    }

    fn read<'a>(
        &'a self,
        topic: &'a str,
        last_cursor: Option<&'a Cursor>,
        limit: usize,
        block: Option<Duration>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<BusEntry>, BusError>> + Send + 'a>> {
        Box::pin(async move {
            if limit == 0 {
                return Ok(Vec::new());
            }
            let deadline = block.map(|wait| Instant::now() + wait);

            // Tail mode resolves its start position once: strictly after the
            // given cursor, or the end of the topic as of this call.
            let mut tail_start: Option<u64> = match last_cursor {
                Some(cursor) => Some(decode_cursor(topic, cursor)?.saturating_add(1)),
                None => None,
            };

            loop {
                let notified = self.shared.publish_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let batch = {
                    let mut inner = self.lock();
                    match &self.group {
                        Some(identity) => Self::take_group_batch(
                            &mut inner,
                            topic,
                            identity,
                            limit,
                            self.claim_timeout,
                            Instant::now(),
                        ),
                        None => {
                            let start = *tail_start.get_or_insert_with(|| {
                                inner
                                    .topics
                                    .get(topic)
                                    .map_or(1, |log| log.next_seq)
                            });
                            Self::take_tail_batch(&inner, topic, start, limit)
                        }
                    }
                };

                if !batch.is_empty() {
                    return Ok(batch);
                }

                let Some(deadline) = deadline else {
                    return Ok(Vec::new());
                };
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(Vec::new());
                }
            }
        })
    }

    fn ack<'a>(
        &'a self,
        topic: &'a str,
        cursor: &'a Cursor,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + 'a>> {
        Box::pin(async move {
            let Some(identity) = &self.group else {
                return Ok(());
            };
            let seq = decode_cursor(topic, cursor)?;
            let mut inner = self.lock();
            if let Some(state) = inner
                .groups
                .get_mut(&(topic.to_string(), identity.group.clone()))
            {
                state.pending.remove(&seq);
            }
            Ok(())
        })
    }

    fn probe(&self) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn earliest<'a>(
        &'a self,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Cursor>, BusError>> + Send + 'a>> {
        Box::pin(async move {
            let inner = self.lock();
            Ok(inner
                .topics
                .get(topic)
                .and_then(TopicLog::first_seq)
                .map(encode_cursor))
        })
    }

    fn latest<'a>(
        &'a self,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Cursor, BusError>> + Send + 'a>> {
        Box::pin(async move {
            let inner = self.lock();
            let seq = inner.topics.get(topic).map_or(0, |log| log.next_seq - 1);
            Ok(encode_cursor(seq))
        })
    }

    fn floor(&self) -> Cursor {
        encode_cursor(0)
    }

    fn compare(&self, a: &Cursor, b: &Cursor) -> Ordering {
        match (a.as_str().parse::<u64>(), b.as_str().parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => a.as_str().cmp(b.as_str()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn message(payload: &str) -> BusMessage {
        BusMessage::new(payload.to_string())
    }

    #[tokio::test]
    async fn read_returns_entries_in_append_order() {
        let bus = MemoryBus::new();
        let before = bus.publish("chat:c1", &message("a")).await.unwrap();
        bus.publish("chat:c1", &message("b")).await.unwrap();
        bus.publish("chat:c1", &message("c")).await.unwrap();

        let entries = bus.read("chat:c1", Some(&before), 10, None).await.unwrap();
        let payloads: Vec<_> = entries.iter().map(|e| e.message.payload.as_str()).collect();
        assert_eq!(payloads, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn cursors_are_strictly_increasing() {
        let bus = MemoryBus::new();
        let mut previous: Option<Cursor> = None;
        for i in 0..10 {
            let cursor = bus
                .publish("chat:c1", &message(&format!("m{i}")))
                .await
                .unwrap();
            if let Some(previous) = &previous {
                assert_eq!(bus.compare(previous, &cursor), Ordering::Less);
            }
            previous = Some(cursor);
        }
    }

    #[tokio::test]
    async fn tail_read_without_cursor_starts_from_the_end() {
        let bus = MemoryBus::new();
        bus.publish("chat:c1", &message("old")).await.unwrap();

        let entries = bus.read("chat:c1", None, 10, None).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn blocked_reader_wakes_on_publish() {
        let bus = MemoryBus::new();
        bus.publish("chat:c1", &message("old")).await.unwrap();

        let reader = bus.clone();
        let handle = tokio::spawn(async move {
            reader
                .read("chat:c1", None, 10, Some(Duration::from_secs(5)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("chat:c1", &message("fresh")).await.unwrap();

        let entries = handle.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message.payload, "fresh");
    }

    #[tokio::test]
    async fn blocked_reader_times_out_empty() {
        let bus = MemoryBus::new();
        let started = std::time::Instant::now();
        let entries = bus
            .read("chat:quiet", None, 10, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(entries.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn group_delivers_each_entry_once_until_claim_expires() {
        let bus = MemoryBus::new().with_claim_timeout(Duration::from_millis(40));
        let consumer = bus.with_group(GroupIdentity::new("workers", "w1"));

        // Register the group before publishing so the entry is in scope.
        assert!(consumer.read("chat:a", None, 10, None).await.unwrap().is_empty());
        bus.publish("chat:a", &message("job")).await.unwrap();

        let first = consumer.read("chat:a", None, 10, None).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(consumer.read("chat:a", None, 10, None).await.unwrap().is_empty());
        assert_eq!(consumer.pending_count("chat:a", "workers"), 1);

        // Unacked past the claim timeout: eligible again.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let redelivered = consumer.read("chat:a", None, 10, None).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].message.id, first[0].message.id);
        assert_eq!(redelivered[0].cursor, first[0].cursor);
    }

    #[tokio::test]
    async fn ack_clears_pending_and_stops_redelivery() {
        let bus = MemoryBus::new().with_claim_timeout(Duration::from_millis(20));
        let consumer = bus.with_group(GroupIdentity::new("workers", "w1"));

        assert!(consumer.read("chat:a", None, 10, None).await.unwrap().is_empty());
        bus.publish("chat:a", &message("job")).await.unwrap();

        let batch = consumer.read("chat:a", None, 10, None).await.unwrap();
        consumer.ack("chat:a", &batch[0].cursor).await.unwrap();
        assert_eq!(consumer.pending_count("chat:a", "workers"), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(consumer.read("chat:a", None, 10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tail_readers_fan_out_while_group_members_share() {
        let bus = MemoryBus::new();
        let observer_a = bus.clone();
        let observer_b = bus.clone();
        let worker = bus.with_group(GroupIdentity::new("workers", "w1"));

        assert!(worker.read("chat:a", None, 10, None).await.unwrap().is_empty());
        let before = bus.publish("chat:a", &message("seed")).await.unwrap();
        bus.publish("chat:a", &message("job")).await.unwrap();

        // Both tail readers see the entry; the group consumes it once.
        let seen_a = observer_a.read("chat:a", Some(&before), 10, None).await.unwrap();
        let seen_b = observer_b.read("chat:a", Some(&before), 10, None).await.unwrap();
        assert_eq!(seen_a.len(), 1);
        assert_eq!(seen_b.len(), 1);
        assert_eq!(worker.read("chat:a", None, 10, None).await.unwrap().len(), 1);
        assert!(worker.read("chat:a", None, 10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn max_len_trims_oldest_and_moves_earliest() {
        let bus = MemoryBus::new().with_max_len(2);
        bus.publish("chat:a", &message("m1")).await.unwrap();
        let second = bus.publish("chat:a", &message("m2")).await.unwrap();
        bus.publish("chat:a", &message("m3")).await.unwrap();

        let earliest = bus.earliest("chat:a").await.unwrap().unwrap();
        assert_eq!(earliest, second);

        // Reading from a trimmed cursor starts at the earliest retained entry.
        let from_start = bus
            .read("chat:a", Some(&Cursor::from("0")), 10, None)
            .await
            .unwrap();
        let payloads: Vec<_> = from_start.iter().map(|e| e.message.payload.as_str()).collect();
        assert_eq!(payloads, vec!["m2", "m3"]);
    }

    #[tokio::test]
    async fn malformed_cursor_is_invalid() {
        let bus = MemoryBus::new();
        let result = bus
            .read("chat:a", Some(&Cursor::from("not-a-cursor")), 10, None)
            .await;
        assert!(matches!(result, Err(BusError::InvalidCursor { .. })));
    }

    #[tokio::test]
    async fn duplicate_ids_are_recognizable() {
        let bus = MemoryBus::new();
        let id = uuid::Uuid::new_v4();
        let start = bus.publish("chat:a", &message("seed")).await.unwrap();
        bus.publish("chat:a", &BusMessage::with_id(id, "once".to_string()))
            .await
            .unwrap();
        bus.publish("chat:a", &BusMessage::with_id(id, "again".to_string()))
            .await
            .unwrap();

        let entries = bus.read("chat:a", Some(&start), 10, None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message.id, entries[1].message.id);
    }
}
