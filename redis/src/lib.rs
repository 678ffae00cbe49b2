//! Redis Streams bus implementation for Agent Mesh.
//!
//! This crate provides the production [`Bus`] backend: an append-only
//! log-structured store with consumer groups, built on Redis Streams
//! (`XADD`/`XREADGROUP`/`XACK` and friends).
//!
//! # Mapping onto Streams
//!
//! | Bus operation | Redis primitive |
//! |---|---|
//! | `publish` | `XADD` (with `MAXLEN ~` trimming when capped) |
//! | `read` (tail) | `XREAD` from an anchored cursor |
//! | `read` (group) | `XPENDING`+`XCLAIM` sweep, then `XREADGROUP .. >` |
//! | `ack` | `XACK` |
//! | `probe` | `PING` |
//! | `earliest` / `latest` | `XRANGE` / `XREVRANGE` with `COUNT 1` |
//!
//! Blocking reads are emulated with short non-blocking polls: `XREAD BLOCK`
//! would monopolize the shared multiplexed connection, and the poll keeps
//! every reader isolated at the cost of ≤50ms extra latency.
//!
//! Each entry stores two fields: `id` (the canonical UUID, for reader-side
//! de-duplication) and `payload` (the JSON-encoded envelope or stream event).
//! Cursors are the stream entry ids Redis assigns (`<ms>-<seq>`); they stay
//! opaque to callers and are ordered by [`Bus::compare`].
//!
//! # Delivery semantics
//!
//! At-least-once. Group reads deliver each entry to one consumer; entries
//! unacknowledged past the claim timeout are swept back in via `XCLAIM` on a
//! later read. The bus never retries internally: `publish` fails fast with
//! `BusError::Unavailable`, transient read errors degrade to empty batches so
//! the caller's poll loop stays in charge.
//!
//! # Example
//!
//! ```no_run
//! use agent_mesh_core::{Bus, BusMessage, GroupIdentity};
//! use agent_mesh_redis::RedisBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedisBus::builder()
//!     .url("redis://127.0.0.1:6379")
//!     .group(GroupIdentity::new("planner", "worker-1"))
//!     .build()
//!     .await?;
//!
//! bus.publish("chat:planner", &BusMessage::new("{}".to_string())).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use agent_mesh_core::bus::{Bus, BusEntry, BusError, BusMessage, Cursor, GroupIdentity};
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, RedisError};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// Default connect timeout for the initial backend handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default claim timeout before unacknowledged entries are redelivered.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(30);

/// Default approximate per-topic retention cap (`XADD MAXLEN ~`).
pub const DEFAULT_MAX_LEN: usize = 10_000;

/// Pause between non-blocking polls while emulating a blocking read.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Redis Streams [`Bus`] implementation.
///
/// Construction is the only place group identity enters: a bus built with
/// [`RedisBusBuilder::group`] reads via `XREADGROUP` and must `ack`; one
/// built without tail-reads via `XREAD` and fans entries out to every
/// reader.
pub struct RedisBus {
    manager: ConnectionManager,
    group: Option<GroupIdentity>,
    claim_timeout: Duration,
    max_len: Option<usize>,
    /// Topics whose consumer group has been ensured with `XGROUP CREATE`.
    ensured_groups: Mutex<HashSet<String>>,
}

impl RedisBus {
    /// Create a builder for configuring the bus.
    #[must_use]
    pub fn builder() -> RedisBusBuilder {
        RedisBusBuilder::default()
    }

    /// Connect with defaults (tail mode, default trimming).
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Unavailable`] if the backend cannot be reached
    /// within the connect timeout.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        Self::builder().url(url).build().await
    }

    fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Ensure the consumer group exists on a topic, tolerating the group
    /// already being there (`BUSYGROUP`).
    async fn ensure_group(&self, topic: &str, identity: &GroupIdentity) -> Result<(), BusError> {
        {
            let ensured = self
                .ensured_groups
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if ensured.contains(topic) {
                return Ok(());
            }
        }

        let mut conn = self.connection();
        let created: Result<String, RedisError> = conn
            .xgroup_create_mkstream(topic, &identity.group, "$")
            .await;
        match created {
            Ok(_) => {
                tracing::debug!(topic = %topic, group = %identity.group, "Created consumer group");
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {}
            Err(e) => return Err(unavailable(&e)),
        }

        self.ensured_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string());
        Ok(())
    }

    /// Sweep entries whose claim expired back to this consumer.
    async fn claim_expired(
        &self,
        topic: &str,
        identity: &GroupIdentity,
        limit: usize,
    ) -> Result<Vec<BusEntry>, BusError> {
        let mut conn = self.connection();
        let pending: StreamPendingCountReply = conn
            .xpending_count(topic, &identity.group, "-", "+", limit)
            .await
            .map_err(|e| unavailable(&e))?;
        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = pending.ids.into_iter().map(|p| p.id).collect();
        let min_idle_ms = usize::try_from(self.claim_timeout.as_millis()).unwrap_or(usize::MAX);
        // XCLAIM only hands over entries idle at least min_idle_ms; recently
        // delivered ones stay with their current consumer.
        let claimed: StreamClaimReply = conn
            .xclaim(topic, &identity.group, &identity.consumer, min_idle_ms, &ids)
            .await
            .map_err(|e| unavailable(&e))?;

        let entries: Vec<BusEntry> = claimed.ids.iter().filter_map(decode_stream_id).collect();
        if !entries.is_empty() {
            tracing::debug!(
                topic = %topic,
                group = %identity.group,
                count = entries.len(),
                "Redelivering entries past claim timeout"
            );
        }
        Ok(entries)
    }

    /// One non-blocking group read: claim sweep, then `XREADGROUP .. >`.
    async fn read_group_once(
        &self,
        topic: &str,
        identity: &GroupIdentity,
        limit: usize,
    ) -> Result<Vec<BusEntry>, BusError> {
        self.ensure_group(topic, identity).await?;

        let mut batch = self.claim_expired(topic, identity, limit).await?;
        if batch.len() >= limit {
            return Ok(batch);
        }

        let options = StreamReadOptions::default()
            .group(&identity.group, &identity.consumer)
            .count(limit - batch.len());

        let mut conn = self.connection();
        let reply: StreamReadReply = conn
            .xread_options(&[topic], &[">"], &options)
            .await
            .map_err(|e| unavailable(&e))?;

        for key in reply.keys {
            for id in &key.ids {
                if let Some(entry) = decode_stream_id(id) {
                    batch.push(entry);
                }
            }
        }
        Ok(batch)
    }

    /// One non-blocking tail read strictly after `start`.
    async fn read_tail_once(
        &self,
        topic: &str,
        start: &str,
        limit: usize,
    ) -> Result<Vec<BusEntry>, BusError> {
        let options = StreamReadOptions::default().count(limit);

        let mut conn = self.connection();
        let reply: Result<StreamReadReply, RedisError> =
            conn.xread_options(&[topic], &[start], &options).await;
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) if is_invalid_stream_id(&e) => {
                return Err(BusError::InvalidCursor {
                    topic: topic.to_string(),
                    cursor: start.to_string(),
                });
            }
            Err(e) => return Err(unavailable(&e)),
        };

        let mut batch = Vec::new();
        for key in reply.keys {
            for id in &key.ids {
                if let Some(entry) = decode_stream_id(id) {
                    batch.push(entry);
                }
            }
        }
        Ok(batch)
    }
}

impl Bus for RedisBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a BusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<Cursor, BusError>> + Send + 'a>> {
        Box::pin(async move {
            let mut conn = self.connection();
            let fields = [
                ("id", message.id.to_string()),
                ("payload", message.payload.clone()),
            ];
            let appended: Result<String, RedisError> = match self.max_len {
                Some(max_len) => {
                    conn.xadd_maxlen(topic, StreamMaxlen::Approx(max_len), "*", &fields)
                        .await
                }
                None => conn.xadd(topic, "*", &fields).await,
            };
            // Fail fast on transport errors; retry policy lives with the caller.
            let id = appended.map_err(|e| {
                tracing::error!(topic = %topic, error = %e, "Failed to append entry");
                unavailable(&e)
            })?;
            tracing::trace!(topic = %topic, cursor = %id, id = %message.id, "Published entry");
            Ok(Cursor::from(id))
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

            // A tail read without a cursor anchors at the current end so
            // entries cannot slip between polls.
            let tail_start = match (&self.group, last_cursor) {
                (Some(_), _) => None,
                (None, Some(cursor)) => Some(cursor.as_str().to_string()),
                (None, None) => Some(self.latest(topic).await?.as_str().to_string()),
            };

            // `XREAD BLOCK` would stall the shared multiplexed connection, so
            // blocking is emulated with short non-blocking polls.
            let deadline = block.map(|wait| tokio::time::Instant::now() + wait);
            loop {
                let result = match (&self.group, &tail_start) {
                    (Some(identity), _) => self.read_group_once(topic, identity, limit).await,
                    (None, Some(start)) => self.read_tail_once(topic, start, limit).await,
                    (None, None) => Ok(Vec::new()),
                };

                let batch = match result {
                    Ok(batch) => batch,
                    Err(BusError::InvalidCursor { topic, cursor }) => {
                        return Err(BusError::InvalidCursor { topic, cursor });
                    }
                    Err(BusError::Unavailable(reason)) => {
                        // Transient read errors degrade to an empty batch;
                        // the caller's poll loop decides when to give up.
                        tracing::warn!(topic = %topic, error = %reason, "Read failed; returning empty batch");
                        return Ok(Vec::new());
                    }
                };

                if !batch.is_empty() {
                    return Ok(batch);
                }
                let Some(deadline) = deadline else {
                    return Ok(Vec::new());
                };
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return Ok(Vec::new());
                }
                tokio::time::sleep((deadline - now).min(POLL_INTERVAL)).await;
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
            let mut conn = self.connection();
            let _acked: i64 = conn
                .xack(topic, &identity.group, &[cursor.as_str()])
                .await
                .map_err(|e| unavailable(&e))?;
            Ok(())
        })
    }

    fn probe(&self) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.connection();
            let pong: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| unavailable(&e))?;
            if pong == "PONG" {
                Ok(())
            } else {
                Err(BusError::Unavailable(format!("unexpected PING reply: {pong}")))
            }
        })
    }

    fn earliest<'a>(
        &'a self,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Cursor>, BusError>> + Send + 'a>> {
        Box::pin(async move {
            let mut conn = self.connection();
            let reply: redis::streams::StreamRangeReply = conn
                .xrange_count(topic, "-", "+", 1)
                .await
                .map_err(|e| unavailable(&e))?;
            Ok(reply.ids.first().map(|id| Cursor::from(id.id.clone())))
        })
    }

    fn latest<'a>(
        &'a self,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Cursor, BusError>> + Send + 'a>> {
        Box::pin(async move {
            let mut conn = self.connection();
            let reply: redis::streams::StreamRangeReply = conn
                .xrevrange_count(topic, "+", "-", 1)
                .await
                .map_err(|e| unavailable(&e))?;
            Ok(reply
                .ids
                .first()
                .map_or_else(|| Cursor::from("0-0"), |id| Cursor::from(id.id.clone())))
        })
    }

    fn floor(&self) -> Cursor {
        Cursor::from("0-0")
    }

    fn compare(&self, a: &Cursor, b: &Cursor) -> Ordering {
        match (parse_stream_id(a.as_str()), parse_stream_id(b.as_str())) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => a.as_str().cmp(b.as_str()),
        }
    }
}

/// Builder for configuring a [`RedisBus`].
///
/// # Example
///
/// ```no_run
/// use agent_mesh_redis::RedisBus;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedisBus::builder()
///     .url("redis://127.0.0.1:6379")
///     .claim_timeout(Duration::from_secs(60))
///     .max_len(50_000)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct RedisBusBuilder {
    url: Option<String>,
    group: Option<GroupIdentity>,
    claim_timeout: Duration,
    max_len: Option<usize>,
    connect_timeout: Duration,
}

impl Default for RedisBusBuilder {
    fn default() -> Self {
        Self {
            url: None,
            group: None,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
            max_len: Some(DEFAULT_MAX_LEN),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl RedisBusBuilder {
    /// Backend endpoint, e.g. `redis://127.0.0.1:6379`.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Read in consumer-group mode with this identity.
    ///
    /// Use a stable group name (one group per agent name) and a unique
    /// consumer name (one per process).
    #[must_use]
    pub fn group(mut self, identity: GroupIdentity) -> Self {
        self.group = Some(identity);
        self
    }

    /// Idle time after which unacknowledged entries are redelivered
    /// (default 30s).
    #[must_use]
    pub const fn claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    /// Approximate per-topic retention cap (default 10 000 entries).
    #[must_use]
    pub const fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Retain topics without trimming.
    #[must_use]
    pub const fn unbounded(mut self) -> Self {
        self.max_len = None;
        self
    }

    /// Timeout for the initial backend handshake (default 5s).
    #[must_use]
    pub const fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Connect and build the bus.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Unavailable`] if the url is missing or malformed,
    /// or the backend does not answer within the connect timeout.
    pub async fn build(self) -> Result<RedisBus, BusError> {
        let url = self
            .url
            .ok_or_else(|| BusError::Unavailable("Bus url not configured".to_string()))?;

        let client = redis::Client::open(url.as_str())
            .map_err(|e| BusError::Unavailable(format!("Invalid bus url: {e}")))?;

        let manager = tokio::time::timeout(self.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                BusError::Unavailable(format!(
                    "Connect timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| unavailable(&e))?;

        tracing::info!(
            url = %url,
            group = ?self.group,
            claim_timeout = ?self.claim_timeout,
            max_len = ?self.max_len,
            "RedisBus connected"
        );

        Ok(RedisBus {
            manager,
            group: self.group,
            claim_timeout: self.claim_timeout,
            max_len: self.max_len,
            ensured_groups: Mutex::new(HashSet::new()),
        })
    }
}

fn unavailable(err: &RedisError) -> BusError {
    BusError::Unavailable(err.to_string())
}

fn is_invalid_stream_id(err: &RedisError) -> bool {
    err.to_string().contains("Invalid stream ID")
}

/// Split a `<ms>-<seq>` stream id into its numeric parts.
fn parse_stream_id(raw: &str) -> Option<(u64, u64)> {
    let (ms, seq) = raw.split_once('-')?;
    Some((ms.parse().ok()?, seq.parse().ok()?))
}

/// Decode one stream entry into a [`BusEntry`].
///
/// Entries missing the `id`/`payload` fields (foreign writers, manual XADDs)
/// are protocol errors: logged and skipped, never fatal to the reader.
fn decode_stream_id(id: &StreamId) -> Option<BusEntry> {
    let payload: Option<String> = id.get("payload");
    let canonical: Option<String> = id.get("id");
    let (Some(payload), Some(canonical)) = (payload, canonical) else {
        tracing::warn!(cursor = %id.id, "Skipping malformed stream entry");
        return None;
    };
    let canonical = match Uuid::parse_str(&canonical) {
        Ok(uuid) => uuid,
        Err(e) => {
            tracing::warn!(cursor = %id.id, error = %e, "Skipping entry with malformed id");
            return None;
        }
    };
    Some(BusEntry {
        cursor: Cursor::from(id.id.clone()),
        message: BusMessage::with_id(canonical, payload),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_a_url() {
        let result = tokio_test::block_on(RedisBus::builder().build());
        assert!(matches!(result, Err(BusError::Unavailable(_))));
    }

    #[test]
    fn stream_ids_order_numerically_not_lexically() {
        assert_eq!(parse_stream_id("9-0"), Some((9, 0)));
        assert!(parse_stream_id("9-0") < parse_stream_id("10-0"));
        assert!(parse_stream_id("10-2") < parse_stream_id("10-10"));
        assert_eq!(parse_stream_id("not-an-id"), None);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let id = StreamId {
            id: "1-1".to_string(),
            map: std::collections::HashMap::new(),
        };
        assert!(decode_stream_id(&id).is_none());
    }

    #[test]
    fn redis_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedisBus>();
        assert_sync::<RedisBus>();
    }
}
