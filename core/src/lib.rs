//! # Agent Mesh Core
//!
//! Frozen wire shapes and the bus abstraction for the Agent Mesh runtime.
//!
//! The runtime is a message-passing pipeline: envelopes enter on inbound
//! topics, workers run them, and fine-grained events fan out on egress
//! topics. This crate owns the pieces every other crate agrees on:
//!
//! - [`envelope`] - the immutable [`Envelope`](envelope::Envelope) record and
//!   its `user:`/`agent:`/`chat:` addressing
//! - [`event`] - the [`StreamEvent`](event::StreamEvent) tagged sum emitted
//!   during runs
//! - [`topic`] - the uniform topic namespace
//! - [`bus`] - the [`Bus`](bus::Bus) trait: ordered, at-least-once,
//!   cursor-addressed topics with optional consumer groups
//! - [`memory_bus`] - the in-process backend for single-process mode and
//!   tests; the Redis Streams backend lives in `agent-mesh-redis`
//!
//! Nothing here is mutable in place: envelopes and events are created once,
//! bus entries are append-only, and cursors are opaque handles ordered by
//! the bus that issued them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod envelope;
pub mod event;
pub mod memory_bus;
pub mod topic;

pub use bus::{Bus, BusEntry, BusError, BusMessage, Cursor, GroupIdentity};
pub use envelope::{Envelope, EnvelopeError, EnvelopeKind, Recipient, Sender};
pub use event::{EventError, LogLevel, StreamEvent};
pub use memory_bus::MemoryBus;
