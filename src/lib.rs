//! # WeaveSync
//!
//! A real-time collaborative document synchronization kernel for a
//! block-structured rich-text editor backed by a CRDT.
//!
//! ## Architecture
//!
//! - `encoding`: byte ↔ text transcoding for text-framed transports
//! - `policy`: typed policy manifests, deterministic hashing, and negotiation
//! - `storage`: abstract durable storage for snapshots and the update log
//! - `compaction`: compaction policy and snapshot+tail recovery
//! - `protocol`: the wire envelope, message taxonomy, and validators
//! - `sync`: the client and server state machines (the "kernel")
//! - `ratelimit`: token-bucket rate limiting keyed by client
//! - `audit`: the append-only operation log
//! - `observability`: metrics registry and correlated logging context
//!
//! The CRDT itself, the editor view layer, and application-level auth/HTTP
//! surfaces are deliberately out of scope: this crate orders, persists,
//! forwards, and replays opaque update bytes produced elsewhere.

#![warn(missing_docs)]

/// Byte/text transcoding for text-framed transports.
pub mod encoding;

/// Typed policy manifests, hashing, and negotiation.
pub mod policy;

/// Durable storage abstraction and implementations.
pub mod storage;

/// Compaction policy and recovery.
pub mod compaction;

/// Wire protocol: envelopes, messages, validation.
pub mod protocol;

/// The sync kernel: client and server state machines.
pub mod sync;

/// Token-bucket rate limiting.
pub mod ratelimit;

/// Append-only operation log.
pub mod audit;

/// Metrics and correlated logging.
pub mod observability;

/// Crate-wide error type composing every module's local error.
pub mod error;

pub use error::{WeaveError, WeaveResult};

/// The protocol version string every envelope must carry.
pub const PROTOCOL_VERSION: &str = "weave-sync/1";
