//! Replication Publisher and Subscriber/Applier.
//!
//! Generalizes `src/replication.rs`'s `Replicator` — which published JSON
//! `ReplicationMessage`s over one flat topic — into a publisher that
//! allocates monotonic `seq` and falls back to the Offline Queue, and a
//! subscriber that decodes, validates, dedups, and tracks per-peer
//! watermarks.

mod publisher;
mod subscriber;

pub use publisher::Publisher;
pub use subscriber::Subscriber;
