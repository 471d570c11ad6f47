//! Objsync Store - the object-sync storage core
//!
//! This crate implements the persistent state engine of the sync service:
//! - Document store over logical collections (MongoDB or in-memory)
//! - Chunked payload store (files on disk or blobs in the database)
//! - Object lifecycle engine: status transitions, per-destination delivery
//!   state, consumer/receiver counters, chunked-upload reassembly
//! - Notification records with resend timing
//! - Lease-based leader election with version-guarded takeover
//! - Background maintenance scan (activation, expiration, pruning)

pub mod acls;
pub mod auth;
pub mod destinations;
pub mod docstore;
pub mod documents;
pub mod leader;
pub mod maintenance;
pub mod notifications;
pub mod objects;
pub mod organizations;
pub mod payload;
pub mod store;
pub mod webhooks;

// Re-exports
pub use auth::{AppKeyIdentity, DummyAuthenticator};
pub use docstore::{collections, DocStore, MemoryStore, MongoStore};
pub use payload::{FileStore, GridStore, PayloadStore};
pub use store::SyncStore;
