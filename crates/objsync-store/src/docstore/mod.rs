//! Document store over logical collections.
//!
//! The trait is the seam between the storage core and the persistence
//! backend. Filters and mutations are BSON documents using the subset of
//! the MongoDB query language both backends understand: top-level field
//! equality on dotted paths, `$or` / `$and`, `$ne` / `$lte` / `$gte`
//! conditions, and `$set` / `$inc` / `$currentDate` mutations.
//!
//! `$currentDate` with `{"$type": "timestamp"}` stamps the field with a
//! monotonically increasing server-side timestamp; the core uses that
//! value as its optimistic-concurrency token.

pub mod collections;
mod memory;
mod mongo;
mod query;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

use bson::Document;
use chrono::{DateTime, Utc};
use objsync_common::Result;

/// Backend-agnostic access to the persisted collections
pub trait DocStore: Send + Sync {
    /// Insert a document; `Duplicate` if the primary key already exists
    fn insert(&self, coll: &str, doc: Document) -> Result<()>;

    /// Replace the first document matching `filter`, inserting if none does
    fn upsert(&self, coll: &str, filter: Document, doc: Document) -> Result<()>;

    /// Apply a mutation to the first document matching `filter`;
    /// `NotFound` if the filter matches nothing
    fn update(&self, coll: &str, filter: Document, update: Document) -> Result<()>;

    /// Fetch the first document matching `filter`; `NotFound` if absent.
    /// `projection` is a fetch-size optimization a backend may ignore.
    fn fetch_one(
        &self,
        coll: &str,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Document>;

    /// Fetch every document matching `filter`
    fn fetch_all(
        &self,
        coll: &str,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Vec<Document>>;

    /// Delete every document matching `filter`; missing documents are not
    /// an error
    fn remove_all(&self, coll: &str, filter: Document) -> Result<()>;

    /// Clock of the machine holding the data, used to decide lease expiry
    /// without trusting the local clock
    fn server_time(&self) -> Result<DateTime<Utc>>;
}
