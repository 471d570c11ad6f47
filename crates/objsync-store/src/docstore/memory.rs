//! In-memory document store.
//!
//! Backs tests and single-process deployments. Collections are plain
//! vectors of BSON documents; the optimistic-concurrency token is a
//! process-wide monotonic timestamp sequence. Projections are ignored,
//! they only reduce fetch sizes on a real backend.

use super::query::{apply_update, matches};
use super::DocStore;
use bson::{Document, Timestamp};
use chrono::{DateTime, Utc};
use objsync_common::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Document store held entirely in process memory
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    sequence: AtomicU32,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next value of the token sequence. Seconds-granularity wall clock
    /// plus a strictly increasing counter keeps tokens unique and ordered.
    fn next_timestamp(&self) -> Timestamp {
        Timestamp {
            time: u32::try_from(Utc::now().timestamp()).unwrap_or(u32::MAX),
            increment: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }
}

impl DocStore for MemoryStore {
    fn insert(&self, coll: &str, doc: Document) -> Result<()> {
        let mut collections = self.collections.write();
        let docs = collections.entry(coll.to_string()).or_default();
        if let Some(id) = doc.get("_id") {
            if docs.iter().any(|d| d.get("_id") == Some(id)) {
                return Err(Error::Duplicate);
            }
        }
        docs.push(doc);
        Ok(())
    }

    fn upsert(&self, coll: &str, filter: Document, doc: Document) -> Result<()> {
        let mut collections = self.collections.write();
        let docs = collections.entry(coll.to_string()).or_default();
        match docs.iter_mut().find(|d| matches(d, &filter)) {
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
        Ok(())
    }

    fn update(&self, coll: &str, filter: Document, update: Document) -> Result<()> {
        let now = self.next_timestamp();
        let mut collections = self.collections.write();
        let docs = collections.entry(coll.to_string()).or_default();
        let Some(doc) = docs.iter_mut().find(|d| matches(d, &filter)) else {
            return Err(Error::NotFound);
        };
        apply_update(doc, &update, now)
    }

    fn fetch_one(
        &self,
        coll: &str,
        filter: Document,
        _projection: Option<Document>,
    ) -> Result<Document> {
        let collections = self.collections.read();
        collections
            .get(coll)
            .and_then(|docs| docs.iter().find(|d| matches(d, &filter)))
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn fetch_all(
        &self,
        coll: &str,
        filter: Document,
        _projection: Option<Document>,
    ) -> Result<Vec<Document>> {
        let collections = self.collections.read();
        Ok(collections
            .get(coll)
            .map(|docs| {
                docs.iter()
                    .filter(|d| matches(d, &filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn remove_all(&self, coll: &str, filter: Document) -> Result<()> {
        let mut collections = self.collections.write();
        if let Some(docs) = collections.get_mut(coll) {
            docs.retain(|d| !matches(d, &filter));
        }
        Ok(())
    }

    fn server_time(&self) -> Result<DateTime<Utc>> {
        Ok(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, Bson};

    #[test]
    fn test_insert_and_duplicate() {
        let store = MemoryStore::new();
        store
            .insert("leader", doc! {"_id": 1, "uuid": "a"})
            .unwrap();
        let err = store
            .insert("leader", doc! {"_id": 1, "uuid": "b"})
            .unwrap_err();
        assert!(err.is_duplicate());
    }

    #[test]
    fn test_upsert_replaces_matching_document() {
        let store = MemoryStore::new();
        store
            .upsert("objects", doc! {"_id": "k"}, doc! {"_id": "k", "status": "notReadyToSend"})
            .unwrap();
        store
            .upsert("objects", doc! {"_id": "k"}, doc! {"_id": "k", "status": "readyToSend"})
            .unwrap();
        let all = store.fetch_all("objects", doc! {}, None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].get_str("status").unwrap(), "readyToSend");
    }

    #[test]
    fn test_update_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update("objects", doc! {"_id": "missing"}, doc! {"$set": {"status": "x"}})
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_tokens_are_monotonic() {
        let store = MemoryStore::new();
        store
            .insert("objects", doc! {"_id": "k", "last-update": Timestamp { time: 0, increment: 0 }})
            .unwrap();
        let mut previous = Timestamp { time: 0, increment: 0 };
        for _ in 0..5 {
            store
                .update(
                    "objects",
                    doc! {"_id": "k"},
                    doc! {"$currentDate": {"last-update": {"$type": "timestamp"}}},
                )
                .unwrap();
            let doc = store.fetch_one("objects", doc! {"_id": "k"}, None).unwrap();
            let Some(Bson::Timestamp(current)) = doc.get("last-update").cloned() else {
                panic!("token missing");
            };
            assert!((current.time, current.increment) > (previous.time, previous.increment));
            previous = current;
        }
    }

    #[test]
    fn test_stale_token_misses() {
        let store = MemoryStore::new();
        let zero = Timestamp { time: 0, increment: 0 };
        store
            .insert("objects", doc! {"_id": "k", "last-update": zero})
            .unwrap();
        store
            .update(
                "objects",
                doc! {"_id": "k", "last-update": zero},
                doc! {"$currentDate": {"last-update": {"$type": "timestamp"}}},
            )
            .unwrap();
        // the token moved; the same precondition now fails
        let err = store
            .update(
                "objects",
                doc! {"_id": "k", "last-update": zero},
                doc! {"$set": {"status": "x"}},
            )
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
