//! The storage facade.
//!
//! `SyncStore` ties the document store, the payload store and the
//! process-local upload state together. The operation groups live in
//! sibling modules (`objects`, `notifications`, `leader`, ...) as further
//! `impl SyncStore` blocks.

use crate::docstore::{DocStore, MemoryStore, MongoStore};
use crate::payload::{FileStore, GridStore, PayloadStore};
use bson::Document;
use objsync_common::{Config, Error, PayloadBackend, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use uuid::Uuid;

/// Optimistic read-modify-write loops give up after this many conflicts
pub(crate) const MAX_UPDATE_TRIES: usize = 5;

/// The storage core of a sync-service node
#[derive(Clone)]
pub struct SyncStore {
    pub(crate) inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    pub(crate) docs: Arc<dyn DocStore>,
    pub(crate) payloads: Arc<dyn PayloadStore>,
    /// Open chunked-upload handles, keyed by object key. The lock guards
    /// only map lookups; it is never held across backend I/O.
    pub(crate) uploads: Mutex<HashMap<String, UploadHandle>>,
    /// Identity of this node in the leader lease
    pub(crate) node_id: String,
    pub(crate) is_leader: AtomicBool,
    pub(crate) connected: AtomicBool,
    pub(crate) shutdown: AtomicBool,
    pub(crate) maintenance: Mutex<Option<JoinHandle<()>>>,
    pub(crate) resend_interval_secs: i64,
    pub(crate) leadership_timeout_secs: i32,
    pub(crate) maintenance_interval_secs: u64,
}

/// Reassembly state of one in-flight chunked upload
pub(crate) struct UploadHandle {
    /// Next sequential byte offset of the staging blob
    pub(crate) offset: i64,
    /// Whether any bytes reached the payload backend yet
    pub(crate) started: bool,
    /// Out-of-order chunks keyed by their byte offset
    pub(crate) chunks: HashMap<i64, Vec<u8>>,
}

impl UploadHandle {
    pub(crate) fn new() -> Self {
        Self {
            offset: 0,
            started: false,
            chunks: HashMap::new(),
        }
    }
}

impl SyncStore {
    /// Connect to the configured backends and start the maintenance loop
    pub fn open(config: &Config) -> Result<Self> {
        let docs: Arc<dyn DocStore> = Arc::new(MongoStore::connect(
            &config.mongo,
            &config.storage.persistence_root_path,
        )?);
        let payloads: Arc<dyn PayloadStore> = match config.storage.payload_backend {
            PayloadBackend::File => Arc::new(FileStore::new(
                config.storage.persistence_root_path.join("sync/objects"),
            )?),
            PayloadBackend::Database => Arc::new(GridStore::new(Arc::clone(&docs))),
        };
        let store = Self::with_backends(docs, payloads, config);
        store.inner.connected.store(true, Ordering::Relaxed);
        store.start_maintenance();
        Ok(store)
    }

    /// Assemble a store over explicit backends without starting the
    /// maintenance loop; used by embedders and tests that drive the
    /// maintenance steps themselves
    #[must_use]
    pub fn with_backends(
        docs: Arc<dyn DocStore>,
        payloads: Arc<dyn PayloadStore>,
        config: &Config,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                docs,
                payloads,
                uploads: Mutex::new(HashMap::new()),
                node_id: Uuid::new_v4().to_string(),
                is_leader: AtomicBool::new(false),
                connected: AtomicBool::new(true),
                shutdown: AtomicBool::new(false),
                maintenance: Mutex::new(None),
                resend_interval_secs: config.resend_interval_secs,
                leadership_timeout_secs: config.leadership_timeout_secs,
                maintenance_interval_secs: config.storage.maintenance_interval_secs,
            }),
        }
    }

    /// An in-memory store for tests and single-process embedding
    #[must_use]
    pub fn in_memory(config: &Config) -> Self {
        let docs: Arc<dyn DocStore> = Arc::new(MemoryStore::new());
        let payloads: Arc<dyn PayloadStore> = Arc::new(GridStore::new(Arc::clone(&docs)));
        Self::with_backends(docs, payloads, config)
    }

    /// Stop the maintenance loop and release the backends
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.inner.maintenance.lock().take() {
            let _ = handle.join();
        }
        self.inner.connected.store(false, Ordering::Relaxed);
    }

    /// Whether the persistence backend was reachable at the last check
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    /// Identity this node uses in the leader lease
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub(crate) fn docs(&self) -> &dyn DocStore {
        self.inner.docs.as_ref()
    }

    pub(crate) fn payloads(&self) -> &dyn PayloadStore {
        self.inner.payloads.as_ref()
    }

    /// Take the upload handle for `key` out of the map, if present
    pub(crate) fn take_upload(&self, key: &str) -> Option<UploadHandle> {
        self.inner.uploads.lock().remove(key)
    }

    /// Put an upload handle back into the map
    pub(crate) fn put_upload(&self, key: String, handle: UploadHandle) {
        self.inner.uploads.lock().insert(key, handle);
    }

    #[cfg(test)]
    pub(crate) fn has_upload(&self, key: &str) -> bool {
        self.inner.uploads.lock().contains_key(key)
    }

    /// Typed fetch helper: deserialize the first document matching `filter`
    pub(crate) fn fetch_typed<T: serde::de::DeserializeOwned>(
        &self,
        coll: &str,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<T> {
        let doc = self.docs().fetch_one(coll, filter, projection)?;
        Ok(bson::from_document(doc)?)
    }

    /// Typed fetch helper for collections scans
    pub(crate) fn fetch_all_typed<T: serde::de::DeserializeOwned>(
        &self,
        coll: &str,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Vec<T>> {
        let docs = self.docs().fetch_all(coll, filter, projection)?;
        docs.into_iter()
            .map(|doc| bson::from_document(doc).map_err(Error::from))
            .collect()
    }
}
