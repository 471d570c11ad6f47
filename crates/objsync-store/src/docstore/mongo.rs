//! MongoDB document store.
//!
//! Production backend. Documents pass through unchanged; `$currentDate`
//! tokens come from the cluster time. Connecting retries within the
//! configured budget but gives up immediately on authentication failures.

use super::{collections, DocStore};
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    ClientOptions, Credential, FindOneOptions, FindOptions, ReplaceOptions, ServerAddress, Tls,
    TlsOptions,
};
use mongodb::sync::{Client, Collection};
use mongodb::IndexModel;
use objsync_common::{Error, MongoConfig, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(20);
const DIAL_RETRY_PAUSE: Duration = Duration::from_secs(10);

/// Document store backed by a MongoDB deployment
pub struct MongoStore {
    client: Client,
    db_name: String,
}

impl MongoStore {
    /// Connect to the configured deployment, create the secondary indexes
    /// and verify reachability with a ping loop bounded by
    /// `connect_timeout_secs`.
    pub fn connect(config: &MongoConfig, persistence_root: &Path) -> Result<Self> {
        let hosts = config
            .address_csv
            .split(',')
            .map(|addr| {
                ServerAddress::parse(addr.trim())
                    .map_err(|e| Error::storage(format!("bad database address {addr}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut options = ClientOptions::builder().hosts(hosts).build();
        options.connect_timeout = Some(DIAL_TIMEOUT);
        options.server_selection_timeout = Some(DIAL_TIMEOUT);
        if config.session_cache_size > 1 {
            options.max_pool_size = Some(config.session_cache_size);
        }
        if !config.username.is_empty() {
            let mut credential = Credential::default();
            credential.username = Some(config.username.clone());
            credential.password = Some(config.password.clone());
            credential.source = Some(config.auth_db_name.clone());
            options.credential = Some(credential);
        }
        if config.use_ssl {
            let mut tls = TlsOptions::default();
            tls.ca_file_path = resolve_ca_path(config, persistence_root)?;
            if config.allow_invalid_certificates {
                tls.allow_invalid_certificates = Some(true);
            }
            options.tls = Some(Tls::Enabled(tls));
        }

        let client = Client::with_options(options)
            .map_err(|e| Error::Unavailable(format!("failed to build database client: {e}")))?;
        let store = Self {
            client,
            db_name: config.db_name.clone(),
        };

        store.wait_until_reachable(config.connect_timeout_secs)?;
        store.ensure_indexes()?;
        info!("connected to the database");
        Ok(store)
    }

    fn wait_until_reachable(&self, budget_secs: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(budget_secs.max(1));
        loop {
            match self
                .client
                .database(&self.db_name)
                .run_command(doc! {"ping": 1}, None)
            {
                Ok(_) => return Ok(()),
                Err(err) => {
                    let message = err.to_string();
                    if is_auth_failure(&message) || Instant::now() >= deadline {
                        return Err(Error::Unavailable(format!(
                            "failed to reach the database: {message}"
                        )));
                    }
                    warn!(error = %message, "database not reachable yet, retrying");
                    std::thread::sleep(DIAL_RETRY_PAUSE);
                }
            }
        }
    }

    fn ensure_indexes(&self) -> Result<()> {
        let keys = [
            (
                collections::DESTINATIONS,
                doc! {"destination.destination-org-id": 1},
            ),
            (
                collections::NOTIFICATIONS,
                doc! {
                    "notification.destination-org-id": 1,
                    "notification.destination-id": 1,
                    "notification.destination-type": 1,
                },
            ),
            (
                collections::NOTIFICATIONS,
                doc! {"notification.resend-time": 1, "notification.status": 1},
            ),
            (collections::OBJECTS, doc! {"metadata.destination-org-id": 1}),
            (collections::ACLS, doc! {"org-id": 1, "acl-type": 1}),
        ];
        for (coll, key) in keys {
            let model = IndexModel::builder().keys(key).build();
            self.collection(coll)
                .create_index(model, None)
                .map_err(map_err)?;
        }
        Ok(())
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.client
            .database(&self.db_name)
            .collection::<Document>(name)
    }
}

impl DocStore for MongoStore {
    fn insert(&self, coll: &str, doc: Document) -> Result<()> {
        match self.collection(coll).insert_one(doc, None) {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_key(&err) => Err(Error::Duplicate),
            Err(err) => Err(map_err(err)),
        }
    }

    fn upsert(&self, coll: &str, filter: Document, doc: Document) -> Result<()> {
        let mut options = ReplaceOptions::default();
        options.upsert = Some(true);
        self.collection(coll)
            .replace_one(filter, doc, options)
            .map(|_| ())
            .map_err(map_err)
    }

    fn update(&self, coll: &str, filter: Document, update: Document) -> Result<()> {
        let result = self
            .collection(coll)
            .update_one(filter, update, None)
            .map_err(map_err)?;
        if result.matched_count == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn fetch_one(
        &self,
        coll: &str,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Document> {
        let mut options = FindOneOptions::default();
        options.projection = projection;
        self.collection(coll)
            .find_one(filter, options)
            .map_err(map_err)?
            .ok_or(Error::NotFound)
    }

    fn fetch_all(
        &self,
        coll: &str,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Vec<Document>> {
        let mut options = FindOptions::default();
        options.projection = projection;
        let cursor = self.collection(coll).find(filter, options).map_err(map_err)?;
        cursor
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(map_err)
    }

    fn remove_all(&self, coll: &str, filter: Document) -> Result<()> {
        self.collection(coll)
            .delete_many(filter, None)
            .map(|_| ())
            .map_err(map_err)
    }

    fn server_time(&self) -> Result<DateTime<Utc>> {
        let reply = self
            .client
            .database(&self.db_name)
            .run_command(doc! {"isMaster": 1}, None)
            .map_err(map_err)?;
        match reply.get("localTime") {
            Some(Bson::DateTime(dt)) => Ok(dt.to_chrono()),
            _ => Err(Error::storage("isMaster reply carries no localTime")),
        }
    }
}

/// Resolve the CA certificate setting: an absolute path, a path relative
/// to the persistence root, or inline PEM that gets written next to the
/// other persistent state.
fn resolve_ca_path(config: &MongoConfig, persistence_root: &Path) -> Result<Option<PathBuf>> {
    if config.ca_certificate.is_empty() {
        return Ok(None);
    }
    let path = if config.ca_certificate.starts_with('/') {
        PathBuf::from(&config.ca_certificate)
    } else {
        persistence_root.join(&config.ca_certificate)
    };
    if path.exists() {
        return Ok(Some(path));
    }
    // Not a file on disk; treat the value as inline PEM
    std::fs::create_dir_all(persistence_root)?;
    let pem_path = persistence_root.join("mongo-ca.pem");
    std::fs::write(&pem_path, config.ca_certificate.as_bytes())?;
    Ok(Some(pem_path))
}

fn is_auth_failure(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("unauthorized")
        || lowered.contains("not authorized")
        || lowered.contains("auth fail")
        || lowered.contains("authentication failed")
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        &*err.kind,
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == 11000
    )
}

fn map_err(err: mongodb::error::Error) -> Error {
    match &*err.kind {
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } => Error::Unavailable(err.to_string()),
        _ => Error::Storage(err.to_string()),
    }
}
