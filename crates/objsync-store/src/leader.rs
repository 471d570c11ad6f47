//! Leader election.
//!
//! A single lease document (`_id` = 1) in the `leader` collection decides
//! which node runs background maintenance. The heartbeat timestamp comes
//! from the database server, and takeovers are guarded by the lease
//! version so two candidates cannot both win.

use crate::docstore::collections;
use crate::documents::{zero_ts, LeaderDoc};
use crate::store::SyncStore;
use bson::{doc, Timestamp};
use chrono::{DateTime, Utc};
use objsync_common::{Error, Result};

const LEADER_DOC_ID: i32 = 1;

impl SyncStore {
    /// Try to bootstrap the lease. Returns `false` without error when some
    /// node already inserted it.
    pub fn insert_initial_leader(&self, leader_id: &str) -> Result<bool> {
        let lease = LeaderDoc {
            id: LEADER_DOC_ID,
            uuid: leader_id.to_string(),
            last_heartbeat_ts: zero_ts(),
            heartbeat_timeout: self.inner.leadership_timeout_secs,
            version: 1,
        };
        match self
            .docs()
            .insert(collections::LEADER, bson::to_document(&lease)?)
        {
            Ok(()) => Ok(true),
            Err(Error::Duplicate) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Refresh the lease heartbeat. Returns `false` without error when the
    /// lease no longer names this node, meaning leadership was lost.
    pub fn leader_periodic_update(&self, leader_id: &str) -> Result<bool> {
        match self.docs().update(
            collections::LEADER,
            doc! {"_id": LEADER_DOC_ID, "uuid": leader_id},
            doc! {"$currentDate": {"last-heartbeat-ts": {"$type": "timestamp"}}},
        ) {
            Ok(()) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// The current lease: holder, timeout, last heartbeat, version
    pub fn retrieve_leader(&self) -> Result<(String, i32, DateTime<Utc>, i64)> {
        let lease: LeaderDoc =
            self.fetch_typed(collections::LEADER, doc! {"_id": LEADER_DOC_ID}, None)?;
        Ok((
            lease.uuid,
            lease.heartbeat_timeout,
            timestamp_to_datetime(lease.last_heartbeat_ts),
            lease.version,
        ))
    }

    /// Take over an expired lease. The update is conditional on the
    /// version observed by the caller; `false` without error means another
    /// candidate got there first.
    pub fn update_leader(&self, leader_id: &str, observed_version: i64) -> Result<bool> {
        match self.docs().update(
            collections::LEADER,
            doc! {"_id": LEADER_DOC_ID, "version": observed_version},
            doc! {
                "$currentDate": {"last-heartbeat-ts": {"$type": "timestamp"}},
                "$set": {
                    "uuid": leader_id,
                    "heartbeat-timeout": self.inner.leadership_timeout_secs,
                    "version": observed_version + 1,
                },
            },
        ) {
            Ok(()) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Give up the lease by resetting its heartbeat to the epoch origin,
    /// making it immediately eligible for takeover
    pub fn resign_leadership(&self, leader_id: &str) -> Result<()> {
        let epoch = Timestamp {
            time: 0,
            increment: 1,
        };
        match self.docs().update(
            collections::LEADER,
            doc! {"_id": LEADER_DOC_ID, "uuid": leader_id},
            doc! {"$set": {"last-heartbeat-ts": epoch}},
        ) {
            Ok(()) | Err(Error::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Clock of the database server, so lease expiry does not depend on
    /// the local clock
    pub fn retrieve_time_on_server(&self) -> Result<DateTime<Utc>> {
        self.docs().server_time()
    }

    /// Whether this node currently holds the lease
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.inner
            .is_leader
            .load(std::sync::atomic::Ordering::Relaxed)
    }
}

pub(crate) fn timestamp_to_datetime(ts: Timestamp) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(i64::from(ts.time), 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use objsync_common::Config;

    fn store() -> SyncStore {
        SyncStore::in_memory(&Config::default())
    }

    #[test]
    fn test_leader_takeover() {
        let store = store();

        // node A bootstraps the lease; node B arrives second
        assert!(store.insert_initial_leader("A").unwrap());
        assert!(!store.insert_initial_leader("B").unwrap());

        let (uuid, timeout, _heartbeat, version) = store.retrieve_leader().unwrap();
        assert_eq!(uuid, "A");
        assert_eq!(timeout, Config::default().leadership_timeout_secs);
        assert_eq!(version, 1);

        // B takes over with the version it observed
        assert!(store.update_leader("B", 1).unwrap());
        // A's heartbeat now misses: it is no longer the leader
        assert!(!store.leader_periodic_update("A").unwrap());
        assert!(store.leader_periodic_update("B").unwrap());

        let (uuid, _, _, version) = store.retrieve_leader().unwrap();
        assert_eq!(uuid, "B");
        assert_eq!(version, 2);

        // a takeover with a stale version loses
        assert!(!store.update_leader("C", 1).unwrap());
    }

    #[test]
    fn test_heartbeat_moves_the_timestamp() {
        let store = store();
        store.insert_initial_leader("A").unwrap();
        let (_, _, before, _) = store.retrieve_leader().unwrap();
        store.leader_periodic_update("A").unwrap();
        let (_, _, after, _) = store.retrieve_leader().unwrap();
        assert!(after >= before);
        assert!(after > timestamp_to_datetime(zero_ts()));
    }

    #[test]
    fn test_resignation_resets_heartbeat_to_epoch() {
        let store = store();
        store.insert_initial_leader("A").unwrap();
        store.leader_periodic_update("A").unwrap();
        store.resign_leadership("A").unwrap();
        let (_, _, heartbeat, _) = store.retrieve_leader().unwrap();
        assert_eq!(heartbeat, timestamp_to_datetime(zero_ts()));

        // resigning a lease held by someone else is a no-op
        store.resign_leadership("B").unwrap();
    }
}
