//! Background maintenance loop.
//!
//! A ticker thread that advances the leadership state machine and, while
//! this node holds the lease, scans the objects collection: activates
//! scheduled objects, removes expired ones and prunes deleted objects
//! whose destinations are all done with them.

use crate::docstore::collections;
use crate::documents::ObjectDoc;
use crate::store::SyncStore;
use bson::doc;
use objsync_common::time::now_rfc3339;
use objsync_common::{DestinationStatus, MetaData, ObjectStatus, Result};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

impl SyncStore {
    /// Start the maintenance ticker. Runs until [`SyncStore::stop`].
    pub fn start_maintenance(&self) {
        let store = self.clone();
        let interval = Duration::from_secs(self.inner.maintenance_interval_secs.max(1));
        let handle = thread::spawn(move || {
            info!("maintenance thread started");
            while !store.inner.shutdown.load(Ordering::Relaxed) {
                thread::sleep(interval);
                if store.inner.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(err) = store.leadership_tick() {
                    warn!(error = %err, "leadership step failed");
                }
                if store.is_leader() {
                    if let Err(err) = store.check_objects() {
                        warn!(error = %err, "object maintenance scan failed");
                    }
                }
            }
            info!("maintenance thread stopped");
        });
        *self.inner.maintenance.lock() = Some(handle);
    }

    /// One step of the leadership state machine: heartbeat while leading,
    /// otherwise bootstrap the lease or take it over once it expired
    pub(crate) fn leadership_tick(&self) -> Result<()> {
        let node_id = self.inner.node_id.clone();
        if self.is_leader() {
            if !self.leader_periodic_update(&node_id)? {
                warn!("leadership lease was taken by another node");
                self.inner.is_leader.store(false, Ordering::Relaxed);
            }
            return Ok(());
        }

        if self.insert_initial_leader(&node_id)? {
            // stamp the heartbeat right away, the inserted lease carries
            // the zero timestamp
            self.leader_periodic_update(&node_id)?;
            info!("assumed leadership");
            self.inner.is_leader.store(true, Ordering::Relaxed);
            return Ok(());
        }

        let (leader_uuid, timeout, last_heartbeat, version) = self.retrieve_leader()?;
        if leader_uuid == node_id {
            self.inner.is_leader.store(true, Ordering::Relaxed);
            return Ok(());
        }
        let server_time = self.retrieve_time_on_server()?;
        if (server_time - last_heartbeat).num_seconds() > i64::from(timeout)
            && self.update_leader(&node_id, version)?
        {
            info!(previous = %leader_uuid, "took over an expired leadership lease");
            self.inner.is_leader.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    /// One maintenance scan over the objects collection
    pub fn check_objects(&self) -> Result<()> {
        for (metadata, _status) in self.get_objects_to_activate()? {
            debug!(object = %metadata.object_key(), "activating scheduled object");
            if let Err(err) = self.activate_object(
                &metadata.dest_org_id,
                &metadata.object_type,
                &metadata.object_id,
            ) {
                warn!(object = %metadata.object_key(), error = %err, "activation failed");
            }
        }

        let now = now_rfc3339();
        let expired: Vec<ObjectDoc> = self.fetch_all_typed(
            collections::OBJECTS,
            doc! {"metadata.expiration": {"$ne": "", "$lte": now}},
            Some(doc! {"metadata": 1}),
        )?;
        for object in expired {
            info!(object = %object.id, "removing expired object");
            self.remove_object_and_notifications(&object.metadata);
        }

        let deleted: Vec<ObjectDoc> = self.fetch_all_typed(
            collections::OBJECTS,
            doc! {"status": ObjectStatus::ObjDeleted.as_str()},
            Some(doc! {"metadata": 1, "destinations": 1}),
        )?;
        for object in deleted {
            let all_done = object.destinations.iter().all(|d| {
                matches!(
                    d.status,
                    DestinationStatus::Consumed | DestinationStatus::Error
                )
            });
            if all_done {
                debug!(object = %object.id, "pruning deleted object");
                self.remove_object_and_notifications(&object.metadata);
            }
        }
        Ok(())
    }

    /// Best-effort removal of an object, its payload and its notification
    /// records
    fn remove_object_and_notifications(&self, metadata: &MetaData) {
        if let Err(err) = self.delete_stored_object(
            &metadata.dest_org_id,
            &metadata.object_type,
            &metadata.object_id,
        ) {
            warn!(object = %metadata.object_key(), error = %err, "failed to remove object");
            return;
        }
        if let Err(err) = self.delete_notification_records(
            &metadata.dest_org_id,
            &metadata.object_type,
            &metadata.object_id,
            "",
            "",
        ) {
            warn!(object = %metadata.object_key(), error = %err, "failed to purge notifications");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::{DocStore, MemoryStore};
    use crate::payload::GridStore;
    use crate::PayloadStore;
    use objsync_common::time::rfc3339_in;
    use objsync_common::{Config, Destination, Notification, NotificationStatus};
    use std::sync::Arc;

    fn store() -> SyncStore {
        SyncStore::in_memory(&Config::default())
    }

    /// Two stores sharing one backend, like two CSS replicas
    fn replica_pair() -> (SyncStore, SyncStore) {
        let docs: Arc<dyn DocStore> = Arc::new(MemoryStore::new());
        let payloads: Arc<dyn PayloadStore> = Arc::new(GridStore::new(Arc::clone(&docs)));
        let config = Config::default();
        (
            SyncStore::with_backends(Arc::clone(&docs), Arc::clone(&payloads), &config),
            SyncStore::with_backends(docs, payloads, &config),
        )
    }

    fn meta(object_id: &str) -> MetaData {
        MetaData {
            object_id: object_id.to_string(),
            object_type: "model".to_string(),
            dest_org_id: "myorg".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_scan_activates_due_objects() {
        let store = store();
        let mut metadata = meta("due");
        metadata.inactive = true;
        metadata.activation_time = rfc3339_in(-5);
        store
            .store_object(metadata, None, ObjectStatus::ReadyToSend)
            .unwrap();

        store.check_objects().unwrap();
        let stored = store.retrieve_object("myorg", "model", "due").unwrap().unwrap();
        assert!(!stored.inactive);
    }

    #[test]
    fn test_scan_removes_expired_objects() {
        let store = store();
        let mut metadata = meta("old");
        metadata.expiration = rfc3339_in(-5);
        store
            .store_object(metadata, Some(b"stale"), ObjectStatus::ReadyToSend)
            .unwrap();
        store
            .update_notification_record(Notification {
                object_type: "model".to_string(),
                object_id: "old".to_string(),
                dest_org_id: "myorg".to_string(),
                dest_type: "gw".to_string(),
                dest_id: "g1".to_string(),
                status: NotificationStatus::Update,
                ..Default::default()
            })
            .unwrap();

        store.check_objects().unwrap();

        assert!(store.retrieve_object("myorg", "model", "old").unwrap().is_none());
        assert!(store.retrieve_object_data("myorg", "model", "old").unwrap().is_none());
        assert!(store
            .retrieve_notification_record("myorg", "model", "old", "gw", "g1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_scan_prunes_fully_acknowledged_deleted_objects() {
        let store = store();
        store
            .store_destination(Destination {
                dest_org_id: "myorg".to_string(),
                dest_type: "gw".to_string(),
                dest_id: "g1".to_string(),
                communication: "http".to_string(),
            })
            .unwrap();
        store.store_object(meta("done"), None, ObjectStatus::ReadyToSend).unwrap();
        store
            .update_object_delivery_status(
                Some(DestinationStatus::Consumed),
                "",
                "myorg",
                "model",
                "done",
                "gw",
                "g1",
            )
            .unwrap();
        store.mark_object_deleted("myorg", "model", "done").unwrap();

        store.store_object(meta("in-flight"), None, ObjectStatus::ReadyToSend).unwrap();
        store.mark_object_deleted("myorg", "model", "in-flight").unwrap();
        store
            .update_object_delivery_status(
                Some(DestinationStatus::Delivering),
                "",
                "myorg",
                "model",
                "in-flight",
                "gw",
                "g1",
            )
            .unwrap();

        store.check_objects().unwrap();

        assert!(store.retrieve_object("myorg", "model", "done").unwrap().is_none());
        // a destination is still working on this one
        assert!(store.retrieve_object("myorg", "model", "in-flight").unwrap().is_some());
    }

    #[test]
    fn test_leadership_lifecycle_between_replicas() {
        let (a, b) = replica_pair();

        a.leadership_tick().unwrap();
        assert!(a.is_leader());
        // the lease is fresh, so the second replica stays follower
        b.leadership_tick().unwrap();
        assert!(!b.is_leader());

        // the leader resigns; its lease is immediately expired
        a.resign_leadership(a.node_id()).unwrap();
        b.leadership_tick().unwrap();
        assert!(b.is_leader());

        // the old leader notices on its next heartbeat
        a.leadership_tick().unwrap();
        assert!(!a.is_leader());
    }
}
