//! Notification engine.
//!
//! One record per (object, destination) pair. A record's `resend-time`
//! tells the transport when to retransmit; the window is six resend
//! intervals from now.

use crate::docstore::collections;
use crate::documents::NotificationDoc;
use crate::store::SyncStore;
use bson::{doc, Document};
use objsync_common::time::now_unix;
use objsync_common::{notification_key, Error, Notification, NotificationStatus, Result};

const RESEND_WINDOW_MULTIPLIER: i64 = 6;

impl SyncStore {
    fn resend_window_secs(&self) -> i64 {
        self.inner.resend_interval_secs * RESEND_WINDOW_MULTIPLIER
    }

    /// Insert or replace the notification record for its (object,
    /// destination) pair. An unset resend time is scheduled a full window
    /// out.
    pub fn update_notification_record(&self, mut notification: Notification) -> Result<()> {
        if notification.resend_time == 0 {
            notification.resend_time = now_unix() + self.resend_window_secs();
        }
        let id = notification.key();
        let record = NotificationDoc {
            id: id.clone(),
            notification,
        };
        let filter = doc! {
            "_id": &id,
            "notification.destination-org-id": record.notification.dest_org_id.as_str(),
            "notification.destination-id": record.notification.dest_id.as_str(),
            "notification.destination-type": record.notification.dest_type.as_str(),
        };
        self.docs()
            .upsert(collections::NOTIFICATIONS, filter, bson::to_document(&record)?)
    }

    /// Push the record's resend time a full window out
    pub fn update_notification_resend_time(&self, notification: &Notification) -> Result<()> {
        let id = notification.key();
        let resend_time = now_unix() + self.resend_window_secs();
        self.docs().update(
            collections::NOTIFICATIONS,
            doc! {"_id": id},
            doc! {"$set": {"notification.resend-time": resend_time}},
        )
    }

    /// The notification record for the given object and destination
    pub fn retrieve_notification_record(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<Option<Notification>> {
        let id = notification_key(org_id, object_type, object_id, dest_type, dest_id);
        match self.fetch_typed::<NotificationDoc>(collections::NOTIFICATIONS, doc! {"_id": id}, None)
        {
            Ok(record) => Ok(Some(record.notification)),
            Err(Error::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Notifications that are due for (re)transmission. Without a
    /// destination, returns every `Getdata` record plus all records of
    /// sendable statuses whose resend time has passed; with a destination,
    /// returns that destination's sendable records regardless of timing
    /// (including `ReceivedByDestination` when `retrieve_received` is set).
    pub fn retrieve_notifications(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
        retrieve_received: bool,
    ) -> Result<Vec<Notification>> {
        let query = if dest_type.is_empty() && dest_id.is_empty() {
            doc! {"$or": [
                {"notification.status": NotificationStatus::Getdata.as_str()},
                {
                    "notification.resend-time": {"$lte": now_unix()},
                    "$or": [
                        {"notification.status": NotificationStatus::Update.as_str()},
                        {"notification.status": NotificationStatus::Received.as_str()},
                        {"notification.status": NotificationStatus::Consumed.as_str()},
                        {"notification.status": NotificationStatus::Data.as_str()},
                        {"notification.status": NotificationStatus::Delete.as_str()},
                        {"notification.status": NotificationStatus::Deleted.as_str()},
                    ],
                },
            ]}
        } else {
            let mut statuses = vec![
                doc! {"notification.status": NotificationStatus::Update.as_str()},
                doc! {"notification.status": NotificationStatus::Received.as_str()},
                doc! {"notification.status": NotificationStatus::Consumed.as_str()},
                doc! {"notification.status": NotificationStatus::Getdata.as_str()},
                doc! {"notification.status": NotificationStatus::Data.as_str()},
                doc! {"notification.status": NotificationStatus::Delete.as_str()},
                doc! {"notification.status": NotificationStatus::Deleted.as_str()},
            ];
            if retrieve_received {
                statuses.push(
                    doc! {"notification.status": NotificationStatus::ReceivedByDestination.as_str()},
                );
            }
            doc! {
                "$or": statuses,
                "notification.destination-org-id": org_id,
                "notification.destination-id": dest_id,
                "notification.destination-type": dest_type,
            }
        };
        self.fetch_notifications(query)
    }

    /// Notifications waiting for an earlier exchange with the destination
    /// to finish
    pub fn retrieve_pending_notifications(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<Vec<Notification>> {
        let mut query = doc! {
            "$or": [
                {"notification.status": NotificationStatus::UpdatePending.as_str()},
                {"notification.status": NotificationStatus::ConsumedPending.as_str()},
                {"notification.status": NotificationStatus::DeletePending.as_str()},
                {"notification.status": NotificationStatus::DeletedPending.as_str()},
            ],
            "notification.destination-org-id": org_id,
        };
        if !dest_type.is_empty() || !dest_id.is_empty() {
            query.insert("notification.destination-id", dest_id);
            query.insert("notification.destination-type", dest_type);
        }
        self.fetch_notifications(query)
    }

    /// Bulk-delete notification records. The most specific key given wins:
    /// exact (object, destination) pair, else everything for the object,
    /// else everything for the destination.
    pub fn delete_notification_records(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<()> {
        let filter = if !object_type.is_empty() && !object_id.is_empty() {
            if !dest_type.is_empty() && !dest_id.is_empty() {
                doc! {"_id": notification_key(org_id, object_type, object_id, dest_type, dest_id)}
            } else {
                doc! {
                    "notification.destination-org-id": org_id,
                    "notification.object-type": object_type,
                    "notification.object-id": object_id,
                }
            }
        } else {
            doc! {
                "notification.destination-org-id": org_id,
                "notification.destination-type": dest_type,
                "notification.destination-id": dest_id,
            }
        };
        self.docs().remove_all(collections::NOTIFICATIONS, filter)
    }

    fn fetch_notifications(&self, query: Document) -> Result<Vec<Notification>> {
        let records: Vec<NotificationDoc> =
            self.fetch_all_typed(collections::NOTIFICATIONS, query, None)?;
        Ok(records.into_iter().map(|r| r.notification).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objsync_common::Config;

    fn store() -> SyncStore {
        SyncStore::in_memory(&Config::default())
    }

    fn notification(object_id: &str, dest_id: &str, status: NotificationStatus) -> Notification {
        Notification {
            object_type: "model".to_string(),
            object_id: object_id.to_string(),
            dest_org_id: "myorg".to_string(),
            dest_type: "gw".to_string(),
            dest_id: dest_id.to_string(),
            status,
            instance_id: 1,
            resend_time: 0,
        }
    }

    #[test]
    fn test_unset_resend_time_gets_a_full_window() {
        // resend_interval_secs defaults to 5, so the window is 30 seconds
        let store = store();
        store
            .update_notification_record(notification("m1", "g1", NotificationStatus::Update))
            .unwrap();
        let stored = store
            .retrieve_notification_record("myorg", "model", "m1", "gw", "g1")
            .unwrap()
            .unwrap();
        let delta = stored.resend_time - now_unix();
        assert!((29..=31).contains(&delta), "resend window was {delta}");
    }

    #[test]
    fn test_global_retrieval_honors_resend_time() {
        let store = store();
        // a fresh update: resend time lies in the future
        store
            .update_notification_record(notification("fresh", "g1", NotificationStatus::Update))
            .unwrap();
        // an overdue update
        let mut overdue = notification("overdue", "g1", NotificationStatus::Update);
        overdue.resend_time = now_unix() - 1;
        store.update_notification_record(overdue).unwrap();
        // getdata is returned regardless of timing
        store
            .update_notification_record(notification("wanted", "g1", NotificationStatus::Getdata))
            .unwrap();
        // pending statuses never show up here
        let mut pending = notification("waiting", "g1", NotificationStatus::UpdatePending);
        pending.resend_time = now_unix() - 1;
        store.update_notification_record(pending).unwrap();

        let due = store.retrieve_notifications("myorg", "", "", false).unwrap();
        let mut ids: Vec<&str> = due.iter().map(|n| n.object_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, ["overdue", "wanted"]);
    }

    #[test]
    fn test_destination_retrieval_ignores_timing() {
        let store = store();
        store
            .update_notification_record(notification("m1", "g1", NotificationStatus::Update))
            .unwrap();
        store
            .update_notification_record(notification("m2", "g1", NotificationStatus::ReceivedByDestination))
            .unwrap();
        store
            .update_notification_record(notification("m3", "g2", NotificationStatus::Update))
            .unwrap();

        let due = store.retrieve_notifications("myorg", "gw", "g1", false).unwrap();
        let ids: Vec<&str> = due.iter().map(|n| n.object_id.as_str()).collect();
        assert_eq!(ids, ["m1"]);

        let due = store.retrieve_notifications("myorg", "gw", "g1", true).unwrap();
        assert_eq!(due.len(), 2);
    }

    #[test]
    fn test_pending_retrieval() {
        let store = store();
        store
            .update_notification_record(notification("m1", "g1", NotificationStatus::UpdatePending))
            .unwrap();
        store
            .update_notification_record(notification("m2", "g2", NotificationStatus::DeletePending))
            .unwrap();
        store
            .update_notification_record(notification("m3", "g1", NotificationStatus::Update))
            .unwrap();

        let pending = store.retrieve_pending_notifications("myorg", "", "").unwrap();
        assert_eq!(pending.len(), 2);
        let pending = store.retrieve_pending_notifications("myorg", "gw", "g1").unwrap();
        let ids: Vec<&str> = pending.iter().map(|n| n.object_id.as_str()).collect();
        assert_eq!(ids, ["m1"]);
    }

    #[test]
    fn test_resend_time_bump() {
        let store = store();
        let mut overdue = notification("m1", "g1", NotificationStatus::Update);
        overdue.resend_time = now_unix() - 1;
        store.update_notification_record(overdue.clone()).unwrap();

        store.update_notification_resend_time(&overdue).unwrap();
        let stored = store
            .retrieve_notification_record("myorg", "model", "m1", "gw", "g1")
            .unwrap()
            .unwrap();
        assert!(stored.resend_time >= now_unix() + 29);
    }

    #[test]
    fn test_delete_precedence() {
        let store = store();
        for (object_id, dest_id) in [("m1", "g1"), ("m1", "g2"), ("m2", "g1")] {
            store
                .update_notification_record(notification(object_id, dest_id, NotificationStatus::Update))
                .unwrap();
        }

        // exact pair
        store
            .delete_notification_records("myorg", "model", "m1", "gw", "g1")
            .unwrap();
        assert!(store
            .retrieve_notification_record("myorg", "model", "m1", "gw", "g1")
            .unwrap()
            .is_none());
        assert!(store
            .retrieve_notification_record("myorg", "model", "m1", "gw", "g2")
            .unwrap()
            .is_some());

        // everything for the object
        store
            .delete_notification_records("myorg", "model", "m1", "", "")
            .unwrap();
        assert!(store
            .retrieve_notification_record("myorg", "model", "m1", "gw", "g2")
            .unwrap()
            .is_none());

        // everything for the destination
        store
            .delete_notification_records("myorg", "", "", "gw", "g1")
            .unwrap();
        assert!(store
            .retrieve_notification_record("myorg", "model", "m2", "gw", "g1")
            .unwrap()
            .is_none());
    }
}
