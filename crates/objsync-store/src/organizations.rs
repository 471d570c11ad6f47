//! Organizations and their messaging groups.

use crate::docstore::collections;
use crate::documents::{MessagingGroupDoc, ObjectDoc, OrganizationDoc};
use crate::leader::timestamp_to_datetime;
use crate::store::SyncStore;
use bson::{doc, Timestamp};
use chrono::{DateTime, Utc};
use objsync_common::{Error, MessagingGroup, Organization, Result, StoredOrganization};
use tracing::warn;

fn since_timestamp(since: DateTime<Utc>) -> Timestamp {
    Timestamp {
        time: u32::try_from(since.timestamp()).unwrap_or(0),
        increment: 1,
    }
}

impl SyncStore {
    /// Map an organization to its messaging group
    pub fn store_org_to_messaging_group(&self, org_id: &str, group_name: &str) -> Result<()> {
        let record = MessagingGroupDoc {
            id: org_id.to_string(),
            group_name: group_name.to_string(),
            last_update: crate::documents::zero_ts(),
        };
        self.docs().upsert(
            collections::MESSAGING_GROUPS,
            doc! {"_id": org_id},
            bson::to_document(&record)?,
        )?;
        self.docs().update(
            collections::MESSAGING_GROUPS,
            doc! {"_id": org_id},
            doc! {"$currentDate": {"last-update": {"$type": "timestamp"}}},
        )
    }

    /// Remove an organization's messaging-group mapping
    pub fn delete_org_to_messaging_group(&self, org_id: &str) -> Result<()> {
        self.docs()
            .remove_all(collections::MESSAGING_GROUPS, doc! {"_id": org_id})
    }

    /// The messaging group of an organization, if mapped
    pub fn retrieve_messaging_group(&self, org_id: &str) -> Result<Option<String>> {
        match self.fetch_typed::<MessagingGroupDoc>(
            collections::MESSAGING_GROUPS,
            doc! {"_id": org_id},
            None,
        ) {
            Ok(record) => Ok(Some(record.group_name)),
            Err(Error::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Messaging groups written at or after `since`
    pub fn retrieve_updated_messaging_groups(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<MessagingGroup>> {
        let records: Vec<MessagingGroupDoc> = self.fetch_all_typed(
            collections::MESSAGING_GROUPS,
            doc! {"last-update": {"$gte": since_timestamp(since)}},
            None,
        )?;
        Ok(records
            .into_iter()
            .map(|record| MessagingGroup {
                org_id: record.id,
                group_name: record.group_name,
            })
            .collect())
    }

    /// Store organization information; returns the stored record's
    /// timestamp so replicas can order concurrent updates
    pub fn store_organization(&self, org: Organization) -> Result<DateTime<Utc>> {
        let id = org.org_id.clone();
        let record = OrganizationDoc {
            id: id.clone(),
            org,
            last_update: crate::documents::zero_ts(),
        };
        self.docs().upsert(
            collections::ORGANIZATIONS,
            doc! {"_id": &id},
            bson::to_document(&record)?,
        )?;
        self.docs().update(
            collections::ORGANIZATIONS,
            doc! {"_id": &id},
            doc! {"$currentDate": {"last-update": {"$type": "timestamp"}}},
        )?;
        let stored: OrganizationDoc =
            self.fetch_typed(collections::ORGANIZATIONS, doc! {"_id": id}, None)?;
        Ok(timestamp_to_datetime(stored.last_update))
    }

    /// Organization information, if stored
    pub fn retrieve_organization_info(&self, org_id: &str) -> Result<Option<StoredOrganization>> {
        match self.fetch_typed::<OrganizationDoc>(
            collections::ORGANIZATIONS,
            doc! {"_id": org_id},
            None,
        ) {
            Ok(record) => Ok(Some(StoredOrganization {
                org: record.org,
                timestamp: timestamp_to_datetime(record.last_update),
            })),
            Err(Error::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Remove organization information
    pub fn delete_organization_info(&self, org_id: &str) -> Result<()> {
        self.docs()
            .remove_all(collections::ORGANIZATIONS, doc! {"_id": org_id})
    }

    /// All stored organizations
    pub fn retrieve_organizations(&self) -> Result<Vec<StoredOrganization>> {
        let records: Vec<OrganizationDoc> =
            self.fetch_all_typed(collections::ORGANIZATIONS, doc! {}, None)?;
        Ok(records
            .into_iter()
            .map(|record| StoredOrganization {
                org: record.org,
                timestamp: timestamp_to_datetime(record.last_update),
            })
            .collect())
    }

    /// Organizations written at or after `since`
    pub fn retrieve_updated_organizations(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredOrganization>> {
        let records: Vec<OrganizationDoc> = self.fetch_all_typed(
            collections::ORGANIZATIONS,
            doc! {"last-update": {"$gte": since_timestamp(since)}},
            None,
        )?;
        Ok(records
            .into_iter()
            .map(|record| StoredOrganization {
                org: record.org,
                timestamp: timestamp_to_datetime(record.last_update),
            })
            .collect())
    }

    /// Remove every record belonging to an organization: its messaging
    /// group, destinations, notifications, objects and their payloads
    pub fn delete_organization(&self, org_id: &str) -> Result<()> {
        self.delete_org_to_messaging_group(org_id)?;
        self.docs().remove_all(
            collections::DESTINATIONS,
            doc! {"destination.destination-org-id": org_id},
        )?;
        self.docs().remove_all(
            collections::NOTIFICATIONS,
            doc! {"notification.destination-org-id": org_id},
        )?;

        // payloads first, the object rows reference them
        let objects: Vec<ObjectDoc> = self.fetch_all_typed(
            collections::OBJECTS,
            doc! {"metadata.destination-org-id": org_id},
            Some(doc! {"metadata": 1}),
        )?;
        for object in objects {
            if let Err(err) = self.payloads().delete(&object.id) {
                warn!(object = %object.id, error = %err, "failed to delete payload");
            }
        }
        self.docs().remove_all(
            collections::OBJECTS,
            doc! {"metadata.destination-org-id": org_id},
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objsync_common::{Config, Destination, MetaData, ObjectStatus};

    fn store() -> SyncStore {
        SyncStore::in_memory(&Config::default())
    }

    #[test]
    fn test_messaging_group_roundtrip() {
        let store = store();
        assert!(store.retrieve_messaging_group("o1").unwrap().is_none());
        store.store_org_to_messaging_group("o1", "group-a").unwrap();
        assert_eq!(
            store.retrieve_messaging_group("o1").unwrap(),
            Some("group-a".to_string())
        );
        store.store_org_to_messaging_group("o1", "group-b").unwrap();
        assert_eq!(
            store.retrieve_messaging_group("o1").unwrap(),
            Some("group-b".to_string())
        );
        store.delete_org_to_messaging_group("o1").unwrap();
        assert!(store.retrieve_messaging_group("o1").unwrap().is_none());
    }

    #[test]
    fn test_store_organization_returns_timestamp() {
        let store = store();
        let ts = store
            .store_organization(Organization {
                org_id: "o1".to_string(),
                address: "ssl://broker:8883".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert!(ts > timestamp_to_datetime(crate::documents::zero_ts()));

        let info = store.retrieve_organization_info("o1").unwrap().unwrap();
        assert_eq!(info.org.address, "ssl://broker:8883");
        assert_eq!(info.timestamp, ts);
    }

    #[test]
    fn test_retrieve_updated_since() {
        let store = store();
        let before = Utc::now() - chrono::Duration::seconds(60);
        store
            .store_organization(Organization {
                org_id: "o1".to_string(),
                ..Default::default()
            })
            .unwrap();
        store.store_org_to_messaging_group("o1", "g").unwrap();

        assert_eq!(store.retrieve_updated_organizations(before).unwrap().len(), 1);
        assert_eq!(
            store.retrieve_updated_messaging_groups(before).unwrap().len(),
            1
        );
        let future = Utc::now() + chrono::Duration::seconds(60);
        assert!(store.retrieve_updated_organizations(future).unwrap().is_empty());
        assert!(store.retrieve_updated_messaging_groups(future).unwrap().is_empty());
    }

    #[test]
    fn test_delete_organization_cascades() {
        let store = store();
        store.store_org_to_messaging_group("o1", "g").unwrap();
        store
            .store_destination(Destination {
                dest_org_id: "o1".to_string(),
                dest_type: "gw".to_string(),
                dest_id: "g1".to_string(),
                communication: "http".to_string(),
            })
            .unwrap();
        store
            .store_object(
                MetaData {
                    object_id: "m1".to_string(),
                    object_type: "model".to_string(),
                    dest_org_id: "o1".to_string(),
                    ..Default::default()
                },
                Some(b"abc"),
                ObjectStatus::ReadyToSend,
            )
            .unwrap();
        // a record of another org survives
        store.store_org_to_messaging_group("o2", "g").unwrap();

        store.delete_organization("o1").unwrap();

        assert!(store.retrieve_messaging_group("o1").unwrap().is_none());
        assert!(store.retrieve_destinations("o1", "").unwrap().is_empty());
        assert!(store.retrieve_object("o1", "model", "m1").unwrap().is_none());
        assert!(store
            .retrieve_object_data("o1", "model", "m1")
            .unwrap()
            .is_none());
        assert!(store.retrieve_messaging_group("o2").unwrap().is_some());
    }
}
