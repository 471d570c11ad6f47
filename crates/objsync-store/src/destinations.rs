//! Destination directory.

use crate::docstore::collections;
use crate::documents::DestinationDoc;
use crate::store::SyncStore;
use bson::doc;
use objsync_common::{destination_key, Destination, Error, Result};

impl SyncStore {
    /// Insert or update a destination
    pub fn store_destination(&self, destination: Destination) -> Result<()> {
        let id = destination.key();
        let record = DestinationDoc {
            id: id.clone(),
            destination,
        };
        self.docs().upsert(
            collections::DESTINATIONS,
            doc! {
                "_id": &id,
                "destination.destination-org-id": record.destination.dest_org_id.as_str(),
            },
            bson::to_document(&record)?,
        )
    }

    /// Remove a destination
    pub fn delete_destination(&self, org_id: &str, dest_type: &str, dest_id: &str) -> Result<()> {
        let id = destination_key(org_id, dest_type, dest_id);
        self.docs()
            .remove_all(collections::DESTINATIONS, doc! {"_id": id})
    }

    /// Whether the destination is registered
    pub fn destination_exists(&self, org_id: &str, dest_type: &str, dest_id: &str) -> Result<bool> {
        Ok(self.retrieve_destination(org_id, dest_type, dest_id)?.is_some())
    }

    /// The destination, if registered
    pub fn retrieve_destination(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<Option<Destination>> {
        let id = destination_key(org_id, dest_type, dest_id);
        match self.fetch_typed::<DestinationDoc>(collections::DESTINATIONS, doc! {"_id": id}, None)
        {
            Ok(record) => Ok(Some(record.destination)),
            Err(Error::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// The communication protocol of the destination, if registered
    pub fn retrieve_destination_protocol(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .retrieve_destination(org_id, dest_type, dest_id)?
            .map(|d| d.communication))
    }

    /// All destinations, optionally narrowed by organization and type
    /// (empty strings act as wildcards)
    pub fn retrieve_destinations(&self, org_id: &str, dest_type: &str) -> Result<Vec<Destination>> {
        let mut filter = doc! {};
        if !org_id.is_empty() {
            filter.insert("destination.destination-org-id", org_id);
        }
        if !dest_type.is_empty() {
            filter.insert("destination.destination-type", dest_type);
        }
        let records: Vec<DestinationDoc> =
            self.fetch_all_typed(collections::DESTINATIONS, filter, None)?;
        Ok(records.into_iter().map(|r| r.destination).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objsync_common::Config;

    fn store() -> SyncStore {
        SyncStore::in_memory(&Config::default())
    }

    fn dest(org: &str, dest_type: &str, dest_id: &str) -> Destination {
        Destination {
            dest_org_id: org.to_string(),
            dest_type: dest_type.to_string(),
            dest_id: dest_id.to_string(),
            communication: "mqtt".to_string(),
        }
    }

    #[test]
    fn test_store_and_lookup() {
        let store = store();
        store.store_destination(dest("o1", "gw", "g1")).unwrap();
        store.store_destination(dest("o1", "sensor", "s1")).unwrap();
        store.store_destination(dest("o2", "gw", "g1")).unwrap();

        assert!(store.destination_exists("o1", "gw", "g1").unwrap());
        assert!(!store.destination_exists("o1", "gw", "ghost").unwrap());
        assert_eq!(
            store.retrieve_destination_protocol("o1", "gw", "g1").unwrap(),
            Some("mqtt".to_string())
        );

        assert_eq!(store.retrieve_destinations("", "").unwrap().len(), 3);
        assert_eq!(store.retrieve_destinations("o1", "").unwrap().len(), 2);
        assert_eq!(store.retrieve_destinations("o1", "gw").unwrap().len(), 1);
        assert_eq!(store.retrieve_destinations("", "gw").unwrap().len(), 2);
    }

    #[test]
    fn test_upsert_replaces_protocol() {
        let store = store();
        store.store_destination(dest("o1", "gw", "g1")).unwrap();
        let mut updated = dest("o1", "gw", "g1");
        updated.communication = "http".to_string();
        store.store_destination(updated).unwrap();

        assert_eq!(store.retrieve_destinations("o1", "gw").unwrap().len(), 1);
        assert_eq!(
            store.retrieve_destination_protocol("o1", "gw", "g1").unwrap(),
            Some("http".to_string())
        );
    }

    #[test]
    fn test_delete() {
        let store = store();
        store.store_destination(dest("o1", "gw", "g1")).unwrap();
        store.delete_destination("o1", "gw", "g1").unwrap();
        assert!(store.retrieve_destination("o1", "gw", "g1").unwrap().is_none());
        // deleting again is fine
        store.delete_destination("o1", "gw", "g1").unwrap();
    }
}
