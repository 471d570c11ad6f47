//! Access-control lists for objects and destinations.
//!
//! One row per `(aclType, orgID, key)` with a deduplicated username list.
//! Policy decisions happen elsewhere; this module only maintains the data.

use crate::docstore::collections;
use crate::documents::{zero_ts, AclDoc};
use crate::store::{SyncStore, MAX_UPDATE_TRIES};
use bson::doc;
use objsync_common::{AclType, Error, Result};

fn acl_id(acl_type: AclType, org_id: &str, key: &str) -> String {
    format!("{}:{org_id}:{key}", acl_type.as_str())
}

impl SyncStore {
    /// Add users to an ACL, creating it on first use
    pub fn add_users_to_acl(
        &self,
        acl_type: AclType,
        org_id: &str,
        key: &str,
        usernames: &[String],
    ) -> Result<()> {
        let id = acl_id(acl_type, org_id, key);
        for _ in 0..MAX_UPDATE_TRIES {
            let existing: AclDoc = match self.fetch_typed(
                collections::ACLS,
                doc! {"_id": &id},
                None,
            ) {
                Ok(doc) => doc,
                Err(Error::NotFound) => {
                    let mut initial: Vec<String> = Vec::new();
                    for username in usernames {
                        if !initial.contains(username) {
                            initial.push(username.clone());
                        }
                    }
                    let fresh = AclDoc {
                        id: id.clone(),
                        usernames: initial,
                        org_id: org_id.to_string(),
                        acl_type: acl_type.as_str().to_string(),
                        key: key.to_string(),
                        last_update: zero_ts(),
                    };
                    match self
                        .docs()
                        .insert(collections::ACLS, bson::to_document(&fresh)?)
                    {
                        Ok(()) => return Ok(()),
                        Err(Error::Duplicate) => continue,
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            };

            let mut combined = existing.usernames;
            let before = combined.len();
            for username in usernames {
                if !combined.contains(username) {
                    combined.push(username.clone());
                }
            }
            if combined.len() == before {
                return Ok(());
            }
            match self.docs().update(
                collections::ACLS,
                doc! {"_id": &id, "last-update": existing.last_update},
                doc! {
                    "$set": {"usernames": combined},
                    "$currentDate": {"last-update": {"$type": "timestamp"}},
                },
            ) {
                Ok(()) => return Ok(()),
                Err(Error::NotFound) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::Conflict(format!("failed to add users to ACL {id}")))
    }

    /// Remove users from an ACL; the row disappears with its last user
    pub fn remove_users_from_acl(
        &self,
        acl_type: AclType,
        org_id: &str,
        key: &str,
        usernames: &[String],
    ) -> Result<()> {
        let id = acl_id(acl_type, org_id, key);
        for _ in 0..MAX_UPDATE_TRIES {
            let existing: AclDoc = match self.fetch_typed(
                collections::ACLS,
                doc! {"_id": &id},
                None,
            ) {
                Ok(doc) => doc,
                Err(Error::NotFound) => return Ok(()),
                Err(err) => return Err(err),
            };

            let mut remaining = existing.usernames;
            let before = remaining.len();
            remaining.retain(|username| !usernames.contains(username));
            if remaining.len() == before {
                return Ok(());
            }
            if remaining.is_empty() {
                return self.docs().remove_all(collections::ACLS, doc! {"_id": id});
            }
            match self.docs().update(
                collections::ACLS,
                doc! {"_id": &id, "last-update": existing.last_update},
                doc! {
                    "$set": {"usernames": remaining},
                    "$currentDate": {"last-update": {"$type": "timestamp"}},
                },
            ) {
                Ok(()) => return Ok(()),
                Err(Error::NotFound) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::Conflict(format!(
            "failed to remove users from ACL {id}"
        )))
    }

    /// The usernames on an ACL; empty when the ACL does not exist
    pub fn retrieve_acl(&self, acl_type: AclType, org_id: &str, key: &str) -> Result<Vec<String>> {
        let id = acl_id(acl_type, org_id, key);
        match self.fetch_typed::<AclDoc>(collections::ACLS, doc! {"_id": id}, None) {
            Ok(doc) => Ok(doc.usernames),
            Err(Error::NotFound) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// The keys of all ACLs of the given type in an organization
    pub fn retrieve_acls_in_org(&self, acl_type: AclType, org_id: &str) -> Result<Vec<String>> {
        let records: Vec<AclDoc> = self.fetch_all_typed(
            collections::ACLS,
            doc! {"org-id": org_id, "acl-type": acl_type.as_str()},
            None,
        )?;
        Ok(records.into_iter().map(|record| record.key).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objsync_common::Config;

    fn store() -> SyncStore {
        SyncStore::in_memory(&Config::default())
    }

    fn users(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_add_deduplicates() {
        let store = store();
        store
            .add_users_to_acl(AclType::Objects, "o", "model", &users(&["alice", "bob", "alice"]))
            .unwrap();
        store
            .add_users_to_acl(AclType::Objects, "o", "model", &users(&["bob", "carol"]))
            .unwrap();
        assert_eq!(
            store.retrieve_acl(AclType::Objects, "o", "model").unwrap(),
            ["alice", "bob", "carol"]
        );
    }

    #[test]
    fn test_remove_drops_empty_row() {
        let store = store();
        store
            .add_users_to_acl(AclType::Destinations, "o", "gw", &users(&["alice", "bob"]))
            .unwrap();
        store
            .remove_users_from_acl(AclType::Destinations, "o", "gw", &users(&["alice"]))
            .unwrap();
        assert_eq!(
            store.retrieve_acl(AclType::Destinations, "o", "gw").unwrap(),
            ["bob"]
        );
        store
            .remove_users_from_acl(AclType::Destinations, "o", "gw", &users(&["bob"]))
            .unwrap();
        assert!(store
            .retrieve_acl(AclType::Destinations, "o", "gw")
            .unwrap()
            .is_empty());
        assert!(store
            .retrieve_acls_in_org(AclType::Destinations, "o")
            .unwrap()
            .is_empty());
        // removing from a missing ACL is a no-op
        store
            .remove_users_from_acl(AclType::Destinations, "o", "gw", &users(&["bob"]))
            .unwrap();
    }

    #[test]
    fn test_acl_types_are_disjoint() {
        let store = store();
        store
            .add_users_to_acl(AclType::Objects, "o", "model", &users(&["alice"]))
            .unwrap();
        store
            .add_users_to_acl(AclType::Destinations, "o", "model", &users(&["bob"]))
            .unwrap();
        assert_eq!(
            store.retrieve_acls_in_org(AclType::Objects, "o").unwrap(),
            ["model"]
        );
        assert_eq!(
            store.retrieve_acl(AclType::Objects, "o", "model").unwrap(),
            ["alice"]
        );
        assert_eq!(
            store.retrieve_acl(AclType::Destinations, "o", "model").unwrap(),
            ["bob"]
        );
    }
}
