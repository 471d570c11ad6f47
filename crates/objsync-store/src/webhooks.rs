//! Webhook sets, one per `orgID:objectType`.
//!
//! The URL list is mutated under the `last-update` token: adds use exact
//! equality for deduplication, removals match case-insensitively.

use crate::docstore::collections;
use crate::documents::{zero_ts, WebhookDoc};
use crate::store::{SyncStore, MAX_UPDATE_TRIES};
use bson::doc;
use objsync_common::{Error, Result};
use tracing::debug;

impl SyncStore {
    /// Register a webhook URL for an object type
    pub fn add_webhook(&self, org_id: &str, object_type: &str, url: &str) -> Result<()> {
        let id = format!("{org_id}:{object_type}");
        debug!(id, url, "adding webhook");
        for _ in 0..MAX_UPDATE_TRIES {
            let existing: WebhookDoc = match self.fetch_typed(
                collections::WEBHOOKS,
                doc! {"_id": &id},
                None,
            ) {
                Ok(doc) => doc,
                Err(Error::NotFound) => {
                    let fresh = WebhookDoc {
                        id: id.clone(),
                        hooks: vec![url.to_string()],
                        last_update: zero_ts(),
                    };
                    match self
                        .docs()
                        .insert(collections::WEBHOOKS, bson::to_document(&fresh)?)
                    {
                        Ok(()) => return Ok(()),
                        Err(Error::Duplicate) => continue,
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            };

            if existing.hooks.iter().any(|hook| hook == url) {
                return Ok(());
            }
            let mut hooks = existing.hooks;
            hooks.push(url.to_string());
            match self.docs().update(
                collections::WEBHOOKS,
                doc! {"_id": &id, "last-update": existing.last_update},
                doc! {
                    "$set": {"hooks": hooks},
                    "$currentDate": {"last-update": {"$type": "timestamp"}},
                },
            ) {
                Ok(()) => return Ok(()),
                Err(Error::NotFound) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::Conflict(format!("failed to add a webhook for {id}")))
    }

    /// Remove a webhook URL (case-insensitive match)
    pub fn delete_webhook(&self, org_id: &str, object_type: &str, url: &str) -> Result<()> {
        let id = format!("{org_id}:{object_type}");
        debug!(id, url, "deleting webhook");
        for _ in 0..MAX_UPDATE_TRIES {
            let existing: WebhookDoc =
                self.fetch_typed(collections::WEBHOOKS, doc! {"_id": &id}, None)?;
            let mut hooks = existing.hooks;
            let Some(position) = hooks.iter().position(|hook| hook.eq_ignore_ascii_case(url))
            else {
                return Ok(());
            };
            hooks.swap_remove(position);
            match self.docs().update(
                collections::WEBHOOKS,
                doc! {"_id": &id, "last-update": existing.last_update},
                doc! {
                    "$set": {"hooks": hooks},
                    "$currentDate": {"last-update": {"$type": "timestamp"}},
                },
            ) {
                Ok(()) => return Ok(()),
                Err(Error::NotFound) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::Conflict(format!(
            "failed to delete a webhook for {id}"
        )))
    }

    /// The webhook URLs registered for an object type; `NotFound` when
    /// there are none
    pub fn retrieve_webhooks(&self, org_id: &str, object_type: &str) -> Result<Vec<String>> {
        let id = format!("{org_id}:{object_type}");
        let existing: WebhookDoc =
            self.fetch_typed(collections::WEBHOOKS, doc! {"_id": id}, None)?;
        if existing.hooks.is_empty() {
            return Err(Error::NotFound);
        }
        Ok(existing.hooks)
    }
}
