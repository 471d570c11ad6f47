//! Object lifecycle engine.
//!
//! Status transitions, per-destination delivery state, consumer/receiver
//! counters and chunked-upload reassembly. Multi-field updates go through
//! the `last-update` token with a bounded retry loop; counter updates use
//! single-document `$inc` so they need no retry.

use crate::docstore::collections;
use crate::documents::{DestinationDoc, NotificationDoc, ObjectDoc};
use crate::payload::read_chunk;
use crate::store::{SyncStore, UploadHandle, MAX_UPDATE_TRIES};
use bson::doc;
use objsync_common::time::{now_nanos, now_rfc3339, rfc3339_in};
use objsync_common::{
    object_key, Destination, DestinationStatus, Error, MetaData, NotificationStatus,
    ObjectDeliveryStatus, ObjectStatus, Result, StoreDestinationStatus,
};
use std::io::Read;
use tracing::{debug, warn};

/// Out-of-order chunks kept per upload before new ones are discarded
pub(crate) const OUT_OF_ORDER_WINDOW: usize = 100;

/// Objects auto-deleted after full consumption linger this long
const AUTO_DELETE_GRACE_SECS: i64 = 3600;

impl SyncStore {
    /// Store an object: its payload if given, its metadata, and - when this
    /// node is the origin - a fresh instance id and the initial destinations
    /// list
    pub fn store_object(
        &self,
        mut metadata: MetaData,
        data: Option<&[u8]>,
        status: ObjectStatus,
    ) -> Result<()> {
        let id = metadata.object_key();
        if let Some(data) = data {
            self.payloads()
                .store(&id, &mut &data[..], data.len() as i64)?;
        } else if !metadata.meta_only || metadata.no_data {
            self.payloads().delete(&id)?;
        }

        let destinations = if matches!(
            status,
            ObjectStatus::NotReadyToSend | ObjectStatus::ReadyToSend
        ) {
            // the object came from a service, so this node is its origin
            metadata.instance_id = now_nanos();
            self.initial_destinations(&metadata)?
        } else {
            Vec::new()
        };

        let object = ObjectDoc {
            id: id.clone(),
            status,
            remaining_consumers: metadata.expected_consumers,
            // receivers inherit the expected consumer count
            remaining_receivers: metadata.expected_consumers,
            destinations,
            last_update: crate::documents::zero_ts(),
            metadata,
        };
        let org = object.metadata.dest_org_id.clone();
        self.docs().upsert(
            collections::OBJECTS,
            doc! {"_id": &id, "metadata.destination-org-id": org},
            bson::to_document(&object)?,
        )
    }

    /// Destinations matching the object's metadata filters, all `Pending`
    fn initial_destinations(&self, metadata: &MetaData) -> Result<Vec<StoreDestinationStatus>> {
        let mut filter = doc! {"destination.destination-org-id": metadata.dest_org_id.as_str()};
        if !metadata.dest_type.is_empty() {
            filter.insert("destination.destination-type", metadata.dest_type.as_str());
        }
        let docs: Vec<DestinationDoc> =
            self.fetch_all_typed(collections::DESTINATIONS, filter, None)?;
        Ok(docs
            .into_iter()
            .map(|d| d.destination)
            .filter(|d| metadata.dest_id.is_empty() || d.dest_id == metadata.dest_id)
            .map(|destination| StoreDestinationStatus {
                destination,
                status: DestinationStatus::Pending,
                message: String::new(),
            })
            .collect())
    }

    /// Append one chunk of a chunked upload. Out-of-delivery-order chunks
    /// are buffered per upload (up to [`OUT_OF_ORDER_WINDOW`] of them, then
    /// `Discarded`); `last_chunk` publishes the blob and evicts the handle.
    #[allow(clippy::too_many_arguments)]
    pub fn append_object_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        reader: &mut dyn Read,
        length: u32,
        offset: i64,
        total: i64,
        first_chunk: bool,
        last_chunk: bool,
    ) -> Result<()> {
        let id = object_key(org_id, object_type, object_id);
        let mut handle = if first_chunk {
            let _ = self.take_upload(&id);
            self.payloads().delete(&id)?;
            UploadHandle::new()
        } else {
            self.take_upload(&id).ok_or_else(|| {
                Error::storage(format!("no upload in progress for {id} at offset {offset}"))
            })?
        };

        let outcome = self.append_chunk(&id, &mut handle, reader, length, offset, total);
        match outcome {
            Ok(()) if last_chunk => {
                // publish; the handle is gone once the blob is visible
                let first = !handle.started;
                self.payloads().append(
                    &id,
                    &mut std::io::empty(),
                    0,
                    handle.offset,
                    total,
                    first,
                    true,
                )
            }
            outcome => {
                self.put_upload(id, handle);
                outcome
            }
        }
    }

    fn append_chunk(
        &self,
        id: &str,
        handle: &mut UploadHandle,
        reader: &mut dyn Read,
        length: u32,
        offset: i64,
        total: i64,
    ) -> Result<()> {
        let data = read_chunk(reader, length)?;
        if offset == handle.offset {
            let mut chunk = data;
            loop {
                debug!(id, offset = handle.offset, len = chunk.len(), "writing chunk");
                let first = !handle.started;
                self.payloads().append(
                    id,
                    &mut chunk.as_slice(),
                    chunk.len() as u32,
                    handle.offset,
                    total,
                    first,
                    false,
                )?;
                handle.started = true;
                handle.offset += chunk.len() as i64;
                // drain buffered chunks that are now in sequence
                match handle.chunks.remove(&handle.offset) {
                    Some(buffered) => chunk = buffered,
                    None => break,
                }
            }
        } else {
            if handle.chunks.len() >= OUT_OF_ORDER_WINDOW {
                return Err(Error::Discarded(format!(
                    "discarded chunk at offset {offset}: out-of-order window is full"
                )));
            }
            debug!(id, offset, buffered = handle.chunks.len() + 1, "buffering out-of-order chunk");
            handle.chunks.insert(offset, data);
        }
        Ok(())
    }

    /// Replace the object's payload in one shot. Returns `false` without
    /// error when the object does not exist. A `NotReadyToSend` object
    /// becomes `ReadyToSend`; a `ReadyToSend` object gets a fresh instance
    /// id since its content changed.
    pub fn store_object_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        reader: &mut dyn Read,
    ) -> Result<bool> {
        let id = object_key(org_id, object_type, object_id);
        let object: ObjectDoc = match self.fetch_typed(
            collections::OBJECTS,
            doc! {"_id": &id},
            Some(doc! {"status": 1}),
        ) {
            Ok(object) => object,
            Err(Error::NotFound) => return Ok(false),
            Err(err) => return Err(err),
        };

        match object.status {
            ObjectStatus::NotReadyToSend => {
                self.update_object_status(org_id, object_type, object_id, ObjectStatus::ReadyToSend)?;
            }
            ObjectStatus::ReadyToSend => {
                self.docs().update(
                    collections::OBJECTS,
                    doc! {"_id": &id},
                    doc! {
                        "$set": {"metadata.instance-id": now_nanos()},
                        "$currentDate": {"last-update": {"$type": "timestamp"}},
                    },
                )?;
            }
            _ => {}
        }

        let written = self.payloads().store(&id, reader, 0)?;
        self.docs().update(
            collections::OBJECTS,
            doc! {"_id": &id},
            doc! {"$set": {"metadata.object-size": written}},
        )?;
        Ok(true)
    }

    /// Open a streaming reader over the object's payload; backend resources
    /// are released when the reader is dropped. `None` when there is no
    /// payload.
    pub fn retrieve_object_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<Option<Box<dyn Read + Send>>> {
        let id = object_key(org_id, object_type, object_id);
        match self.payloads().get(&id) {
            Ok(reader) => Ok(Some(reader)),
            Err(Error::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Random-access read of the object's payload
    pub fn read_object_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        size: usize,
        offset: i64,
    ) -> Result<(Vec<u8>, bool, usize)> {
        let id = object_key(org_id, object_type, object_id);
        self.payloads().get_chunk(&id, size, offset)
    }

    /// The object's metadata; `None` when absent
    pub fn retrieve_object(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<Option<MetaData>> {
        let id = object_key(org_id, object_type, object_id);
        match self.fetch_typed::<ObjectDoc>(
            collections::OBJECTS,
            doc! {"_id": id},
            Some(doc! {"metadata": 1}),
        ) {
            Ok(object) => Ok(Some(object.metadata)),
            Err(Error::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// The object's metadata and status together
    pub fn retrieve_object_and_status(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<Option<(MetaData, ObjectStatus)>> {
        let id = object_key(org_id, object_type, object_id);
        match self.fetch_typed::<ObjectDoc>(collections::OBJECTS, doc! {"_id": id}, None) {
            Ok(object) => Ok(Some((object.metadata, object.status))),
            Err(Error::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// The object's status; `None` when absent
    pub fn retrieve_object_status(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<Option<ObjectStatus>> {
        let id = object_key(org_id, object_type, object_id);
        match self.fetch_typed::<ObjectDoc>(
            collections::OBJECTS,
            doc! {"_id": id},
            Some(doc! {"status": 1}),
        ) {
            Ok(object) => Ok(Some(object.status)),
            Err(Error::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Number of consumers that have not consumed the object yet
    pub fn retrieve_object_remaining_consumers(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<i32> {
        let id = object_key(org_id, object_type, object_id);
        let object: ObjectDoc = self.fetch_typed(
            collections::OBJECTS,
            doc! {"_id": id},
            Some(doc! {"remaining-consumers": 1}),
        )?;
        Ok(object.remaining_consumers)
    }

    /// Atomically decrement the remaining-consumers counter and read it back
    pub fn decrement_and_return_remaining_consumers(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<i32> {
        self.decrement_counter(org_id, object_type, object_id, "remaining-consumers")
    }

    /// Atomically decrement the remaining-receivers counter and read it back
    pub fn decrement_and_return_remaining_receivers(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<i32> {
        self.decrement_counter(org_id, object_type, object_id, "remaining-receivers")
    }

    fn decrement_counter(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        field: &str,
    ) -> Result<i32> {
        let id = object_key(org_id, object_type, object_id);
        let mut decrement = bson::Document::new();
        decrement.insert(field, -1_i32);
        self.docs().update(
            collections::OBJECTS,
            doc! {"_id": &id},
            doc! {
                "$inc": decrement,
                "$currentDate": {"last-update": {"$type": "timestamp"}},
            },
        )?;
        let mut projection = bson::Document::new();
        projection.insert(field, 1_i32);
        let object: ObjectDoc =
            self.fetch_typed(collections::OBJECTS, doc! {"_id": id}, Some(projection))?;
        Ok(match field {
            "remaining-receivers" => object.remaining_receivers,
            _ => object.remaining_consumers,
        })
    }

    /// Set the remaining-consumers counter back to the expected count.
    /// The receivers counter is left untouched.
    pub fn reset_object_remaining_consumers(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<()> {
        let id = object_key(org_id, object_type, object_id);
        let object: ObjectDoc = self.fetch_typed(
            collections::OBJECTS,
            doc! {"_id": &id},
            Some(doc! {"metadata": 1}),
        )?;
        self.docs().update(
            collections::OBJECTS,
            doc! {"_id": id},
            doc! {
                "$set": {"remaining-consumers": object.metadata.expected_consumers},
                "$currentDate": {"last-update": {"$type": "timestamp"}},
            },
        )
    }

    /// Destinations the object has to be sent to
    pub fn get_object_destinations(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<Vec<Destination>> {
        Ok(self
            .get_object_destinations_list(org_id, object_type, object_id)?
            .into_iter()
            .map(|d| d.destination)
            .collect())
    }

    /// Destinations the object has to be sent to, with delivery status
    pub fn get_object_destinations_list(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<Vec<StoreDestinationStatus>> {
        let id = object_key(org_id, object_type, object_id);
        match self.fetch_typed::<ObjectDoc>(
            collections::OBJECTS,
            doc! {"_id": id},
            Some(doc! {"destinations": 1}),
        ) {
            Ok(object) => Ok(object.destinations),
            Err(Error::NotFound) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Change the delivery status and/or message of one destination of the
    /// object. When the last destination of an auto-delete object reaches
    /// `Consumed`, the object is scheduled for removal by setting its
    /// expiration an hour out.
    #[allow(clippy::too_many_arguments)]
    pub fn update_object_delivery_status(
        &self,
        status: Option<DestinationStatus>,
        message: &str,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<()> {
        if status.is_none() && message.is_empty() {
            return Ok(());
        }
        let id = object_key(org_id, object_type, object_id);
        for _ in 0..MAX_UPDATE_TRIES {
            let mut object: ObjectDoc = self.fetch_typed(
                collections::OBJECTS,
                doc! {"_id": &id},
                Some(doc! {"metadata": 1, "destinations": 1, "last-update": 1}),
            )?;

            let mut found = false;
            let mut all_consumed = true;
            for dest in &mut object.destinations {
                if !found
                    && dest.destination.dest_type == dest_type
                    && dest.destination.dest_id == dest_id
                {
                    if !message.is_empty() || dest.status == DestinationStatus::Error {
                        dest.message = message.to_string();
                    }
                    if let Some(status) = status {
                        dest.status = status;
                    }
                    found = true;
                } else if dest.status != DestinationStatus::Consumed {
                    all_consumed = false;
                }
            }
            if !found {
                return Err(Error::storage(format!(
                    "object {id} has no destination {dest_type}/{dest_id}"
                )));
            }

            let mut set = doc! {"destinations": bson::to_bson(&object.destinations)?};
            if object.metadata.auto_delete
                && status == Some(DestinationStatus::Consumed)
                && all_consumed
                && object.metadata.expiration.is_empty()
            {
                // fully consumed: schedule the object for removal
                set.insert("metadata.expiration", rfc3339_in(AUTO_DELETE_GRACE_SECS));
            }
            match self.docs().update(
                collections::OBJECTS,
                doc! {"_id": &id, "last-update": object.last_update},
                doc! {
                    "$set": set,
                    "$currentDate": {"last-update": {"$type": "timestamp"}},
                },
            ) {
                Ok(()) => return Ok(()),
                Err(Error::NotFound) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::Conflict(format!(
            "failed to update delivery status of {id}"
        )))
    }

    /// Mark every destination of the object as being delivered to
    pub fn update_object_delivering(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<()> {
        let id = object_key(org_id, object_type, object_id);
        for _ in 0..MAX_UPDATE_TRIES {
            let mut object: ObjectDoc = self.fetch_typed(
                collections::OBJECTS,
                doc! {"_id": &id},
                Some(doc! {"destinations": 1, "last-update": 1}),
            )?;
            for dest in &mut object.destinations {
                dest.status = DestinationStatus::Delivering;
            }
            match self.docs().update(
                collections::OBJECTS,
                doc! {"_id": &id, "last-update": object.last_update},
                doc! {
                    "$set": {"destinations": bson::to_bson(&object.destinations)?},
                    "$currentDate": {"last-update": {"$type": "timestamp"}},
                },
            ) {
                Ok(()) => return Ok(()),
                Err(Error::NotFound) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::Conflict(format!(
            "failed to mark {id} as delivering"
        )))
    }

    /// Objects that should be offered to the given destination. As a side
    /// effect the destination is recorded on each matched object, status
    /// `Delivering` for objects being returned, `Pending` otherwise.
    pub fn retrieve_objects(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<Vec<MetaData>> {
        let query = doc! {
            "metadata.destination-org-id": org_id,
            "$or": [
                {"status": ObjectStatus::ReadyToSend.as_str()},
                {"status": ObjectStatus::NotReadyToSend.as_str()},
            ],
        };
        'fetch: for _ in 0..MAX_UPDATE_TRIES {
            let objects: Vec<ObjectDoc> =
                self.fetch_all_typed(collections::OBJECTS, query.clone(), None)?;
            let mut result = Vec::new();
            for mut object in objects {
                let meta = &object.metadata;
                if !(meta.dest_type.is_empty() || meta.dest_type == dest_type)
                    || !(meta.dest_id.is_empty() || meta.dest_id == dest_id)
                {
                    continue;
                }
                let mut status = DestinationStatus::Pending;
                if object.status == ObjectStatus::ReadyToSend && !meta.inactive {
                    result.push(object.metadata.clone());
                    status = DestinationStatus::Delivering;
                }
                let Some(destination) = self.retrieve_destination(org_id, dest_type, dest_id)?
                else {
                    continue;
                };
                // record the destination, never duplicating an entry
                match object.destinations.iter_mut().find(|d| {
                    d.destination.dest_type == dest_type && d.destination.dest_id == dest_id
                }) {
                    Some(existing) => existing.status = status,
                    None => object.destinations.push(StoreDestinationStatus {
                        destination,
                        status,
                        message: String::new(),
                    }),
                }
                match self.docs().update(
                    collections::OBJECTS,
                    doc! {"_id": &object.id, "last-update": object.last_update},
                    doc! {
                        "$set": {"destinations": bson::to_bson(&object.destinations)?},
                        "$currentDate": {"last-update": {"$type": "timestamp"}},
                    },
                ) {
                    Ok(()) => {}
                    Err(Error::NotFound) => continue 'fetch,
                    Err(err) => return Err(err),
                }
            }
            return Ok(result);
        }
        Err(Error::Conflict(format!(
            "failed to record destination {dest_type}/{dest_id} on the matched objects"
        )))
    }

    /// Edge-updated objects a receiving node should hand to its services
    pub fn retrieve_updated_objects(
        &self,
        org_id: &str,
        object_type: &str,
        received: bool,
    ) -> Result<Vec<MetaData>> {
        let mut statuses = vec![
            doc! {"status": ObjectStatus::CompletelyReceived.as_str()},
            doc! {"status": ObjectStatus::ObjDeleted.as_str()},
        ];
        if received {
            statuses.push(doc! {"status": ObjectStatus::ObjReceived.as_str()});
        }
        let query = doc! {
            "$or": statuses,
            "metadata.destination-org-id": org_id,
            "metadata.object-type": object_type,
        };
        let objects: Vec<ObjectDoc> = self.fetch_all_typed(collections::OBJECTS, query, None)?;
        Ok(objects.into_iter().map(|o| o.metadata).collect())
    }

    /// Inactive objects whose activation time has passed
    pub fn get_objects_to_activate(&self) -> Result<Vec<(MetaData, ObjectStatus)>> {
        let now = now_rfc3339();
        let query = doc! {
            "$or": [
                {"status": ObjectStatus::NotReadyToSend.as_str()},
                {"status": ObjectStatus::ReadyToSend.as_str()},
            ],
            "metadata.inactive": true,
            "$and": [
                {"metadata.activation-time": {"$ne": ""}},
                {"metadata.activation-time": {"$lte": now}},
            ],
        };
        let objects: Vec<ObjectDoc> = self.fetch_all_typed(
            collections::OBJECTS,
            query,
            Some(doc! {"metadata": 1, "status": 1}),
        )?;
        Ok(objects.into_iter().map(|o| (o.metadata, o.status)).collect())
    }

    /// Set the object's status
    pub fn update_object_status(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        status: ObjectStatus,
    ) -> Result<()> {
        let id = object_key(org_id, object_type, object_id);
        self.docs().update(
            collections::OBJECTS,
            doc! {"_id": id},
            doc! {
                "$set": {"status": status.as_str()},
                "$currentDate": {"last-update": {"$type": "timestamp"}},
            },
        )
    }

    /// Mark the object as deleted; it stays around until its destinations
    /// acknowledge the deletion
    pub fn mark_object_deleted(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<()> {
        let id = object_key(org_id, object_type, object_id);
        self.docs().update(
            collections::OBJECTS,
            doc! {"_id": id},
            doc! {
                "$set": {"status": ObjectStatus::ObjDeleted.as_str(), "metadata.deleted": true},
                "$currentDate": {"last-update": {"$type": "timestamp"}},
            },
        )
    }

    /// Clear the inactive flag of a scheduled object
    pub fn activate_object(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<()> {
        let id = object_key(org_id, object_type, object_id);
        self.docs().update(
            collections::OBJECTS,
            doc! {"_id": id},
            doc! {
                "$set": {"metadata.inactive": false},
                "$currentDate": {"last-update": {"$type": "timestamp"}},
            },
        )
    }

    /// Remove the object and its payload
    pub fn delete_stored_object(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<()> {
        let id = object_key(org_id, object_type, object_id);
        debug!(id, "deleting object");
        if let Err(err) = self.payloads().delete(&id) {
            warn!(id, error = %err, "failed to delete object payload");
        }
        self.docs()
            .remove_all(collections::OBJECTS, doc! {"_id": id})
    }

    /// Remove the object's payload only
    pub fn delete_stored_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<()> {
        let id = object_key(org_id, object_type, object_id);
        debug!(id, "deleting object payload");
        self.payloads().delete(&id)
    }

    /// The objects in use at a destination, with their delivery status as
    /// seen through that destination's notification records
    pub fn get_objects_for_destination(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<Vec<ObjectDeliveryStatus>> {
        let query = doc! {
            "$or": [
                {"notification.status": NotificationStatus::Update.as_str()},
                {"notification.status": NotificationStatus::UpdatePending.as_str()},
                {"notification.status": NotificationStatus::Updated.as_str()},
                {"notification.status": NotificationStatus::ReceivedByDestination.as_str()},
                {"notification.status": NotificationStatus::ConsumedByDestination.as_str()},
                {"notification.status": NotificationStatus::Error.as_str()},
            ],
            "notification.destination-org-id": org_id,
            "notification.destination-id": dest_id,
            "notification.destination-type": dest_type,
        };
        let records: Vec<NotificationDoc> =
            self.fetch_all_typed(collections::NOTIFICATIONS, query, None)?;
        Ok(records
            .into_iter()
            .map(|record| {
                let n = record.notification;
                let status = match n.status {
                    NotificationStatus::ReceivedByDestination => DestinationStatus::Delivered,
                    NotificationStatus::ConsumedByDestination => DestinationStatus::Consumed,
                    NotificationStatus::Error => DestinationStatus::Error,
                    _ => DestinationStatus::Delivering,
                };
                ObjectDeliveryStatus {
                    org_id: org_id.to_string(),
                    object_type: n.object_type,
                    object_id: n.object_id,
                    status,
                }
            })
            .collect())
    }
}
