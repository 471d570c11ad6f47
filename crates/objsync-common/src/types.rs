//! Core type definitions for the objsync storage core
//!
//! This module defines the entities persisted by the store: object
//! metadata, destinations, notifications, organizations and ACLs, plus
//! the composite keys that identify them.
//!
//! Composite keys are colon-joined ASCII strings. The delimiter is part
//! of the on-disk contract and must not change.

use serde::{Deserialize, Serialize};

/// Builds the composite key of an object: `orgID:objectType:objectID`.
#[must_use]
pub fn object_key(org_id: &str, object_type: &str, object_id: &str) -> String {
    format!("{org_id}:{object_type}:{object_id}")
}

/// Builds the composite key of a destination: `orgID:destType:destID`.
#[must_use]
pub fn destination_key(org_id: &str, dest_type: &str, dest_id: &str) -> String {
    format!("{org_id}:{dest_type}:{dest_id}")
}

/// Builds the composite key of a notification:
/// `orgID:objectType:objectID:destType:destID`.
#[must_use]
pub fn notification_key(
    org_id: &str,
    object_type: &str,
    object_id: &str,
    dest_type: &str,
    dest_id: &str,
) -> String {
    format!("{org_id}:{object_type}:{object_id}:{dest_type}:{dest_id}")
}

/// Object status as tracked by the lifecycle engine.
///
/// `NotReadyToSend` and `ReadyToSend` only ever appear on the node that
/// originated the object; the `*Received` statuses only on receiving nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectStatus {
    /// The object is still being uploaded by its producer
    #[default]
    NotReadyToSend,
    /// The object is complete and can be delivered
    ReadyToSend,
    /// A receiving node got the metadata but not yet all the data
    PartiallyReceived,
    /// A receiving node got the metadata and all the data
    CompletelyReceived,
    /// The object was received without data (metadata-only path)
    ObjReceived,
    /// The object was marked as deleted
    ObjDeleted,
}

impl ObjectStatus {
    /// String form used in persisted documents and queries
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotReadyToSend => "notReadyToSend",
            Self::ReadyToSend => "readyToSend",
            Self::PartiallyReceived => "partiallyReceived",
            Self::CompletelyReceived => "completelyReceived",
            Self::ObjReceived => "objReceived",
            Self::ObjDeleted => "objDeleted",
        }
    }
}

/// Per-destination delivery status embedded in an object document
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DestinationStatus {
    /// Not yet picked up by the destination
    #[default]
    Pending,
    /// The object is being delivered to the destination
    Delivering,
    /// The destination received the object
    Delivered,
    /// The destination consumed the object
    Consumed,
    /// Delivery failed; see the accompanying message
    Error,
}

impl DestinationStatus {
    /// String form used in persisted documents and queries
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::Consumed => "consumed",
            Self::Error => "error",
        }
    }
}

/// Status of a delivery notification record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationStatus {
    /// An update needs to be sent to the destination
    #[default]
    Update,
    /// An update is waiting for an earlier exchange to finish
    UpdatePending,
    /// The update was sent and acknowledged
    Updated,
    /// A received acknowledgement needs to be sent
    Received,
    /// A consumed acknowledgement needs to be sent
    Consumed,
    ConsumedPending,
    /// A delete needs to be sent to the destination
    Delete,
    DeletePending,
    /// A deleted acknowledgement needs to be sent
    Deleted,
    DeletedPending,
    /// The destination asked for the object's data
    Getdata,
    /// Data is being transferred
    Data,
    /// The destination reported receipt of the object
    ReceivedByDestination,
    /// The destination reported consumption of the object
    ConsumedByDestination,
    /// The exchange with the destination failed
    Error,
}

impl NotificationStatus {
    /// String form used in persisted documents and queries
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::UpdatePending => "updatePending",
            Self::Updated => "updated",
            Self::Received => "received",
            Self::Consumed => "consumed",
            Self::ConsumedPending => "consumedPending",
            Self::Delete => "delete",
            Self::DeletePending => "deletePending",
            Self::Deleted => "deleted",
            Self::DeletedPending => "deletedPending",
            Self::Getdata => "getdata",
            Self::Data => "data",
            Self::ReceivedByDestination => "receivedByDestination",
            Self::ConsumedByDestination => "consumedByDestination",
            Self::Error => "error",
        }
    }
}

/// Object metadata as provided by the producer and tracked by the store.
///
/// `dest_type` and `dest_id` select the destinations the object is sent
/// to; an empty string acts as a wildcard. `activation_time` and
/// `expiration` are RFC3339 strings, empty when unset, so they can be
/// compared lexicographically in queries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaData {
    #[serde(rename = "object-id", default)]
    pub object_id: String,
    #[serde(rename = "object-type", default)]
    pub object_type: String,
    #[serde(rename = "destination-org-id", default)]
    pub dest_org_id: String,
    #[serde(rename = "destination-type", default)]
    pub dest_type: String,
    #[serde(rename = "destination-id", default)]
    pub dest_id: String,
    /// Upload time in nanoseconds since the epoch, set at the origin;
    /// identifies a specific content revision of the object
    #[serde(rename = "instance-id", default)]
    pub instance_id: i64,
    /// Number of consumers expected to consume the object
    #[serde(rename = "expected-consumers", default)]
    pub expected_consumers: i32,
    /// Inactive objects are not delivered until activated
    #[serde(default)]
    pub inactive: bool,
    /// RFC3339 time at which an inactive object becomes active; empty if none
    #[serde(rename = "activation-time", default)]
    pub activation_time: String,
    /// RFC3339 time after which the object is removed; empty if none
    #[serde(default)]
    pub expiration: String,
    /// The object carries no data at all
    #[serde(rename = "no-data", default)]
    pub no_data: bool,
    /// This update touches only the metadata; data is left as is
    #[serde(rename = "meta-only", default)]
    pub meta_only: bool,
    /// Delete the object once all its destinations consumed it
    #[serde(rename = "auto-delete", default)]
    pub auto_delete: bool,
    #[serde(rename = "object-size", default)]
    pub object_size: i64,
    #[serde(default)]
    pub deleted: bool,
}

impl MetaData {
    /// Composite key of the object this metadata describes
    #[must_use]
    pub fn object_key(&self) -> String {
        object_key(&self.dest_org_id, &self.object_type, &self.object_id)
    }
}

/// A target edge endpoint identified by `(orgID, destType, destID)`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    #[serde(rename = "destination-org-id", default)]
    pub dest_org_id: String,
    #[serde(rename = "destination-type", default)]
    pub dest_type: String,
    #[serde(rename = "destination-id", default)]
    pub dest_id: String,
    /// Communication protocol used to reach this destination
    #[serde(default)]
    pub communication: String,
}

impl Destination {
    /// Composite key of this destination
    #[must_use]
    pub fn key(&self) -> String {
        destination_key(&self.dest_org_id, &self.dest_type, &self.dest_id)
    }
}

/// Delivery state of an object at one of its destinations
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDestinationStatus {
    pub destination: Destination,
    pub status: DestinationStatus,
    /// Failure detail; meaningful when `status` is `Error`
    #[serde(default)]
    pub message: String,
}

/// A per-destination delivery control record with resend timing
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "object-type", default)]
    pub object_type: String,
    #[serde(rename = "object-id", default)]
    pub object_id: String,
    #[serde(rename = "destination-org-id", default)]
    pub dest_org_id: String,
    #[serde(rename = "destination-type", default)]
    pub dest_type: String,
    #[serde(rename = "destination-id", default)]
    pub dest_id: String,
    pub status: NotificationStatus,
    /// Content revision this notification refers to
    #[serde(rename = "instance-id", default)]
    pub instance_id: i64,
    /// Unix time at which the notification should be retransmitted
    #[serde(rename = "resend-time", default)]
    pub resend_time: i64,
}

impl Notification {
    /// Composite key of this notification
    #[must_use]
    pub fn key(&self) -> String {
        notification_key(
            &self.dest_org_id,
            &self.object_type,
            &self.object_id,
            &self.dest_type,
            &self.dest_id,
        )
    }
}

/// The status of an object at a given destination, derived from its
/// notification records
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDeliveryStatus {
    pub org_id: String,
    pub object_type: String,
    pub object_id: String,
    pub status: DestinationStatus,
}

/// Organization registered with the sync service
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    #[serde(rename = "org-id", default)]
    pub org_id: String,
    /// Broker user for this organization, if any
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Address of the organization's messaging broker
    #[serde(default)]
    pub address: String,
}

/// An organization together with the time its record was last written
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredOrganization {
    pub org: Organization,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Mapping of an organization to its messaging group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagingGroup {
    pub org_id: String,
    pub group_name: String,
}

/// The kind of entities an ACL protects
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclType {
    Objects,
    Destinations,
}

impl AclType {
    /// String form used in persisted documents and keys
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Objects => "objects",
            Self::Destinations => "destinations",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_keys() {
        assert_eq!(object_key("myorg", "model", "m1"), "myorg:model:m1");
        assert_eq!(destination_key("myorg", "gateway", "g1"), "myorg:gateway:g1");
        assert_eq!(
            notification_key("myorg", "model", "m1", "gateway", "g1"),
            "myorg:model:m1:gateway:g1"
        );
    }

    #[test]
    fn test_status_strings_match_serde() {
        let status = bson::to_bson(&ObjectStatus::ReadyToSend).unwrap();
        assert_eq!(status, bson::Bson::String("readyToSend".to_string()));
        assert_eq!(ObjectStatus::ReadyToSend.as_str(), "readyToSend");

        let status = bson::to_bson(&NotificationStatus::ReceivedByDestination).unwrap();
        assert_eq!(
            status,
            bson::Bson::String("receivedByDestination".to_string())
        );

        let status = bson::to_bson(&DestinationStatus::Delivering).unwrap();
        assert_eq!(status, bson::Bson::String("delivering".to_string()));
    }

    #[test]
    fn test_metadata_document_field_names() {
        let meta = MetaData {
            object_id: "m1".to_string(),
            object_type: "model".to_string(),
            dest_org_id: "myorg".to_string(),
            ..Default::default()
        };
        let doc = bson::to_document(&meta).unwrap();
        assert_eq!(doc.get_str("object-id").unwrap(), "m1");
        assert_eq!(doc.get_str("destination-org-id").unwrap(), "myorg");
        assert!(doc.get("instance-id").is_some());
    }
}
