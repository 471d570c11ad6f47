//! Persisted document shapes.
//!
//! One struct per collection, serialized to BSON. Field names are part of
//! the on-disk contract; the `last-update` / `last-heartbeat-ts` fields
//! carry the server-side token used for optimistic concurrency and default
//! to the zero timestamp on insert.

use bson::Timestamp;
use objsync_common::{
    Destination, MetaData, Notification, ObjectStatus, Organization, StoreDestinationStatus,
};
use serde::{Deserialize, Serialize};

pub(crate) fn zero_ts() -> Timestamp {
    Timestamp {
        time: 0,
        increment: 0,
    }
}

/// A row of the `objects` collection
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub metadata: MetaData,
    #[serde(default)]
    pub status: ObjectStatus,
    #[serde(rename = "remaining-consumers", default)]
    pub remaining_consumers: i32,
    #[serde(rename = "remaining-receivers", default)]
    pub remaining_receivers: i32,
    #[serde(default)]
    pub destinations: Vec<StoreDestinationStatus>,
    #[serde(rename = "last-update", default = "zero_ts")]
    pub last_update: Timestamp,
}

/// A row of the `destinations` collection
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DestinationDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub destination: Destination,
}

/// A row of the `notifications` collection
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub notification: Notification,
}

/// The singleton leader lease document (`_id` = 1)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaderDoc {
    #[serde(rename = "_id")]
    pub id: i32,
    pub uuid: String,
    #[serde(rename = "last-heartbeat-ts", default = "zero_ts")]
    pub last_heartbeat_ts: Timestamp,
    #[serde(rename = "heartbeat-timeout")]
    pub heartbeat_timeout: i32,
    pub version: i64,
}

/// A row of the `webhooks` collection, keyed by `orgID:objectType`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub hooks: Vec<String>,
    #[serde(rename = "last-update", default = "zero_ts")]
    pub last_update: Timestamp,
}

/// A row of the `acls` collection, keyed by `aclType:orgID:key`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AclDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub usernames: Vec<String>,
    #[serde(rename = "org-id")]
    pub org_id: String,
    #[serde(rename = "acl-type")]
    pub acl_type: String,
    #[serde(rename = "key", default)]
    pub key: String,
    #[serde(rename = "last-update", default = "zero_ts")]
    pub last_update: Timestamp,
}

/// A row of the `organizations` collection
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrganizationDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub org: Organization,
    #[serde(rename = "last-update", default = "zero_ts")]
    pub last_update: Timestamp,
}

/// A row of the `messaging-groups` collection
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessagingGroupDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "group-name")]
    pub group_name: String,
    #[serde(rename = "last-update", default = "zero_ts")]
    pub last_update: Timestamp,
}

/// A row of the `payloads.files` collection: maps an object key to the
/// chunked blob currently published for it
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PayloadFileDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "blob-id")]
    pub blob_id: String,
    pub length: i64,
    #[serde(rename = "chunk-size")]
    pub chunk_size: i64,
}

/// A row of the `payloads.chunks` collection
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PayloadChunkDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "blob-id")]
    pub blob_id: String,
    pub n: i64,
    #[serde(with = "serde_bytes_bson")]
    pub data: Vec<u8>,
}

/// BSON binary (de)serialization for chunk data
mod serde_bytes_bson {
    use bson::{Binary, Bson};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        Bson::Binary(Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: data.to_vec(),
        })
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Bson::deserialize(deserializer)? {
            Bson::Binary(bin) => Ok(bin.bytes),
            other => Err(serde::de::Error::custom(format!(
                "expected binary chunk data, got {other}"
            ))),
        }
    }
}
