//! Names of the persisted collections.

pub const OBJECTS: &str = "objects";
pub const DESTINATIONS: &str = "destinations";
pub const NOTIFICATIONS: &str = "notifications";
pub const WEBHOOKS: &str = "webhooks";
pub const ACLS: &str = "acls";
pub const LEADER: &str = "leader";
pub const MESSAGING_GROUPS: &str = "messaging-groups";
pub const ORGANIZATIONS: &str = "organizations";

// Owned by the database payload backend
pub const PAYLOAD_FILES: &str = "payloads.files";
pub const PAYLOAD_CHUNKS: &str = "payloads.chunks";
