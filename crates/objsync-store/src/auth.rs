//! Development-only authentication seed.
//!
//! Loads `<persistence root>/sync/dummy-auth.json` and classifies app
//! keys. App secrets are ignored: user keys look like `userID@orgID` or
//! `email@domain@orgID`, edge-node keys like `orgID/destType/destID`.
//! Users absent from the seed file are treated as admins of their
//! organization.

use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use tracing::warn;

const SEED_FILE: &str = "sync/dummy-auth.json";

#[derive(Debug, Default, Deserialize)]
struct AuthSeed {
    #[serde(rename = "regularUsers", default)]
    regular_users: Vec<String>,
    #[serde(rename = "syncAdmins", default)]
    sync_admins: Vec<String>,
}

/// What an app key identifies as
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppKeyIdentity {
    /// An edge node; `id` is `destType/destID`
    EdgeNode { org_id: String, id: String },
    /// A regular user of an organization
    User { org_id: String, user: String },
    /// An administrator of an organization
    Admin { org_id: String, user: String },
    /// A service-wide administrator
    SyncAdmin { user: String },
    /// The key matches no known shape
    Invalid,
}

/// Dummy authenticator for development deployments
#[derive(Debug, Default)]
pub struct DummyAuthenticator {
    regular_users: Vec<String>,
    sync_admins: Vec<String>,
}

impl DummyAuthenticator {
    /// Load the seed file. A missing or malformed file leaves both user
    /// sets empty.
    pub fn load(persistence_root: &Path) -> Self {
        let path = persistence_root.join(SEED_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to open auth seed file");
                return Self::default();
            }
        };
        match serde_json::from_reader::<_, AuthSeed>(file) {
            Ok(seed) => Self {
                regular_users: seed.regular_users,
                sync_admins: seed.sync_admins,
            },
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to parse auth seed file");
                Self::default()
            }
        }
    }

    /// Classify an app key against the seed lists
    #[must_use]
    pub fn classify(&self, app_key: &str) -> AppKeyIdentity {
        let parts: Vec<&str> = app_key.split('/').collect();
        if parts.len() == 3 {
            return AppKeyIdentity::EdgeNode {
                org_id: parts[0].to_string(),
                id: format!("{}/{}", parts[1], parts[2]),
            };
        }

        let parts: Vec<&str> = app_key.split('@').collect();
        let user = match parts.len() {
            2 => parts[0].to_string(),
            3 => format!("{}@{}", parts[0], parts[1]),
            _ => return AppKeyIdentity::Invalid,
        };
        let org_id = parts[parts.len() - 1].to_string();

        if self.regular_users.contains(&user) {
            return AppKeyIdentity::User { org_id, user };
        }
        if self.sync_admins.contains(&user) {
            return AppKeyIdentity::SyncAdmin { user };
        }
        AppKeyIdentity::Admin { org_id, user }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (tempfile::TempDir, DummyAuthenticator) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sync")).unwrap();
        std::fs::write(
            dir.path().join(SEED_FILE),
            r#"{"regularUsers": ["alice", "bob@example.com"], "syncAdmins": ["root"]}"#,
        )
        .unwrap();
        let auth = DummyAuthenticator::load(dir.path());
        (dir, auth)
    }

    #[test]
    fn test_missing_seed_file_yields_empty_sets() {
        let dir = tempfile::tempdir().unwrap();
        let auth = DummyAuthenticator::load(dir.path());
        // nobody is a regular user, so everyone is an org admin
        assert_eq!(
            auth.classify("anyone@myorg"),
            AppKeyIdentity::Admin {
                org_id: "myorg".to_string(),
                user: "anyone".to_string()
            }
        );
    }

    #[test]
    fn test_classification() {
        let (_dir, auth) = seeded();

        assert_eq!(
            auth.classify("myorg/gw/g1"),
            AppKeyIdentity::EdgeNode {
                org_id: "myorg".to_string(),
                id: "gw/g1".to_string()
            }
        );
        assert_eq!(
            auth.classify("alice@myorg"),
            AppKeyIdentity::User {
                org_id: "myorg".to_string(),
                user: "alice".to_string()
            }
        );
        assert_eq!(
            auth.classify("bob@example.com@myorg"),
            AppKeyIdentity::User {
                org_id: "myorg".to_string(),
                user: "bob@example.com".to_string()
            }
        );
        assert_eq!(
            auth.classify("root@myorg"),
            AppKeyIdentity::SyncAdmin {
                user: "root".to_string()
            }
        );
        assert_eq!(
            auth.classify("carol@myorg"),
            AppKeyIdentity::Admin {
                org_id: "myorg".to_string(),
                user: "carol".to_string()
            }
        );
        assert_eq!(auth.classify("garbage"), AppKeyIdentity::Invalid);
    }
}
