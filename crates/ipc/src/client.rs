//! Client identities carried by every envelope.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known client id of the base-main window.
pub const BASE_MAIN_ID: &str = "main";

/// Role a window plays on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Main,
    Popout,
}

impl Role {
    /// Wire name of the role, as matched by filters.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Main => "main",
            Role::Popout => "popout",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one window on the bus.
///
/// Timestamps are milliseconds since the Unix epoch. Only `updated_at`
/// changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    pub id: String,
    pub role: Role,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ClientIdentity {
    /// Create an identity stamped at `now`.
    pub fn new(id: impl Into<String>, role: Role, now: u64) -> Self {
        Self {
            id: id.into(),
            role,
            created_at: now,
            updated_at: now,
        }
    }

    /// Identity of the base-main window.
    pub fn base_main(now: u64) -> Self {
        Self::new(BASE_MAIN_ID, Role::Main, now)
    }

    /// Whether this is the base-main client.
    pub fn is_base_main(&self) -> bool {
        self.role == Role::Main && self.id == BASE_MAIN_ID
    }

    /// Refresh the last-seen timestamp.
    pub fn touch(&mut self, now: u64) {
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_main_identity() {
        let client = ClientIdentity::base_main(42);
        assert!(client.is_base_main());
        assert_eq!(client.created_at, 42);
        assert_eq!(client.updated_at, 42);

        let popout = ClientIdentity::new(BASE_MAIN_ID, Role::Popout, 42);
        assert!(!popout.is_base_main());
    }

    #[test]
    fn test_touch_only_moves_updated_at() {
        let mut client = ClientIdentity::new("a1b2c3d4", Role::Popout, 10);
        client.touch(99);
        assert_eq!(client.created_at, 10);
        assert_eq!(client.updated_at, 99);
    }

    #[test]
    fn test_identity_wire_format() {
        let client = ClientIdentity::new("a1b2c3d4", Role::Popout, 5);
        let json = serde_json::to_string(&client).unwrap();
        assert!(json.contains("\"role\":\"popout\""));
        assert!(json.contains("\"createdAt\":5"));
    }
}
