//! Recipient filters.
//!
//! A filter selects clients by role or id, either including or excluding the
//! listed values. A client matches a list of filters when it matches all of
//! them, so an empty list matches every client.

use crate::client::{ClientIdentity, Role};
use serde::{Deserialize, Serialize};

/// Client property a filter inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterProperty {
    Role,
    Id,
}

/// Whether listed values are accepted or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    Include,
    Exclude,
}

/// A single recipient predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFilter {
    pub property: FilterProperty,
    pub mode: FilterMode,
    pub values: Vec<String>,
}

impl MessageFilter {
    /// Accept clients with the given role.
    pub fn with_role(role: Role) -> Self {
        Self::with_roles(&[role])
    }

    /// Accept clients with any of the given roles.
    pub fn with_roles(roles: &[Role]) -> Self {
        Self {
            property: FilterProperty::Role,
            mode: FilterMode::Include,
            values: roles.iter().map(|r| r.as_str().to_string()).collect(),
        }
    }

    /// Accept only the client with this id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self::with_ids([id.into()])
    }

    /// Accept clients with any of these ids.
    pub fn with_ids(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            property: FilterProperty::Id,
            mode: FilterMode::Include,
            values: ids.into_iter().collect(),
        }
    }

    /// Reject the client with this id.
    pub fn without_id(id: impl Into<String>) -> Self {
        Self::without_ids([id.into()])
    }

    /// Reject clients with any of these ids.
    pub fn without_ids(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            property: FilterProperty::Id,
            mode: FilterMode::Exclude,
            values: ids.into_iter().collect(),
        }
    }

    /// Main-role clients only.
    pub fn main_only() -> Self {
        Self::with_role(Role::Main)
    }

    /// Popout-role clients only.
    pub fn popouts_only() -> Self {
        Self::with_role(Role::Popout)
    }

    /// Check a single client against this filter.
    pub fn accepts(&self, client: &ClientIdentity) -> bool {
        let value = match self.property {
            FilterProperty::Role => client.role.as_str(),
            FilterProperty::Id => client.id.as_str(),
        };
        let listed = self.values.iter().any(|v| v == value);
        (self.mode == FilterMode::Include) == listed
    }
}

/// Check a client against every filter.
pub fn matches(client: &ClientIdentity, filters: &[MessageFilter]) -> bool {
    filters.iter().all(|f| f.accepts(client))
}
