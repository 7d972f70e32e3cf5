//! Node entity (spec §3 "Node").

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable node identifier. Strings rather than a numeric key so an
/// in-memory test registry and a real relational one can agree on the same
/// wire representation without a sequence generator.
pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminStatus {
    Active,
    Inactive,
    Maintenance,
}

impl AdminStatus {
    pub fn is_active(self) -> bool {
        matches!(self, AdminStatus::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub address: String,
    pub credentials: String,
    pub bucket: String,
    /// Lower priority value is preferred.
    pub priority: i32,
    pub admin_status: AdminStatus,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

impl Node {
    /// Ordering key for tie-breaks: lowest priority, then lowest id.
    pub fn tie_break_key(&self) -> (i32, &str) {
        (self.priority, self.id.as_str())
    }
}
