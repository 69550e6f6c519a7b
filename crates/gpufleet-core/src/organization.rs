//! Tenants sharing the GPU pool

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An organization owning a fleet and submitting jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    /// Stable identifier used on every GPU and job record
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}
