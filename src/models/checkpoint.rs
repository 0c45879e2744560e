//! Resumable harvest state.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::template::{QueryIdentity, RequestTemplate};

/// Durable resume point for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Cursor to resume from; `None` once the feed was exhausted
    #[serde(default)]
    pub cursor: Option<String>,

    /// Template snapshot with every cursor field stripped
    #[serde(default)]
    pub vars_template: Option<RequestTemplate>,

    #[serde(default)]
    pub cursor_key: Option<String>,

    #[serde(default)]
    pub query_identity: Option<QueryIdentity>,

    /// Resource ids already written to the output log
    #[serde(default)]
    pub dedup_keys: BTreeSet<String>,

    /// Top-level pages committed across all runs
    #[serde(default)]
    pub pages_committed: usize,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            cursor: None,
            vars_template: None,
            cursor_key: None,
            query_identity: None,
            dedup_keys: BTreeSet::new(),
            pages_committed: 0,
            timestamp: Utc::now(),
        }
    }
}

impl Checkpoint {
    /// Whether this checkpoint carries enough to skip first-page discovery.
    pub fn is_resumable(&self) -> bool {
        self.cursor.as_deref().is_some_and(|c| !c.is_empty())
            && self.vars_template.is_some()
            && self.cursor_key.is_some()
    }

    /// Whether the stored query matches a live one.
    pub fn matches_identity(&self, live: &QueryIdentity) -> bool {
        self.query_identity.as_ref() == Some(live)
    }
}
