//! Harvested entities and nested expansion work.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Person or page that authored a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One extracted business entity (post, comment, reply).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identity used for deduplication
    pub resource_id: String,

    /// Raw source id as found in the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Type discriminator value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,

    /// Engagement counters (max observed value per name)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,

    /// Unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permalink: Option<String>,

    /// Resource id of the shared/reposted entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_from: Option<String>,

    /// Parent record for replies harvested through an expansion job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_count: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expansion_token: Option<String>,
}

impl Record {
    /// Fold another occurrence of the same entity into this one.
    ///
    /// Counters keep the maximum; every other field keeps the first
    /// non-empty value.
    pub fn merge(&mut self, other: Record) {
        for (name, value) in other.counters {
            let slot = self.counters.entry(name).or_insert(0);
            *slot = (*slot).max(value);
        }
        self.reply_count = match (self.reply_count, other.reply_count) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if self.media.is_empty() {
            self.media = other.media;
        }
        self.id = self.id.take().or(other.id);
        self.kind = self.kind.take().or(other.kind);
        self.author = self.author.take().or(other.author);
        self.text = self.text.take().or(other.text);
        self.created_at = self.created_at.or(other.created_at);
        self.permalink = self.permalink.take().or(other.permalink);
        self.shared_from = self.shared_from.take().or(other.shared_from);
        self.parent_id = self.parent_id.take().or(other.parent_id);
        self.expansion_token = self.expansion_token.take().or(other.expansion_token);
    }

    /// Id used to address this record's reply thread.
    pub fn parent_key(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.resource_id)
    }

    /// Expansion job for this record's nested children, if it reports any.
    pub fn expansion_job(&self) -> Option<ExpansionJob> {
        match self.reply_count {
            Some(n) if n > 0 => Some(ExpansionJob {
                parent_id: self.parent_key().to_string(),
                continuation_token: self.expansion_token.clone(),
            }),
            _ => None,
        }
    }
}

/// Secondary pagination task for a record's nested children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionJob {
    pub parent_id: String,
    pub continuation_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_takes_max_counters() {
        let mut a = Record {
            resource_id: "1".into(),
            counters: BTreeMap::from([("reaction_count".to_string(), 4)]),
            ..Record::default()
        };
        let b = Record {
            resource_id: "1".into(),
            text: Some("hello".into()),
            counters: BTreeMap::from([
                ("reaction_count".to_string(), 9),
                ("share_count".to_string(), 2),
            ]),
            ..Record::default()
        };
        a.merge(b);
        assert_eq!(a.counters["reaction_count"], 9);
        assert_eq!(a.counters["share_count"], 2);
        assert_eq!(a.text.as_deref(), Some("hello"));
    }

    #[test]
    fn test_merge_keeps_first_text() {
        let mut a = Record {
            resource_id: "1".into(),
            text: Some("first".into()),
            ..Record::default()
        };
        a.merge(Record {
            resource_id: "1".into(),
            text: Some("second".into()),
            ..Record::default()
        });
        assert_eq!(a.text.as_deref(), Some("first"));
    }

    #[test]
    fn test_expansion_job_requires_children() {
        let mut r = Record {
            resource_id: "77".into(),
            id: Some("Y29tbWVudDo3Nw==".into()),
            expansion_token: Some("tok".into()),
            ..Record::default()
        };
        assert!(r.expansion_job().is_none());

        r.reply_count = Some(2);
        let job = r.expansion_job().unwrap();
        assert_eq!(job.parent_id, "Y29tbWVudDo3Nw==");
        assert_eq!(job.continuation_token.as_deref(), Some("tok"));
    }
}
