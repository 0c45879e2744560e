// src/services/extractor.rs

//! Deep extractor.
//!
//! Finds entity nodes anywhere in a response tree by structural fingerprint,
//! turns them into [`Record`]s, and reads the pagination signals (next
//! cursor, has-next flag) from the same tree.

use std::collections::{HashMap, HashSet};

use scraper::{Html, Selector};
use serde_json::{Map, Value};

use crate::error::{AppError, Result};
use crate::models::{Author, ExpansionJob, ExtractionConfig, Record};
use crate::services::tree::{self, NodeClassifier, Visit};
use crate::utils::content_hash;
use crate::utils::url::{extract_permalink_id, is_digits};

/// Transport-level noise some endpoints prepend to JSON bodies.
const NOISE_PREFIXES: [&str; 4] = ["for (;;);", "for(;;);", ")]}'", "while(1);"];

const EMBEDDED_JSON_SELECTOR: &str = r#"script[type="application/json"]"#;

const AUTHOR_KEYS: [&str; 3] = ["author", "owner", "actors"];
const TEXT_PATHS: [&[&str]; 5] = [
    &["message", "text"],
    &["body", "text"],
    &["comment_body", "text"],
    &["text"],
    &["message"],
];
const MEDIA_ROOTS: [&str; 5] = ["attachments", "attachment", "media", "photo_image", "image"];
const MEDIA_KEYS: [&str; 3] = ["uri", "src", "playable_url"];
const CREATED_KEYS: [&str; 3] = ["creation_time", "created_time", "timestamp"];
const SHARED_KEYS: [&str; 3] = ["attached_story", "shared_story", "attached_post"];

/// Result of extracting one response body.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub records: Vec<Record>,
    pub next_cursor: Option<String>,
    pub has_next: Option<bool>,
    pub expansion_jobs: Vec<ExpansionJob>,
}

impl Extraction {
    /// An empty page that ends pagination.
    pub fn closed() -> Self {
        Self {
            has_next: Some(false),
            ..Self::default()
        }
    }

    /// Cursor to continue with, honoring an explicit "no more" flag.
    pub fn continuation(&self) -> Option<&str> {
        if self.has_next == Some(false) {
            return None;
        }
        self.next_cursor.as_deref()
    }
}

/// Structural fingerprint of an entity node.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    type_key: String,
    entity_types: HashSet<String>,
    identity_fields: Vec<String>,
}

impl Fingerprint {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            type_key: config.type_key.clone(),
            entity_types: config.entity_types.iter().cloned().collect(),
            identity_fields: config.identity_fields.clone(),
        }
    }
}

impl NodeClassifier for Fingerprint {
    fn is_entity(&self, node: &Map<String, Value>) -> bool {
        let typed = node
            .get(&self.type_key)
            .and_then(Value::as_str)
            .is_some_and(|t| self.entity_types.contains(t));
        typed
            || self
                .identity_fields
                .iter()
                .any(|f| node.get(f).is_some_and(|v| !v.is_null()))
    }
}

/// Walks response trees and produces records and pagination signals.
#[derive(Debug, Clone)]
pub struct Extractor {
    config: ExtractionConfig,
    fingerprint: Fingerprint,
    volatile: HashSet<String>,
}

impl Extractor {
    pub fn new(config: ExtractionConfig) -> Self {
        let fingerprint = Fingerprint::new(&config);
        let volatile = config
            .cursor_fields
            .iter()
            .chain(&config.has_next_fields)
            .chain(&config.counter_fields)
            .chain(&config.reply_count_fields)
            .chain(&config.expansion_token_fields)
            .cloned()
            .collect();
        Self {
            config,
            fingerprint,
            volatile,
        }
    }

    /// Parse and extract a raw response body.
    ///
    /// Fails with [`AppError::Parse`] only when the body stays unparseable
    /// after the cleanup fallbacks.
    pub fn extract(&self, body: &str) -> Result<Extraction> {
        let mut docs = parse_documents(body)?;
        let root = if docs.len() == 1 {
            docs.remove(0)
        } else {
            Value::Array(docs)
        };
        Ok(self.extract_tree(&root))
    }

    /// Extract from an already-parsed tree.
    pub fn extract_tree(&self, root: &Value) -> Extraction {
        let mut records: Vec<Record> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for node in tree::find_entities(root, &self.fingerprint) {
            let record = self.record_from_node(node);
            match positions.get(&record.resource_id) {
                Some(&pos) => records[pos].merge(record),
                None => {
                    positions.insert(record.resource_id.clone(), records.len());
                    records.push(record);
                }
            }
        }

        let next_cursor = self.find_cursor(root);
        let has_next = self.find_has_next(root).or(Some(next_cursor.is_some()));
        let expansion_jobs = records.iter().filter_map(Record::expansion_job).collect();

        Extraction {
            records,
            next_cursor,
            has_next,
            expansion_jobs,
        }
    }

    /// First distinct cursor field in the tree.
    ///
    /// With `shallowest_cursor` set (the default) this departs from plain
    /// walk order: entity nodes may carry cursors of their own nested
    /// connections, so the candidates are ordered by depth first.
    fn find_cursor(&self, root: &Value) -> Option<String> {
        let mut hits: Vec<(&str, &str, usize)> = tree::collect_fields(root, &self.config.cursor_fields)
            .into_iter()
            .filter_map(|(key, value, depth)| {
                value
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .map(|s| (key, s, depth))
            })
            .collect();
        if self.config.shallowest_cursor {
            hits.sort_by_key(|&(_, _, depth)| depth);
        }

        let mut seen = HashSet::new();
        hits.retain(|&(key, value, _)| seen.insert((key, value)));
        if hits.len() > 1 {
            log::debug!("{} distinct cursor candidates, using {}", hits.len(), hits[0].1);
        }
        hits.first().map(|&(_, value, _)| value.to_string())
    }

    fn find_has_next(&self, root: &Value) -> Option<bool> {
        tree::collect_fields(root, &self.config.has_next_fields)
            .into_iter()
            .filter_map(|(_, value, depth)| value.as_bool().map(|b| (b, depth)))
            .min_by_key(|&(_, depth)| depth)
            .map(|(flag, _)| flag)
    }

    fn record_from_node(&self, node: &Map<String, Value>) -> Record {
        let permalink = self.find_permalink(node);
        let resource_id = self.derive_resource_id(node, permalink.as_deref());

        let mut record = Record {
            resource_id,
            id: node.get("id").and_then(scalar_string),
            kind: node
                .get(&self.config.type_key)
                .and_then(Value::as_str)
                .map(str::to_string),
            author: find_author(node),
            text: find_text(node),
            media: self.find_media(node),
            permalink,
            shared_from: self.find_shared(node),
            ..Record::default()
        };

        tree::walk_own(node, &self.fingerprint, &mut |n| {
            let Some(key) = n.key else { return };
            if self.config.counter_fields.iter().any(|c| c == key) {
                if let Some(count) = counter_value(n.value) {
                    let slot = record.counters.entry(key.to_string()).or_insert(0);
                    *slot = (*slot).max(count);
                }
            } else if self.config.reply_count_fields.iter().any(|c| c == key) {
                if let Some(count) = counter_value(n.value) {
                    record.reply_count = Some(record.reply_count.unwrap_or(0).max(count));
                }
            } else if self.config.expansion_token_fields.iter().any(|c| c == key) {
                if record.expansion_token.is_none() {
                    record.expansion_token =
                        n.value.as_str().filter(|s| !s.is_empty()).map(str::to_string);
                }
            } else if CREATED_KEYS.contains(&key) && record.created_at.is_none() {
                record.created_at = n.value.as_i64();
            }
        });

        record
    }

    /// Canonical numeric id, then permalink digits, then a content hash.
    fn derive_resource_id(&self, node: &Map<String, Value>, permalink: Option<&str>) -> String {
        for field in &self.config.numeric_id_fields {
            if let Some(id) = node.get(field).and_then(scalar_string) {
                if is_digits(&id) {
                    return id;
                }
            }
        }
        if let Some(id) = permalink.and_then(extract_permalink_id) {
            return id;
        }
        content_hash(&self.normalize(&Value::Object(node.clone())))
    }

    /// Drop fields that change between fetches of the same entity.
    fn normalize(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(k, _)| !self.volatile.contains(k.as_str()))
                    .map(|(k, v)| (k.clone(), self.normalize(v)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.normalize(v)).collect()),
            other => other.clone(),
        }
    }

    fn find_permalink(&self, node: &Map<String, Value>) -> Option<String> {
        let direct = self
            .config
            .permalink_fields
            .iter()
            .filter_map(|f| node.get(f).and_then(Value::as_str))
            .find(|s| s.starts_with("http"));
        if let Some(url) = direct {
            return Some(url.to_string());
        }

        let mut nested = None;
        tree::walk_own(node, &self.fingerprint, &mut |n| {
            if nested.is_some() {
                return;
            }
            let Some(key) = n.key else { return };
            if self.config.permalink_fields.iter().any(|f| f == key) {
                if let Some(url) = n.value.as_str() {
                    if extract_permalink_id(url).is_some() {
                        nested = Some(url.to_string());
                    }
                }
            }
        });
        nested
    }

    fn find_media(&self, node: &Map<String, Value>) -> Vec<String> {
        let mut media: Vec<String> = Vec::new();
        for root in MEDIA_ROOTS {
            let Some(subtree) = node.get(root) else { continue };
            tree::walk(subtree, &mut |n| {
                if let Value::Object(child) = n.value {
                    if self.fingerprint.is_entity(child) {
                        return Visit::Skip;
                    }
                }
                if let (Some(key), Some(url)) = (n.key, n.value.as_str()) {
                    if MEDIA_KEYS.contains(&key)
                        && url.starts_with("http")
                        && !media.iter().any(|m| m == url)
                    {
                        media.push(url.to_string());
                    }
                }
                Visit::Descend
            });
        }
        media
    }

    fn find_shared(&self, node: &Map<String, Value>) -> Option<String> {
        SHARED_KEYS.iter().find_map(|key| match node.get(*key) {
            Some(Value::Object(shared)) if self.fingerprint.is_entity(shared) => {
                let permalink = self.find_permalink(shared);
                Some(self.derive_resource_id(shared, permalink.as_deref()))
            }
            _ => None,
        })
    }
}

/// String form of a string or integer value.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A counter is either a bare number or an object with a `count` field.
fn counter_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::Object(map) => map.get("count").and_then(Value::as_u64),
        _ => None,
    }
}

fn find_author(node: &Map<String, Value>) -> Option<Author> {
    AUTHOR_KEYS.iter().find_map(|key| {
        let value = node.get(*key)?;
        let obj = match value {
            Value::Array(items) => items.first()?.as_object()?,
            Value::Object(obj) => obj,
            _ => return None,
        };
        let author = Author {
            id: obj.get("id").and_then(scalar_string),
            name: obj.get("name").and_then(Value::as_str).map(str::to_string),
        };
        (author.id.is_some() || author.name.is_some()).then_some(author)
    })
}

fn find_text(node: &Map<String, Value>) -> Option<String> {
    TEXT_PATHS.iter().find_map(|path| {
        let (first, rest) = path.split_first()?;
        let mut value = node.get(*first)?;
        for segment in rest {
            value = value.get(*segment)?;
        }
        value
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// Parse a raw body into one or more JSON documents.
///
/// Tries a plain parse first, then strips known prefix noise and reads a
/// stream of concatenated or newline-delimited documents, then looks for
/// JSON embedded in an HTML page.
pub fn parse_documents(body: &str) -> Result<Vec<Value>> {
    let trimmed = body.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        return Err(AppError::parse("empty response body"));
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(vec![value]);
    }

    let docs = parse_stream(strip_noise(trimmed));
    if !docs.is_empty() {
        log::debug!("Recovered {} document(s) after cleanup", docs.len());
        return Ok(docs);
    }

    if trimmed.starts_with('<') {
        let docs = embedded_documents(trimmed)?;
        if !docs.is_empty() {
            log::debug!("Recovered {} embedded document(s) from HTML", docs.len());
            return Ok(docs);
        }
    }

    Err(AppError::parse(format!(
        "no JSON document in {} byte body",
        body.len()
    )))
}

fn strip_noise(text: &str) -> &str {
    let mut text = text.trim();
    while let Some(prefix) = NOISE_PREFIXES.iter().find(|p| text.starts_with(**p)) {
        text = text[prefix.len()..].trim_start();
    }
    text
}

/// Concatenated documents, falling back to one document per line.
fn parse_stream(text: &str) -> Vec<Value> {
    let mut docs = Vec::new();
    let mut broken = false;
    for item in serde_json::Deserializer::from_str(text).into_iter::<Value>() {
        match item {
            Ok(value) => docs.push(value),
            Err(_) => {
                broken = true;
                break;
            }
        }
    }
    if broken {
        docs = text
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(strip_noise(line)).ok())
            .collect();
    }
    docs.retain(|v| v.is_object() || v.is_array());
    docs
}

fn embedded_documents(html: &str) -> Result<Vec<Value>> {
    let selector = Selector::parse(EMBEDDED_JSON_SELECTOR)
        .map_err(|e| AppError::selector(EMBEDDED_JSON_SELECTOR, format!("{e:?}")))?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&selector)
        .flat_map(|script| parse_stream(&script.text().collect::<String>()))
        .collect())
}
