//! Application configuration structures.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AppError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Which feed is being harvested
    #[serde(default)]
    pub target: TargetConfig,

    /// Session and transport behavior
    #[serde(default)]
    pub session: SessionConfig,

    /// Output, checkpoint and diagnostics locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Pagination controller limits
    #[serde(default)]
    pub harvest: HarvestConfig,

    /// Request template handling
    #[serde(default)]
    pub template: TemplateConfig,

    /// Entity and cursor fingerprints
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Secondary (reply thread) query
    #[serde(default)]
    pub expansion: ExpansionConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.session.user_agent.trim().is_empty() {
            return Err(AppError::validation("session.user_agent is empty"));
        }
        if self.session.timeout_secs == 0 {
            return Err(AppError::validation("session.timeout_secs must be > 0"));
        }
        if self.session.discovery_timeout_secs == 0 {
            return Err(AppError::validation(
                "session.discovery_timeout_secs must be > 0",
            ));
        }
        if self.session.capture_capacity == 0 {
            return Err(AppError::validation("session.capture_capacity must be > 0"));
        }
        if self.harvest.page_size_floor == 0 {
            return Err(AppError::validation("harvest.page_size_floor must be > 0"));
        }
        if self.harvest.no_progress_limit == 0 {
            return Err(AppError::validation("harvest.no_progress_limit must be > 0"));
        }
        if self.harvest.jitter_min_ms > self.harvest.jitter_max_ms {
            return Err(AppError::validation(
                "harvest.jitter_min_ms must not exceed harvest.jitter_max_ms",
            ));
        }
        if self.template.cursor_keys.is_empty() {
            return Err(AppError::validation("template.cursor_keys is empty"));
        }
        if self.extraction.cursor_fields.is_empty() {
            return Err(AppError::validation("extraction.cursor_fields is empty"));
        }
        if !self.target.origin_url.is_empty() {
            Url::parse(&self.target.origin_url)?;
        }
        if !self.target.endpoint.is_empty() {
            Url::parse(&self.target.endpoint)?;
        }
        if self.expansion.doc_id.is_some()
            && (self.expansion.parent_key.trim().is_empty()
                || self.expansion.token_key.trim().is_empty())
        {
            return Err(AppError::validation(
                "expansion.parent_key and expansion.token_key are required with expansion.doc_id",
            ));
        }
        Ok(())
    }
}

/// Identity of the harvested feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Free-form target identifier (group or page id)
    #[serde(default)]
    pub id: String,

    /// View that provokes the first pagination request
    #[serde(default)]
    pub origin_url: String,

    /// Query endpoint used when a captured request has no URL
    #[serde(default)]
    pub endpoint: String,

    /// Substring of the friendly name the discovered request must carry
    #[serde(default)]
    pub query_name: Option<String>,

    /// Exact document id the discovered request must carry
    #[serde(default)]
    pub doc_id: Option<String>,
}

/// Session/transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// User-Agent header for replayed requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// How long to wait for a matching captured request
    #[serde(default = "defaults::discovery_timeout")]
    pub discovery_timeout_secs: u64,

    /// Run the rendering session without a visible window
    #[serde(default = "defaults::headless")]
    pub headless: bool,

    /// JSON file holding captured requests
    #[serde(default)]
    pub capture_file: Option<PathBuf>,

    /// Number of captured requests retained
    #[serde(default = "defaults::capture_capacity")]
    pub capture_capacity: usize,

    /// Extra headers sent with every replay
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            discovery_timeout_secs: defaults::discovery_timeout(),
            headless: defaults::headless(),
            capture_file: None,
            capture_capacity: defaults::capture_capacity(),
            headers: BTreeMap::new(),
        }
    }
}

/// File locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Append-only record log (one JSON record per line)
    #[serde(default = "defaults::output_log")]
    pub output_log: PathBuf,

    /// Checkpoint file, overwritten atomically after each page
    #[serde(default = "defaults::checkpoint")]
    pub checkpoint: PathBuf,

    /// Raw bodies that failed to parse
    #[serde(default = "defaults::dump_dir")]
    pub dump_dir: PathBuf,

    /// Summary of the last run
    #[serde(default = "defaults::summary")]
    pub summary: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_log: defaults::output_log(),
            checkpoint: defaults::checkpoint(),
            dump_dir: defaults::dump_dir(),
            summary: defaults::summary(),
        }
    }
}

/// What to do when a resumed checkpoint belongs to a different query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMismatch {
    /// Adopt the live template but keep resuming from the stored cursor
    #[default]
    TrustCursor,
    /// Adopt the live template and start from its own first page
    DiscardCursor,
}

/// Pagination controller limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Minimum page size injected into requests
    #[serde(default = "defaults::page_size_floor")]
    pub page_size_floor: u64,

    /// Consecutive pages without new records before recovery
    #[serde(default = "defaults::no_progress_limit")]
    pub no_progress_limit: usize,

    /// Stop after this many top-level pages
    #[serde(default)]
    pub max_pages: Option<usize>,

    /// Stop after this many recoveries that only nudged the session
    #[serde(default)]
    pub max_idle_rounds: Option<usize>,

    /// Transport failures tolerated in a row before the run fails
    #[serde(default = "defaults::max_recovery_attempts")]
    pub max_recovery_attempts: usize,

    /// Lower bound of the delay between requests
    #[serde(default = "defaults::jitter_min")]
    pub jitter_min_ms: u64,

    /// Upper bound of the delay between requests
    #[serde(default = "defaults::jitter_max")]
    pub jitter_max_ms: u64,

    /// Compare the checkpointed query identity with a live capture on resume
    #[serde(default)]
    pub verify_identity: bool,

    /// Policy applied when `verify_identity` finds a different query
    #[serde(default)]
    pub identity_mismatch: IdentityMismatch,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            page_size_floor: defaults::page_size_floor(),
            no_progress_limit: defaults::no_progress_limit(),
            max_pages: None,
            max_idle_rounds: None,
            max_recovery_attempts: defaults::max_recovery_attempts(),
            jitter_min_ms: defaults::jitter_min(),
            jitter_max_ms: defaults::jitter_max(),
            verify_identity: false,
            identity_mismatch: IdentityMismatch::default(),
        }
    }
}

/// Request template handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Variable names that may carry the cursor, in priority order
    #[serde(default = "defaults::cursor_keys")]
    pub cursor_keys: Vec<String>,

    /// Variable names that carry the page size
    #[serde(default = "defaults::page_size_keys")]
    pub page_size_keys: Vec<String>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            cursor_keys: defaults::cursor_keys(),
            page_size_keys: defaults::page_size_keys(),
        }
    }
}

/// Structural fingerprints used by the deep extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Type discriminator key
    #[serde(default = "defaults::type_key")]
    pub type_key: String,

    /// Discriminator values that mark an entity node
    #[serde(default = "defaults::entity_types")]
    pub entity_types: Vec<String>,

    /// Fields whose presence marks an entity node
    #[serde(default = "defaults::identity_fields")]
    pub identity_fields: Vec<String>,

    /// Fields holding a canonical numeric id, in priority order
    #[serde(default = "defaults::numeric_id_fields")]
    pub numeric_id_fields: Vec<String>,

    /// Fields holding a permalink
    #[serde(default = "defaults::permalink_fields")]
    pub permalink_fields: Vec<String>,

    /// Response fields carrying the next cursor
    #[serde(default = "defaults::cursor_fields")]
    pub cursor_fields: Vec<String>,

    /// Take the shallowest cursor field rather than the first one met in
    /// walk order, so cursors of nested reply connections never win
    #[serde(default = "defaults::shallowest_cursor")]
    pub shallowest_cursor: bool,

    /// Response fields carrying an explicit has-next flag
    #[serde(default = "defaults::has_next_fields")]
    pub has_next_fields: Vec<String>,

    /// Engagement counters
    #[serde(default = "defaults::counter_fields")]
    pub counter_fields: Vec<String>,

    /// Fields reporting the number of nested replies
    #[serde(default = "defaults::reply_count_fields")]
    pub reply_count_fields: Vec<String>,

    /// Fields carrying the token that opens the reply thread
    #[serde(default = "defaults::expansion_token_fields")]
    pub expansion_token_fields: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            type_key: defaults::type_key(),
            entity_types: defaults::entity_types(),
            identity_fields: defaults::identity_fields(),
            numeric_id_fields: defaults::numeric_id_fields(),
            permalink_fields: defaults::permalink_fields(),
            cursor_fields: defaults::cursor_fields(),
            shallowest_cursor: defaults::shallowest_cursor(),
            has_next_fields: defaults::has_next_fields(),
            counter_fields: defaults::counter_fields(),
            reply_count_fields: defaults::reply_count_fields(),
            expansion_token_fields: defaults::expansion_token_fields(),
        }
    }
}

/// Reply-thread query. Disabled while `doc_id` is unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpansionConfig {
    #[serde(default)]
    pub doc_id: Option<String>,

    #[serde(default)]
    pub friendly_name: String,

    /// Variable receiving the parent record id
    #[serde(default)]
    pub parent_key: String,

    /// Variable receiving the continuation token
    #[serde(default)]
    pub token_key: String,

    /// Static variables sent with every reply request
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
}

impl ExpansionConfig {
    pub fn is_enabled(&self) -> bool {
        self.doc_id.is_some()
    }
}

mod defaults {
    use std::path::PathBuf;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    // Session defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0".into()
    }
    pub fn timeout() -> u64 {
        30
    }
    pub fn discovery_timeout() -> u64 {
        45
    }
    pub fn headless() -> bool {
        true
    }
    pub fn shallowest_cursor() -> bool {
        true
    }
    pub fn capture_capacity() -> usize {
        64
    }

    // Path defaults
    pub fn output_log() -> PathBuf {
        PathBuf::from("state/records.jsonl")
    }
    pub fn checkpoint() -> PathBuf {
        PathBuf::from("state/checkpoint.json")
    }
    pub fn dump_dir() -> PathBuf {
        PathBuf::from("state/failures")
    }
    pub fn summary() -> PathBuf {
        PathBuf::from("state/last_run.json")
    }

    // Harvest defaults
    pub fn page_size_floor() -> u64 {
        10
    }
    pub fn no_progress_limit() -> usize {
        3
    }
    pub fn max_recovery_attempts() -> usize {
        3
    }
    pub fn jitter_min() -> u64 {
        800
    }
    pub fn jitter_max() -> u64 {
        2200
    }

    // Template defaults
    pub fn cursor_keys() -> Vec<String> {
        strings(&[
            "cursor",
            "after",
            "afterCursor",
            "feedAfterCursor",
            "commentsAfterCursor",
            "end_cursor",
        ])
    }
    pub fn page_size_keys() -> Vec<String> {
        strings(&["count", "first", "pageSize", "page_size", "limit"])
    }

    // Extraction defaults
    pub fn type_key() -> String {
        "__typename".into()
    }
    pub fn entity_types() -> Vec<String> {
        strings(&["Story", "Post", "Comment", "Reply"])
    }
    pub fn identity_fields() -> Vec<String> {
        strings(&["post_id", "comment_id", "legacy_fbid"])
    }
    pub fn numeric_id_fields() -> Vec<String> {
        strings(&["post_id", "comment_id", "legacy_fbid", "id"])
    }
    pub fn permalink_fields() -> Vec<String> {
        strings(&["permalink_url", "url", "wwwURL", "permalink"])
    }
    pub fn cursor_fields() -> Vec<String> {
        strings(&["end_cursor", "endCursor", "next_cursor", "nextCursor"])
    }
    pub fn has_next_fields() -> Vec<String> {
        strings(&["has_next_page", "hasNextPage", "has_more"])
    }
    pub fn counter_fields() -> Vec<String> {
        strings(&["reaction_count", "comment_count", "share_count", "view_count"])
    }
    pub fn reply_count_fields() -> Vec<String> {
        strings(&["total_reply_count", "reply_count", "replies_count"])
    }
    pub fn expansion_token_fields() -> Vec<String> {
        strings(&["expansion_token", "reply_expansion_token"])
    }
}
