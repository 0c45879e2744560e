//! Transport adapter seam.
//!
//! The harvester never drives the session itself. It asks the transport for
//! the most recent captured request matching a filter, and asks it to replay
//! a request template and hand back the raw response text. Session-level
//! recovery (reload the origin view, nudge the session) also goes through here.

pub mod capture;
pub mod http;
#[cfg(test)]
pub(crate) mod scripted;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{RequestDescriptor, RequestTemplate, TargetConfig, TemplateConfig};

pub use capture::CaptureBuffer;
pub use http::HttpTransport;

/// Predicate selecting the feed's pagination request among captured traffic.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    /// Substring of the friendly name
    pub friendly_name: Option<String>,
    /// Exact document id
    pub doc_id: Option<String>,
    /// At least one of these variables must be present (empty: no check)
    pub cursor_keys: Vec<String>,
}

impl RequestFilter {
    pub fn from_config(target: &TargetConfig, template: &TemplateConfig) -> Self {
        Self {
            friendly_name: target.query_name.clone(),
            doc_id: target.doc_id.clone(),
            cursor_keys: template.cursor_keys.clone(),
        }
    }

    pub fn matches(&self, request: &RequestDescriptor) -> bool {
        if let Some(wanted) = &self.friendly_name {
            if !request.friendly_name().is_some_and(|n| n.contains(wanted.as_str())) {
                return false;
            }
        }
        if let Some(wanted) = &self.doc_id {
            if request.doc_id() != Some(wanted.as_str()) {
                return false;
            }
        }
        if self.cursor_keys.is_empty() {
            return true;
        }
        request
            .variables()
            .is_some_and(|vars| self.cursor_keys.iter().any(|k| vars.contains_key(k.as_str())))
    }
}

/// Live page session as seen by the harvester.
#[async_trait]
pub trait Transport: Send {
    /// Most recent captured request matching `filter`, waiting up to `timeout`.
    async fn discover_first_request(
        &mut self,
        filter: &RequestFilter,
        timeout: Duration,
    ) -> Result<RequestDescriptor>;

    /// Send `request` within the session and return the raw body.
    async fn replay(&mut self, request: &RequestTemplate) -> Result<String>;

    /// Reload the origin view so a fresh pagination request gets captured.
    async fn reload_origin(&mut self) -> Result<()> {
        Ok(())
    }

    /// Poke the session (scroll) without reloading it.
    async fn nudge(&mut self) -> Result<()> {
        Ok(())
    }
}
