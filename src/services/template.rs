// src/services/template.rs

//! Request template manager.
//!
//! Owns the variables bag of a pagination query: strips cursor-like fields,
//! merges refreshed variables, enforces the page-size floor and injects the
//! next cursor under the designated key.

use serde_json::{Map, Value};

use crate::error::{AppError, Result};
use crate::models::{ExpansionConfig, QueryIdentity, RequestTemplate, TemplateConfig};

/// Builds ready-to-send requests from a stable template.
#[derive(Debug, Clone)]
pub struct TemplateManager {
    cursor_keys: Vec<String>,
    page_size_keys: Vec<String>,
    page_size_floor: u64,
    /// Variables from a later capture, layered over the base template
    refreshed: Option<Map<String, Value>>,
    expansion: ExpansionConfig,
}

impl TemplateManager {
    pub fn new(config: &TemplateConfig, page_size_floor: u64, expansion: ExpansionConfig) -> Self {
        Self {
            cursor_keys: config.cursor_keys.clone(),
            page_size_keys: config.page_size_keys.clone(),
            page_size_floor,
            refreshed: None,
            expansion,
        }
    }

    /// First reserved cursor key present in `variables`, in priority order.
    pub fn detect_cursor_key(&self, variables: &Map<String, Value>) -> Result<String> {
        self.cursor_keys
            .iter()
            .find(|key| variables.contains_key(key.as_str()))
            .cloned()
            .ok_or_else(|| {
                let present: Vec<&str> = variables.keys().map(String::as_str).collect();
                AppError::template(format!(
                    "none of the cursor keys {:?} present in variables {:?}",
                    self.cursor_keys, present
                ))
            })
    }

    /// Prepare a freshly captured template: detect its cursor key and return
    /// it together with the cursor value the capture carried, if any.
    pub fn adopt(&self, mut template: RequestTemplate) -> Result<(RequestTemplate, Option<String>)> {
        let key = self.detect_cursor_key(&template.variables)?;
        template.cursor_key = Some(key);
        let cursor = template.cursor_value().map(str::to_string);
        Ok((self.snapshot(&template), cursor))
    }

    /// Layer externally refreshed variables over every subsequent request.
    pub fn refresh(&mut self, variables: Map<String, Value>) {
        let mut variables = variables;
        self.strip_cursors(&mut variables);
        self.refreshed = Some(variables);
    }

    /// Take over the session of a later capture of the same query: its form
    /// parameters, its endpoint when it has one, and its variables.
    pub fn absorb_capture(&mut self, base: &mut RequestTemplate, fresh: &RequestTemplate) {
        base.params = fresh.params.clone();
        if !fresh.endpoint.is_empty() {
            base.endpoint = fresh.endpoint.clone();
        }
        self.refresh(fresh.variables.clone());
    }

    /// Template as it is actually sent, refreshed variables folded in and
    /// no cursor set. This is what a checkpoint stores.
    pub fn resolved(&self, template: &RequestTemplate) -> Result<RequestTemplate> {
        self.build_next_request(template, None)
    }

    /// Copy of `template` with every reserved cursor field removed.
    pub fn snapshot(&self, template: &RequestTemplate) -> RequestTemplate {
        let mut snapshot = template.clone();
        self.strip_cursors(&mut snapshot.variables);
        snapshot
    }

    /// Build the next request: base template, refreshed variables, cursor
    /// fields stripped, page size floored, then `cursor` under the cursor key.
    pub fn build_next_request(
        &self,
        template: &RequestTemplate,
        cursor: Option<&str>,
    ) -> Result<RequestTemplate> {
        let key = template
            .cursor_key
            .clone()
            .ok_or_else(|| AppError::template("template has no cursor key"))?;

        let mut request = template.clone();
        if let Some(refreshed) = &self.refreshed {
            for (k, v) in refreshed {
                request.variables.insert(k.clone(), v.clone());
            }
        }
        self.strip_cursors(&mut request.variables);
        self.apply_page_size_floor(&mut request.variables);

        if let Some(cursor) = cursor {
            request
                .variables
                .insert(key, Value::String(cursor.to_string()));
        }
        Ok(request)
    }

    /// Whether a reply-thread query is configured.
    pub fn expansion_enabled(&self) -> bool {
        self.expansion.is_enabled()
    }

    /// Reply-scoped request for `parent_id`, continuing from `token`.
    ///
    /// Session parameters and endpoint come from the feed template.
    pub fn build_expansion_request(
        &self,
        base: &RequestTemplate,
        parent_id: &str,
        token: Option<&str>,
    ) -> Result<RequestTemplate> {
        let doc_id = self
            .expansion
            .doc_id
            .clone()
            .ok_or_else(|| AppError::config("expansion query is not configured"))?;

        let mut variables = self.expansion.variables.clone();
        self.apply_page_size_floor(&mut variables);
        variables.insert(
            self.expansion.parent_key.clone(),
            Value::String(parent_id.to_string()),
        );
        if let Some(token) = token {
            variables.insert(
                self.expansion.token_key.clone(),
                Value::String(token.to_string()),
            );
        }

        Ok(RequestTemplate {
            endpoint: base.endpoint.clone(),
            params: base.params.clone(),
            variables,
            identity: QueryIdentity {
                doc_id,
                friendly_name: self.expansion.friendly_name.clone(),
            },
            cursor_key: Some(self.expansion.token_key.clone()),
        })
    }

    fn strip_cursors(&self, variables: &mut Map<String, Value>) {
        for key in &self.cursor_keys {
            variables.remove(key);
        }
    }

    fn apply_page_size_floor(&self, variables: &mut Map<String, Value>) {
        for key in &self.page_size_keys {
            if let Some(size) = variables.get(key).and_then(Value::as_u64) {
                if size < self.page_size_floor {
                    log::debug!(
                        "Raising {} from {} to {}",
                        key,
                        size,
                        self.page_size_floor
                    );
                    variables.insert(key.clone(), Value::from(self.page_size_floor));
                }
            }
        }
    }
}
