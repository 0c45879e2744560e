//! Scripted transport for tests.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use crate::error::{AppError, Result};
use crate::models::{
    DOC_ID_PARAM, FRIENDLY_NAME_PARAM, RequestDescriptor, RequestTemplate, VARIABLES_PARAM,
};

use super::{RequestFilter, Transport};

/// One scripted answer to `replay`.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Body(String),
    Fail(String),
}

/// Replays a fixed response sequence and records what it was asked.
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    captures: VecDeque<RequestDescriptor>,
    replies: VecDeque<Reply>,
    pub requests: Vec<RequestTemplate>,
    pub discoveries: usize,
    pub reloads: usize,
    pub nudges: usize,
}

impl ScriptedTransport {
    pub fn new(capture: RequestDescriptor) -> Self {
        Self {
            captures: VecDeque::from([capture]),
            ..Self::default()
        }
    }

    /// Capture served after the next reload.
    pub fn then_capture(mut self, capture: RequestDescriptor) -> Self {
        self.captures.push_back(capture);
        self
    }

    pub fn reply(mut self, body: impl Into<String>) -> Self {
        self.replies.push_back(Reply::Body(body.into()));
        self
    }

    pub fn fail(mut self, times: usize) -> Self {
        for i in 0..times {
            self.replies
                .push_back(Reply::Fail(format!("scripted failure {}", i + 1)));
        }
        self
    }

    /// Value of `key` in the variables of the n-th replayed request.
    pub fn sent_variable(&self, n: usize, key: &str) -> Option<Value> {
        self.requests.get(n)?.variables.get(key).cloned()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn discover_first_request(
        &mut self,
        filter: &RequestFilter,
        _timeout: Duration,
    ) -> Result<RequestDescriptor> {
        self.discoveries += 1;
        self.captures
            .front()
            .filter(|c| filter.matches(c))
            .cloned()
            .ok_or_else(|| AppError::transport("discover", "no matching capture"))
    }

    async fn replay(&mut self, request: &RequestTemplate) -> Result<String> {
        self.requests.push(request.clone());
        match self.replies.pop_front() {
            Some(Reply::Body(body)) => Ok(body),
            Some(Reply::Fail(message)) => Err(AppError::transport("replay", message)),
            None => Err(AppError::transport("replay", "script exhausted")),
        }
    }

    async fn reload_origin(&mut self) -> Result<()> {
        self.reloads += 1;
        if self.captures.len() > 1 {
            self.captures.pop_front();
        }
        Ok(())
    }

    async fn nudge(&mut self) -> Result<()> {
        self.nudges += 1;
        Ok(())
    }
}

/// Captured feed request carrying `variables`.
pub(crate) fn capture(variables: Value) -> RequestDescriptor {
    RequestDescriptor {
        url: "https://example.com/api/graphql/".into(),
        method: "POST".into(),
        form: BTreeMap::from([
            ("av".to_string(), "1000".to_string()),
            (DOC_ID_PARAM.to_string(), "5001".to_string()),
            (
                FRIENDLY_NAME_PARAM.to_string(),
                "GroupsFeedPaginationQuery".to_string(),
            ),
            (VARIABLES_PARAM.to_string(), variables.to_string()),
        ]),
        captured_at: Utc::now(),
    }
}

/// Feed page holding stories with the given post ids.
pub(crate) fn feed_page(ids: &[&str], cursor: Option<&str>) -> String {
    let edges: Vec<Value> = ids
        .iter()
        .map(|id| {
            json!({"node": {
                "__typename": "Story",
                "post_id": id,
                "message": {"text": format!("post {id}")}
            }})
        })
        .collect();
    json!({
        "data": {"node": {"group_feed": {
            "edges": edges,
            "page_info": {"end_cursor": cursor, "has_next_page": cursor.is_some()}
        }}}
    })
    .to_string()
}
