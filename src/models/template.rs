//! Request shapes exchanged with the transport.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, Result};

/// Form field carrying the JSON-encoded variables document.
pub const VARIABLES_PARAM: &str = "variables";
/// Form field carrying the persisted query id.
pub const DOC_ID_PARAM: &str = "doc_id";
/// Form field carrying the human-readable query name.
pub const FRIENDLY_NAME_PARAM: &str = "fb_api_req_friendly_name";

/// Which persisted query a template targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryIdentity {
    pub doc_id: String,
    pub friendly_name: String,
}

impl std::fmt::Display for QueryIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.friendly_name, self.doc_id)
    }
}

/// A raw request observed on the session, as handed over by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    /// Decoded form body
    #[serde(default)]
    pub form: BTreeMap<String, String>,

    #[serde(default = "Utc::now")]
    pub captured_at: DateTime<Utc>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl RequestDescriptor {
    pub fn friendly_name(&self) -> Option<&str> {
        self.form.get(FRIENDLY_NAME_PARAM).map(String::as_str)
    }

    pub fn doc_id(&self) -> Option<&str> {
        self.form.get(DOC_ID_PARAM).map(String::as_str)
    }

    /// Parsed `variables` document, if present and well-formed.
    pub fn variables(&self) -> Option<Map<String, Value>> {
        let raw = self.form.get(VARIABLES_PARAM)?;
        match serde_json::from_str::<Value>(raw).ok()? {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }
}

/// Parameter bag for one pagination query.
///
/// A stored template never carries a live cursor value; the template
/// manager injects the cursor into a per-request copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTemplate {
    pub endpoint: String,

    /// Opaque form parameters (session tokens etc.)
    #[serde(default)]
    pub params: BTreeMap<String, String>,

    /// Structured query parameters
    #[serde(default)]
    pub variables: Map<String, Value>,

    pub identity: QueryIdentity,

    /// Variable name carrying the pagination token, once discovered
    #[serde(default)]
    pub cursor_key: Option<String>,
}

impl RequestTemplate {
    /// Build a template from a captured request.
    ///
    /// The variables are kept verbatim here; cursor stripping is the
    /// template manager's job.
    pub fn from_descriptor(descriptor: &RequestDescriptor, fallback_endpoint: &str) -> Result<Self> {
        let variables = match descriptor.form.get(VARIABLES_PARAM) {
            None => Map::new(),
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                Ok(other) => {
                    return Err(AppError::template(format!(
                        "variables is not an object: {other}"
                    )));
                }
                Err(e) => {
                    return Err(AppError::template(format!("variables is not JSON: {e}")));
                }
            },
        };

        let params = descriptor
            .form
            .iter()
            .filter(|(k, _)| {
                !matches!(
                    k.as_str(),
                    VARIABLES_PARAM | DOC_ID_PARAM | FRIENDLY_NAME_PARAM
                )
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let endpoint = if descriptor.url.is_empty() {
            fallback_endpoint.to_string()
        } else {
            descriptor.url.clone()
        };

        Ok(Self {
            endpoint,
            params,
            variables,
            identity: QueryIdentity {
                doc_id: descriptor.doc_id().unwrap_or_default().to_string(),
                friendly_name: descriptor.friendly_name().unwrap_or_default().to_string(),
            },
            cursor_key: None,
        })
    }

    /// Current value of the cursor variable, if any.
    pub fn cursor_value(&self) -> Option<&str> {
        let key = self.cursor_key.as_deref()?;
        self.variables
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Encode as form fields for the wire.
    pub fn to_form(&self) -> Vec<(String, String)> {
        let mut form: Vec<(String, String)> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !self.identity.doc_id.is_empty() {
            form.push((DOC_ID_PARAM.to_string(), self.identity.doc_id.clone()));
        }
        if !self.identity.friendly_name.is_empty() {
            form.push((
                FRIENDLY_NAME_PARAM.to_string(),
                self.identity.friendly_name.clone(),
            ));
        }
        form.push((
            VARIABLES_PARAM.to_string(),
            Value::Object(self.variables.clone()).to_string(),
        ));
        form
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> RequestDescriptor {
        let mut form = BTreeMap::new();
        form.insert("av".to_string(), "1000".to_string());
        form.insert(DOC_ID_PARAM.to_string(), "555".to_string());
        form.insert(
            FRIENDLY_NAME_PARAM.to_string(),
            "GroupsFeedPaginationQuery".to_string(),
        );
        form.insert(
            VARIABLES_PARAM.to_string(),
            r#"{"id":"42","count":3,"cursor":"abc"}"#.to_string(),
        );
        RequestDescriptor {
            url: "https://example.com/api/graphql/".to_string(),
            method: "POST".to_string(),
            form,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn test_from_descriptor_splits_fields() {
        let template = RequestTemplate::from_descriptor(&descriptor(), "").unwrap();
        assert_eq!(template.identity.doc_id, "555");
        assert_eq!(template.identity.friendly_name, "GroupsFeedPaginationQuery");
        assert_eq!(template.params.len(), 1);
        assert_eq!(template.variables["count"], 3);
        assert!(template.cursor_key.is_none());
    }

    #[test]
    fn test_rejects_non_json_variables() {
        let mut d = descriptor();
        d.form
            .insert(VARIABLES_PARAM.to_string(), "{broken".to_string());
        assert!(matches!(
            RequestTemplate::from_descriptor(&d, ""),
            Err(AppError::Template(_))
        ));
    }

    #[test]
    fn test_fallback_endpoint() {
        let mut d = descriptor();
        d.url.clear();
        let template = RequestTemplate::from_descriptor(&d, "https://fallback/").unwrap();
        assert_eq!(template.endpoint, "https://fallback/");
    }

    #[test]
    fn test_to_form_encodes_variables() {
        let mut template = RequestTemplate::from_descriptor(&descriptor(), "").unwrap();
        template.cursor_key = Some("cursor".to_string());
        assert_eq!(template.cursor_value(), Some("abc"));

        let form = template.to_form();
        let vars = form
            .iter()
            .find(|(k, _)| k == VARIABLES_PARAM)
            .map(|(_, v)| v.clone())
            .unwrap();
        let parsed: Value = serde_json::from_str(&vars).unwrap();
        assert_eq!(parsed["id"], "42");
        assert!(form.iter().any(|(k, v)| k == DOC_ID_PARAM && v == "555"));
    }
}
