//! Message shapes exchanged with clients, shared by the WebSocket channel and
//! the HTTP routes.

use clickrank_core::{RankedResult, SearchError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Deserialize)]
pub struct QueryMessage {
    pub query: String,
    #[serde(default)]
    pub filters: Option<Vec<String>>,
}

impl QueryMessage {
    pub fn filter_set(&self) -> Option<BTreeSet<String>> {
        self.filters.as_ref().map(|f| f.iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedbackMessage {
    pub query: String,
    pub url: String,
    pub clicked: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Feedback { feedback: FeedbackMessage },
    Query(QueryMessage),
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorReply {
    pub error: ErrorDetail,
}

impl From<&SearchError> for ErrorReply {
    fn from(e: &SearchError) -> Self {
        Self { error: ErrorDetail { kind: e.kind(), message: e.to_string() } }
    }
}

pub fn results_json(results: &[RankedResult]) -> String {
    serde_json::to_string(results).unwrap_or_else(|e| error_json(&SearchError::Serialization(e.to_string())))
}

pub fn error_json(e: &SearchError) -> String {
    serde_json::to_string(&ErrorReply::from(e))
        .unwrap_or_else(|_| r#"{"error":{"kind":"serialization","message":"unencodable error"}}"#.to_string())
}
