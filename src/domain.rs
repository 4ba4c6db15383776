//! Core data model: inbound request, classification, and the payload shared
//! between the cache and the coalescer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /infer`.
#[derive(Debug, Clone, Deserialize)]
pub struct InferRequest {
    pub product: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Text,
    Media,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Media => "media",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationReason {
    MediaDetected,
    RiskOrPolicyPrompt,
    DefaultTextRoute,
}

impl ClassificationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MediaDetected => "media_detected",
            Self::RiskOrPolicyPrompt => "risk_or_policy_prompt",
            Self::DefaultTextRoute => "default_text_route",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub route: Route,
    pub escalate: bool,
    pub reason: ClassificationReason,
}

/// Payload shared verbatim between the cache (`cache:{fp}`) and the
/// coalescer result slot (`dedupe:result:{fp}`) — this is the unit of
/// single-flight sharing across replicas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub provider: String,
    pub route: String,
    pub output: Value,
    pub claude_escalated: bool,
}

/// Full response body for `POST /infer`.
#[derive(Debug, Clone, Serialize)]
pub struct InferResponse {
    pub request_id: String,
    pub provider: String,
    pub route: String,
    pub output: Value,
    pub cached: bool,
    pub deduped: bool,
    pub claude_escalated: bool,
}

impl InferResponse {
    pub fn from_entry(request_id: String, entry: CacheEntry, cached: bool, deduped: bool) -> Self {
        Self {
            request_id,
            provider: entry.provider,
            route: entry.route,
            output: entry.output,
            cached,
            deduped,
            claude_escalated: entry.claude_escalated,
        }
    }
}
