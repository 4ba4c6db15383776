//! Pure routing classifier: no I/O, no shared state. Must run before any
//! provider call so its decision can feed the cache signature and the
//! dispatcher's fallback order.

use crate::domain::{Classification, ClassificationReason, InferRequest, Route};

const MEDIA_KEYWORDS: &[&str] = &["image", "video", "audio", "transcribe", "voice note", "speech"];

const ESCALATION_KEYWORDS: &[&str] = &[
    "legal",
    "medical",
    "compliance",
    "contract",
    "regulated",
    "breach",
    "incident response",
    "security policy",
];

fn metadata_bool(request: &InferRequest, key: &str) -> bool {
    request
        .metadata
        .get(key)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

pub fn classify(request: &InferRequest) -> Classification {
    let prompt_lower = request.prompt.to_lowercase();

    let has_media = request.media_url.as_deref().is_some_and(|url| !url.is_empty())
        || metadata_bool(request, "is_media")
        || MEDIA_KEYWORDS.iter().any(|kw| prompt_lower.contains(kw));

    if has_media {
        return Classification {
            route: Route::Media,
            escalate: false,
            reason: ClassificationReason::MediaDetected,
        };
    }

    let escalate = metadata_bool(request, "escalate_to_claude")
        || ESCALATION_KEYWORDS.iter().any(|kw| prompt_lower.contains(kw));

    Classification {
        route: Route::Text,
        escalate,
        reason: if escalate {
            ClassificationReason::RiskOrPolicyPrompt
        } else {
            ClassificationReason::DefaultTextRoute
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(prompt: &str, media_url: Option<&str>, metadata: serde_json::Value) -> InferRequest {
        InferRequest {
            product: "synqra".to_string(),
            prompt: prompt.to_string(),
            media_url: media_url.map(str::to_string),
            metadata: metadata.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn media_url_forces_media_route() {
        let c = classify(&request("hello", Some("https://x/a.mp4"), json!({})));
        assert_eq!(c.route, Route::Media);
        assert_eq!(c.reason, ClassificationReason::MediaDetected);
        assert!(!c.escalate);
    }

    #[test]
    fn media_keyword_in_prompt_routes_media() {
        let c = classify(&request("please transcribe this", None, json!({})));
        assert_eq!(c.route, Route::Media);
    }

    #[test]
    fn media_shortcircuits_escalation() {
        let c = classify(&request("transcribe this legal audio", None, json!({})));
        assert_eq!(c.route, Route::Media);
        assert!(!c.escalate);
    }

    #[test]
    fn escalation_keyword_sets_flag() {
        let c = classify(&request("please review this contract", None, json!({})));
        assert_eq!(c.route, Route::Text);
        assert!(c.escalate);
        assert_eq!(c.reason, ClassificationReason::RiskOrPolicyPrompt);
    }

    #[test]
    fn metadata_escalate_flag_is_honored() {
        let c = classify(&request("hi", None, json!({"escalate_to_claude": true})));
        assert!(c.escalate);
    }

    #[test]
    fn plain_prompt_is_default_text_route() {
        let c = classify(&request("what's the weather", None, json!({})));
        assert_eq!(c.route, Route::Text);
        assert!(!c.escalate);
        assert_eq!(c.reason, ClassificationReason::DefaultTextRoute);
    }
}
