#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_inference_router::config::{
    BreakerConfig, MemoryConfig, ProviderConfig, RouterConfig, StoreConfig, TokenBudgetConfig,
};
use async_inference_router::domain::InferRequest;
use async_inference_router::providers::fake::{FakeProviderClients, Scripted};
use async_inference_router::store::fake::FakeStore;
use async_inference_router::RouterCore;

fn config(claude_cap_ratio: f64) -> RouterConfig {
    RouterConfig {
        bind_addr: "0.0.0.0:0".to_string(),
        global_timeout: Duration::from_millis(500),
        dedupe_window_ms: 150,
        memory: MemoryConfig { min_free_ram_mb: 0 },
        tokens: TokenBudgetConfig {
            max_prompt_chars: 16_000,
            ceilings: HashMap::new(),
            default_ceiling: 600,
        },
        breaker: BreakerConfig {
            threshold_429: 2,
            open_seconds: 60,
        },
        store: StoreConfig {
            redis_url: "redis://unused".to_string(),
            namespace: "itest".to_string(),
            cache_ttl_seconds: 300,
            dedupe_lock_ttl_seconds: 35,
            dedupe_result_ttl_seconds: 35,
            dedupe_poll_interval_ms: 5,
            claude_cap_ratio,
            claude_window_seconds: 3600,
        },
        providers: ProviderConfig {
            groq_api_key: None,
            groq_model: "test".to_string(),
            groq_base_url: "http://unused".to_string(),
            groq_timeout: Duration::from_secs(8),
            ollama_base_url: "http://unused".to_string(),
            ollama_model: "test".to_string(),
            ollama_max_concurrency: 5,
            claude_api_key: None,
            claude_model: "test".to_string(),
            kie_api_key: None,
            kie_base_url: "http://unused".to_string(),
        },
    }
}

fn request(product: &str, prompt: &str, media_url: Option<&str>) -> InferRequest {
    InferRequest {
        product: product.to_string(),
        prompt: prompt.to_string(),
        media_url: media_url.map(str::to_string),
        metadata: Default::default(),
    }
}

#[tokio::test]
async fn oversized_prompt_is_rejected_before_any_provider_call() {
    let core = RouterCore::new(
        config(1.0),
        Arc::new(FakeStore::new(1.0)),
        Arc::new(FakeProviderClients::default()),
    );
    let prompt = "x".repeat(16_001);
    let result = core.route(request("noid", &prompt, None), "req-1".to_string()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn token_ceiling_rejects_before_dispatch() {
    let core = RouterCore::new(
        config(1.0),
        Arc::new(FakeStore::new(1.0)),
        Arc::new(FakeProviderClients::default()),
    );
    // noid ceiling is 600 tokens (~2397 chars); this prompt is well over it.
    let prompt = "x".repeat(10_000);
    let result = core.route(request("noid", &prompt, None), "req-1".to_string()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn media_request_with_url_calls_media_provider_and_is_not_escalated() {
    let providers = FakeProviderClients::default();
    providers
        .media
        .lock()
        .unwrap()
        .push(Scripted::Text("transcribed output".to_string()));
    let core = RouterCore::new(config(1.0), Arc::new(FakeStore::new(1.0)), Arc::new(providers));

    let response = core
        .route(
            request("noid", "please transcribe this legal audio", Some("https://x/a.mp3")),
            "req-1".to_string(),
        )
        .await
        .unwrap();
    assert_eq!(response.provider, "kie");
    assert_eq!(response.route, "media");
    assert!(!response.claude_escalated);
}

#[tokio::test]
async fn media_provider_failure_has_no_text_fallback() {
    let providers = FakeProviderClients::default();
    providers.media.lock().unwrap().push(Scripted::Failure);
    // If media failure fell back to text providers this would wrongly succeed.
    providers.fast_text.lock().unwrap().push(Scripted::Text("should never be used".to_string()));
    let core = RouterCore::new(config(1.0), Arc::new(FakeStore::new(1.0)), Arc::new(providers));

    let result = core
        .route(
            request("noid", "transcribe this", Some("https://x/a.mp3")),
            "req-1".to_string(),
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn all_providers_failing_surfaces_all_providers_failed() {
    let providers = FakeProviderClients::default();
    providers.fast_text.lock().unwrap().push(Scripted::Failure);
    providers.local_text.lock().unwrap().push(Scripted::Failure);
    let core = RouterCore::new(config(0.0), Arc::new(FakeStore::new(0.0)), Arc::new(providers));

    let result = core.route(request("noid", "plain prompt", None), "req-1".to_string()).await;
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_concurrent_identical_requests_yield_one_cached_output() {
    let providers = FakeProviderClients::default();
    providers.fast_text.lock().unwrap().push(Scripted::Text("shared output".to_string()));
    let core = Arc::new(RouterCore::new(config(1.0), Arc::new(FakeStore::new(1.0)), Arc::new(providers)));

    let mut handles = Vec::new();
    for i in 0..8 {
        let core = core.clone();
        handles.push(tokio::spawn(async move {
            core.route(request("noid", "identical prompt", None), format!("req-{i}")).await
        }));
    }

    let mut outputs = Vec::new();
    for handle in handles {
        outputs.push(handle.await.unwrap().unwrap().output);
    }
    assert!(outputs.windows(2).all(|pair| pair[0] == pair[1]));
}
