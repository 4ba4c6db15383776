//! Orchestrates the ten-stage pipeline (§2): admission, token budget,
//! signature, cache, classifier, coalescer, quota, dispatch, breaker,
//! writer. `RouterCore` is the one shared object built at startup and held
//! behind `Arc` by the HTTP layer.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::admission::{enforce_prompt_length, enforce_token_ceiling, MemoryGate};
use crate::breaker::CircuitBreaker;
use crate::classifier::classify;
use crate::config::RouterConfig;
use crate::domain::{CacheEntry, Classification, InferRequest, InferResponse, Route};
use crate::errors::RouterError;
use crate::observability::RouterEvent;
use crate::providers::ProviderClients;
use crate::signature::fingerprint;
use crate::store::SharedStore;

const VOICE_CALIBRATION: &str = "Voice calibration for Synqra: concise, executive, no hype, action-first language. Preserve factual certainty and avoid speculative claims.\n\n";

pub struct RouterCore {
    pub config: RouterConfig,
    pub memory_gate: MemoryGate,
    pub breaker: CircuitBreaker,
    pub store: Arc<dyn SharedStore>,
    pub providers: Arc<dyn ProviderClients>,
}

impl RouterCore {
    pub fn new(config: RouterConfig, store: Arc<dyn SharedStore>, providers: Arc<dyn ProviderClients>) -> Self {
        Self {
            memory_gate: MemoryGate::new(&config.memory),
            breaker: CircuitBreaker::new(&config.breaker),
            config,
            store,
            providers,
        }
    }

    pub async fn health(&self) -> serde_json::Value {
        let redis_ok = self.store.ping().await;
        let breaker_status = self.breaker.status().await;
        let memory = self.memory_gate.snapshot();
        let healthy = redis_ok && memory.healthy;
        serde_json::json!({
            "status": if healthy { "ok" } else { "degraded" },
            "redis": { "ok": redis_ok },
            "memory": memory,
            "circuit_breaker": breaker_status,
            "timeouts": {
                "fast_text_seconds": self.providers.fast_text_timeout().as_secs_f64(),
                "global_seconds": self.config.global_timeout.as_secs_f64(),
            },
            "policy": {
                "cache_ttl_seconds": self.config.store.cache_ttl_seconds,
                "dedupe_window_ms": self.config.dedupe_window_ms,
                "claude_cap_ratio": self.config.store.claude_cap_ratio,
            },
        })
    }

    /// Runs the full pipeline for one request. `request_id` is the caller's
    /// `x-request-id` if supplied, else a freshly minted UUID (§6).
    pub async fn route(&self, request: InferRequest, request_id: String) -> Result<InferResponse, RouterError> {
        if request.prompt.is_empty() && request.media_url.as_deref().unwrap_or("").is_empty() {
            warn!(event = RouterEvent::RequestRejectedValidation.as_str(), request_id = %request_id);
            return Err(RouterError::Validation);
        }

        if let Err(error) = self.memory_gate.enforce() {
            warn!(event = RouterEvent::RequestRejectedMemory.as_str(), request_id = %request_id);
            return Err(error);
        }
        if let Err(error) = enforce_prompt_length(self.config.tokens.max_prompt_chars, &request.prompt)
            .and_then(|_| enforce_token_ceiling(&self.config.tokens, &request.product, &request.prompt))
        {
            warn!(event = RouterEvent::RequestRejectedTokenBudget.as_str(), request_id = %request_id);
            return Err(error);
        }
        info!(event = RouterEvent::RequestAdmitted.as_str(), request_id = %request_id);

        self.store.record_total_request(&request_id).await;

        let signature = fingerprint(&request);

        if let Some(entry) = self.store.get_cache(&signature).await {
            info!(event = RouterEvent::CacheHit.as_str(), request_id = %request_id, %signature);
            return Ok(InferResponse::from_entry(request_id, entry, true, false));
        }

        let classification = classify(&request);
        let lock_acquired = self.store.try_acquire_lock(&signature, &request_id).await;

        if !lock_acquired {
            if let Some(lock) = self.store.get_lock(&signature).await {
                let age_ms = now_ms() - lock.started_ms;
                if age_ms <= self.config.dedupe_window_ms as i64 {
                    info!(event = RouterEvent::CoalesceWaitStarted.as_str(), request_id = %request_id, %signature);
                    let deadline = tokio::time::Instant::now() + self.config.global_timeout;
                    if let Some(entry) = self.store.wait_for_result(&signature, deadline).await {
                        info!(event = RouterEvent::CoalesceWaitHit.as_str(), request_id = %request_id, %signature);
                        return Ok(InferResponse::from_entry(request_id, entry, false, true));
                    }
                    warn!(event = RouterEvent::CoalesceWaitTimedOut.as_str(), request_id = %request_id, %signature);
                } else {
                    warn!(event = RouterEvent::CoalesceBypassStaleLock.as_str(), request_id = %request_id, %signature, age_ms);
                }
            }
        } else {
            info!(event = RouterEvent::CoalesceLockAcquired.as_str(), request_id = %request_id, %signature);
        }

        if lock_acquired {
            let result = self.execute(&request, classification, &request_id).await;
            match &result {
                Ok(entry) => {
                    self.store.set_cache(&signature, entry).await;
                    self.store.set_dedupe_result(&signature, entry).await;
                }
                Err(_) => {}
            }
            self.store.release_lock(&signature, &request_id).await;
            let entry = result?;
            return Ok(InferResponse::from_entry(request_id, entry, false, false));
        }

        let entry = self.execute(&request, classification, &request_id).await?;
        self.store.set_cache(&signature, &entry).await;
        Ok(InferResponse::from_entry(request_id, entry, false, false))
    }

    async fn execute(
        &self,
        request: &InferRequest,
        classification: Classification,
        request_id: &str,
    ) -> Result<CacheEntry, RouterError> {
        info!(event = RouterEvent::DispatchStarted.as_str(), request_id = %request_id, route = classification.route.as_str());

        if classification.route == Route::Media {
            let media_url = request
                .media_url
                .as_deref()
                .filter(|url| !url.is_empty())
                .ok_or(RouterError::MediaUrlRequired)?;
            let output = self
                .providers
                .call_media(&request.prompt, media_url, &request.metadata)
                .await
                .map_err(|_| RouterError::AllProvidersFailed)?;
            return Ok(CacheEntry {
                provider: "kie".to_string(),
                route: Route::Media.as_str().to_string(),
                output,
                claude_escalated: false,
            });
        }

        let prompt = if request.product.trim().eq_ignore_ascii_case("synqra") {
            format!("{VOICE_CALIBRATION}{}", request.prompt)
        } else {
            request.prompt.clone()
        };

        if classification.escalate {
            if let Some(entry) = self.try_premium(&prompt, request_id).await {
                return Ok(entry);
            }
        }

        if self.breaker.is_open().await {
            let status = self.breaker.status().await;
            warn!(event = RouterEvent::BreakerOpened.as_str(), request_id = %request_id);
            return Err(RouterError::BreakerOpen {
                retry_after_secs: status.retry_after_seconds.max(1),
            });
        }

        match self.providers.call_fast_text(&prompt).await {
            Ok(output) => {
                self.breaker.record_success().await;
                info!(event = RouterEvent::BreakerClosedOnSuccess.as_str(), request_id = %request_id);
                return Ok(CacheEntry {
                    provider: "groq".to_string(),
                    route: Route::Text.as_str().to_string(),
                    output: serde_json::Value::String(output),
                    claude_escalated: false,
                });
            }
            Err(error) if error.is_rate_limited() => {
                warn!(event = RouterEvent::ProviderRateLimited.as_str(), request_id = %request_id, provider = "groq");
                if self.breaker.record_rate_limited().await {
                    let status = self.breaker.status().await;
                    return Err(RouterError::BreakerOpen {
                        retry_after_secs: status.retry_after_seconds.max(1),
                    });
                }
            }
            Err(error) => {
                warn!(event = RouterEvent::ProviderCallFailed.as_str(), request_id = %request_id, provider = "groq", error = %error);
                self.breaker.record_non_429_failure().await;
            }
        }

        match self.providers.call_local_text(&prompt).await {
            Ok(output) => {
                return Ok(CacheEntry {
                    provider: "ollama".to_string(),
                    route: Route::Text.as_str().to_string(),
                    output: serde_json::Value::String(output),
                    claude_escalated: false,
                });
            }
            Err(error) => {
                warn!(event = RouterEvent::ProviderCallFailed.as_str(), request_id = %request_id, provider = "ollama", error = %error);
            }
        }

        if let Some(entry) = self.try_premium(&prompt, request_id).await {
            return Ok(entry);
        }

        warn!(event = RouterEvent::AllProvidersFailed.as_str(), request_id = %request_id);
        Err(RouterError::AllProvidersFailed)
    }

    /// Reserves rolling-window quota, calls the premium provider, and
    /// releases the reservation if the call fails — mirrors `_try_claude`'s
    /// release-on-failure so a failed premium call never silently burns
    /// quota.
    async fn try_premium(&self, prompt: &str, request_id: &str) -> Option<CacheEntry> {
        let reservation = self.store.try_reserve_premium(request_id).await;
        if !reservation.allowed {
            info!(
                event = RouterEvent::QuotaDenied.as_str(),
                request_id = %request_id,
                total_count = reservation.total_count,
                claude_count = reservation.claude_count,
                projected_ratio = reservation.projected_ratio,
            );
            return None;
        }
        info!(event = RouterEvent::QuotaReserved.as_str(), request_id = %request_id);

        match self.providers.call_premium_text(prompt).await {
            Ok(output) => Some(CacheEntry {
                provider: "claude".to_string(),
                route: Route::Text.as_str().to_string(),
                output: serde_json::Value::String(output),
                claude_escalated: true,
            }),
            Err(error) => {
                warn!(event = RouterEvent::ProviderCallFailed.as_str(), request_id = %request_id, provider = "claude", error = %error);
                if let Some(member) = reservation.member {
                    self.store.release_premium_reservation(&member).await;
                    info!(event = RouterEvent::QuotaReleased.as_str(), request_id = %request_id);
                }
                None
            }
        }
    }
}

pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, MemoryConfig, ProviderConfig, StoreConfig, TokenBudgetConfig};
    use crate::providers::fake::{FakeProviderClients, Scripted};
    use crate::store::fake::FakeStore;
    use std::collections::HashMap;
    use std::time::Duration;

    fn test_config() -> RouterConfig {
        RouterConfig {
            bind_addr: "0.0.0.0:0".to_string(),
            global_timeout: Duration::from_millis(200),
            dedupe_window_ms: 100,
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
                namespace: "test".to_string(),
                cache_ttl_seconds: 300,
                dedupe_lock_ttl_seconds: 35,
                dedupe_result_ttl_seconds: 35,
                dedupe_poll_interval_ms: 5,
                claude_cap_ratio: 0.5,
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

    fn core_with(cap_ratio: f64, providers: FakeProviderClients) -> RouterCore {
        let mut config = test_config();
        config.store.claude_cap_ratio = cap_ratio;
        RouterCore::new(config, Arc::new(FakeStore::new(cap_ratio)), Arc::new(providers))
    }

    fn request(product: &str, prompt: &str) -> InferRequest {
        InferRequest {
            product: product.to_string(),
            prompt: prompt.to_string(),
            media_url: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn successful_fast_text_response_is_cached_and_returned_verbatim() {
        let providers = FakeProviderClients::default();
        providers.fast_text.lock().unwrap().push(Scripted::Text("hi there".to_string()));
        let core = core_with(1.0, providers);

        let response = core.route(request("noid", "hello"), "req-1".to_string()).await.unwrap();
        assert_eq!(response.provider, "groq");
        assert!(!response.cached);

        let again = core.route(request("noid", "hello"), "req-2".to_string()).await.unwrap();
        assert!(again.cached);
        assert_eq!(again.output, response.output);
    }

    #[tokio::test]
    async fn fast_text_failure_falls_back_to_local_text() {
        let providers = FakeProviderClients::default();
        providers.fast_text.lock().unwrap().push(Scripted::Failure);
        providers.local_text.lock().unwrap().push(Scripted::Text("local output".to_string()));
        let core = core_with(1.0, providers);

        let response = core.route(request("noid", "unique prompt one"), "req".to_string()).await.unwrap();
        assert_eq!(response.provider, "ollama");
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_rate_limits_and_blocks_further_groq_calls() {
        let providers = FakeProviderClients::default();
        providers.fast_text.lock().unwrap().push(Scripted::RateLimited);
        providers.fast_text.lock().unwrap().push(Scripted::RateLimited);
        let core = core_with(1.0, providers);

        let first = core.route(request("noid", "prompt a"), "req-a".to_string()).await;
        assert!(first.is_err());
        let second = core.route(request("noid", "prompt b"), "req-b".to_string()).await;
        match second {
            Err(RouterError::BreakerOpen { retry_after_secs }) => assert!(retry_after_secs >= 1),
            other => panic!("expected BreakerOpen, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn media_route_without_url_is_rejected_before_dispatch() {
        let core = core_with(1.0, FakeProviderClients::default());
        let result = core.route(request("noid", "please transcribe this"), "req".to_string()).await;
        assert!(matches!(result, Err(RouterError::MediaUrlRequired)));
    }

    #[tokio::test]
    async fn escalation_keyword_tries_premium_before_fast_text() {
        let providers = FakeProviderClients::default();
        providers.premium_text.lock().unwrap().push(Scripted::Text("premium output".to_string()));
        let core = core_with(1.0, providers);

        let response = core
            .route(request("synqra", "please review this contract"), "req".to_string())
            .await
            .unwrap();
        assert_eq!(response.provider, "claude");
        assert!(response.claude_escalated);
    }

    #[tokio::test]
    async fn premium_quota_denial_falls_through_to_fast_text() {
        let providers = FakeProviderClients::default();
        providers.fast_text.lock().unwrap().push(Scripted::Text("fast output".to_string()));
        // cap_ratio 0.0 denies every premium reservation once a total request is recorded.
        let core = core_with(0.0, providers);

        let response = core
            .route(request("synqra", "please review this contract"), "req".to_string())
            .await
            .unwrap();
        assert_eq!(response.provider, "groq");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_identical_requests_are_coalesced_into_one_upstream_call() {
        let providers = FakeProviderClients::default();
        providers.fast_text.lock().unwrap().push(Scripted::Text("single flight".to_string()));
        let core = Arc::new(core_with(1.0, providers));

        let a = {
            let core = core.clone();
            tokio::spawn(async move { core.route(request("noid", "same prompt"), "req-a".to_string()).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = {
            let core = core.clone();
            tokio::spawn(async move { core.route(request("noid", "same prompt"), "req-b".to_string()).await })
        };

        let (first, second) = tokio::join!(a, b);
        let first = first.unwrap().unwrap();
        let second = second.unwrap().unwrap();
        assert_eq!(first.output, second.output);
        assert!(first.deduped || second.deduped || second.cached);
    }
}
