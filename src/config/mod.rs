//! Typed runtime configuration. Every option in the environment table has a
//! default; a present-but-malformed value falls back to the default rather
//! than panicking at startup (mirrors the tolerant env parsing the agent
//! config layer uses elsewhere in the stack).

use std::collections::HashMap;
use std::time::Duration;

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_string(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub min_free_ram_mb: u64,
}

#[derive(Debug, Clone)]
pub struct TokenBudgetConfig {
    pub max_prompt_chars: usize,
    pub ceilings: HashMap<String, u64>,
    pub default_ceiling: u64,
}

impl TokenBudgetConfig {
    pub fn ceiling_for(&self, product: &str) -> u64 {
        self.ceilings
            .get(&product.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub threshold_429: u32,
    pub open_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub redis_url: String,
    pub namespace: String,
    pub cache_ttl_seconds: u64,
    pub dedupe_lock_ttl_seconds: u64,
    pub dedupe_result_ttl_seconds: u64,
    pub dedupe_poll_interval_ms: u64,
    pub claude_cap_ratio: f64,
    pub claude_window_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub groq_api_key: Option<String>,
    pub groq_model: String,
    pub groq_base_url: String,
    pub groq_timeout: Duration,
    pub ollama_base_url: String,
    pub ollama_model: String,
    pub ollama_max_concurrency: usize,
    pub claude_api_key: Option<String>,
    pub claude_model: String,
    pub kie_api_key: Option<String>,
    pub kie_base_url: String,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub bind_addr: String,
    pub global_timeout: Duration,
    pub dedupe_window_ms: u64,
    pub memory: MemoryConfig,
    pub tokens: TokenBudgetConfig,
    pub breaker: BreakerConfig,
    pub store: StoreConfig,
    pub providers: ProviderConfig,
}

impl RouterConfig {
    pub fn from_env() -> Self {
        let mut ceilings = HashMap::new();
        ceilings.insert("synqra".to_string(), 1500);
        ceilings.insert("aurafx".to_string(), 800);
        ceilings.insert("noid".to_string(), 600);

        Self {
            bind_addr: env_string("BIND_ADDR")
                .or_else(|| env_string("PORT").map(|p| format!("0.0.0.0:{p}")))
                .unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            global_timeout: Duration::from_secs(env_parsed("GLOBAL_TIMEOUT_SECONDS", 30)),
            dedupe_window_ms: env_parsed("DEDUPE_WINDOW_MS", 100),
            memory: MemoryConfig {
                min_free_ram_mb: env_parsed("MIN_FREE_RAM_MB", 500),
            },
            tokens: TokenBudgetConfig {
                max_prompt_chars: env_parsed("MAX_PROMPT_CHARS", 16_000),
                ceilings,
                default_ceiling: 600,
            },
            breaker: BreakerConfig {
                threshold_429: env_parsed("GROQ_429_BREAKER_THRESHOLD", 2),
                open_seconds: env_parsed("GROQ_429_BREAKER_OPEN_SECONDS", 60),
            },
            store: StoreConfig {
                redis_url: env_string("REDIS_URL")
                    .unwrap_or_else(|| "redis://127.0.0.1:6379/0".to_string()),
                namespace: env_string("REDIS_NAMESPACE")
                    .unwrap_or_else(|| "synqra:inference".to_string()),
                cache_ttl_seconds: env_parsed("CACHE_TTL_SECONDS", 300),
                dedupe_lock_ttl_seconds: 35,
                dedupe_result_ttl_seconds: 35,
                dedupe_poll_interval_ms: 25,
                claude_cap_ratio: env_parsed("CLAUDE_CAP_RATIO", 0.01),
                claude_window_seconds: env_parsed("CLAUDE_ROLLING_WINDOW_SECONDS", 3600),
            },
            providers: ProviderConfig {
                groq_api_key: env_string("GROQ_API_KEY"),
                groq_model: env_string("GROQ_MODEL")
                    .unwrap_or_else(|| "llama-3.3-70b-versatile".to_string()),
                groq_base_url: env_string("GROQ_BASE_URL")
                    .unwrap_or_else(|| "https://api.groq.com/openai/v1".to_string()),
                groq_timeout: Duration::from_secs(env_parsed("GROQ_TIMEOUT_SECONDS", 8)),
                ollama_base_url: env_string("OLLAMA_BASE_URL")
                    .unwrap_or_else(|| "http://localhost:11434".to_string()),
                ollama_model: env_string("OLLAMA_MODEL").unwrap_or_else(|| "llama3.1:8b".to_string()),
                ollama_max_concurrency: env_parsed("OLLAMA_MAX_CONCURRENCY", 5),
                claude_api_key: env_string("CLAUDE_API_KEY"),
                claude_model: env_string("CLAUDE_MODEL")
                    .unwrap_or_else(|| "claude-3-5-sonnet-20241022".to_string()),
                kie_api_key: env_string("KIE_API_KEY"),
                kie_base_url: env_string("KIE_BASE_URL").unwrap_or_else(|| "https://api.kie.ai".to_string()),
            },
        }
    }
}
