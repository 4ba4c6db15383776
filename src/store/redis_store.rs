use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::FromRedisValue;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::StoreConfig;
use crate::domain::CacheEntry;
use crate::observability::RouterEvent;

use super::{LockInfo, PremiumReservation, SharedStore};

/// Conditional delete: only the lock's owner may release it. Matches the
/// lease-release script used by the session-gate's distributed lock.
const RELEASE_LOCK_SCRIPT: &str = r#"
local raw = redis.call("GET", KEYS[1])
if not raw then
  return 0
end
local ok, payload = pcall(cjson.decode, raw)
if not ok then
  return 0
end
if payload["owner"] == ARGV[1] then
  return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Atomic premium-quota reservation: trims both rolling windows, checks
/// the projected ratio, and inserts the candidate member in one round
/// trip so the check cannot race a concurrent reservation.
const RESERVE_PREMIUM_SCRIPT: &str = r#"
local total_key = KEYS[1]
local claude_key = KEYS[2]
local now_ms = tonumber(ARGV[1])
local cutoff_ms = tonumber(ARGV[2])
local cap_ratio = tonumber(ARGV[3])
local member = ARGV[4]

redis.call("ZREMRANGEBYSCORE", total_key, 0, cutoff_ms)
redis.call("ZREMRANGEBYSCORE", claude_key, 0, cutoff_ms)

local total_count = redis.call("ZCARD", total_key)
local claude_count = redis.call("ZCARD", claude_key)
if total_count == 0 then
  return {0, total_count, claude_count, "0"}
end

local projected_ratio = (claude_count + 1) / total_count
if projected_ratio <= cap_ratio then
  redis.call("ZADD", claude_key, now_ms, member)
  return {1, total_count, claude_count, tostring(projected_ratio)}
end
return {0, total_count, claude_count, tostring(projected_ratio)}
"#;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub struct RedisStore {
    client: redis::Client,
    namespace: String,
    cache_ttl_seconds: u64,
    dedupe_lock_ttl_seconds: u64,
    dedupe_result_ttl_seconds: u64,
    claude_cap_ratio: f64,
    claude_window_seconds: i64,
    dedupe_poll_interval_ms: u64,
    connection: Arc<Mutex<Option<redis::aio::MultiplexedConnection>>>,
}

impl RedisStore {
    pub fn new(config: &StoreConfig) -> anyhow::Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            namespace: config.namespace.clone(),
            cache_ttl_seconds: config.cache_ttl_seconds,
            dedupe_lock_ttl_seconds: config.dedupe_lock_ttl_seconds,
            dedupe_result_ttl_seconds: config.dedupe_result_ttl_seconds,
            claude_cap_ratio: config.claude_cap_ratio,
            claude_window_seconds: config.claude_window_seconds,
            dedupe_poll_interval_ms: config.dedupe_poll_interval_ms,
            connection: Arc::new(Mutex::new(None)),
        })
    }

    fn cache_key(&self, fingerprint: &str) -> String {
        format!("{}:cache:{}", self.namespace, fingerprint)
    }

    fn lock_key(&self, fingerprint: &str) -> String {
        format!("{}:dedupe:lock:{}", self.namespace, fingerprint)
    }

    fn result_key(&self, fingerprint: &str) -> String {
        format!("{}:dedupe:result:{}", self.namespace, fingerprint)
    }

    fn total_requests_key(&self) -> String {
        format!("{}:metrics:requests:total", self.namespace)
    }

    fn claude_requests_key(&self) -> String {
        format!("{}:metrics:requests:claude", self.namespace)
    }

    async fn ensure_connection(
        &self,
        connection: &mut Option<redis::aio::MultiplexedConnection>,
    ) -> anyhow::Result<()> {
        if connection.is_some() {
            return Ok(());
        }
        *connection = Some(self.client.get_multiplexed_async_connection().await?);
        Ok(())
    }

    /// Run a command, reconnecting and retrying once on failure — the only
    /// cross-process concurrency primitive in this service, so a transient
    /// disconnect should not immediately surface to the caller.
    async fn run_command<T, F>(&self, operation: &'static str, build: F) -> anyhow::Result<T>
    where
        T: FromRedisValue + Send,
        F: Fn() -> redis::Cmd,
    {
        let mut last_error = None;
        for attempt in 0..2 {
            let mut conn_guard = self.connection.lock().await;
            self.ensure_connection(&mut conn_guard).await?;
            let conn = conn_guard
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("redis connection unavailable"))?;
            let result: redis::RedisResult<T> = build().query_async(conn).await;
            match result {
                Ok(value) => return Ok(value),
                Err(error) => {
                    tracing::warn!(
                        event = RouterEvent::StoreError.as_str(),
                        operation,
                        attempt = attempt + 1,
                        error = %error,
                        "redis command failed; reconnecting"
                    );
                    *conn_guard = None;
                    last_error = Some(anyhow::anyhow!(error));
                    if attempt == 0 {
                        continue;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("redis command failed unexpectedly")))
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn ping(&self) -> bool {
        self.run_command::<String, _>("ping", || redis::cmd("PING"))
            .await
            .is_ok()
    }

    async fn get_cache(&self, fingerprint: &str) -> Option<CacheEntry> {
        let key = self.cache_key(fingerprint);
        let raw: Option<String> = self
            .run_command("cache_get", move || {
                let mut cmd = redis::cmd("GET");
                cmd.arg(&key);
                cmd
            })
            .await
            .unwrap_or(None);
        raw.and_then(|payload| serde_json::from_str(&payload).ok())
    }

    async fn set_cache(&self, fingerprint: &str, entry: &CacheEntry) {
        let key = self.cache_key(fingerprint);
        let ttl = self.cache_ttl_seconds;
        let Ok(payload) = serde_json::to_string(entry) else {
            return;
        };
        let _: anyhow::Result<()> = self
            .run_command("cache_set", move || {
                let mut cmd = redis::cmd("SETEX");
                cmd.arg(&key).arg(ttl).arg(&payload);
                cmd
            })
            .await;
    }

    async fn try_acquire_lock(&self, fingerprint: &str, owner: &str) -> bool {
        let key = self.lock_key(fingerprint);
        let ttl = self.dedupe_lock_ttl_seconds;
        let payload = serde_json::json!({ "owner": owner, "started_ms": now_ms() }).to_string();
        let acquired: anyhow::Result<Option<String>> = self
            .run_command("lock_acquire", move || {
                let mut cmd = redis::cmd("SET");
                cmd.arg(&key).arg(&payload).arg("NX").arg("EX").arg(ttl);
                cmd
            })
            .await;
        // Store errors are treated as lock-acquired (fail-open, §4.5).
        acquired.map(|v| v.is_some()).unwrap_or(true)
    }

    async fn get_lock(&self, fingerprint: &str) -> Option<LockInfo> {
        let key = self.lock_key(fingerprint);
        let raw: Option<String> = self
            .run_command("lock_get", move || {
                let mut cmd = redis::cmd("GET");
                cmd.arg(&key);
                cmd
            })
            .await
            .unwrap_or(None);
        raw.and_then(|payload| {
            let value: serde_json::Value = serde_json::from_str(&payload).ok()?;
            Some(LockInfo {
                owner: value.get("owner")?.as_str()?.to_string(),
                started_ms: value.get("started_ms")?.as_i64()?,
            })
        })
    }

    async fn release_lock(&self, fingerprint: &str, owner: &str) {
        let key = self.lock_key(fingerprint);
        let owner = owner.to_string();
        let _: anyhow::Result<i64> = self
            .run_command("lock_release", move || {
                let mut cmd = redis::cmd("EVAL");
                cmd.arg(RELEASE_LOCK_SCRIPT).arg(1).arg(&key).arg(&owner);
                cmd
            })
            .await;
    }

    async fn set_dedupe_result(&self, fingerprint: &str, entry: &CacheEntry) {
        let key = self.result_key(fingerprint);
        let ttl = self.dedupe_result_ttl_seconds;
        let Ok(payload) = serde_json::to_string(entry) else {
            return;
        };
        let _: anyhow::Result<()> = self
            .run_command("dedupe_result_set", move || {
                let mut cmd = redis::cmd("SETEX");
                cmd.arg(&key).arg(ttl).arg(&payload);
                cmd
            })
            .await;
    }

    async fn wait_for_result(&self, fingerprint: &str, deadline: Instant) -> Option<CacheEntry> {
        let cache_key = self.cache_key(fingerprint);
        let result_key = self.result_key(fingerprint);
        loop {
            if let Ok(Some(payload)) = self
                .run_command::<Option<String>, _>("dedupe_wait_cache", {
                    let cache_key = cache_key.clone();
                    move || {
                        let mut cmd = redis::cmd("GET");
                        cmd.arg(&cache_key);
                        cmd
                    }
                })
                .await
            {
                if let Ok(entry) = serde_json::from_str(&payload) {
                    return Some(entry);
                }
            }
            if let Ok(Some(payload)) = self
                .run_command::<Option<String>, _>("dedupe_wait_result", {
                    let result_key = result_key.clone();
                    move || {
                        let mut cmd = redis::cmd("GET");
                        cmd.arg(&result_key);
                        cmd
                    }
                })
                .await
            {
                if let Ok(entry) = serde_json::from_str(&payload) {
                    return Some(entry);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(std::time::Duration::from_millis(self.dedupe_poll_interval_ms)).await;
        }
    }

    async fn record_total_request(&self, request_id: &str) {
        let key = self.total_requests_key();
        let now = now_ms();
        let member = format!("{now}:{request_id}");
        let cutoff = now - self.claude_window_seconds * 1000;
        let _: anyhow::Result<i64> = self
            .run_command("metrics_record_total", move || {
                let mut cmd = redis::cmd("ZADD");
                cmd.arg(&key).arg(now).arg(&member);
                cmd
            })
            .await;
        let key = self.total_requests_key();
        let _: anyhow::Result<i64> = self
            .run_command("metrics_trim_total", move || {
                let mut cmd = redis::cmd("ZREMRANGEBYSCORE");
                cmd.arg(&key).arg(0).arg(cutoff);
                cmd
            })
            .await;
    }

    async fn try_reserve_premium(&self, request_id: &str) -> PremiumReservation {
        let total_key = self.total_requests_key();
        let claude_key = self.claude_requests_key();
        let now = now_ms();
        let cutoff = now - self.claude_window_seconds * 1000;
        let cap_ratio = self.claude_cap_ratio;
        let member = format!("{now}:{request_id}");

        // The script returns a mixed-type table (three Lua numbers, one
        // `tostring`-ed ratio); decoding it as `Vec<String>` relies on every
        // element coercing through `String: FromRedisValue`, which integer
        // replies don't on all redis-rs builds. A typed tuple decodes each
        // element against its own RESP type instead.
        let result: anyhow::Result<(i64, i64, i64, String)> = self
            .run_command("claude_reserve", {
                let member = member.clone();
                move || {
                    let mut cmd = redis::cmd("EVAL");
                    cmd.arg(RESERVE_PREMIUM_SCRIPT)
                        .arg(2)
                        .arg(&total_key)
                        .arg(&claude_key)
                        .arg(now)
                        .arg(cutoff)
                        .arg(cap_ratio)
                        .arg(&member);
                    cmd
                }
            })
            .await;

        match result {
            Ok((allowed_flag, total_count, claude_count, projected_ratio)) => {
                let allowed = allowed_flag == 1;
                PremiumReservation {
                    allowed,
                    total_count,
                    claude_count,
                    projected_ratio: projected_ratio.parse().unwrap_or(0.0),
                    member: if allowed { Some(member) } else { None },
                }
            }
            // Any store error denies the premium path (fail closed, §4.5).
            Err(_) => PremiumReservation {
                allowed: false,
                total_count: 0,
                claude_count: 0,
                projected_ratio: 0.0,
                member: None,
            },
        }
    }

    async fn release_premium_reservation(&self, member: &str) {
        let key = self.claude_requests_key();
        let member = member.to_string();
        let _: anyhow::Result<i64> = self
            .run_command("claude_release", move || {
                let mut cmd = redis::cmd("ZREM");
                cmd.arg(&key).arg(&member);
                cmd
            })
            .await;
    }
}
