//! Structured logging event names, used as the `event` field on tracing spans/logs.
//!
//! Keeping names in one enum avoids typo drift between call sites and whatever
//! dashboards key off the `event` field downstream.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterEvent {
    RequestAdmitted,
    RequestRejectedMemory,
    RequestRejectedTokenBudget,
    RequestRejectedValidation,
    CacheHit,
    CoalesceLockAcquired,
    CoalesceWaitStarted,
    CoalesceWaitHit,
    CoalesceWaitTimedOut,
    CoalesceBypassStaleLock,
    DispatchStarted,
    ProviderCallFailed,
    ProviderRateLimited,
    BreakerOpened,
    BreakerClosedOnSuccess,
    QuotaDenied,
    QuotaReserved,
    QuotaReleased,
    AllProvidersFailed,
    DeadlineExceeded,
    StoreError,
    ResponseWritten,
}

impl RouterEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestAdmitted => "router.request.admitted",
            Self::RequestRejectedMemory => "router.request.rejected_memory",
            Self::RequestRejectedTokenBudget => "router.request.rejected_token_budget",
            Self::RequestRejectedValidation => "router.request.rejected_validation",
            Self::CacheHit => "router.cache.hit",
            Self::CoalesceLockAcquired => "router.coalesce.lock_acquired",
            Self::CoalesceWaitStarted => "router.coalesce.wait_started",
            Self::CoalesceWaitHit => "router.coalesce.wait_hit",
            Self::CoalesceWaitTimedOut => "router.coalesce.wait_timed_out",
            Self::CoalesceBypassStaleLock => "router.coalesce.bypass_stale_lock",
            Self::DispatchStarted => "router.dispatch.started",
            Self::ProviderCallFailed => "router.provider.call_failed",
            Self::ProviderRateLimited => "router.provider.rate_limited",
            Self::BreakerOpened => "router.breaker.opened",
            Self::BreakerClosedOnSuccess => "router.breaker.closed_on_success",
            Self::QuotaDenied => "router.quota.denied",
            Self::QuotaReserved => "router.quota.reserved",
            Self::QuotaReleased => "router.quota.released",
            Self::AllProvidersFailed => "router.dispatch.all_providers_failed",
            Self::DeadlineExceeded => "router.dispatch.deadline_exceeded",
            Self::StoreError => "router.store.error",
            Self::ResponseWritten => "router.response.written",
        }
    }
}
