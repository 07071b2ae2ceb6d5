/// Preset call policies for the control plane's external dependencies
use crate::retry::RetryConfig;
use std::time::Duration;

/// Deadline plus retry budget for one kind of external call
#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub deadline: Duration,
    pub retry: RetryConfig,
}

impl CallPolicy {
    pub fn new(deadline: Duration, retry: RetryConfig) -> Self {
        Self { deadline, retry }
    }
}

/// Subscription-tier lookups on the join path
///
/// - Deadline: 3s
/// - No retry (the viewer can simply try joining again)
pub fn subscription_lookup() -> CallPolicy {
    CallPolicy::new(Duration::from_secs(3), RetryConfig::never())
}

/// Payment capture keyed by an idempotency key
///
/// - Deadline: 10s
/// - One retry after 200ms (safe because the processor deduplicates by key)
pub fn payment_capture() -> CallPolicy {
    CallPolicy::new(
        Duration::from_secs(10),
        RetryConfig::once(Duration::from_millis(200)),
    )
}

/// Transcoder start/stop signalling
///
/// - Deadline: 15s
/// - One retry after 500ms (launch and finalize are idempotent per session)
pub fn transcoder_control() -> CallPolicy {
    CallPolicy::new(
        Duration::from_secs(15),
        RetryConfig::once(Duration::from_millis(500)),
    )
}

/// Fire-and-forget notification dispatch
///
/// - Deadline: 5s
/// - No retry (delivery mechanics belong to the notification service)
pub fn notification_dispatch() -> CallPolicy {
    CallPolicy::new(Duration::from_secs(5), RetryConfig::never())
}
