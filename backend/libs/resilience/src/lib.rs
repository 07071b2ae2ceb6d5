/// Resilience helpers for calls that leave the process
///
/// The live-session control plane talks to a payment processor, a
/// subscription store, a notification service and a transcoder. Every one of
/// those calls is bounded:
/// - **Deadline**: a hard upper bound on how long a call may suspend
/// - **Retry**: a bounded number of re-attempts with exponential backoff,
///   gated by a caller-supplied predicate so only idempotent failures repeat
/// - **Presets**: pre-tuned bundles for each external dependency
///
/// # Example: payment capture retried once on transport failure
///
/// ```rust,no_run
/// use resilience::{presets, with_deadline, with_retry};
///
/// #[tokio::main]
/// async fn main() {
///     let policy = presets::payment_capture();
///
///     let result = with_retry(
///         policy.retry.clone(),
///         |err: &resilience::DeadlineError<String>| err.is_elapsed(),
///         || with_deadline(policy.deadline, async { Ok::<_, String>(()) }),
///     )
///     .await;
///     assert!(result.is_ok());
/// }
/// ```

pub mod presets;
pub mod retry;
pub mod timeout;

pub use presets::CallPolicy;
pub use retry::{with_retry, RetryConfig};
pub use timeout::{with_deadline, DeadlineError};
