//! Seams to the collaborators the control plane depends on
//!
//! Every trait has an HTTP (or process / filesystem) implementation used in
//! deployment and an in-memory implementation used when the collaborator is
//! not configured and in tests. All calls go through [`guarded`], which
//! applies a deadline and the dependency's retry budget.

pub mod archive;
pub mod notifier;
pub mod payment;
pub mod subscription;
pub mod transcoder;

use resilience::{presets, with_deadline, with_retry, CallPolicy, DeadlineError};
use std::future::Future;
use thiserror::Error;
use tracing::warn;

use crate::config::ExternalServicesConfig;
use crate::error::AppError;
use crate::metrics;

pub use archive::{ArchiveStorage, InMemoryArchiveStorage, LocalArchiveStorage};
pub use notifier::{HttpSubscriberNotifier, InMemorySubscriberNotifier, SubscriberNotifier};
pub use payment::{
    CaptureOutcome, CaptureRequest, HttpPaymentGateway, InMemoryPaymentGateway, PaymentGateway,
    ScriptedCapture,
};
pub use subscription::{HttpSubscriptionDirectory, InMemorySubscriptionDirectory, SubscriptionDirectory};
pub use transcoder::{
    FfmpegTranscoder, FinalizedJob, InMemoryTranscoder, LaunchedJob, RecordedSegment,
    ReadinessMode, TranscodeJobSpec, TranscoderBackend,
};

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("{dependency} unavailable: {message}")]
    Unavailable {
        dependency: &'static str,
        message: String,
    },

    #[error("{dependency} timed out")]
    Timeout { dependency: &'static str },

    #[error("{dependency} rejected the request: {message}")]
    Rejected {
        dependency: &'static str,
        message: String,
    },
}

impl ClientError {
    pub fn unavailable(dependency: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            dependency,
            message: message.into(),
        }
    }

    pub fn rejected(dependency: &'static str, message: impl Into<String>) -> Self {
        Self::Rejected {
            dependency,
            message: message.into(),
        }
    }

    pub fn dependency(&self) -> &'static str {
        match self {
            Self::Unavailable { dependency, .. }
            | Self::Timeout { dependency }
            | Self::Rejected { dependency, .. } => dependency,
        }
    }

    /// Rejections are answers, not outages
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

impl From<ClientError> for AppError {
    fn from(error: ClientError) -> Self {
        AppError::ExternalDependency(error.to_string())
    }
}

/// Deadline and retry budgets per collaborator
#[derive(Debug, Clone)]
pub struct CallPolicies {
    pub subscription: CallPolicy,
    pub payment: CallPolicy,
    pub transcoder: CallPolicy,
    pub notification: CallPolicy,
}

impl CallPolicies {
    pub fn from_config(config: &ExternalServicesConfig) -> Self {
        let mut subscription = presets::subscription_lookup();
        subscription.deadline = config.timeout;

        let mut payment = presets::payment_capture();
        payment.retry.initial_backoff = config.retry_backoff;

        Self {
            subscription,
            payment,
            transcoder: presets::transcoder_control(),
            notification: presets::notification_dispatch(),
        }
    }
}

/// Run one collaborator call under `policy`, counting and logging the failure
/// that survives the retry budget.
pub async fn guarded<T, F, Fut>(
    dependency: &'static str,
    policy: &CallPolicy,
    mut call: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let deadline = policy.deadline;
    let result = with_retry(policy.retry.clone(), ClientError::is_transient, || {
        let attempt = call();
        async move {
            with_deadline(deadline, attempt)
                .await
                .map_err(|e| match e {
                    DeadlineError::Elapsed(_) => ClientError::Timeout { dependency },
                    DeadlineError::Inner(inner) => inner,
                })
        }
    })
    .await;

    if let Err(error) = &result {
        metrics::external_failure(dependency);
        warn!(dependency, error = %error, "external call failed");
    }
    result
}
