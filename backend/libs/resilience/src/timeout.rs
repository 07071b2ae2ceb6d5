/// Deadline wrapper for fallible async operations
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, thiserror::Error)]
pub enum DeadlineError<E> {
    #[error("deadline of {0:?} elapsed")]
    Elapsed(Duration),
    #[error("{0}")]
    Inner(E),
}

impl<E> DeadlineError<E> {
    pub fn is_elapsed(&self) -> bool {
        matches!(self, DeadlineError::Elapsed(_))
    }

    /// Collapse into the inner error type, mapping an elapsed deadline with `on_elapsed`
    pub fn into_inner_or(self, on_elapsed: impl FnOnce(Duration) -> E) -> E {
        match self {
            DeadlineError::Elapsed(d) => on_elapsed(d),
            DeadlineError::Inner(e) => e,
        }
    }
}

/// Run a fallible future under a deadline, keeping the inner error type intact
pub async fn with_deadline<F, T, E>(duration: Duration, future: F) -> Result<T, DeadlineError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match timeout(duration, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(DeadlineError::Inner(e)),
        Err(_) => Err(DeadlineError::Elapsed(duration)),
    }
}
