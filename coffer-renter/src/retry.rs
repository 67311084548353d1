use std::{future::Future, time::Duration};

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::{is_cancelled, is_permanent, CancelError},
    Result,
};

/// Bounded exponential backoff applied to a single host operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Retry {
    pub max_attempts: usize,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for Retry {
    fn default() -> Retry {
        Retry {
            max_attempts: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
        }
    }
}

impl Retry {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Run `attempt` until it succeeds, fails permanently, is cancelled, or
    /// `max_attempts` is exhausted. The last error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.backoff();
        let mut n = 0usize;
        loop {
            n += 1;
            let err = match attempt().await {
                Ok(value) => {
                    if n > 1 {
                        info!(attempt = n, "retry successful");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };
            if is_cancelled(&err) || is_permanent(&err) || n >= self.max_attempts.max(1) {
                return Err(err);
            }
            let delay = backoff.next_backoff().unwrap_or(self.max_interval);
            warn!(?delay, attempt = n, err = %err, "retrying");
            select! {
                _ = cancel.cancelled() => {
                    return Err(CancelError.into());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;

    use super::*;
    use crate::error::{transient, Permanent};

    fn fast() -> Retry {
        Retry {
            max_attempts: 3,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = &AtomicUsize::new(0);
        let cancel = CancellationToken::new();
        let value = fast()
            .run(&cancel, move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient(anyhow!("not yet")))
                } else {
                    Ok(42)
                }
            })
            .await
            .expect("retry");
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = &AtomicUsize::new(0);
        let cancel = CancellationToken::new();
        let res: Result<()> = fast()
            .run(&cancel, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient(anyhow!("still down")))
            })
            .await;
        assert_eq!(res.unwrap_err().to_string(), "still down");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_is_not_retried() {
        let calls = &AtomicUsize::new(0);
        let cancel = CancellationToken::new();
        let res: Result<()> = fast()
            .run(&cancel, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Permanent::new("insufficient funds").into())
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_during_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let retry = Retry {
            initial_interval: Duration::from_secs(60),
            max_interval: Duration::from_secs(60),
            ..fast()
        };
        let res: Result<()> = retry
            .run(&cancel, || async { Err(transient(anyhow!("down"))) })
            .await;
        assert!(is_cancelled(&res.unwrap_err()));
    }
}
