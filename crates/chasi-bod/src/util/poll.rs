//! Fixed-interval polling with a deadline.

use core::error::Error;
use std::future::Future;
use std::time::Duration;

use error_stack::Context;
use error_stack::Report;
use tokio::time::Instant;

/// Interval and overall deadline of a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSettings {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(5 * 60))
    }
}

/// Outcome of one polling attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Ready(T),
    /// Not there yet; the reason is kept for the timeout report
    Pending(String),
}

#[derive(Debug, derive_more::Display)]
pub enum PollError {
    #[display("condition not met within {timeout:?} (last state: {last})")]
    TimedOut { timeout: Duration, last: String },
    #[display("polling aborted by a non-retryable error")]
    Aborted,
}

impl Error for PollError {}

/// Runs `check` every `settings.interval` until it reports ready, returns a
/// non-retryable error, or `settings.timeout` elapses. A check still running
/// at the deadline is dropped.
///
/// # Errors
///
/// - [`PollError::TimedOut`] if the deadline passes first
/// - [`PollError::Aborted`] wrapping the check's own error
pub async fn poll_until<T, E, F, Fut>(
    settings: PollSettings,
    mut check: F,
) -> Result<T, Report<PollError>>
where
    E: Context,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>, Report<E>>>,
{
    let deadline = Instant::now() + settings.timeout;
    let mut last = "not checked".to_string();

    loop {
        match tokio::time::timeout_at(deadline, check()).await {
            Err(_) => break,
            Ok(Ok(Attempt::Ready(value))) => return Ok(value),
            Ok(Ok(Attempt::Pending(reason))) => last = reason,
            Ok(Err(report)) => return Err(report.change_context(PollError::Aborted)),
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep_until((now + settings.interval).min(deadline)).await;
    }

    Err(Report::new(PollError::TimedOut {
        timeout: settings.timeout,
        last,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::infrastructure::k8s::KubernetesError;

    #[test(tokio::test(start_paused = true))]
    async fn returns_once_ready() {
        let attempts = AtomicU32::new(0);

        let value = poll_until(PollSettings::default(), || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Ok::<_, Report<KubernetesError>>(Attempt::Pending(format!("attempt {n}")))
            } else {
                Ok(Attempt::Ready(n))
            }
        })
        .await
        .expect("should become ready");

        assert_eq!(value, 3);
    }

    #[test(tokio::test(start_paused = true))]
    async fn times_out_with_last_reason() {
        let started = Instant::now();
        let attempts = AtomicU32::new(0);

        let err = poll_until(PollSettings::default(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok::<Attempt<()>, Report<KubernetesError>>(Attempt::Pending("0/1 ready".to_string()))
        })
        .await
        .expect_err("should time out");

        assert!(matches!(
            err.current_context(),
            PollError::TimedOut { last, .. } if last == "0/1 ready"
        ));
        assert_eq!(started.elapsed(), Duration::from_secs(300));
        assert!(attempts.load(Ordering::SeqCst) >= 60);
    }

    #[test(tokio::test(start_paused = true))]
    async fn non_retryable_error_aborts_immediately() {
        let attempts = AtomicU32::new(0);

        let err = poll_until(PollSettings::default(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<Attempt<()>, _>(Report::new(KubernetesError::RequestFailed {
                message: "forbidden".to_string(),
            }))
        })
        .await
        .expect_err("should abort");

        assert!(matches!(err.current_context(), PollError::Aborted));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
