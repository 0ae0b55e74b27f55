//! Bounded convergence polling.
//!
//! Every "wait until the cluster looks right" loop in this crate goes through
//! [`converge`]: apply has already happened, and we repeatedly ask a readiness
//! probe until it says yes, a deadline passes, the caller cancels, or the
//! backend reports an error that polling cannot fix.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fluvio_future::timer::sleep;

use crate::error::BackendError;

/// Bounds for a single convergence wait
#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    /// Pause between probe attempts
    pub interval: Duration,
    /// Total budget for the wait, measured from the first probe
    pub deadline: Duration,
}

impl WaitOptions {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }
}

/// What a convergence wait ended with
#[derive(Debug)]
pub struct ConvergenceOutcome {
    /// Whether the probe ever reported ready
    pub healthy: bool,
    /// The most recent probe error, kept for timeout diagnostics
    pub last_error: Option<BackendError>,
    /// Wall-clock time spent in the loop
    pub elapsed: Duration,
    /// Whether the loop stopped because the caller cancelled it
    pub cancelled: bool,
}

impl ConvergenceOutcome {
    /// True when the loop stopped on a non-retryable probe error
    pub fn is_fatal(&self) -> bool {
        !self.healthy
            && !self.cancelled
            && self
                .last_error
                .as_ref()
                .is_some_and(|err| !err.is_retryable())
    }
}

/// Polls `probe` until it reports ready or the wait is exhausted.
///
/// The probe contract: `Ok(true)` means converged, `Ok(false)` means not yet.
/// A retryable error (`NotFound`, `Transient`) is recorded and polling
/// continues; any other error stops the loop at once, with no further sleep.
/// The deadline is checked after every probe, and cancellation interrupts the
/// inter-poll sleep so it takes effect within one interval.
pub async fn converge<F, Fut>(
    mut probe: F,
    opts: WaitOptions,
    cancel: &CancellationToken,
) -> ConvergenceOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, BackendError>>,
{
    let started = Instant::now();
    let mut last_error: Option<BackendError> = None;

    loop {
        match probe().await {
            Ok(true) => {
                return ConvergenceOutcome {
                    healthy: true,
                    last_error: None,
                    elapsed: started.elapsed(),
                    cancelled: false,
                };
            }
            Ok(false) => {
                debug!(elapsed = ?started.elapsed(), "probe not ready yet");
            }
            Err(err) if err.is_retryable() => {
                debug!(%err, "retryable probe failure, continuing to poll");
                last_error = Some(err);
            }
            Err(err) => {
                warn!(%err, "fatal probe failure, stopping wait");
                return ConvergenceOutcome {
                    healthy: false,
                    last_error: Some(err),
                    elapsed: started.elapsed(),
                    cancelled: false,
                };
            }
        }

        if started.elapsed() >= opts.deadline {
            return ConvergenceOutcome {
                healthy: false,
                last_error,
                elapsed: started.elapsed(),
                cancelled: false,
            };
        }

        tokio::select! {
            _ = sleep(opts.interval) => {}
            _ = cancel.cancelled() => {
                return ConvergenceOutcome {
                    healthy: false,
                    last_error,
                    elapsed: started.elapsed(),
                    cancelled: true,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn fast(deadline_ms: u64) -> WaitOptions {
        WaitOptions::new(Duration::from_millis(10), Duration::from_millis(deadline_ms))
    }

    #[fluvio_future::test]
    async fn test_converge_reports_healthy_on_third_poll() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe_calls = calls.clone();
        let cancel = CancellationToken::new();

        let opts = WaitOptions::new(Duration::from_millis(20), Duration::from_secs(5));
        let outcome = converge(
            move || {
                let n = probe_calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(n >= 3) }
            },
            opts,
            &cancel,
        )
        .await;

        assert!(outcome.healthy);
        assert!(outcome.last_error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // two sleeps of 20ms, well under the 5s deadline
        assert!(outcome.elapsed >= Duration::from_millis(40));
        assert!(outcome.elapsed < Duration::from_secs(1));
    }

    #[fluvio_future::test]
    async fn test_converge_stops_at_deadline() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe_calls = calls.clone();
        let cancel = CancellationToken::new();

        let outcome = converge(
            move || {
                probe_calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(false) }
            },
            fast(50),
            &cancel,
        )
        .await;

        assert!(!outcome.healthy);
        assert!(!outcome.cancelled);
        assert!(outcome.last_error.is_none());
        assert!(outcome.elapsed >= Duration::from_millis(50));
        // bounded: nowhere near unlimited polling
        assert!(calls.load(Ordering::SeqCst) <= 8);
    }

    #[fluvio_future::test]
    async fn test_converge_keeps_polling_through_retryable_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe_calls = calls.clone();
        let cancel = CancellationToken::new();

        let outcome = converge(
            move || {
                let n = probe_calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(BackendError::not_found("daemonset cilium"))
                    } else {
                        Ok(true)
                    }
                }
            },
            fast(5_000),
            &cancel,
        )
        .await;

        assert!(outcome.healthy);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[fluvio_future::test]
    async fn test_converge_records_last_error_on_timeout() {
        let cancel = CancellationToken::new();

        let outcome = converge(
            || async { Err(BackendError::Transient("connection refused".into())) },
            fast(40),
            &cancel,
        )
        .await;

        assert!(!outcome.healthy);
        let last = outcome.last_error.expect("timeout should keep last error");
        assert!(matches!(last, BackendError::Transient(_)));
    }

    #[fluvio_future::test]
    async fn test_converge_stops_immediately_on_fatal_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe_calls = calls.clone();
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let outcome = converge(
            move || {
                probe_calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::Rejected("bad values".into())) }
            },
            WaitOptions::new(Duration::from_secs(2), Duration::from_secs(30)),
            &cancel,
        )
        .await;

        assert!(outcome.is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // no inter-poll sleep happened
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[fluvio_future::test]
    async fn test_converge_honors_cancellation_promptly() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        fluvio_future::task::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let outcome = converge(
            || async { Ok(false) },
            WaitOptions::new(Duration::from_secs(10), Duration::from_secs(60)),
            &cancel,
        )
        .await;

        assert!(outcome.cancelled);
        assert!(!outcome.healthy);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
