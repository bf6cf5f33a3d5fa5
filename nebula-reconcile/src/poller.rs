//! Convergence poller.
//!
//! The remote service has no push notifications, so waiting for an object to
//! finish provisioning means re-reading it until its lifecycle state matches.
//! Failed refreshes count as "still pending"; only the overall timeout (or
//! cancellation by the host) ends the wait early.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::{Caller, Value};
use crate::document::{self, ObservedObject};
use crate::error::{Error, Result};

/// Timing budget for a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollBudget {
    /// Total time allowed for the object to converge.
    pub timeout: Duration,
    /// Delay between refreshes.
    pub poll_interval: Duration,
    /// Lower bound on the delay between refreshes.
    pub min_interval: Duration,
}

impl Default for PollBudget {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(10),
            min_interval: Duration::from_secs(3),
        }
    }
}

impl PollBudget {
    /// Effective delay between two refreshes.
    pub fn cadence(&self) -> Duration {
        self.poll_interval.max(self.min_interval)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cadence().is_zero() {
            return Err(Error::Validation(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Condition an observed object must satisfy to end the wait.
#[derive(Debug, Clone, Copy)]
pub struct TargetState {
    pub label: &'static str,
    pub matches: fn(&ObservedObject) -> bool,
}

/// Blocks the calling flow until an object reaches a target state.
pub struct Poller<'a> {
    client: &'a dyn Caller,
    info_call: &'static str,
    element: &'static str,
    budget: PollBudget,
    cancel: CancellationToken,
}

impl<'a> Poller<'a> {
    pub fn new(
        client: &'a dyn Caller,
        info_call: &'static str,
        element: &'static str,
        budget: PollBudget,
    ) -> Self {
        Self {
            client,
            info_call,
            element,
            budget,
            cancel: CancellationToken::new(),
        }
    }

    /// Let the host abort the wait between refreshes.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn refresh(&self, id: i64) -> Result<ObservedObject> {
        let body = self
            .client
            .call(self.info_call, vec![Value::Int(id), Value::Bool(false)])
            .await?;
        document::decode_one(&body, self.element)
    }

    /// Wait until object `id` satisfies `target`.
    pub async fn wait_for(&self, id: i64, target: TargetState) -> Result<ObservedObject> {
        let start = Instant::now();
        let deadline = start + self.budget.timeout;
        let cadence = self.budget.cadence();
        let mut last: Option<ObservedObject> = None;
        let mut attempts = 0u32;

        info!(id, target = target.label, timeout = ?self.budget.timeout, "Waiting for object");

        loop {
            attempts += 1;
            match self.refresh(id).await {
                Ok(obj) if (target.matches)(&obj) => {
                    info!(
                        id,
                        target = target.label,
                        attempts,
                        elapsed = ?start.elapsed(),
                        "Object reached target state"
                    );
                    return Ok(obj);
                }
                Ok(obj) => {
                    debug!(id, state = ?obj.state, attempts, "Object still pending");
                    last = Some(obj);
                }
                Err(e) => {
                    debug!(id, error = %e, attempts, "Refresh failed, treating as pending");
                }
            }

            // no refresh may follow the previous one sooner than min_interval
            let now = Instant::now();
            if now + self.budget.min_interval > deadline {
                warn!(id, target = target.label, attempts, "Timed out waiting for object");
                return Err(Error::ConvergenceTimeout {
                    id,
                    target: target.label,
                    elapsed: now - start,
                    last: last.map(Box::new),
                });
            }

            let wake = (now + cadence).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = self.cancel.cancelled() => {
                    info!(id, "Wait cancelled");
                    return Err(Error::Cancelled);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::fake::FakeCaller;
    use crate::document::fixtures::object;

    const READY: TargetState = TargetState {
        label: "ready",
        matches: |obj| obj.state == Some(1),
    };

    fn image_in_state(state: i64) -> String {
        object(
            "IMAGE",
            8,
            "disk",
            "600",
            &format!("<STATE>{state}</STATE>"),
        )
    }

    fn budget(timeout_secs: u64) -> PollBudget {
        PollBudget {
            timeout: Duration::from_secs(timeout_secs),
            poll_interval: Duration::from_secs(10),
            min_interval: Duration::from_secs(3),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_poll() {
        let fake = FakeCaller::new();
        fake.respond("one.image.info", Ok(image_in_state(4)));
        fake.respond("one.image.info", Ok(image_in_state(4)));
        fake.respond("one.image.info", Ok(image_in_state(1)));

        let poller = Poller::new(&fake, "one.image.info", "IMAGE", budget(20));
        let obj = poller.wait_for(8, READY).await.unwrap();

        assert_eq!(obj.state, Some(1));
        assert_eq!(fake.count("one.image.info"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_last_observed_state() {
        let fake = FakeCaller::new();
        for _ in 0..3 {
            fake.respond("one.image.info", Ok(image_in_state(4)));
        }

        let poller = Poller::new(&fake, "one.image.info", "IMAGE", budget(20));
        let err = poller.wait_for(8, READY).await.unwrap_err();

        match err {
            Error::ConvergenceTimeout {
                id, target, last, ..
            } => {
                assert_eq!(id, 8);
                assert_eq!(target, "ready");
                assert_eq!(last.unwrap().state, Some(4));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fake.count("one.image.info"), 3);
    }

    /// Records when each call was made.
    struct Timed<'a> {
        inner: &'a FakeCaller,
        at: std::sync::Mutex<Vec<Instant>>,
    }

    #[async_trait::async_trait]
    impl Caller for Timed<'_> {
        async fn call(&self, method: &str, args: Vec<Value>) -> Result<String> {
            self.at.lock().unwrap().push(Instant::now());
            self.inner.call(method, args).await
        }

        fn username(&self) -> &str {
            self.inner.username()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_never_shortens_the_spacing() {
        let fake = FakeCaller::new();
        for _ in 0..4 {
            fake.respond("one.image.info", Ok(image_in_state(4)));
        }
        let timed = Timed {
            inner: &fake,
            at: std::sync::Mutex::new(Vec::new()),
        };

        let err = Poller::new(&timed, "one.image.info", "IMAGE", budget(21))
            .wait_for(8, READY)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConvergenceTimeout { .. }));

        let at = timed.at.lock().unwrap().clone();
        assert_eq!(at.len(), 3);
        for pair in at.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(3));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failures_count_as_pending() {
        let fake = FakeCaller::new();
        fake.respond("one.image.info", Err(Error::Transport("reset".into())));
        fake.reject("one.image.info", "Error getting image [8]");
        fake.respond("one.image.info", Ok(image_in_state(1)));

        let poller = Poller::new(&fake, "one.image.info", "IMAGE", budget(60));
        assert!(poller.wait_for(8, READY).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn respects_minimum_spacing() {
        let fake = FakeCaller::new();
        fake.respond("one.image.info", Ok(image_in_state(4)));
        fake.respond("one.image.info", Ok(image_in_state(1)));

        let fast = PollBudget {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            min_interval: Duration::from_secs(3),
        };
        let start = Instant::now();
        Poller::new(&fake, "one.image.info", "IMAGE", fast)
            .wait_for(8, READY)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_wait() {
        let fake = FakeCaller::new();
        fake.respond("one.image.info", Ok(image_in_state(4)));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Poller::new(&fake, "one.image.info", "IMAGE", budget(600))
            .with_cancellation(cancel)
            .wait_for(8, READY)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(fake.count("one.image.info"), 1);
    }

    #[test]
    fn default_budget() {
        let b = PollBudget::default();
        assert_eq!(b.timeout, Duration::from_secs(600));
        assert_eq!(b.cadence(), Duration::from_secs(10));
    }
}
