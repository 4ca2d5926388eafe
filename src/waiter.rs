//! Poll-until-target for asynchronously provisioned objects.
//!
//! A [`StateChangeConf`] names the states an object may pass through
//! (`pending`) and the states that end the wait (`target`). The waiter calls a
//! caller-supplied refresh function after an initial delay and then at least
//! `min_timeout` apart, until the refresh reports a target state, reports a
//! state outside `pending ∪ target`, fails, or the deadline passes.
//!
//! Disappearance is reported by returning no object together with
//! [`NOT_FOUND_STATE`]; delete waiters put that state in their target set.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::context::OpContext;
use crate::error::ProviderError;

/// Synthetic state for an object the API no longer knows about.
pub const NOT_FOUND_STATE: &str = "Not Found";

/// Waiter configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChangeConf {
    /// States the object may legitimately pass through.
    pub pending: Vec<String>,
    /// States that end the wait successfully.
    pub target: Vec<String>,
    /// Delay before the first poll.
    pub delay: Duration,
    /// Minimum interval between polls.
    pub min_timeout: Duration,
    /// Overall budget.
    pub timeout: Duration,
    /// Consecutive "no object" polls tolerated before failing.
    pub not_found_checks: u32,
}

impl StateChangeConf {
    /// Wait from any of `pending` to any of `target` with default budgets
    /// (5 s delay, 5 s interval, 5 min timeout).
    pub fn new(pending: &[&str], target: &[&str]) -> Self {
        Self {
            pending: pending.iter().map(|s| s.to_string()).collect(),
            target: target.iter().map(|s| s.to_string()).collect(),
            delay: Duration::from_secs(5),
            min_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(5 * 60),
            not_found_checks: 20,
        }
    }

    /// Wait for an object to disappear.
    pub fn until_gone(pending: &[&str]) -> Self {
        Self::new(pending, &[NOT_FOUND_STATE])
    }

    /// Set the delay before the first poll.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the minimum interval between polls.
    pub fn with_min_timeout(mut self, min_timeout: Duration) -> Self {
        self.min_timeout = min_timeout;
        self
    }

    /// Set the overall budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set how many consecutive "no object" polls are tolerated.
    pub fn with_not_found_checks(mut self, checks: u32) -> Self {
        self.not_found_checks = checks;
        self
    }

    fn check(&self) -> Result<(), ProviderError> {
        if self.target.is_empty() {
            return Err(ProviderError::Sdk("waiter has no target states".to_string()));
        }
        if let Some(overlap) = self.pending.iter().find(|s| self.target.contains(s)) {
            return Err(ProviderError::Sdk(format!(
                "waiter state {:?} is both pending and target",
                overlap
            )));
        }
        Ok(())
    }

    fn is_target(&self, state: &str) -> bool {
        self.target.iter().any(|s| s == state)
    }

    fn is_pending(&self, state: &str) -> bool {
        self.pending.iter().any(|s| s == state)
    }
}

/// A failed wait, carrying the last observation for diagnostics.
#[derive(Debug)]
pub struct WaitError<T> {
    /// The last object the refresh function returned.
    pub last_object: Option<T>,
    /// The last state observed.
    pub last_state: Option<String>,
    /// Why the wait ended.
    pub error: ProviderError,
}

impl<T> fmt::Display for WaitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.last_state {
            Some(state) => write!(f, "{} (last state: '{}')", self.error, state),
            None => write!(f, "{}", self.error),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for WaitError<T> {}

impl<T> From<WaitError<T>> for ProviderError {
    fn from(err: WaitError<T>) -> Self {
        err.error
    }
}

/// Poll `refresh` until it reports a target state.
///
/// `refresh` returns the current object (or `None` when it is gone) and its
/// state. On success the final `(object, state)` is returned; the state is
/// always one of `conf.target`.
pub async fn wait_for_state<T, F, Fut>(
    ctx: &OpContext,
    conf: &StateChangeConf,
    mut refresh: F,
) -> Result<(Option<T>, String), WaitError<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(Option<T>, String), ProviderError>>,
{
    let mut last_object: Option<T> = None;
    let mut last_state: Option<String> = None;

    if let Err(error) = conf.check() {
        return Err(WaitError {
            last_object,
            last_state,
            error,
        });
    }

    let wait_ctx = ctx.child_with_timeout(conf.timeout);
    let mut not_found = 0u32;
    let mut pause = conf.delay;
    let mut polls = 0u32;

    loop {
        if let Err(error) = wait_ctx.sleep(pause).await {
            let error = timed_out(conf, error, last_state.as_deref());
            return Err(WaitError {
                last_object,
                last_state,
                error,
            });
        }
        pause = conf.min_timeout;
        polls += 1;

        let (object, state) = match wait_ctx.run(refresh()).await {
            Ok(observed) => observed,
            Err(error) => {
                let error = timed_out(conf, error, last_state.as_deref());
                return Err(WaitError {
                    last_object,
                    last_state,
                    error,
                });
            },
        };
        debug!(state = %state, polls, found = object.is_some(), "waiter poll");

        if conf.is_target(&state) {
            return Ok((object, state));
        }

        if object.is_none() {
            not_found += 1;
            if not_found > conf.not_found_checks {
                return Err(WaitError {
                    last_object,
                    last_state: Some(state),
                    error: ProviderError::NotFound(format!(
                        "couldn't find resource ({} retries)",
                        conf.not_found_checks
                    )),
                });
            }
            last_state = Some(state);
            continue;
        }
        not_found = 0;

        if !conf.is_pending(&state) {
            let error = ProviderError::FailedPrecondition(format!(
                "unexpected state '{}', wanted target '{}'",
                state,
                conf.target.join(", ")
            ));
            return Err(WaitError {
                last_object: object,
                last_state: Some(state),
                error,
            });
        }

        last_object = object;
        last_state = Some(state);
    }
}

/// Turn the result of fetching an object into a waiter observation.
///
/// A 404 reads as the object being gone ([`NOT_FOUND_STATE`]).
pub fn observe<T>(
    result: Result<T, ProviderError>,
    state_of: impl FnOnce(&T) -> String,
) -> Result<(Option<T>, String), ProviderError> {
    match result {
        Ok(object) => {
            let state = state_of(&object);
            Ok((Some(object), state))
        },
        Err(err) if err.is_not_found() => Ok((None, NOT_FOUND_STATE.to_string())),
        Err(err) => Err(err),
    }
}

fn timed_out(conf: &StateChangeConf, error: ProviderError, last_state: Option<&str>) -> ProviderError {
    match error {
        ProviderError::Timeout { .. } => ProviderError::Timeout {
            message: format!(
                "timeout while waiting for state to become '{}' (last state: '{}', timeout: {:?})",
                conf.target.join(", "),
                last_state.unwrap_or(""),
                conf.timeout
            ),
            last_state: last_state.map(str::to_string),
        },
        other => other,
    }
}
