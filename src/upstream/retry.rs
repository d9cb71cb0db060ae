//! Bounded retries for transient failures of upstream calls and store writes.

// std
use std::future::Future;
// crates.io
use tokio::time;
// self
use crate::{_prelude::*, config::RetryPolicy};

/// Attempt and wall-clock accounting for one retried operation.
#[derive(Debug)]
struct RetryBudget<'a> {
	policy: &'a RetryPolicy,
	deadline: Instant,
	retries: u32,
}
impl<'a> RetryBudget<'a> {
	fn new(policy: &'a RetryPolicy) -> Self {
		let now = Instant::now();
		let deadline =
			now.checked_add(policy.deadline).unwrap_or(now + Duration::from_secs(86_400));

		Self { policy, deadline, retries: 0 }
	}

	/// Timeout for the next attempt, or `None` once the deadline passed.
	fn next_timeout(&self) -> Option<Duration> {
		let timeout = self.remaining().min(self.policy.attempt_timeout);

		(!timeout.is_zero()).then_some(timeout)
	}

	fn remaining(&self) -> Duration {
		self.deadline.saturating_duration_since(Instant::now())
	}

	/// Consume one retry and return the delay before it, or `None` when none are left.
	fn take_retry(&mut self) -> Option<Duration> {
		if self.retries >= self.policy.max_retries {
			tracing::debug!(retries = self.retries, "retry budget exhausted");

			return None;
		}

		let delay = self.policy.compute_backoff(self.retries).min(self.remaining());

		self.retries = self.retries.saturating_add(1);

		Some(delay)
	}
}

/// Run `operation` until it succeeds, fails permanently, or the policy budget runs out.
///
/// Only errors classified by [`Error::is_transient`] are retried. The closure receives the
/// per-attempt timeout granted by the policy. The last error is returned on exhaustion.
pub async fn retry_transient<T, F, Fut>(
	policy: &RetryPolicy,
	operation: &'static str,
	mut attempt: F,
) -> Result<T>
where
	F: FnMut(Duration) -> Fut,
	Fut: Future<Output = Result<T>>,
{
	let mut budget = RetryBudget::new(policy);
	let mut last_error = None;

	while let Some(timeout) = budget.next_timeout() {
		match attempt(timeout).await {
			Ok(value) => return Ok(value),
			Err(err) if err.is_transient() => {
				tracing::warn!(
					operation,
					error = %err,
					retries = budget.retries,
					"transient failure"
				);

				last_error = Some(err);

				match budget.take_retry() {
					Some(delay) if !delay.is_zero() => time::sleep(delay).await,
					Some(_) => {},
					None => break,
				}
			},
			Err(err) => return Err(err),
		}
	}

	Err(last_error
		.unwrap_or_else(|| Error::Transport(format!("{operation}: retry budget exhausted."))))
}
