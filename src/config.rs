//! Trust cache configuration and validation.
//!
//! Every knob has a default so a config only needs the authority URL and the database path.
//! Call [`TrustCacheConfig::validate`] (done by the builder) before wiring components.

// std
use std::{cell::RefCell, path::PathBuf};
// crates.io
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use url::Url;
// self
use crate::{_prelude::*, security};

thread_local! {
	static JITTER_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_rng(&mut rand::rng()));
}

/// Default bounded buffer size between queue intake and store workers.
pub const DEFAULT_BUFFER_SIZE: usize = 100;
/// Default number of store-writing workers.
pub const DEFAULT_WORKERS: usize = 4;
/// Default interval between reaper sweeps.
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Default retention past `expires_at` before a record may be purged.
pub const DEFAULT_REAPER_GRACE: Duration = Duration::from_secs(60 * 60);
/// Default size guard for one backfill line (1 MiB).
pub const DEFAULT_MAX_BATCH_BYTES: u64 = 1_048_576;
/// Upper bound on worker count.
pub const MAX_WORKERS: usize = 64;

/// Randomization applied on top of the exponential backoff schedule.
#[derive(Clone, Debug, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
	/// Deterministic delays.
	None,
	/// Delay drawn from the top fifth of the current step.
	#[default]
	Full,
	/// Delay drawn between the initial backoff and three times the current step.
	Decorrelated,
}

/// Backoff and budget for one class of retried work.
///
/// Long-running loops (queue reconnects, event applies) only use the backoff fields and keep
/// retrying until shutdown; bounded operations also honour `max_retries` and `deadline`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
	/// Retries allowed after the first attempt.
	pub max_retries: u32,
	/// Time limit for a single attempt.
	pub attempt_timeout: Duration,
	/// Delay before the first retry; later delays double from here.
	pub initial_backoff: Duration,
	/// Ceiling for any single delay.
	pub max_backoff: Duration,
	/// Wall-clock budget shared by every attempt of one operation.
	pub deadline: Duration,
	/// Randomization applied to each delay.
	#[serde(default)]
	pub jitter: JitterStrategy,
}
impl RetryPolicy {
	/// Policy used for queue reconnects: unbounded attempts, capped at 30 seconds apart.
	pub fn reconnect() -> Self {
		Self {
			max_retries: u32::MAX,
			attempt_timeout: Duration::from_secs(10),
			initial_backoff: Duration::from_millis(500),
			max_backoff: Duration::from_secs(30),
			deadline: Duration::from_secs(60 * 60 * 24 * 365),
			jitter: JitterStrategy::Full,
		}
	}

	/// Check the policy; `field` names it in the returned error.
	pub fn validate(&self, field: &'static str) -> Result<()> {
		let problem = if self.attempt_timeout < Duration::from_millis(100) {
			Some("attempt_timeout must be at least 100 ms.")
		} else if self.initial_backoff.is_zero() {
			Some("initial_backoff must be greater than zero.")
		} else if self.max_backoff < self.initial_backoff {
			Some("max_backoff must not be below initial_backoff.")
		} else if self.deadline < self.attempt_timeout {
			Some("deadline must not be below attempt_timeout.")
		} else {
			None
		};

		match problem {
			Some(reason) => Err(Error::Validation { field, reason: reason.into() }),
			None => Ok(()),
		}
	}

	/// Delay to wait before retry number `attempt` (zero-based).
	pub fn compute_backoff(&self, attempt: u32) -> Duration {
		let step = self
			.initial_backoff
			.checked_mul(1 << attempt.min(20))
			.map_or(self.max_backoff, |step| step.min(self.max_backoff))
			.max(self.initial_backoff);

		match self.jitter {
			JitterStrategy::None => step,
			JitterStrategy::Full => random_within(step.mul_f64(0.8).max(self.initial_backoff), step),
			JitterStrategy::Decorrelated => {
				let previous = if attempt == 0 { self.initial_backoff } else { step };
				let ceiling = previous.mul_f64(3.0);

				random_within(
					self.initial_backoff,
					ceiling.clamp(self.initial_backoff, self.max_backoff),
				)
			},
		}
	}
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_retries: 2,
			attempt_timeout: Duration::from_secs(3),
			initial_backoff: Duration::from_millis(250),
			max_backoff: Duration::from_secs(2),
			deadline: Duration::from_secs(8),
			jitter: JitterStrategy::Full,
		}
	}
}

/// Event consumer tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsumerConfig {
	/// Capacity of each worker's bounded buffer; intake blocks when it is full.
	#[serde(default = "default_buffer_size")]
	pub buffer_size: usize,
	/// Number of workers applying events to the store.
	#[serde(default = "default_workers")]
	pub workers: usize,
	/// Backoff between queue reconnect attempts.
	#[serde(default = "RetryPolicy::reconnect")]
	pub reconnect: RetryPolicy,
	/// Backoff between attempts to apply one event after a store failure.
	#[serde(default)]
	pub apply_backoff: RetryPolicy,
}
impl ConsumerConfig {
	/// Validate consumer tuning.
	pub fn validate(&self) -> Result<()> {
		if self.buffer_size == 0 {
			return Err(Error::Validation {
				field: "consumer.buffer_size",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.workers == 0 || self.workers > MAX_WORKERS {
			return Err(Error::Validation {
				field: "consumer.workers",
				reason: format!("Must be between 1 and {MAX_WORKERS}."),
			});
		}

		self.reconnect.validate("consumer.reconnect")?;
		self.apply_backoff.validate("consumer.apply_backoff")?;

		Ok(())
	}
}
impl Default for ConsumerConfig {
	fn default() -> Self {
		Self {
			buffer_size: DEFAULT_BUFFER_SIZE,
			workers: DEFAULT_WORKERS,
			reconnect: RetryPolicy::reconnect(),
			apply_backoff: RetryPolicy::default(),
		}
	}
}

/// Expired-record reaper tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReaperConfig {
	/// Whether the reaper task runs at all.
	#[serde(default = "default_true")]
	pub enabled: bool,
	/// Interval between sweeps.
	#[serde(default = "default_reaper_interval")]
	pub interval: Duration,
	/// Retention past `expires_at` before a record is deleted.
	#[serde(default = "default_reaper_grace")]
	pub grace: Duration,
}
impl Default for ReaperConfig {
	fn default() -> Self {
		Self { enabled: true, interval: DEFAULT_REAPER_INTERVAL, grace: DEFAULT_REAPER_GRACE }
	}
}

/// Top-level configuration for a [`TrustCache`](crate::TrustCache).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrustCacheConfig {
	/// Base URL of the identity authority.
	pub authority_url: Url,
	/// Whether HTTPS is required when talking to the authority.
	#[serde(default = "default_true")]
	pub require_https: bool,
	/// On-disk location of the SQLite trust store.
	pub database_path: PathBuf,
	/// Maximum size of one newline-delimited backfill batch.
	#[serde(default = "default_max_batch_bytes")]
	pub max_batch_bytes: u64,
	/// Retry policy for store writes during backfill.
	#[serde(default)]
	pub backfill_retry: RetryPolicy,
	/// Retry policy for transient refresh failures.
	#[serde(default)]
	pub refresh_retry: RetryPolicy,
	/// Event consumer tuning.
	#[serde(default)]
	pub consumer: ConsumerConfig,
	/// Reaper tuning.
	#[serde(default)]
	pub reaper: ReaperConfig,
	/// Whether rotated credential cookies carry the `Secure` attribute.
	#[serde(default = "default_true")]
	pub secure_cookies: bool,
}
impl TrustCacheConfig {
	/// Construct a configuration with default tuning.
	pub fn new(authority_url: impl AsRef<str>, database_path: impl Into<PathBuf>) -> Result<Self> {
		let authority_url = Url::parse(authority_url.as_ref())?;

		Ok(Self {
			authority_url,
			require_https: true,
			database_path: database_path.into(),
			max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
			backfill_retry: RetryPolicy::default(),
			refresh_retry: RetryPolicy::default(),
			consumer: ConsumerConfig::default(),
			reaper: ReaperConfig::default(),
			secure_cookies: true,
		})
	}

	/// Allow or forbid plain-HTTP authority URLs.
	pub fn with_require_https(mut self, require_https: bool) -> Self {
		self.require_https = require_https;

		self
	}

	/// Validate the configuration against the documented constraints.
	pub fn validate(&self) -> Result<()> {
		if self.require_https {
			security::enforce_https(&self.authority_url)?;
		}
		if self.authority_url.host_str().is_none() {
			return Err(Error::Validation {
				field: "authority_url",
				reason: "Must include a host component.".into(),
			});
		}
		if self.authority_url.cannot_be_a_base() {
			return Err(Error::Validation {
				field: "authority_url",
				reason: "Must be usable as a base URL.".into(),
			});
		}
		if self.database_path.as_os_str().is_empty() {
			return Err(Error::Validation {
				field: "database_path",
				reason: "Must not be empty.".into(),
			});
		}
		if self.max_batch_bytes == 0 {
			return Err(Error::Validation {
				field: "max_batch_bytes",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.reaper.enabled && self.reaper.interval < Duration::from_secs(1) {
			return Err(Error::Validation {
				field: "reaper.interval",
				reason: "Must be at least 1 second.".into(),
			});
		}

		self.backfill_retry.validate("backfill_retry")?;
		self.refresh_retry.validate("refresh_retry")?;
		self.consumer.validate()?;

		Ok(())
	}
}

fn random_within(low: Duration, high: Duration) -> Duration {
	if high <= low {
		return high;
	}

	let span = u64::try_from((high - low).as_nanos()).unwrap_or(u64::MAX);

	low + Duration::from_nanos(JITTER_RNG.with(|rng| rng.borrow_mut().random_range(0..=span)))
}

fn default_true() -> bool {
	true
}

fn default_buffer_size() -> usize {
	DEFAULT_BUFFER_SIZE
}

fn default_workers() -> usize {
	DEFAULT_WORKERS
}

fn default_reaper_interval() -> Duration {
	DEFAULT_REAPER_INTERVAL
}

fn default_reaper_grace() -> Duration {
	DEFAULT_REAPER_GRACE
}

fn default_max_batch_bytes() -> u64 {
	DEFAULT_MAX_BATCH_BYTES
}
