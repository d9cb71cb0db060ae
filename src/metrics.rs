//! Metrics helpers and consumer telemetry bookkeeping.
//!
//! The `record_*` functions emit through the `metrics` facade when the `metrics` feature is
//! enabled and compile to nothing otherwise. [`ConsumerMetrics`] is always available and feeds
//! [`TrustCacheStatus`](crate::TrustCacheStatus).

// std
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
#[cfg(feature = "prometheus")] use std::sync::OnceLock;
// crates.io
#[cfg(feature = "metrics")] use metrics::Label;
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
#[cfg(feature = "metrics")] use smallvec::SmallVec;
// self
use crate::_prelude::*;

#[cfg(feature = "metrics")]
type LabelSet = SmallVec<[Label; 4]>;

#[cfg(feature = "metrics")]
const METRIC_DECISIONS_TOTAL: &str = "trust_cache_decisions_total";
#[cfg(feature = "metrics")]
const METRIC_EVENTS_TOTAL: &str = "trust_cache_events_total";
#[cfg(feature = "metrics")]
const METRIC_BACKFILL_FACTS_TOTAL: &str = "trust_cache_backfill_facts_total";
#[cfg(feature = "metrics")]
const METRIC_BACKFILL_DURATION: &str = "trust_cache_backfill_duration_seconds";
#[cfg(feature = "metrics")]
const METRIC_REFRESH_TOTAL: &str = "trust_cache_refresh_total";
#[cfg(feature = "metrics")]
const METRIC_RECONNECTS_TOTAL: &str = "trust_cache_consumer_reconnects_total";
#[cfg(feature = "metrics")]
const METRIC_PURGED_TOTAL: &str = "trust_cache_purged_records_total";

/// Shared Prometheus handle installed by [`install_default_exporter`].
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Outcome of applying one queue event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventOutcome {
	/// The event changed the store.
	Applied,
	/// The event was already reflected in the store.
	Duplicate,
	/// The event could not be decoded and was dead-lettered.
	Poison,
	/// Applying the event failed and will be retried.
	Retried,
}
impl EventOutcome {
	/// Label value used for metrics and logs.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Applied => "applied",
			Self::Duplicate => "duplicate",
			Self::Poison => "poison",
			Self::Retried => "retried",
		}
	}
}

/// Thread-safe counters shared by the event consumer and its workers.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
	connected: AtomicBool,
	applied: AtomicU64,
	duplicates: AtomicU64,
	poison: AtomicU64,
	apply_retries: AtomicU64,
	reconnects: AtomicU64,
	last_applied_millis: AtomicU64,
}
impl ConsumerMetrics {
	/// Create a new shared accumulator.
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Record the outcome of one event.
	pub fn record_event(&self, outcome: EventOutcome) {
		let counter = match outcome {
			EventOutcome::Applied => &self.applied,
			EventOutcome::Duplicate => &self.duplicates,
			EventOutcome::Poison => &self.poison,
			EventOutcome::Retried => &self.apply_retries,
		};

		counter.fetch_add(1, Ordering::Relaxed);

		if matches!(outcome, EventOutcome::Applied | EventOutcome::Duplicate) {
			let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();

			self.last_applied_millis.store(now, Ordering::Relaxed);
		}

		record_event(outcome);
	}

	/// Record a (re)connection attempt outcome.
	pub fn record_connection(&self, connected: bool) {
		self.connected.store(connected, Ordering::Relaxed);
	}

	/// Record a reconnect after a transport failure.
	pub fn record_reconnect(&self) {
		self.reconnects.fetch_add(1, Ordering::Relaxed);

		record_consumer_reconnect();
	}

	/// Take a point-in-time snapshot for status reporting.
	pub fn snapshot(&self) -> ConsumerMetricsSnapshot {
		ConsumerMetricsSnapshot {
			connected: self.connected.load(Ordering::Relaxed),
			applied: self.applied.load(Ordering::Relaxed),
			duplicates: self.duplicates.load(Ordering::Relaxed),
			poison: self.poison.load(Ordering::Relaxed),
			apply_retries: self.apply_retries.load(Ordering::Relaxed),
			reconnects: self.reconnects.load(Ordering::Relaxed),
			last_applied_at: match self.last_applied_millis.load(Ordering::Relaxed) {
				0 => None,
				value => i64::try_from(value).ok().and_then(DateTime::<Utc>::from_timestamp_millis),
			},
		}
	}
}

/// Read-only snapshot of consumer telemetry counters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConsumerMetricsSnapshot {
	/// Whether the consumer currently holds a queue connection.
	pub connected: bool,
	/// Events that changed the store.
	pub applied: u64,
	/// Events that were already reflected.
	pub duplicates: u64,
	/// Malformed events that were dead-lettered.
	pub poison: u64,
	/// Store failures that caused an event to be retried.
	pub apply_retries: u64,
	/// Reconnects after transport failures.
	pub reconnects: u64,
	/// When an event was last applied (or recognised as a duplicate).
	pub last_applied_at: Option<DateTime<Utc>>,
}
impl ConsumerMetricsSnapshot {
	/// Total events acknowledged to the queue.
	pub fn acknowledged(&self) -> u64 {
		self.applied + self.duplicates + self.poison
	}
}

/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the recorder is installed.
#[cfg(feature = "prometheus")]
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new()
		.install_recorder()
		.map_err(|err| Error::Metrics(err.to_string()))?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus exporter handle when installed.
#[cfg(feature = "prometheus")]
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Record a validator decision (`accept`, `expired_refreshable`, or a reject reason).
#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
pub fn record_decision(outcome: &'static str) {
	#[cfg(feature = "metrics")]
	metrics::counter!(METRIC_DECISIONS_TOTAL, outcome_labels(outcome).iter()).increment(1);
}

/// Record the outcome of one queue event.
#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
pub fn record_event(outcome: EventOutcome) {
	#[cfg(feature = "metrics")]
	metrics::counter!(METRIC_EVENTS_TOTAL, outcome_labels(outcome.as_str()).iter()).increment(1);
}

/// Record a completed backfill run.
#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
pub fn record_backfill(facts: u64, duration: Duration) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(METRIC_BACKFILL_FACTS_TOTAL).increment(facts);
		metrics::histogram!(METRIC_BACKFILL_DURATION).record(duration.as_secs_f64());
	}
}

/// Record the final status of a refresh (`success`, `rejected`, or `error`).
#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
pub fn record_refresh(status: &'static str) {
	#[cfg(feature = "metrics")]
	{
		let mut labels = LabelSet::with_capacity(1);

		labels.push(Label::new("status", status));

		metrics::counter!(METRIC_REFRESH_TOTAL, labels.iter()).increment(1);
	}
}

/// Record a queue reconnect.
pub fn record_consumer_reconnect() {
	#[cfg(feature = "metrics")]
	metrics::counter!(METRIC_RECONNECTS_TOTAL).increment(1);
}

/// Record records deleted by the reaper.
#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
pub fn record_purged(count: u64) {
	#[cfg(feature = "metrics")]
	metrics::counter!(METRIC_PURGED_TOTAL).increment(count);
}

#[cfg(feature = "metrics")]
fn outcome_labels(outcome: &'static str) -> LabelSet {
	let mut labels = LabelSet::with_capacity(1);

	labels.push(Label::new("outcome", outcome));

	labels
}
