//! Explicit context object wiring the trust cache components together.

// std
use std::sync::{Mutex, MutexGuard};
// crates.io
use tokio::{
	sync::watch,
	task::JoinHandle,
	time::{self, MissedTickBehavior},
};
// self
use crate::{
	_prelude::*,
	auth::{Authenticator, ClaimsVerifier},
	config::{ReaperConfig, TrustCacheConfig},
	metrics::{self, ConsumerMetrics, ConsumerMetricsSnapshot},
	refresh::RefreshCoordinator,
	store::{self, SqliteStore, TokenStore},
	sync::{
		backfill::{BackfillReport, BackfillSynchronizer},
		consumer::{ConsumerHandle, EventConsumer, shutdown_requested},
		queue::EventSource,
	},
	upstream::{AuthorityClient, HttpAuthority},
	validator::Validator,
};

/// Builder for [`TrustCache`].
#[derive(Debug)]
pub struct TrustCacheBuilder {
	config: TrustCacheConfig,
	store: Option<Arc<dyn TokenStore>>,
	authority: Option<Arc<dyn AuthorityClient>>,
	events: Option<Arc<dyn EventSource>>,
	verifier: Option<Arc<ClaimsVerifier>>,
}
impl TrustCacheBuilder {
	/// Start a builder from `config`.
	pub fn new(config: TrustCacheConfig) -> Self {
		Self { config, store: None, authority: None, events: None, verifier: None }
	}

	/// Use a pre-built store instead of opening `database_path`.
	pub fn store(mut self, store: Arc<dyn TokenStore>) -> Self {
		self.store = Some(store);

		self
	}

	/// Use a custom authority client instead of [`HttpAuthority`].
	pub fn authority(mut self, authority: Arc<dyn AuthorityClient>) -> Self {
		self.authority = Some(authority);

		self
	}

	/// Queue delivering token lifecycle events.
	pub fn events(mut self, events: Arc<dyn EventSource>) -> Self {
		self.events = Some(events);

		self
	}

	/// Signature verifier for access tokens.
	pub fn verifier(mut self, verifier: ClaimsVerifier) -> Self {
		self.verifier = Some(Arc::new(verifier));

		self
	}

	/// Validate the configuration and assemble the context.
	pub fn build(self) -> Result<TrustCache> {
		self.config.validate()?;

		let Some(events) = self.events else {
			return Err(Error::Validation {
				field: "events",
				reason: "An event source is required.".into(),
			});
		};
		let Some(verifier) = self.verifier else {
			return Err(Error::Validation {
				field: "verifier",
				reason: "A claims verifier is required.".into(),
			});
		};
		let store = match self.store {
			Some(store) => store,
			None => Arc::new(SqliteStore::open(&self.config.database_path)?),
		};
		let authority = match self.authority {
			Some(authority) => authority,
			None => Arc::new(HttpAuthority::new(&self.config)?),
		};
		let validator = Validator::new(store.clone());
		let refresher = RefreshCoordinator::new(authority.clone(), self.config.refresh_retry.clone());
		let (shutdown, _) = watch::channel(false);

		Ok(TrustCache {
			config: self.config,
			store,
			authority,
			events,
			verifier,
			validator,
			refresher,
			shutdown,
			state: Mutex::new(RunState::default()),
		})
	}
}

/// Point-in-time view of the trust cache.
#[derive(Clone, Debug)]
pub struct TrustCacheStatus {
	/// Whether [`TrustCache::start`] completed.
	pub ready: bool,
	/// Report of the boot backfill, once it completed.
	pub backfill: Option<BackfillReport>,
	/// Persisted sync cursor.
	pub cursor: Option<DateTime<Utc>>,
	/// Number of stored records.
	pub records: Option<u64>,
	/// Whether the consumer task is running.
	pub consumer_running: bool,
	/// Event consumer counters.
	pub consumer: ConsumerMetricsSnapshot,
}

#[derive(Debug, Default)]
struct RunState {
	started: bool,
	backfill: Option<BackfillReport>,
	consumer: Option<ConsumerHandle>,
	consumer_metrics: Option<Arc<ConsumerMetrics>>,
	reaper: Option<JoinHandle<()>>,
}

/// Trust cache context owning the store and the background tasks that keep it current.
#[derive(Debug)]
pub struct TrustCache {
	config: TrustCacheConfig,
	store: Arc<dyn TokenStore>,
	authority: Arc<dyn AuthorityClient>,
	events: Arc<dyn EventSource>,
	verifier: Arc<ClaimsVerifier>,
	validator: Validator,
	refresher: RefreshCoordinator,
	shutdown: watch::Sender<bool>,
	state: Mutex<RunState>,
}
impl TrustCache {
	/// Start a builder from `config`.
	pub fn builder(config: TrustCacheConfig) -> TrustCacheBuilder {
		TrustCacheBuilder::new(config)
	}

	/// Start the event consumer, run the boot backfill, and start the reaper.
	///
	/// The consumer starts first so no event published during backfill is missed. A backfill
	/// failure is fatal: background tasks are stopped and the error is returned.
	#[tracing::instrument(skip(self))]
	pub async fn start(&self) -> Result<BackfillReport> {
		{
			let mut state = self.lock()?;

			if state.started {
				return Err(Error::Validation {
					field: "start",
					reason: "The trust cache was already started.".into(),
				});
			}

			let consumer = EventConsumer::new(
				self.events.clone(),
				self.store.clone(),
				self.config.consumer.clone(),
			);

			state.started = true;
			state.consumer_metrics = Some(consumer.metrics());
			state.consumer = Some(consumer.spawn(self.shutdown.subscribe()));
		}

		let backfill = BackfillSynchronizer::new(
			self.store.clone(),
			self.authority.clone(),
			self.config.backfill_retry.clone(),
		);
		let report = match backfill.run().await {
			Ok(report) => report,
			Err(err) => {
				tracing::error!(error = %err, "boot backfill failed");

				self.shutdown().await;

				return Err(err);
			},
		};
		let mut state = self.lock()?;

		state.backfill = Some(report.clone());

		if self.config.reaper.enabled {
			state.reaper = Some(tokio::spawn(run_reaper(
				self.store.clone(),
				self.config.reaper.clone(),
				self.shutdown.subscribe(),
			)));
		}

		tracing::info!(watermark = %report.watermark, "trust cache ready");

		Ok(report)
	}

	/// Request-path authenticator backed by this cache.
	pub fn authenticator(&self) -> Authenticator {
		Authenticator::new(
			self.verifier.clone(),
			self.validator.clone(),
			self.refresher.clone(),
			self.config.secure_cookies,
		)
	}

	/// Validator reading this cache's store.
	pub fn validator(&self) -> Validator {
		self.validator.clone()
	}

	/// Shared trust store.
	pub fn store(&self) -> Arc<dyn TokenStore> {
		self.store.clone()
	}

	/// Current status; store read failures show up as `None` fields.
	pub fn status(&self) -> TrustCacheStatus {
		let (ready, backfill, consumer_running, consumer) = match self.lock() {
			Ok(state) => (
				state.backfill.is_some(),
				state.backfill.clone(),
				state.consumer.as_ref().is_some_and(|handle| !handle.is_finished()),
				state.consumer_metrics.as_ref().map(|metrics| metrics.snapshot()).unwrap_or_default(),
			),
			Err(_) => (false, None, false, ConsumerMetricsSnapshot::default()),
		};

		TrustCacheStatus {
			ready,
			backfill,
			cursor: self.store.cursor().ok(),
			records: self.store.record_count().ok(),
			consumer_running,
			consumer,
		}
	}

	/// Signal every background task to stop and wait for them.
	pub async fn shutdown(&self) {
		self.shutdown.send_replace(true);

		let (consumer, reaper) = match self.lock() {
			Ok(mut state) => (state.consumer.take(), state.reaper.take()),
			Err(_) => (None, None),
		};

		if let Some(consumer) = consumer
			&& let Err(err) = consumer.join().await
		{
			tracing::warn!(error = %err, "event consumer did not stop cleanly");
		}
		if let Some(reaper) = reaper
			&& let Err(err) = reaper.await
		{
			tracing::warn!(error = %err, "reaper did not stop cleanly");
		}

		tracing::info!("trust cache stopped");
	}

	fn lock(&self) -> Result<MutexGuard<'_, RunState>> {
		self.state.lock().map_err(|_| Error::Store("Run state mutex poisoned.".into()))
	}
}

/// Delete records whose retention ended before `now - grace`.
pub fn purge_expired(store: &dyn TokenStore, grace: Duration, now: DateTime<Utc>) -> Result<u64> {
	let Some(cutoff) = TimeDelta::from_std(grace).ok().and_then(|grace| now.checked_sub_signed(grace))
	else {
		return Ok(0);
	};
	let purged = store.purge_expired_before(cutoff)?;

	metrics::record_purged(purged);

	if purged > 0 {
		tracing::info!(purged, %cutoff, "expired records purged");
	}

	Ok(purged)
}

async fn run_reaper(
	store: Arc<dyn TokenStore>,
	config: ReaperConfig,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut ticker = time::interval(config.interval);

	ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

	loop {
		tokio::select! {
			biased;
			_ = shutdown_requested(&mut shutdown) => break,
			_ = ticker.tick() => {},
		}

		let target = store.clone();
		let grace = config.grace;

		if let Err(err) =
			store::off_runtime(move || purge_expired(target.as_ref(), grace, Utc::now())).await
		{
			tracing::warn!(error = %err, "reaper sweep failed");
		}
	}

	tracing::debug!("reaper stopped");
}
