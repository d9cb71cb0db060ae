//! Long-running applier of token lifecycle events.
//!
//! One intake task reads deliveries from the queue, decodes them, and routes each event to a
//! worker chosen by hashing its token id, so all events for one id are applied serially. Worker
//! channels are bounded; when a worker falls behind, intake waits instead of dropping.

// std
use std::hash::{DefaultHasher, Hash, Hasher};
// crates.io
use tokio::{
	sync::{mpsc, watch},
	task::JoinHandle,
	time,
};
// self
use crate::{
	_prelude::*,
	config::{ConsumerConfig, RetryPolicy},
	metrics::{ConsumerMetrics, ConsumerMetricsSnapshot, EventOutcome},
	store::{self, ApplyOutcome, TokenStore},
	sync::{
		event::TokenEvent,
		queue::{Delivery, EventSource, EventStream},
	},
};

type Job = (TokenEvent, Delivery);

/// Why a queue session ended.
enum SessionEnd {
	Shutdown,
	Disconnected,
}

/// Event consumer wiring a queue to the store.
#[derive(Debug)]
pub struct EventConsumer {
	source: Arc<dyn EventSource>,
	store: Arc<dyn TokenStore>,
	config: ConsumerConfig,
	metrics: Arc<ConsumerMetrics>,
}
impl EventConsumer {
	/// Create a consumer; nothing runs until [`EventConsumer::spawn`].
	pub fn new(
		source: Arc<dyn EventSource>,
		store: Arc<dyn TokenStore>,
		config: ConsumerConfig,
	) -> Self {
		Self { source, store, config, metrics: ConsumerMetrics::new() }
	}

	/// Shared counters updated by the consumer.
	pub fn metrics(&self) -> Arc<ConsumerMetrics> {
		self.metrics.clone()
	}

	/// Run the consumer on the tokio runtime until `shutdown` flips to `true`.
	pub fn spawn(self, shutdown: watch::Receiver<bool>) -> ConsumerHandle {
		let metrics = self.metrics.clone();
		let task = tokio::spawn(self.run(shutdown));

		ConsumerHandle { task, metrics }
	}

	#[tracing::instrument(skip_all, fields(workers = self.config.workers))]
	async fn run(self, mut shutdown: watch::Receiver<bool>) {
		let workers = self.config.workers.max(1);
		let mut senders = Vec::with_capacity(workers);
		let mut tasks = Vec::with_capacity(workers);

		for index in 0..workers {
			let (sender, receiver) = mpsc::channel(self.config.buffer_size.max(1));
			let worker = Worker {
				index,
				store: self.store.clone(),
				backoff: self.config.apply_backoff.clone(),
				metrics: self.metrics.clone(),
			};

			senders.push(sender);
			tasks.push(tokio::spawn(worker.run(receiver, shutdown.clone())));
		}

		let mut attempt = 0u32;

		loop {
			let connected = tokio::select! {
				biased;
				_ = shutdown_requested(&mut shutdown) => break,
				connected = self.source.connect() => connected,
			};

			match connected {
				Ok(stream) => {
					tracing::info!("queue connected");

					self.metrics.record_connection(true);
					attempt = 0;

					let ended = self.intake(stream, &senders, &mut shutdown).await;

					self.metrics.record_connection(false);

					match ended {
						Ok(SessionEnd::Shutdown) => break,
						Ok(SessionEnd::Disconnected) => tracing::info!("queue session ended"),
						Err(err) => tracing::warn!(error = %err, "queue session failed"),
					}
				},
				Err(err) => tracing::warn!(error = %err, attempt, "queue connect failed"),
			}

			let delay = self.config.reconnect.compute_backoff(attempt);

			attempt = attempt.saturating_add(1);
			self.metrics.record_reconnect();

			tracing::debug!(?delay, attempt, "reconnecting to queue");

			tokio::select! {
				biased;
				_ = shutdown_requested(&mut shutdown) => break,
				_ = time::sleep(delay) => {},
			}
		}

		drop(senders);

		for task in tasks {
			if let Err(err) = task.await {
				tracing::error!(error = %err, "consumer worker panicked");
			}
		}

		tracing::info!("event consumer stopped");
	}

	async fn intake(
		&self,
		mut stream: Box<dyn EventStream>,
		senders: &[mpsc::Sender<Job>],
		shutdown: &mut watch::Receiver<bool>,
	) -> Result<SessionEnd> {
		loop {
			let next = tokio::select! {
				biased;
				_ = shutdown_requested(shutdown) => return Ok(SessionEnd::Shutdown),
				next = stream.next_delivery() => next?,
			};
			let Some(delivery) = next else {
				return Ok(SessionEnd::Disconnected);
			};
			let event = match TokenEvent::decode(&delivery.payload) {
				Ok(event) => event,
				Err(err) => {
					dead_letter(&self.metrics, delivery, &err).await;

					continue;
				},
			};
			let sender = &senders[worker_index(&event.token_id, senders.len())];

			tokio::select! {
				biased;
				_ = shutdown_requested(shutdown) => return Ok(SessionEnd::Shutdown),
				sent = sender.send((event, delivery)) => {
					if sent.is_err() {
						return Err(Error::Shutdown);
					}
				},
			}
		}
	}
}

/// Handle to a spawned [`EventConsumer`].
#[derive(Debug)]
pub struct ConsumerHandle {
	task: JoinHandle<()>,
	metrics: Arc<ConsumerMetrics>,
}
impl ConsumerHandle {
	/// Current consumer counters.
	pub fn metrics(&self) -> ConsumerMetricsSnapshot {
		self.metrics.snapshot()
	}

	/// Whether the consumer task has exited.
	pub fn is_finished(&self) -> bool {
		self.task.is_finished()
	}

	/// Wait for the consumer to stop after shutdown was signalled.
	pub async fn join(self) -> Result<()> {
		self.task.await.map_err(|err| Error::Transport(format!("consumer task failed: {err}")))
	}
}

struct Worker {
	index: usize,
	store: Arc<dyn TokenStore>,
	backoff: RetryPolicy,
	metrics: Arc<ConsumerMetrics>,
}
impl Worker {
	async fn run(self, mut jobs: mpsc::Receiver<Job>, mut shutdown: watch::Receiver<bool>) {
		loop {
			let job = tokio::select! {
				biased;
				_ = shutdown_requested(&mut shutdown) => break,
				job = jobs.recv() => job,
			};
			let Some((event, delivery)) = job else {
				break;
			};

			self.settle(event, delivery, &mut shutdown).await;
		}

		tracing::debug!(worker = self.index, "consumer worker stopped");
	}

	/// Apply one event, retrying store failures until it lands or shutdown is requested.
	///
	/// The delivery is acknowledged only after a successful apply.
	async fn settle(
		&self,
		event: TokenEvent,
		delivery: Delivery,
		shutdown: &mut watch::Receiver<bool>,
	) {
		let mut attempt = 0u32;

		loop {
			let applied = {
				let target = self.store.clone();
				let event = event.clone();

				store::off_runtime(move || event.apply(target.as_ref())).await
			};

			match applied {
				Ok(outcome) => {
					let outcome = match outcome {
						ApplyOutcome::Applied => EventOutcome::Applied,
						ApplyOutcome::Duplicate => EventOutcome::Duplicate,
					};

					tracing::debug!(
						worker = self.index,
						delivery = %delivery.id,
						token = %event.token_id,
						kind = event.kind.as_str(),
						outcome = outcome.as_str(),
						"event applied"
					);

					self.metrics.record_event(outcome);

					if let Err(err) = delivery.ack().await {
						tracing::warn!(error = %err, "ack failed; event will be redelivered");
					}

					return;
				},
				Err(err) if err.is_transient() => {
					let delay = self.backoff.compute_backoff(attempt);

					attempt = attempt.saturating_add(1);
					self.metrics.record_event(EventOutcome::Retried);

					tracing::warn!(
						worker = self.index,
						token = %event.token_id,
						error = %err,
						attempt,
						?delay,
						"store write failed; retrying event"
					);

					tokio::select! {
						biased;
						_ = shutdown_requested(shutdown) => {
							tracing::warn!(
								token = %event.token_id,
								"shutdown before apply; event left unacknowledged"
							);

							return;
						},
						_ = time::sleep(delay) => {},
					}
				},
				Err(err) => {
					dead_letter(&self.metrics, delivery, &err).await;

					return;
				},
			}
		}
	}
}

async fn dead_letter(metrics: &ConsumerMetrics, delivery: Delivery, err: &Error) {
	tracing::warn!(delivery = %delivery.id, error = %err, "poison event dead-lettered");

	metrics.record_event(EventOutcome::Poison);

	if let Err(ack_err) = delivery.reject(err.to_string()).await {
		tracing::warn!(error = %ack_err, "dead-letter failed; event will be redelivered");
	}
}

/// Resolve once shutdown is requested or the signal's sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
	let _ = shutdown.wait_for(|stop| *stop).await;
}

fn worker_index(token_id: &str, workers: usize) -> usize {
	if workers == 0 {
		return 0;
	}

	let mut hasher = DefaultHasher::new();

	token_id.hash(&mut hasher);

	(hasher.finish() as usize) % workers
}
