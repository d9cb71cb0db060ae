//! Durable queue abstraction consumed by the event consumer.
//!
//! Transports deliver payloads at least once. A delivery stays pending until it is acknowledged;
//! pending deliveries are redelivered after a reconnect.

// std
use std::{
	collections::{BTreeMap, VecDeque},
	fmt::Debug,
	sync::{Mutex, MutexGuard},
};
// crates.io
use tokio::sync::Notify;
// self
use crate::_prelude::*;

/// Connection factory for a durable queue.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync + Debug {
	/// Open a new consuming session, resuming from the queue's own ack state.
	async fn connect(&self) -> Result<Box<dyn EventStream>>;
}

/// One consuming session.
#[async_trait::async_trait]
pub trait EventStream: Send {
	/// Wait for the next delivery.
	///
	/// `Ok(None)` means the session ended; an error means the transport failed. Either way the
	/// consumer reconnects.
	async fn next_delivery(&mut self) -> Result<Option<Delivery>>;
}

/// Settlement handle for one delivery.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Debug {
	/// Confirm the delivery; it will not be redelivered.
	async fn ack(self: Box<Self>) -> Result<()>;

	/// Dead-letter the delivery (where supported) and confirm it.
	async fn reject(self: Box<Self>, reason: String) -> Result<()>;
}

/// Payload received from the queue together with its settlement handle.
#[derive(Debug)]
pub struct Delivery {
	/// Transport-assigned delivery identifier.
	pub id: String,
	/// Raw event payload.
	pub payload: Vec<u8>,
	acknowledger: Box<dyn Acknowledge>,
}
impl Delivery {
	/// Bundle a payload with its settlement handle.
	pub fn new(
		id: impl Into<String>,
		payload: impl Into<Vec<u8>>,
		acknowledger: Box<dyn Acknowledge>,
	) -> Self {
		Self { id: id.into(), payload: payload.into(), acknowledger }
	}

	/// Confirm the delivery.
	pub async fn ack(self) -> Result<()> {
		self.acknowledger.ack().await
	}

	/// Dead-letter and confirm the delivery.
	pub async fn reject(self, reason: impl Into<String>) -> Result<()> {
		self.acknowledger.reject(reason.into()).await
	}
}

/// In-process durable queue.
///
/// Unacknowledged deliveries are requeued on every [`EventSource::connect`], matching the
/// redelivery behaviour of broker-backed transports. Useful for embedding and tests.
#[derive(Clone, Debug, Default)]
pub struct MemoryQueue {
	shared: Arc<MemoryShared>,
}
#[derive(Debug, Default)]
struct MemoryShared {
	state: Mutex<MemoryState>,
	notify: Notify,
}
#[derive(Debug, Default)]
struct MemoryState {
	next_id: u64,
	generation: u64,
	ready: VecDeque<(u64, Vec<u8>)>,
	pending: BTreeMap<u64, Vec<u8>>,
	dead_letters: Vec<(Vec<u8>, String)>,
	acknowledged: u64,
	refused_connects: u32,
}
impl MemoryQueue {
	/// Create an empty queue.
	pub fn new() -> Self {
		Self::default()
	}

	/// Enqueue a raw payload.
	pub fn publish(&self, payload: impl Into<Vec<u8>>) {
		if let Ok(mut state) = self.lock() {
			let id = state.next_id;

			state.next_id += 1;
			state.ready.push_back((id, payload.into()));
		}

		self.shared.notify.notify_waiters();
	}

	/// Serialize and enqueue an event.
	pub fn publish_json<T>(&self, event: &T) -> Result<()>
	where
		T: serde::Serialize,
	{
		self.publish(serde_json::to_vec(event)?);

		Ok(())
	}

	/// Break every open session; their next read fails with a transport error.
	pub fn sever(&self) {
		if let Ok(mut state) = self.lock() {
			state.generation += 1;
		}

		self.shared.notify.notify_waiters();
	}

	/// Refuse the next `count` connection attempts.
	pub fn refuse_connects(&self, count: u32) {
		if let Ok(mut state) = self.lock() {
			state.refused_connects = count;
		}
	}

	/// Deliveries waiting to be handed out.
	pub fn ready_len(&self) -> usize {
		self.lock().map(|state| state.ready.len()).unwrap_or_default()
	}

	/// Deliveries handed out but not yet settled.
	pub fn pending_len(&self) -> usize {
		self.lock().map(|state| state.pending.len()).unwrap_or_default()
	}

	/// Number of settled deliveries, including dead-lettered ones.
	pub fn acknowledged(&self) -> u64 {
		self.lock().map(|state| state.acknowledged).unwrap_or_default()
	}

	/// Payloads and reasons of dead-lettered deliveries.
	pub fn dead_letters(&self) -> Vec<(Vec<u8>, String)> {
		self.lock().map(|state| state.dead_letters.clone()).unwrap_or_default()
	}

	fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
		lock_state(&self.shared)
	}
}
#[async_trait::async_trait]
impl EventSource for MemoryQueue {
	async fn connect(&self) -> Result<Box<dyn EventStream>> {
		let generation = {
			let mut state = self.lock()?;

			if state.refused_connects > 0 {
				state.refused_connects -= 1;

				return Err(Error::Transport("connection refused".into()));
			}

			let pending = std::mem::take(&mut state.pending);

			for (id, payload) in pending.into_iter().rev() {
				state.ready.push_front((id, payload));
			}

			state.generation
		};

		Ok(Box::new(MemoryStream { shared: self.shared.clone(), generation }))
	}
}

struct MemoryStream {
	shared: Arc<MemoryShared>,
	generation: u64,
}
#[async_trait::async_trait]
impl EventStream for MemoryStream {
	async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
		loop {
			let notified = self.shared.notify.notified();

			{
				let mut state = lock_state(&self.shared)?;

				if state.generation != self.generation {
					return Err(Error::Transport("connection severed".into()));
				}
				if let Some((id, payload)) = state.ready.pop_front() {
					state.pending.insert(id, payload.clone());

					let acknowledger = MemoryAck { shared: self.shared.clone(), id };

					return Ok(Some(Delivery::new(id.to_string(), payload, Box::new(acknowledger))));
				}
			}

			notified.await;
		}
	}
}

#[derive(Debug)]
struct MemoryAck {
	shared: Arc<MemoryShared>,
	id: u64,
}
#[async_trait::async_trait]
impl Acknowledge for MemoryAck {
	async fn ack(self: Box<Self>) -> Result<()> {
		let mut state = lock_state(&self.shared)?;

		if state.pending.remove(&self.id).is_some() {
			state.acknowledged += 1;
		}

		Ok(())
	}

	async fn reject(self: Box<Self>, reason: String) -> Result<()> {
		let mut state = lock_state(&self.shared)?;

		if let Some(payload) = state.pending.remove(&self.id) {
			state.dead_letters.push((payload, reason));
			state.acknowledged += 1;
		}

		Ok(())
	}
}

fn lock_state(shared: &MemoryShared) -> Result<MutexGuard<'_, MemoryState>> {
	shared.state.lock().map_err(|_| Error::Transport("memory queue lock poisoned".into()))
}
