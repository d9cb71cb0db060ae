//! Redis Streams transport for token lifecycle events.
//!
//! Events are read through a consumer group. Every new session first drains the entries already
//! delivered to this consumer but never acknowledged, walking its pending list from `0` past the
//! last id read, then switches to new entries (`>`).

// std
use std::collections::VecDeque;
// crates.io
use redis::{
	AsyncCommands, Client,
	aio::MultiplexedConnection,
	streams::{StreamId, StreamReadOptions, StreamReadReply},
};
use serde::{Deserialize, Serialize};
// self
use crate::{
	_prelude::*,
	sync::queue::{Acknowledge, Delivery, EventSource, EventStream},
};

const PAYLOAD_FIELD: &str = "payload";

/// Connection and naming settings for the Redis Streams transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedisQueueConfig {
	/// Redis connection URL.
	pub url: String,
	/// Stream key carrying token events.
	pub stream: String,
	/// Consumer group shared by all trust cache instances.
	pub group: String,
	/// Consumer name; must be stable across restarts to recover pending entries.
	pub consumer: String,
	/// Stream receiving poison payloads, if any.
	#[serde(default)]
	pub dead_letter_stream: Option<String>,
	/// Maximum entries fetched per read.
	#[serde(default = "default_batch_size")]
	pub batch_size: usize,
	/// How long one read blocks waiting for new entries.
	#[serde(default = "default_block")]
	pub block: Duration,
}
impl RedisQueueConfig {
	/// Settings with default batching for the given stream and group.
	pub fn new(
		url: impl Into<String>,
		stream: impl Into<String>,
		group: impl Into<String>,
		consumer: impl Into<String>,
	) -> Self {
		Self {
			url: url.into(),
			stream: stream.into(),
			group: group.into(),
			consumer: consumer.into(),
			dead_letter_stream: None,
			batch_size: default_batch_size(),
			block: default_block(),
		}
	}

	/// Route poison payloads to `stream`.
	pub fn with_dead_letter_stream(mut self, stream: impl Into<String>) -> Self {
		self.dead_letter_stream = Some(stream.into());

		self
	}
}

/// [`EventSource`] backed by a Redis stream consumer group.
#[derive(Clone, Debug)]
pub struct RedisStreamSource {
	client: Client,
	config: Arc<RedisQueueConfig>,
}
impl RedisStreamSource {
	/// Create a source; no connection is opened until [`EventSource::connect`].
	pub fn new(config: RedisQueueConfig) -> Result<Self> {
		if config.batch_size == 0 {
			return Err(Error::Validation {
				field: "redis.batch_size",
				reason: "Must be greater than zero.".into(),
			});
		}

		let client = Client::open(config.url.as_str())?;

		Ok(Self { client, config: Arc::new(config) })
	}
}
#[async_trait::async_trait]
impl EventSource for RedisStreamSource {
	#[tracing::instrument(skip(self), fields(stream = %self.config.stream, group = %self.config.group))]
	async fn connect(&self) -> Result<Box<dyn EventStream>> {
		let mut conn = self.client.get_multiplexed_async_connection().await?;
		let created: redis::RedisResult<()> =
			conn.xgroup_create_mkstream(&self.config.stream, &self.config.group, "0").await;

		match created {
			Ok(()) => tracing::info!("consumer group created"),
			Err(err) if err.code() == Some("BUSYGROUP") => {},
			Err(err) => return Err(err.into()),
		}

		Ok(Box::new(RedisStream {
			conn,
			config: self.config.clone(),
			position: ReadPosition::default(),
			buffered: VecDeque::new(),
		}))
	}
}

/// Where the next `XREADGROUP` of a session starts.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ReadPosition {
	/// Walking this consumer's pending entries after the given id.
	Pending(String),
	/// Reading entries never delivered to the group.
	New,
}
impl ReadPosition {
	fn start_id(&self) -> &str {
		match self {
			Self::Pending(after) => after,
			Self::New => ">",
		}
	}

	fn is_pending(&self) -> bool {
		matches!(self, Self::Pending(_))
	}

	/// Move past a read whose last entry id was `last_id`; an empty read ends the pending walk.
	fn advance(&mut self, last_id: Option<&str>) {
		if let Self::Pending(after) = self {
			match last_id {
				Some(last_id) => *after = last_id.to_owned(),
				None => *self = Self::New,
			}
		}
	}
}
impl Default for ReadPosition {
	fn default() -> Self {
		Self::Pending("0".into())
	}
}

struct RedisStream {
	conn: MultiplexedConnection,
	config: Arc<RedisQueueConfig>,
	position: ReadPosition,
	buffered: VecDeque<Delivery>,
}
impl RedisStream {
	fn delivery(&self, entry: StreamId) -> Delivery {
		let payload = entry.get::<Vec<u8>>(PAYLOAD_FIELD).unwrap_or_default();
		let acknowledger = RedisAck {
			conn: self.conn.clone(),
			config: self.config.clone(),
			id: entry.id.clone(),
			payload: payload.clone(),
		};

		Delivery::new(entry.id, payload, Box::new(acknowledger))
	}
}
#[async_trait::async_trait]
impl EventStream for RedisStream {
	async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
		loop {
			if let Some(delivery) = self.buffered.pop_front() {
				return Ok(Some(delivery));
			}

			let mut options = StreamReadOptions::default()
				.group(&self.config.group, &self.config.consumer)
				.count(self.config.batch_size);

			if !self.position.is_pending() {
				options = options.block(self.config.block.as_millis() as usize);
			}

			let reply: Option<StreamReadReply> = self
				.conn
				.xread_options(&[&self.config.stream], &[self.position.start_id()], &options)
				.await?;
			let entries: Vec<StreamId> =
				reply.into_iter().flat_map(|reply| reply.keys).flat_map(|key| key.ids).collect();
			let was_pending = self.position.is_pending();

			self.position.advance(entries.last().map(|entry| entry.id.as_str()));

			if was_pending && !self.position.is_pending() {
				tracing::debug!("pending entries drained");
			}
			if entries.is_empty() {
				continue;
			}

			for entry in entries {
				let delivery = self.delivery(entry);

				self.buffered.push_back(delivery);
			}
		}
	}
}

struct RedisAck {
	conn: MultiplexedConnection,
	config: Arc<RedisQueueConfig>,
	id: String,
	payload: Vec<u8>,
}
impl std::fmt::Debug for RedisAck {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RedisAck").field("id", &self.id).finish()
	}
}
#[async_trait::async_trait]
impl Acknowledge for RedisAck {
	async fn ack(self: Box<Self>) -> Result<()> {
		let mut conn = self.conn.clone();
		let _: i64 = conn.xack(&self.config.stream, &self.config.group, &[&self.id]).await?;

		Ok(())
	}

	async fn reject(self: Box<Self>, reason: String) -> Result<()> {
		if let Some(dead_letter_stream) = &self.config.dead_letter_stream {
			let mut conn = self.conn.clone();
			let fields: [(&str, &[u8]); 3] = [
				(PAYLOAD_FIELD, self.payload.as_slice()),
				("reason", reason.as_bytes()),
				("source_id", self.id.as_bytes()),
			];
			let _: String = conn.xadd(dead_letter_stream, "*", &fields).await?;
		}

		self.ack().await
	}
}

fn default_batch_size() -> usize {
	64
}

fn default_block() -> Duration {
	Duration::from_millis(250)
}
