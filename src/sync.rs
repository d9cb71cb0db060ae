//! Writers that keep the trust store consistent with the authority.
//!
//! [`BackfillSynchronizer`] performs the one-time historical catch-up at boot and
//! [`EventConsumer`] applies live lifecycle events from a durable queue afterwards.

pub mod backfill;
pub mod consumer;
pub mod event;
pub mod queue;
#[cfg(feature = "redis")] pub mod redis;

pub use backfill::{BackfillReport, BackfillSynchronizer};
pub use consumer::{ConsumerHandle, EventConsumer};
pub use event::{EventType, TokenEvent};
pub use queue::{Acknowledge, Delivery, EventSource, EventStream};
