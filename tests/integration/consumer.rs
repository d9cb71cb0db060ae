//! Event consumer scenarios against an on-disk store.

// std
use std::sync::Arc;
// crates.io
use chrono::TimeDelta;
use token_trust_cache::{
	ConsumerConfig, Decision, EventConsumer, Result, SqliteStore, TokenEvent, TokenKind,
	TokenStore, Validator, store::IssuedToken, sync::queue::MemoryQueue, validator::TokenClaims,
};
use tokio::sync::watch;
// self
use crate::common;

struct Jti(&'static str);
impl TokenClaims for Jti {
	fn token_id(&self) -> &str {
		self.0
	}
}

fn consumer_config() -> ConsumerConfig {
	ConsumerConfig {
		buffer_size: 4,
		workers: 2,
		reconnect: common::fast_retry(),
		apply_backoff: common::fast_retry(),
	}
}

#[tokio::test]
async fn out_of_order_issuance_converges() -> Result<()> {
	common::init_tracing();

	let now = common::now();
	let queue = MemoryQueue::new();
	let store = Arc::new(SqliteStore::in_memory()?);
	let access = IssuedToken::access("A1", Some("R1".into()), now + TimeDelta::minutes(15));
	let refresh = IssuedToken::refresh("R1", now + TimeDelta::days(7));

	queue.publish_json(&TokenEvent::issued(&access, now))?;
	queue.publish_json(&TokenEvent::issued(&refresh, now))?;

	let (stop, shutdown) = watch::channel(false);
	let handle =
		EventConsumer::new(Arc::new(queue.clone()), store.clone(), consumer_config()).spawn(shutdown);

	common::eventually(|| queue.acknowledged() == 2).await;

	let validator = Validator::new(store.clone());

	assert_eq!(validator.decide(&Jti("A1"), now + TimeDelta::minutes(1))?, Decision::Accept);
	assert_eq!(
		validator.decide(&Jti("A1"), now + TimeDelta::minutes(20))?,
		Decision::ExpiredRefreshable
	);

	stop.send(true).expect("signal");
	handle.join().await?;

	Ok(())
}

#[tokio::test]
async fn revocation_survives_redelivered_issuance() -> Result<()> {
	common::init_tracing();

	let now = common::now();
	let queue = MemoryQueue::new();
	let store = Arc::new(SqliteStore::in_memory()?);
	let refresh = IssuedToken::refresh("R1", now + TimeDelta::days(7));

	queue.publish_json(&TokenEvent::revoked("R1", TokenKind::RefreshToken, now))?;
	queue.publish_json(&TokenEvent::issued(&refresh, now - TimeDelta::minutes(5)))?;
	queue.publish_json(&TokenEvent::issued(&refresh, now - TimeDelta::minutes(5)))?;

	let (stop, shutdown) = watch::channel(false);
	let handle =
		EventConsumer::new(Arc::new(queue.clone()), store.clone(), consumer_config()).spawn(shutdown);

	common::eventually(|| queue.acknowledged() == 3).await;

	let record = store.lookup("R1", TokenKind::RefreshToken)?.expect("record");

	assert_eq!(record.revoked_at, Some(now));
	assert_eq!(record.expires_at, Some(refresh.expires_at));

	let metrics = handle.metrics();

	assert_eq!(metrics.applied, 2);
	assert_eq!(metrics.duplicates, 1);

	stop.send(true).expect("signal");
	handle.join().await?;

	Ok(())
}

#[tokio::test]
async fn applied_events_persist_across_restarts() -> Result<()> {
	common::init_tracing();

	let dir = tempfile::tempdir()?;
	let path = dir.path().join("trust.db");
	let now = common::now();
	let queue = MemoryQueue::new();

	{
		let store = Arc::new(SqliteStore::open(&path)?);
		let (stop, shutdown) = watch::channel(false);
		let handle = EventConsumer::new(Arc::new(queue.clone()), store, consumer_config())
			.spawn(shutdown);

		queue.publish_json(&TokenEvent::issued(
			&IssuedToken::refresh("R1", now + TimeDelta::days(1)),
			now,
		))?;
		queue.publish_json(&TokenEvent::revoked("A0", TokenKind::AccessToken, now))?;

		common::eventually(|| queue.acknowledged() == 2).await;

		stop.send(true).expect("signal");
		handle.join().await?;
	}

	let reopened = SqliteStore::open(&path)?;

	assert_eq!(reopened.record_count()?, 2);
	assert!(reopened.lookup("A0", TokenKind::AccessToken)?.expect("tombstone").is_tombstone());

	Ok(())
}

#[tokio::test]
async fn shutdown_leaves_unapplied_events_for_redelivery() -> Result<()> {
	common::init_tracing();

	let queue = MemoryQueue::new();
	let store = Arc::new(SqliteStore::in_memory()?);
	let (stop, shutdown) = watch::channel(false);
	let handle =
		EventConsumer::new(Arc::new(queue.clone()), store.clone(), consumer_config()).spawn(shutdown);

	stop.send(true).expect("signal");
	handle.join().await?;

	queue.publish_json(&TokenEvent::revoked("A1", TokenKind::AccessToken, common::now()))?;

	assert_eq!(queue.acknowledged(), 0);
	assert_eq!(queue.ready_len(), 1);
	assert_eq!(store.record_count()?, 0);

	Ok(())
}
