//! Full trust cache lifecycle: boot backfill, live events, and shutdown.

// std
use std::sync::Arc;
// crates.io
use chrono::{DateTime, TimeDelta, Utc};
use token_trust_cache::{
	Authentication, Credentials, Error, RejectReason, Result, TokenEvent, TokenKind, TrustCache,
	sync::queue::MemoryQueue,
};
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{method, path},
};
// self
use crate::common;

async fn authority(status: u16, body: String) -> MockServer {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/v1/tokens"))
		.respond_with(
			ResponseTemplate::new(status)
				.set_body_string(body)
				.insert_header("content-type", "application/x-ndjson"),
		)
		.mount(&server)
		.await;

	server
}

#[tokio::test]
async fn boots_serves_and_follows_revocations() -> Result<()> {
	common::init_tracing();

	let expires_at = common::now() + TimeDelta::minutes(15);
	let server = authority(200, common::ndjson(&[vec![common::pair("R1", "A1", expires_at)]])).await;
	let dir = tempfile::tempdir()?;
	let queue = MemoryQueue::new();
	let cache = TrustCache::builder(common::config(&server.uri(), &dir.path().join("trust.db"))?)
		.events(Arc::new(queue.clone()))
		.verifier(common::verifier())
		.build()?;

	assert!(!cache.status().ready);

	let report = cache.start().await?;
	let status = cache.status();

	assert!(status.ready);
	assert!(status.consumer_running);
	assert_eq!(report.applied, 2);
	assert_eq!(status.records, Some(2));
	assert_eq!(status.cursor, Some(report.watermark));
	assert!(matches!(cache.start().await, Err(Error::Validation { field: "start", .. })));

	let authenticator = cache.authenticator();
	let credentials = Credentials {
		access_token: Some(common::sign_access("A1", expires_at)),
		refresh_token: None,
	};

	assert!(authenticator.authenticate(&credentials).await.is_authenticated());

	queue.publish_json(&TokenEvent::revoked("A1", TokenKind::AccessToken, common::now()))?;
	common::eventually(|| queue.acknowledged() == 1).await;

	assert!(matches!(
		authenticator.authenticate(&credentials).await,
		Authentication::Rejected(RejectReason::Revoked)
	));
	assert_eq!(cache.status().consumer.applied, 1);

	cache.shutdown().await;

	assert!(!cache.status().consumer_running);

	Ok(())
}

#[tokio::test]
async fn failed_backfill_keeps_the_cache_unready() -> Result<()> {
	common::init_tracing();

	let server = authority(500, String::new()).await;
	let dir = tempfile::tempdir()?;
	let cache = TrustCache::builder(common::config(&server.uri(), &dir.path().join("trust.db"))?)
		.events(Arc::new(MemoryQueue::new()))
		.verifier(common::verifier())
		.build()?;

	assert!(matches!(cache.start().await, Err(Error::HttpStatus { .. })));

	let status = cache.status();

	assert!(!status.ready);
	assert!(!status.consumer_running);
	assert_eq!(status.cursor, Some(DateTime::<Utc>::UNIX_EPOCH));
	assert_eq!(status.records, Some(0));

	Ok(())
}

#[tokio::test]
async fn builder_requires_event_source_and_verifier() -> Result<()> {
	let dir = tempfile::tempdir()?;
	let config = common::config("http://authority.internal", &dir.path().join("trust.db"))?;

	assert!(matches!(
		TrustCache::builder(config.clone()).verifier(common::verifier()).build(),
		Err(Error::Validation { field: "events", .. })
	));
	assert!(matches!(
		TrustCache::builder(config.clone()).events(Arc::new(MemoryQueue::new())).build(),
		Err(Error::Validation { field: "verifier", .. })
	));

	let strict = config.with_require_https(true);

	assert!(matches!(
		TrustCache::builder(strict)
			.events(Arc::new(MemoryQueue::new()))
			.verifier(common::verifier())
			.build(),
		Err(Error::Security(_))
	));

	Ok(())
}
