//! Backfill against an HTTP authority.

// std
use std::sync::Arc;
// crates.io
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use token_trust_cache::{
	BackfillSynchronizer, Error, HttpAuthority, Result, SqliteStore, TokenKind, TokenStore,
};
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{method, path, query_param},
};
// self
use crate::common;

fn synchronizer(server: &MockServer, store: Arc<SqliteStore>) -> Result<BackfillSynchronizer> {
	let dir = tempfile::tempdir()?;
	let config = common::config(&server.uri(), &dir.path().join("unused.db"))?;
	let authority = HttpAuthority::new(&config)?;

	Ok(BackfillSynchronizer::new(store, Arc::new(authority), common::fast_retry()))
}

fn ndjson_response(body: String) -> ResponseTemplate {
	ResponseTemplate::new(200)
		.set_body_string(body)
		.insert_header("content-type", "application/x-ndjson")
}

#[tokio::test]
async fn stores_every_fact_and_advances_cursor_to_watermark() -> Result<()> {
	common::init_tracing();

	let server = MockServer::start().await;
	let expires_at = common::now() + TimeDelta::hours(1);
	let body = common::ndjson(&[
		vec![common::pair("r1", "a1", expires_at), common::pair("r2", "a2", expires_at)],
		vec![common::pair("r3", "a3", expires_at)],
	]);

	Mock::given(method("GET"))
		.and(path("/v1/tokens"))
		.and(query_param("issued_after", "1970-01-01T00:00:00.000Z"))
		.respond_with(ndjson_response(body))
		.expect(1)
		.mount(&server)
		.await;

	let store = Arc::new(SqliteStore::in_memory()?);
	let before = common::now();
	let report = synchronizer(&server, store.clone())?.run().await?;
	let after = common::now();

	assert_eq!(report.batches, 2);
	assert_eq!(report.applied, 6);
	assert_eq!(store.record_count()?, 6);
	assert_eq!(store.cursor()?, report.watermark);
	assert!(before <= report.watermark && report.watermark <= after);

	let access = store.lookup("a3", TokenKind::AccessToken)?.expect("access record");

	assert_eq!(access.parent_id.as_deref(), Some("r3"));
	assert_eq!(access.expires_at, Some(expires_at));

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn second_run_resumes_from_previous_watermark() -> Result<()> {
	common::init_tracing();

	let server = MockServer::start().await;
	let store = Arc::new(SqliteStore::in_memory()?);
	let watermark: DateTime<Utc> = common::now() - TimeDelta::minutes(30);

	store.set_cursor(watermark)?;

	let expires_at = common::now() + TimeDelta::hours(1);
	let body = common::ndjson(&[vec![common::pair("r9", "a9", expires_at)]]);

	Mock::given(method("GET"))
		.and(path("/v1/tokens"))
		.and(query_param("issued_after", watermark.to_rfc3339_opts(SecondsFormat::Millis, true)))
		.respond_with(ndjson_response(body))
		.expect(2)
		.mount(&server)
		.await;

	let first = synchronizer(&server, store.clone())?.run().await?;

	assert_eq!(first.started_from, watermark);
	assert_eq!(first.applied, 2);

	// Replaying the same facts is harmless.
	store.set_cursor(watermark)?;

	let replay = synchronizer(&server, store.clone())?.run().await?;

	assert_eq!(replay.applied, 0);
	assert_eq!(replay.duplicates, 2);
	assert_eq!(store.record_count()?, 2);

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn upstream_failure_is_fatal_and_keeps_cursor() -> Result<()> {
	common::init_tracing();

	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/v1/tokens"))
		.respond_with(ResponseTemplate::new(503))
		.mount(&server)
		.await;

	let store = Arc::new(SqliteStore::in_memory()?);
	let result = synchronizer(&server, store.clone())?.run().await;

	assert!(matches!(result, Err(Error::HttpStatus { .. })));
	assert_eq!(store.cursor()?, DateTime::<Utc>::default());

	Ok(())
}

#[tokio::test]
async fn malformed_batch_aborts_without_advancing() -> Result<()> {
	common::init_tracing();

	let server = MockServer::start().await;
	let expires_at = common::now() + TimeDelta::hours(1);
	let mut body = common::ndjson(&[vec![common::pair("r1", "a1", expires_at)]]);

	body.push_str("{\"pairs\": [\n");

	Mock::given(method("GET"))
		.and(path("/v1/tokens"))
		.respond_with(ndjson_response(body))
		.mount(&server)
		.await;

	let store = Arc::new(SqliteStore::in_memory()?);
	let result = synchronizer(&server, store.clone())?.run().await;

	assert!(matches!(result, Err(Error::Backfill(_))));
	assert_eq!(store.cursor()?, DateTime::<Utc>::default());
	// Facts before the failure are kept; the next run replays them idempotently.
	assert_eq!(store.record_count()?, 2);

	Ok(())
}
