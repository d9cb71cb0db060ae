//! Request authentication, including credential rotation through the authority.

// std
use std::{path::Path, sync::Arc};
// crates.io
use chrono::TimeDelta;
use http::{HeaderMap, HeaderValue, header::COOKIE};
use serde_json::json;
use token_trust_cache::{
	Authentication, Authenticator, Credentials, HttpAuthority, RefreshCoordinator, RejectReason,
	Result, SqliteStore, TokenKind, TokenStore, Validator, store::IssuedToken,
};
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{header, method, path},
};
// self
use crate::common;

struct Fixture {
	server: MockServer,
	store: Arc<SqliteStore>,
	authenticator: Authenticator,
}

async fn fixture() -> Result<Fixture> {
	common::init_tracing();

	let server = MockServer::start().await;
	let config = common::config(&server.uri(), Path::new("unused.db"))?;
	let store = Arc::new(SqliteStore::in_memory()?);
	let authority = Arc::new(HttpAuthority::new(&config)?);
	let authenticator = Authenticator::new(
		Arc::new(common::verifier()),
		Validator::new(store.clone()),
		RefreshCoordinator::new(authority, common::fast_retry()),
		config.secure_cookies,
	);

	Ok(Fixture { server, store, authenticator })
}

fn credentials(access: &str, refresh: Option<&str>) -> Credentials {
	Credentials { access_token: Some(access.into()), refresh_token: refresh.map(str::to_owned) }
}

/// Pairs the header and claims of `token` with the signature of `donor`.
fn splice_signature(token: &str, donor: &str) -> String {
	let (signed, _) = token.rsplit_once('.').expect("token shape");
	let (_, signature) = donor.rsplit_once('.').expect("token shape");

	format!("{signed}.{signature}")
}

/// Stores R1 (live) and A1 (expired one minute ago) and returns the signed A1 credential.
fn expired_session(store: &SqliteStore) -> Result<String> {
	let now = common::now();
	let expired_at = now - TimeDelta::minutes(1);

	store.upsert_issued(&IssuedToken::refresh("R1", now + TimeDelta::days(1)))?;
	store.upsert_issued(&IssuedToken::access("A1", Some("R1".into()), expired_at))?;

	Ok(common::sign_access("A1", expired_at))
}

#[tokio::test]
async fn live_token_from_cookie_is_accepted() -> Result<()> {
	let fixture = fixture().await?;
	let expires_at = common::now() + TimeDelta::minutes(15);

	fixture.store.upsert_issued(&IssuedToken::access("A1", None, expires_at))?;

	let token = common::sign_access("A1", expires_at);
	let mut headers = HeaderMap::new();

	headers.insert(
		COOKIE,
		HeaderValue::from_str(&format!("theme=dark; access_token={token}")).expect("cookie header"),
	);

	let outcome = fixture.authenticator.authenticate(&Credentials::from_headers(&headers)).await;

	match outcome {
		Authentication::Authenticated { claims, rotated } => {
			assert_eq!(claims.jti, "A1");
			assert_eq!(claims.sub, "user-1");
			assert!(rotated.is_none());
		},
		other => panic!("expected authentication, got {other:?}"),
	}

	Ok(())
}

#[tokio::test]
async fn unknown_revoked_and_forged_tokens_are_rejected() -> Result<()> {
	let fixture = fixture().await?;
	let now = common::now();
	let expires_at = now + TimeDelta::minutes(15);

	fixture.store.upsert_issued(&IssuedToken::access("A2", None, expires_at))?;
	fixture.store.mark_revoked("A2", TokenKind::AccessToken, now)?;

	let unknown = common::sign_access("A-unknown", expires_at);
	let revoked = common::sign_access("A2", expires_at);
	let forged = splice_signature(&revoked, &common::sign_access("A-other", expires_at));

	let cases = [
		(credentials(&unknown, None), RejectReason::Unknown),
		(credentials(&revoked, None), RejectReason::Revoked),
		(credentials(&forged, None), RejectReason::InvalidCredential),
		(Credentials::default(), RejectReason::InvalidCredential),
	];

	for (credentials, expected) in cases {
		match fixture.authenticator.authenticate(&credentials).await {
			Authentication::Rejected(reason) => assert_eq!(reason, expected),
			other => panic!("expected {expected}, got {other:?}"),
		}
	}

	Ok(())
}

#[tokio::test]
async fn expired_token_is_rotated_with_live_refresh_token() -> Result<()> {
	let fixture = fixture().await?;
	let access = expired_session(&fixture.store)?;
	let rotated_access = common::sign_access("A2", common::now() + TimeDelta::minutes(15));

	Mock::given(method("POST"))
		.and(path("/v1/tokens/refresh"))
		.and(header("authorization", "Bearer refresh-credential"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"access_token": rotated_access,
			"refresh_token": "rotated-refresh",
		})))
		.expect(1)
		.mount(&fixture.server)
		.await;

	let outcome =
		fixture.authenticator.authenticate(&credentials(&access, Some("refresh-credential"))).await;

	match outcome {
		Authentication::Authenticated { claims, rotated: Some(rotated) } => {
			assert_eq!(claims.jti, "A2");
			assert_eq!(rotated.tokens.refresh_token, "rotated-refresh");
			assert_eq!(rotated.set_cookies.len(), 2);
			assert_eq!(
				rotated.set_cookies[1],
				"refresh_token=rotated-refresh; Path=/; HttpOnly"
			);
		},
		other => panic!("expected rotation, got {other:?}"),
	}

	// Rotation never writes the store; the new tokens arrive through the event feed.
	assert!(fixture.store.lookup("A2", TokenKind::AccessToken)?.is_none());

	fixture.server.verify().await;

	Ok(())
}

#[tokio::test]
async fn transient_refresh_failures_are_retried() -> Result<()> {
	let fixture = fixture().await?;
	let access = expired_session(&fixture.store)?;
	let rotated_access = common::sign_access("A2", common::now() + TimeDelta::minutes(15));

	Mock::given(method("POST"))
		.and(path("/v1/tokens/refresh"))
		.respond_with(ResponseTemplate::new(503))
		.up_to_n_times(1)
		.expect(1)
		.mount(&fixture.server)
		.await;
	Mock::given(method("POST"))
		.and(path("/v1/tokens/refresh"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"access_token": rotated_access,
			"refresh_token": "rotated-refresh",
		})))
		.expect(1)
		.mount(&fixture.server)
		.await;

	let outcome =
		fixture.authenticator.authenticate(&credentials(&access, Some("refresh-credential"))).await;

	assert!(outcome.is_authenticated(), "unexpected outcome {outcome:?}");

	fixture.server.verify().await;

	Ok(())
}

#[tokio::test]
async fn rejected_refresh_fails_without_retry() -> Result<()> {
	let fixture = fixture().await?;
	let access = expired_session(&fixture.store)?;

	Mock::given(method("POST"))
		.and(path("/v1/tokens/refresh"))
		.respond_with(ResponseTemplate::new(401))
		.expect(1)
		.mount(&fixture.server)
		.await;

	let outcome =
		fixture.authenticator.authenticate(&credentials(&access, Some("refresh-credential"))).await;

	assert!(matches!(outcome, Authentication::Rejected(RejectReason::RefreshFailed)));

	let missing_refresh = fixture.authenticator.authenticate(&credentials(&access, None)).await;

	assert!(matches!(missing_refresh, Authentication::Rejected(RejectReason::RefreshFailed)));

	fixture.server.verify().await;

	Ok(())
}

#[tokio::test]
async fn expired_token_with_revoked_parent_is_rejected() -> Result<()> {
	let fixture = fixture().await?;
	let access = expired_session(&fixture.store)?;

	fixture.store.mark_revoked("R1", TokenKind::RefreshToken, common::now())?;

	let outcome =
		fixture.authenticator.authenticate(&credentials(&access, Some("refresh-credential"))).await;

	assert!(matches!(outcome, Authentication::Rejected(RejectReason::Expired)));

	Ok(())
}
