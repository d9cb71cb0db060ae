//! Request-path authentication on top of the local trust cache.
//!
//! An [`Authenticator`] takes the credentials carried by a request, verifies the access token
//! signature, asks the [`Validator`] for a trust decision, and rotates credentials through the
//! [`RefreshCoordinator`] when the access token expired but its refresh token is still trusted.

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// crates.io
use http::{
	HeaderMap, HeaderValue,
	header::{AUTHORIZATION, COOKIE},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
// self
use crate::{
	_prelude::*,
	refresh::RefreshCoordinator,
	security,
	upstream::TokenPair,
	validator::{Decision, RejectReason, TokenClaims, Validator},
};

/// Cookie carrying the access token.
pub const ACCESS_TOKEN_COOKIE: &str = "access_token";
/// Cookie carrying the refresh token.
pub const REFRESH_TOKEN_COOKIE: &str = "refresh_token";

/// Claims carried by an access token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
	/// Token identifier; the trust store key.
	pub jti: String,
	/// Subject the token was issued to.
	pub sub: String,
	/// Expiry as seconds since the Unix epoch.
	pub exp: i64,
	/// Issue time as seconds since the Unix epoch.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub iat: Option<i64>,
}
impl TokenClaims for AccessClaims {
	fn token_id(&self) -> &str {
		&self.jti
	}
}

/// Ed25519 signature verifier for access tokens.
///
/// Expiry is not enforced here. The trust store decides it, so an expired access token can still
/// be recognised as refreshable.
#[derive(Clone)]
pub struct ClaimsVerifier {
	key: DecodingKey,
	validation: Validation,
}
impl ClaimsVerifier {
	/// Build a verifier from a PEM-encoded Ed25519 public key.
	///
	/// Literal `\n` sequences are accepted in place of newlines, as produced by single-line
	/// environment variables.
	pub fn from_ed_pem(pem: &str) -> Result<Self> {
		let pem = pem.trim().replace("\\n", "\n");
		let key = DecodingKey::from_ed_pem(pem.as_bytes())?;
		let mut validation = Validation::new(Algorithm::EdDSA);

		validation.validate_exp = false;
		validation.validate_aud = false;
		validation.leeway = 0;

		Ok(Self { key, validation })
	}

	/// Verify the signature of `token` and decode its claims.
	pub fn verify(&self, token: &str) -> Result<AccessClaims> {
		let claims = jsonwebtoken::decode::<AccessClaims>(token, &self.key, &self.validation)?.claims;

		if claims.jti.trim().is_empty() {
			return Err(Error::Validation { field: "jti", reason: "Must not be empty.".into() });
		}

		Ok(claims)
	}
}
impl Debug for ClaimsVerifier {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("ClaimsVerifier").field("algorithms", &self.validation.algorithms).finish()
	}
}

/// Credentials presented by a request.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
	/// Access token from the `Authorization` header or the access cookie.
	pub access_token: Option<String>,
	/// Refresh token from the refresh cookie.
	pub refresh_token: Option<String>,
}
impl Credentials {
	/// Extract credentials from request headers.
	///
	/// A `Bearer` authorization header takes precedence over the access cookie.
	pub fn from_headers(headers: &HeaderMap) -> Self {
		let mut credentials = Self::default();

		for header in headers.get_all(COOKIE) {
			let Ok(header) = header.to_str() else {
				continue;
			};

			for pair in header.split(';') {
				let Some((name, value)) = pair.trim().split_once('=') else {
					continue;
				};
				let value = value.trim().trim_matches('"');

				if value.is_empty() {
					continue;
				}

				match name.trim() {
					ACCESS_TOKEN_COOKIE => credentials.access_token = Some(value.to_owned()),
					REFRESH_TOKEN_COOKIE => credentials.refresh_token = Some(value.to_owned()),
					_ => {},
				}
			}
		}

		if let Some(bearer) = headers
			.get(AUTHORIZATION)
			.and_then(|value| value.to_str().ok())
			.and_then(bearer_token)
		{
			credentials.access_token = Some(bearer.to_owned());
		}

		credentials
	}
}
impl Debug for Credentials {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		let fingerprint =
			|token: &Option<String>| token.as_deref().map(security::credential_fingerprint);

		f.debug_struct("Credentials")
			.field("access_token", &fingerprint(&self.access_token))
			.field("refresh_token", &fingerprint(&self.refresh_token))
			.finish()
	}
}

/// Credentials minted during authentication, to be handed back to the client.
#[derive(Clone)]
pub struct RotatedCredentials {
	/// New token pair.
	pub tokens: TokenPair,
	/// `Set-Cookie` header values for both tokens.
	pub set_cookies: Vec<HeaderValue>,
}
impl Debug for RotatedCredentials {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("RotatedCredentials")
			.field("tokens", &self.tokens)
			.field("set_cookies", &self.set_cookies.len())
			.finish()
	}
}

/// Result of authenticating one request.
#[derive(Clone, Debug)]
pub enum Authentication {
	/// The request may proceed as `claims`.
	Authenticated {
		/// Claims of the trusted access token.
		claims: AccessClaims,
		/// Present when the access token was rotated; the response must carry the new cookies.
		rotated: Option<RotatedCredentials>,
	},
	/// The request must be refused.
	Rejected(RejectReason),
}
impl Authentication {
	/// Whether the request may proceed.
	pub fn is_authenticated(&self) -> bool {
		matches!(self, Self::Authenticated { .. })
	}
}

/// Request-path entry point combining verification, validation, and rotation.
#[derive(Clone, Debug)]
pub struct Authenticator {
	verifier: Arc<ClaimsVerifier>,
	validator: Validator,
	refresher: RefreshCoordinator,
	secure_cookies: bool,
}
impl Authenticator {
	/// Assemble an authenticator.
	pub fn new(
		verifier: Arc<ClaimsVerifier>,
		validator: Validator,
		refresher: RefreshCoordinator,
		secure_cookies: bool,
	) -> Self {
		Self { verifier, validator, refresher, secure_cookies }
	}

	/// Authenticate `credentials` against the current time.
	pub async fn authenticate(&self, credentials: &Credentials) -> Authentication {
		self.authenticate_at(credentials, Utc::now()).await
	}

	/// Authenticate `credentials` as of `now`.
	#[tracing::instrument(skip_all)]
	pub async fn authenticate_at(
		&self,
		credentials: &Credentials,
		now: DateTime<Utc>,
	) -> Authentication {
		let Some(access_token) = credentials.access_token.as_deref() else {
			return Authentication::Rejected(RejectReason::InvalidCredential);
		};
		let claims = match self.verifier.verify(access_token) {
			Ok(claims) => claims,
			Err(err) => {
				tracing::debug!(
					credential = %security::credential_fingerprint(access_token),
					error = %err,
					"access token failed verification"
				);

				return Authentication::Rejected(RejectReason::InvalidCredential);
			},
		};

		match self.validator.decide_detached(claims.clone(), now).await {
			Ok(Decision::Accept) => Authentication::Authenticated { claims, rotated: None },
			Ok(Decision::Reject(reason)) => Authentication::Rejected(reason),
			Ok(Decision::ExpiredRefreshable) => self.rotate(credentials).await,
			Err(err) => {
				tracing::warn!(error = %err, "trust store unavailable");

				Authentication::Rejected(RejectReason::Unavailable)
			},
		}
	}

	/// Exchange the refresh credential and authenticate as the freshly minted access token.
	///
	/// The new token is trusted on the authority's word and its signature; it reaches the store
	/// later through the event feed.
	async fn rotate(&self, credentials: &Credentials) -> Authentication {
		let Some(refresh_token) = credentials.refresh_token.as_deref() else {
			tracing::debug!("expired access token without refresh credential");

			return Authentication::Rejected(RejectReason::RefreshFailed);
		};
		let Ok(tokens) = self.refresher.refresh(refresh_token).await else {
			return Authentication::Rejected(RejectReason::RefreshFailed);
		};
		let claims = match self.verifier.verify(&tokens.access_token) {
			Ok(claims) => claims,
			Err(err) => {
				tracing::warn!(error = %err, "refreshed access token failed verification");

				return Authentication::Rejected(RejectReason::RefreshFailed);
			},
		};
		let set_cookies = match credential_cookies(&tokens, self.secure_cookies) {
			Ok(set_cookies) => set_cookies,
			Err(err) => {
				tracing::warn!(error = %err, "refreshed credentials are not valid cookie values");

				return Authentication::Rejected(RejectReason::RefreshFailed);
			},
		};

		Authentication::Authenticated {
			claims,
			rotated: Some(RotatedCredentials { tokens, set_cookies }),
		}
	}
}

/// Build `Set-Cookie` header values for a rotated token pair.
pub fn credential_cookies(tokens: &TokenPair, secure: bool) -> Result<Vec<HeaderValue>> {
	[(ACCESS_TOKEN_COOKIE, &tokens.access_token), (REFRESH_TOKEN_COOKIE, &tokens.refresh_token)]
		.into_iter()
		.map(|(name, value)| {
			let secure = if secure { "; Secure" } else { "" };
			let cookie = format!("{name}={value}; Path=/; HttpOnly{secure}");

			HeaderValue::from_str(&cookie).map_err(|err| Error::Http(err.into()))
		})
		.collect()
}

fn bearer_token(value: &str) -> Option<&str> {
	let (scheme, token) = value.trim().split_once(' ')?;
	let token = token.trim();

	(scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
