//! Local trust decisions for already-verified access credentials.
//!
//! The validator never performs network I/O: it reads the store and compares timestamps.

// std
use std::fmt::{Display, Formatter, Result as FmtResult};
// self
use crate::{
	_prelude::*,
	metrics,
	store::{self, TokenKind, TokenStore},
};

/// Why a credential was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
	/// The token id is not present in the store.
	Unknown,
	/// The token was revoked.
	Revoked,
	/// The token expired and cannot be refreshed.
	Expired,
	/// Rotating an expired token failed.
	RefreshFailed,
	/// The credential is missing or its signature or claims are invalid.
	InvalidCredential,
	/// The store could not be read.
	Unavailable,
}
impl RejectReason {
	/// Stable label for logs and metrics.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Unknown => "unknown",
			Self::Revoked => "revoked",
			Self::Expired => "expired",
			Self::RefreshFailed => "refresh_failed",
			Self::InvalidCredential => "invalid_credential",
			Self::Unavailable => "unavailable",
		}
	}
}
impl Display for RejectReason {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome of validating one access credential.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
	/// The credential is trusted.
	Accept,
	/// The credential is refused.
	Reject(RejectReason),
	/// The access credential expired but its refresh credential is still trusted.
	ExpiredRefreshable,
}
impl Decision {
	/// Stable label for logs and metrics.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Accept => "accept",
			Self::Reject(reason) => reason.as_str(),
			Self::ExpiredRefreshable => "expired_refreshable",
		}
	}
}

/// Claims the validator needs from a verified access credential.
pub trait TokenClaims {
	/// Token identifier (`jti`).
	fn token_id(&self) -> &str;
}

/// Store-backed validator shared by every request.
#[derive(Clone, Debug)]
pub struct Validator {
	store: Arc<dyn TokenStore>,
}
impl Validator {
	/// Create a validator reading `store`.
	pub fn new(store: Arc<dyn TokenStore>) -> Self {
		Self { store }
	}

	/// Decide whether the credential described by `claims` is trusted at `now`.
	///
	/// A store read failure is returned as an error and must be treated as a rejection.
	pub fn decide<C>(&self, claims: &C, now: DateTime<Utc>) -> Result<Decision>
	where
		C: TokenClaims + ?Sized,
	{
		let decision = self.evaluate(claims.token_id(), now)?;

		metrics::record_decision(decision.as_str());
		tracing::debug!(token = claims.token_id(), decision = decision.as_str(), "token validated");

		Ok(decision)
	}

	/// [`Validator::decide`] on the blocking thread pool, for callers running on the runtime.
	pub async fn decide_detached<C>(&self, claims: C, now: DateTime<Utc>) -> Result<Decision>
	where
		C: TokenClaims + Send + 'static,
	{
		let validator = self.clone();

		store::off_runtime(move || validator.decide(&claims, now)).await
	}

	fn evaluate(&self, token_id: &str, now: DateTime<Utc>) -> Result<Decision> {
		let Some(access) = self.store.lookup(token_id, TokenKind::AccessToken)? else {
			return Ok(Decision::Reject(RejectReason::Unknown));
		};

		if access.is_revoked() {
			return Ok(Decision::Reject(RejectReason::Revoked));
		}
		if !access.is_expired(now) {
			return Ok(Decision::Accept);
		}

		let Some(parent_id) = access.parent_id.as_deref() else {
			return Ok(Decision::Reject(RejectReason::Expired));
		};
		let parent = self.store.lookup(parent_id, TokenKind::RefreshToken)?;

		match parent {
			Some(parent) if parent.is_live(now) => Ok(Decision::ExpiredRefreshable),
			_ => Ok(Decision::Reject(RejectReason::Expired)),
		}
	}
}
