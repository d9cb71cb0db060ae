//! Contracts and wire types for the upstream identity authority.
//!
//! The authority is reached through two calls only: a streaming "list tokens issued after T"
//! used by backfill, and a credential refresh used on the request path.

pub mod client;
pub mod retry;

pub use client::HttpAuthority;

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// crates.io
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
// self
use crate::{
	_prelude::*,
	security,
	store::{IssuedToken, TokenKind},
};

/// Stream of issuance batches produced by a backfill request.
pub type BatchStream = BoxStream<'static, Result<TokenBatch>>;

/// Client side of the identity authority.
#[async_trait::async_trait]
pub trait AuthorityClient: Send + Sync + Debug {
	/// Open a stream of every token fact issued after `issued_after`.
	///
	/// The stream ends cleanly at end-of-data; any item error aborts the backfill.
	async fn list_tokens_issued_after(&self, issued_after: DateTime<Utc>) -> Result<BatchStream>;

	/// Exchange a refresh credential for a new access/refresh pair.
	///
	/// Returns [`Error::RefreshRejected`] when the authority refuses the credential itself.
	async fn refresh(&self, refresh_token: &str, attempt_timeout: Duration) -> Result<TokenPair>;
}

/// One token as described by the authority.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenFact {
	/// Identifier assigned by the authority.
	pub id: String,
	/// Absolute expiry.
	pub expires_at: DateTime<Utc>,
	/// Parent refresh token, for access tokens sent without their pair.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parent_id: Option<String>,
}

/// Refresh token fact paired with the access token minted from it.
///
/// Either side may be missing: an access token whose refresh token is already known is sent
/// alone with its `parent_id`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedPair {
	/// Refresh token side of the pair.
	#[serde(default)]
	pub refresh_token: Option<TokenFact>,
	/// Access token side of the pair.
	#[serde(default)]
	pub access_token: Option<TokenFact>,
}
impl IssuedPair {
	/// Store facts in parent-then-child order.
	pub fn into_issued(self) -> Vec<IssuedToken> {
		let mut issued = Vec::with_capacity(2);
		let parent_id = self.refresh_token.as_ref().map(|refresh| refresh.id.clone());

		if let Some(refresh) = self.refresh_token {
			issued.push(IssuedToken {
				id: refresh.id,
				kind: TokenKind::RefreshToken,
				parent_id: None,
				expires_at: refresh.expires_at,
			});
		}
		if let Some(access) = self.access_token {
			issued.push(IssuedToken {
				id: access.id,
				kind: TokenKind::AccessToken,
				parent_id: parent_id.or(access.parent_id),
				expires_at: access.expires_at,
			});
		}

		issued
	}
}

/// One streamed backfill batch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBatch {
	/// Issued pairs carried by this batch.
	#[serde(default)]
	pub pairs: Vec<IssuedPair>,
}

/// Freshly minted credentials returned by a refresh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
	/// New access token (compact JWS).
	pub access_token: String,
	/// New refresh token (compact JWS).
	pub refresh_token: String,
}
impl Debug for TokenPair {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("TokenPair")
			.field("access_token", &security::credential_fingerprint(&self.access_token))
			.field("refresh_token", &security::credential_fingerprint(&self.refresh_token))
			.finish()
	}
}
