//! Token record model shared by the store, the synchronizers, and the validator.

// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// Token family a record belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
	/// Short-lived credential presented on every request.
	AccessToken,
	/// Long-lived credential used to mint new access tokens.
	RefreshToken,
}
impl TokenKind {
	/// Stable storage/wire name.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::AccessToken => "access_token",
			Self::RefreshToken => "refresh_token",
		}
	}

	/// Parse the storage/wire name.
	pub fn parse(value: &str) -> Option<Self> {
		match value {
			"access_token" => Some(Self::AccessToken),
			"refresh_token" => Some(Self::RefreshToken),
			_ => None,
		}
	}
}

/// Issuance fact to be applied to the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedToken {
	/// Identifier assigned by the authority.
	pub id: String,
	/// Token family.
	pub kind: TokenKind,
	/// Refresh token an access token was minted from.
	pub parent_id: Option<String>,
	/// Absolute expiry.
	pub expires_at: DateTime<Utc>,
}
impl IssuedToken {
	/// Issuance fact for a refresh token.
	pub fn refresh(id: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
		Self { id: id.into(), kind: TokenKind::RefreshToken, parent_id: None, expires_at }
	}

	/// Issuance fact for an access token minted from `parent_id`.
	pub fn access(
		id: impl Into<String>,
		parent_id: Option<String>,
		expires_at: DateTime<Utc>,
	) -> Self {
		Self { id: id.into(), kind: TokenKind::AccessToken, parent_id, expires_at }
	}
}

/// Locally persisted view of one token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
	/// Identifier assigned by the authority.
	pub id: String,
	/// Token family.
	pub kind: TokenKind,
	/// Refresh token an access token was minted from.
	pub parent_id: Option<String>,
	/// Absolute expiry; `None` only for a tombstone whose issuance has not arrived yet.
	pub expires_at: Option<DateTime<Utc>>,
	/// Revocation instant; once set it is never cleared.
	pub revoked_at: Option<DateTime<Utc>>,
}
impl TokenRecord {
	/// Whether a revocation has been recorded.
	pub fn is_revoked(&self) -> bool {
		self.revoked_at.is_some()
	}

	/// Whether the record was created by a revocation that preceded its issuance.
	pub fn is_tombstone(&self) -> bool {
		self.expires_at.is_none()
	}

	/// Whether the token is past its expiry at `now`.
	///
	/// A record without a known expiry is treated as expired.
	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		self.expires_at.map(|expires_at| now > expires_at).unwrap_or(true)
	}

	/// Neither revoked nor expired at `now`.
	pub fn is_live(&self, now: DateTime<Utc>) -> bool {
		!self.is_revoked() && !self.is_expired(now)
	}
}

/// Whether a store mutation changed persisted state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
	/// The fact changed the stored record.
	Applied,
	/// The fact was already reflected; nothing changed.
	Duplicate,
}
