//! Token lifecycle events carried by the queue.

// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::{
	_prelude::*,
	store::{ApplyOutcome, IssuedToken, TokenKind, TokenStore},
};

/// Lifecycle transition described by an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
	/// A token was minted.
	Issued,
	/// A token was revoked.
	Revoked,
}

/// One lifecycle event as published by the authority.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEvent {
	/// Transition type.
	pub event_type: EventType,
	/// Identifier of the affected token.
	pub token_id: String,
	/// Token family.
	pub kind: TokenKind,
	/// Parent refresh token, for issued access tokens.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parent_id: Option<String>,
	/// Absolute expiry; required for `issued` events.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expires_at: Option<DateTime<Utc>>,
	/// When the transition happened at the authority.
	pub timestamp: DateTime<Utc>,
}
impl TokenEvent {
	/// Build an `issued` event.
	pub fn issued(token: &IssuedToken, timestamp: DateTime<Utc>) -> Self {
		Self {
			event_type: EventType::Issued,
			token_id: token.id.clone(),
			kind: token.kind,
			parent_id: token.parent_id.clone(),
			expires_at: Some(token.expires_at),
			timestamp,
		}
	}

	/// Build a `revoked` event.
	pub fn revoked(token_id: impl Into<String>, kind: TokenKind, timestamp: DateTime<Utc>) -> Self {
		Self {
			event_type: EventType::Revoked,
			token_id: token_id.into(),
			kind,
			parent_id: None,
			expires_at: None,
			timestamp,
		}
	}

	/// Decode and validate a queue payload.
	///
	/// Any error here marks the payload as poison: retrying it can never succeed.
	pub fn decode(payload: &[u8]) -> Result<Self> {
		let event: Self = serde_json::from_slice(payload)?;

		event.validate()?;

		Ok(event)
	}

	/// Check structural requirements serde cannot express.
	pub fn validate(&self) -> Result<()> {
		if self.token_id.trim().is_empty() {
			return Err(Error::Validation {
				field: "token_id",
				reason: "Must not be empty.".into(),
			});
		}
		if self.event_type == EventType::Issued && self.expires_at.is_none() {
			return Err(Error::Validation {
				field: "expires_at",
				reason: "Required for issued events.".into(),
			});
		}
		if self.kind == TokenKind::RefreshToken && self.parent_id.is_some() {
			return Err(Error::Validation {
				field: "parent_id",
				reason: "Refresh tokens have no parent.".into(),
			});
		}

		Ok(())
	}

	/// Apply the event to the store.
	pub fn apply(&self, store: &dyn TokenStore) -> Result<ApplyOutcome> {
		match self.event_type {
			EventType::Issued => {
				let Some(expires_at) = self.expires_at else {
					return Err(Error::Validation {
						field: "expires_at",
						reason: "Required for issued events.".into(),
					});
				};

				store.upsert_issued(&IssuedToken {
					id: self.token_id.clone(),
					kind: self.kind,
					parent_id: self.parent_id.clone(),
					expires_at,
				})
			},
			EventType::Revoked => store.mark_revoked(&self.token_id, self.kind, self.timestamp),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::SqliteStore;

	#[test]
	fn decodes_wire_format() {
		let payload = br#"{
			"event_type": "issued",
			"token_id": "a1",
			"kind": "access_token",
			"parent_id": "r1",
			"expires_at": "2030-01-01T00:00:00Z",
			"timestamp": "2029-12-31T23:00:00Z"
		}"#;
		let event = TokenEvent::decode(payload).expect("valid event");

		assert_eq!(event.event_type, EventType::Issued);
		assert_eq!(event.kind, TokenKind::AccessToken);
		assert_eq!(event.parent_id.as_deref(), Some("r1"));
	}

	#[test]
	fn malformed_payloads_are_rejected() {
		assert!(matches!(TokenEvent::decode(b"not json"), Err(Error::Serde(_))));
		assert!(
			TokenEvent::decode(br#"{"event_type":"expired","token_id":"a","kind":"access_token","timestamp":"2030-01-01T00:00:00Z"}"#)
				.is_err()
		);

		let missing_expiry = br#"{"event_type":"issued","token_id":"a","kind":"access_token","timestamp":"2030-01-01T00:00:00Z"}"#;

		assert!(matches!(
			TokenEvent::decode(missing_expiry),
			Err(Error::Validation { field: "expires_at", .. })
		));

		let blank_id = br#"{"event_type":"revoked","token_id":" ","kind":"refresh_token","timestamp":"2030-01-01T00:00:00Z"}"#;

		assert!(matches!(
			TokenEvent::decode(blank_id),
			Err(Error::Validation { field: "token_id", .. })
		));
	}

	#[test]
	fn apply_reports_duplicates() {
		let store = SqliteStore::in_memory().expect("store");
		let now = Utc::now();
		let issued = TokenEvent::issued(&IssuedToken::refresh("r1", now + TimeDelta::hours(1)), now);
		let revoked = TokenEvent::revoked("r1", TokenKind::RefreshToken, now);

		assert_eq!(issued.apply(&store).expect("apply"), ApplyOutcome::Applied);
		assert_eq!(issued.apply(&store).expect("apply"), ApplyOutcome::Duplicate);
		assert_eq!(revoked.apply(&store).expect("apply"), ApplyOutcome::Applied);
		assert_eq!(revoked.apply(&store).expect("apply"), ApplyOutcome::Duplicate);
	}
}
