//! `SQLite`-backed trust store.

// std
use std::{
	path::Path,
	sync::{Mutex, MutexGuard},
};
// crates.io
use rusqlite::{Connection, OptionalExtension, params};
// self
use crate::{
	_prelude::*,
	store::{ApplyOutcome, IssuedToken, TokenKind, TokenRecord, TokenStore},
};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

type RawRecord = (String, String, Option<String>, Option<i64>, Option<i64>);

/// Trust store persisted in a single `SQLite` database.
#[derive(Clone, Debug)]
pub struct SqliteStore {
	conn: Arc<Mutex<Connection>>,
}
impl SqliteStore {
	/// Open (or create) a file-backed store.
	pub fn open(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let conn = Connection::open(path)?;

		conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
			row.get::<_, String>(0)
		})?;

		tracing::debug!(path = %path.display(), "opened trust store");

		Self::from_connection(conn)
	}

	/// Create an in-memory store.
	pub fn in_memory() -> Result<Self> {
		Self::from_connection(Connection::open_in_memory()?)
	}

	fn from_connection(conn: Connection) -> Result<Self> {
		conn.busy_timeout(Duration::from_secs(5))?;
		conn.execute_batch(SCHEMA_SQL)?;

		Ok(Self { conn: Arc::new(Mutex::new(conn)) })
	}

	fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
		self.conn.lock().map_err(|_| Error::Store("Connection mutex poisoned.".into()))
	}
}
impl TokenStore for SqliteStore {
	fn upsert_issued(&self, token: &IssuedToken) -> Result<ApplyOutcome> {
		let mut conn = self.lock()?;
		let tx = conn.transaction()?;
		let outcome = match select_record(&tx, &token.id, token.kind)? {
			None => {
				tx.execute(
					"INSERT INTO token_records (kind, id, parent_id, expires_at, revoked_at) \
					 VALUES (?1, ?2, ?3, ?4, NULL)",
					params![
						token.kind.as_str(),
						token.id,
						token.parent_id,
						token.expires_at.timestamp_millis()
					],
				)?;

				ApplyOutcome::Applied
			},
			Some(existing) => {
				// First issuance wins; a tombstone only gains the fields it is missing.
				let expires_at = match existing.expires_at {
					Some(stored) => {
						if stored.timestamp_millis() != token.expires_at.timestamp_millis() {
							tracing::warn!(
								id = %token.id,
								kind = token.kind.as_str(),
								stored = %stored,
								incoming = %token.expires_at,
								"conflicting expiry for known token; keeping stored value"
							);
						}

						stored
					},
					None => token.expires_at,
				};
				let parent_id = existing.parent_id.clone().or_else(|| token.parent_id.clone());

				if existing.expires_at.map(|stored| stored.timestamp_millis())
					== Some(expires_at.timestamp_millis())
					&& existing.parent_id == parent_id
				{
					ApplyOutcome::Duplicate
				} else {
					tx.execute(
						"UPDATE token_records SET parent_id = ?3, expires_at = ?4 \
						 WHERE kind = ?1 AND id = ?2",
						params![
							token.kind.as_str(),
							token.id,
							parent_id,
							expires_at.timestamp_millis()
						],
					)?;

					ApplyOutcome::Applied
				}
			},
		};

		tx.commit()?;

		Ok(outcome)
	}

	fn mark_revoked(&self, id: &str, kind: TokenKind, at: DateTime<Utc>) -> Result<ApplyOutcome> {
		let mut conn = self.lock()?;
		let tx = conn.transaction()?;
		let outcome = match select_record(&tx, id, kind)? {
			None => {
				tx.execute(
					"INSERT INTO token_records (kind, id, parent_id, expires_at, revoked_at) \
					 VALUES (?1, ?2, NULL, NULL, ?3)",
					params![kind.as_str(), id, at.timestamp_millis()],
				)?;

				ApplyOutcome::Applied
			},
			Some(TokenRecord { revoked_at: Some(previous), .. }) if previous <= at =>
				ApplyOutcome::Duplicate,
			Some(_) => {
				tx.execute(
					"UPDATE token_records SET revoked_at = ?3 WHERE kind = ?1 AND id = ?2",
					params![kind.as_str(), id, at.timestamp_millis()],
				)?;

				ApplyOutcome::Applied
			},
		};

		tx.commit()?;

		Ok(outcome)
	}

	fn lookup(&self, id: &str, kind: TokenKind) -> Result<Option<TokenRecord>> {
		let conn = self.lock()?;

		select_record(&conn, id, kind)
	}

	fn cursor(&self) -> Result<DateTime<Utc>> {
		let conn = self.lock()?;
		let millis: Option<i64> = conn
			.query_row("SELECT synced_through FROM sync_cursor WHERE id = 0", [], |row| row.get(0))
			.optional()?;

		match millis {
			Some(millis) => from_millis(millis, "synced_through"),
			None => Ok(DateTime::<Utc>::default()),
		}
	}

	fn set_cursor(&self, at: DateTime<Utc>) -> Result<()> {
		let conn = self.lock()?;

		conn.execute(
			"INSERT INTO sync_cursor (id, synced_through) VALUES (0, ?1) \
			 ON CONFLICT (id) DO UPDATE SET synced_through = excluded.synced_through",
			params![at.timestamp_millis()],
		)?;

		Ok(())
	}

	fn purge_expired_before(&self, before: DateTime<Utc>) -> Result<u64> {
		let conn = self.lock()?;
		// Tombstones carry no expiry and stay until a late issuance fills one in.
		let deleted = conn.execute(
			"DELETE FROM token_records WHERE expires_at IS NOT NULL AND expires_at < ?1",
			params![before.timestamp_millis()],
		)?;

		Ok(deleted as u64)
	}

	fn record_count(&self) -> Result<u64> {
		let conn = self.lock()?;
		let count: i64 =
			conn.query_row("SELECT COUNT(*) FROM token_records", [], |row| row.get(0))?;

		Ok(count.max(0) as u64)
	}
}

fn select_record(conn: &Connection, id: &str, kind: TokenKind) -> Result<Option<TokenRecord>> {
	let raw: Option<RawRecord> = conn
		.query_row(
			"SELECT kind, id, parent_id, expires_at, revoked_at FROM token_records \
			 WHERE kind = ?1 AND id = ?2",
			params![kind.as_str(), id],
			|row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
		)
		.optional()?;

	raw.map(decode_record).transpose()
}

fn decode_record((kind, id, parent_id, expires_at, revoked_at): RawRecord) -> Result<TokenRecord> {
	let kind = TokenKind::parse(&kind)
		.ok_or_else(|| Error::Store(format!("Unknown token kind '{kind}' for record {id}.")))?;
	let expires_at = expires_at.map(|millis| from_millis(millis, "expires_at")).transpose()?;
	let revoked_at = revoked_at.map(|millis| from_millis(millis, "revoked_at")).transpose()?;

	Ok(TokenRecord { id, kind, parent_id, expires_at, revoked_at })
}

fn from_millis(millis: i64, column: &str) -> Result<DateTime<Utc>> {
	DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
		Error::Store(format!("Column {column} holds out-of-range timestamp {millis}."))
	})
}
