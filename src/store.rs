//! Persisted trust store holding token records and the backfill sync cursor.
//!
//! The store is the only shared mutable resource of the crate. Writers (backfill, event
//! consumer, reaper) and readers (validator) share one `Arc<dyn TokenStore>`; every write
//! touches a single record, so no cross-record locking is required. Calls are synchronous;
//! async callers run them through the blocking thread pool.

pub mod record;
pub mod sqlite;

pub use record::{ApplyOutcome, IssuedToken, TokenKind, TokenRecord};
pub use sqlite::SqliteStore;

// self
use crate::_prelude::*;

/// Storage contract for the trust cache.
///
/// Implementations must make every mutation idempotent and must never clear a recorded
/// revocation. Errors are returned to the caller, which retries the same fact.
pub trait TokenStore: Send + Sync + std::fmt::Debug {
	/// Record an issuance; re-applying the same fact is a no-op.
	fn upsert_issued(&self, token: &IssuedToken) -> Result<ApplyOutcome>;

	/// Record a revocation, creating a tombstone when the token is not yet known.
	///
	/// `revoked_at` only ever moves earlier.
	fn mark_revoked(&self, id: &str, kind: TokenKind, at: DateTime<Utc>) -> Result<ApplyOutcome>;

	/// Fetch a record; `None` means the token is unknown locally.
	fn lookup(&self, id: &str, kind: TokenKind) -> Result<Option<TokenRecord>>;

	/// Instant through which the store is complete via backfill (epoch when never synced).
	fn cursor(&self) -> Result<DateTime<Utc>>;

	/// Persist a new sync cursor.
	fn set_cursor(&self, at: DateTime<Utc>) -> Result<()>;

	/// Delete records that expired before `before`; tombstones without an expiry are kept.
	fn purge_expired_before(&self, before: DateTime<Utc>) -> Result<u64>;

	/// Number of stored records.
	fn record_count(&self) -> Result<u64>;
}

/// Run synchronous store work on the blocking thread pool.
///
/// Store calls may block on disk I/O or lock waits and must not run on runtime threads.
pub(crate) async fn off_runtime<T, F>(op: F) -> Result<T>
where
	T: Send + 'static,
	F: FnOnce() -> Result<T> + Send + 'static,
{
	tokio::task::spawn_blocking(op)
		.await
		.map_err(|err| Error::Store(format!("Store task failed: {err}.")))?
}
