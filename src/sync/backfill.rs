//! Boot-time historical catch-up from the authority.

// crates.io
use chrono::SubsecRound;
use futures::TryStreamExt;
// self
use crate::{
	_prelude::*,
	config::RetryPolicy,
	metrics,
	store::{self, ApplyOutcome, IssuedToken, TokenStore},
	upstream::{AuthorityClient, retry::retry_transient},
};

/// Summary of one completed backfill run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackfillReport {
	/// Cursor the run started from.
	pub started_from: DateTime<Utc>,
	/// Cursor persisted at the end of the run.
	pub watermark: DateTime<Utc>,
	/// Number of batches received.
	pub batches: u64,
	/// Facts that changed the store.
	pub applied: u64,
	/// Facts that were already reflected.
	pub duplicates: u64,
}
impl BackfillReport {
	/// Total facts processed.
	pub fn facts(&self) -> u64 {
		self.applied + self.duplicates
	}
}

/// Streams every token fact issued since the stored cursor into the store.
#[derive(Clone, Debug)]
pub struct BackfillSynchronizer {
	store: Arc<dyn TokenStore>,
	authority: Arc<dyn AuthorityClient>,
	retry: RetryPolicy,
}
impl BackfillSynchronizer {
	/// Create a synchronizer writing to `store`.
	pub fn new(
		store: Arc<dyn TokenStore>,
		authority: Arc<dyn AuthorityClient>,
		retry: RetryPolicy,
	) -> Self {
		Self { store, authority, retry }
	}

	/// Run the backfill to completion.
	///
	/// The watermark is taken before the upstream request and persisted only after a clean
	/// end-of-stream, so facts issued while streaming may be replayed by the next run but are
	/// never skipped. Any error leaves the cursor untouched.
	#[tracing::instrument(skip(self))]
	pub async fn run(&self) -> Result<BackfillReport> {
		let started = Instant::now();
		let started_from = {
			let target = self.store.clone();

			store::off_runtime(move || target.cursor()).await?
		};
		let watermark = Utc::now().trunc_subsecs(3);
		let mut report =
			BackfillReport { started_from, watermark, batches: 0, applied: 0, duplicates: 0 };

		tracing::info!(cursor = %started_from, %watermark, "backfill started");

		let mut batches = self.authority.list_tokens_issued_after(started_from).await?;

		while let Some(batch) = batches
			.try_next()
			.await
			.map_err(|err| Error::Backfill(format!("stream aborted: {err}")))?
		{
			report.batches += 1;

			for token in batch.pairs.into_iter().flat_map(|pair| pair.into_issued()) {
				match self.apply(token).await? {
					ApplyOutcome::Applied => report.applied += 1,
					ApplyOutcome::Duplicate => report.duplicates += 1,
				}
			}

			tracing::debug!(batch = report.batches, facts = report.facts(), "backfill batch applied");
		}

		let target = self.store.clone();

		store::off_runtime(move || target.set_cursor(watermark)).await?;

		metrics::record_backfill(report.facts(), started.elapsed());
		tracing::info!(
			batches = report.batches,
			applied = report.applied,
			duplicates = report.duplicates,
			elapsed_ms = started.elapsed().as_millis() as u64,
			"backfill completed"
		);

		Ok(report)
	}

	async fn apply(&self, token: IssuedToken) -> Result<ApplyOutcome> {
		retry_transient(&self.retry, "backfill.upsert_issued", |_| {
			let target = self.store.clone();
			let token = token.clone();

			store::off_runtime(move || target.upsert_issued(&token))
		})
		.await
	}
}
