//! Credential rotation for expired access tokens with a trusted refresh token.

// self
use crate::{
	_prelude::*,
	config::RetryPolicy,
	metrics, security,
	upstream::{AuthorityClient, TokenPair, retry::retry_transient},
};

/// Calls the authority to mint a new credential pair.
///
/// The coordinator never writes the store: the new tokens reach it through the event feed.
#[derive(Clone, Debug)]
pub struct RefreshCoordinator {
	authority: Arc<dyn AuthorityClient>,
	retry: RetryPolicy,
}
impl RefreshCoordinator {
	/// Create a coordinator using `retry` for transient failures.
	pub fn new(authority: Arc<dyn AuthorityClient>, retry: RetryPolicy) -> Self {
		Self { authority, retry }
	}

	/// Exchange `refresh_token` for a new pair.
	///
	/// Network errors, 5xx, and 429 responses are retried; an explicit rejection is returned
	/// immediately as [`Error::RefreshRejected`].
	#[tracing::instrument(
		skip(self, refresh_token),
		fields(credential = %security::credential_fingerprint(refresh_token))
	)]
	pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
		let authority = &self.authority;
		let result = retry_transient(&self.retry, "refresh", move |timeout| async move {
			authority.refresh(refresh_token, timeout).await
		})
		.await;

		match &result {
			Ok(_) => {
				metrics::record_refresh("success");
				tracing::info!("credentials rotated");
			},
			Err(Error::RefreshRejected { status }) => {
				metrics::record_refresh("rejected");
				tracing::info!(%status, "refresh credential rejected");
			},
			Err(err) => {
				metrics::record_refresh("error");
				tracing::warn!(error = %err, "refresh failed");
			},
		}

		result
	}
}
