//! Crate-wide error types and `Result` alias.

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the trust cache crate.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Http(#[from] http::Error),
	#[error(transparent)]
	Jsonwebtoken(#[from] jsonwebtoken::errors::Error),
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	Sqlite(#[from] rusqlite::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[cfg(feature = "redis")]
	#[error(transparent)]
	Redis(#[from] redis::RedisError),

	#[error("Backfill failed: {0}")]
	Backfill(String),
	#[error("Upstream HTTP status {status} from {url}: {body:?}")]
	HttpStatus { status: http::StatusCode, url: url::Url, body: Option<String> },
	#[error("Metrics error: {0}")]
	Metrics(String),
	#[error("Refresh credential rejected by the authority ({status}).")]
	RefreshRejected { status: http::StatusCode },
	#[error("Security violation: {0}")]
	Security(String),
	#[error("Shutdown requested.")]
	Shutdown,
	#[error("Store error: {0}")]
	Store(String),
	#[error("Queue transport error: {0}")]
	Transport(String),
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },
}
impl Error {
	/// Whether retrying the same operation may succeed.
	///
	/// Rejections and validation failures are final; network, storage, and server-side
	/// failures are not.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Io(_) | Self::Reqwest(_) | Self::Sqlite(_) | Self::Store(_) | Self::Transport(_) =>
				true,
			#[cfg(feature = "redis")]
			Self::Redis(_) => true,
			Self::HttpStatus { status, .. } =>
				status.is_server_error() || *status == http::StatusCode::TOO_MANY_REQUESTS,
			_ => false,
		}
	}
}
#[cfg(feature = "metrics")]
impl<T> From<metrics::SetRecorderError<T>> for Error
where
	T: std::fmt::Display,
{
	fn from(value: metrics::SetRecorderError<T>) -> Self {
		Self::Metrics(value.to_string())
	}
}
