//! HTTP client for the identity authority.

// crates.io
use chrono::SecondsFormat;
use futures::{StreamExt, stream};
use http::StatusCode;
use reqwest::{Client, Response, redirect::Policy};
use url::Url;
// self
use crate::{
	_prelude::*,
	config::TrustCacheConfig,
	security,
	upstream::{AuthorityClient, BatchStream, TokenBatch, TokenPair},
};

const LIST_TOKENS_PATH: &str = "v1/tokens";
const REFRESH_PATH: &str = "v1/tokens/refresh";

/// Authority reached over HTTP.
///
/// Backfill reads a newline-delimited JSON body, one [`TokenBatch`] per line.
#[derive(Clone, Debug)]
pub struct HttpAuthority {
	base_url: Url,
	client: Client,
	require_https: bool,
	max_batch_bytes: usize,
}
impl HttpAuthority {
	/// Build an authority client with the default reqwest client.
	pub fn new(config: &TrustCacheConfig) -> Result<Self> {
		let client = Client::builder()
			.redirect(Policy::limited(3))
			.user_agent(format!("token-trust-cache/{}", env!("CARGO_PKG_VERSION")))
			.connect_timeout(Duration::from_secs(5))
			.build()?;

		Self::with_client(config, client)
	}

	/// Build an authority client around the supplied HTTP client.
	pub fn with_client(config: &TrustCacheConfig, client: Client) -> Result<Self> {
		if config.require_https {
			security::enforce_https(&config.authority_url)?;
		}

		let mut base_url = config.authority_url.clone();

		if !base_url.path().ends_with('/') {
			let path = format!("{}/", base_url.path());

			base_url.set_path(&path);
		}

		Ok(Self {
			base_url,
			client,
			require_https: config.require_https,
			max_batch_bytes: usize::try_from(config.max_batch_bytes).unwrap_or(usize::MAX),
		})
	}

	fn endpoint(&self, path: &str) -> Result<Url> {
		let url = self.base_url.join(path)?;

		if self.require_https {
			security::enforce_https(&url)?;
		}

		Ok(url)
	}
}
#[async_trait::async_trait]
impl AuthorityClient for HttpAuthority {
	#[tracing::instrument(skip(self), fields(issued_after = %issued_after))]
	async fn list_tokens_issued_after(&self, issued_after: DateTime<Utc>) -> Result<BatchStream> {
		let url = self.endpoint(LIST_TOKENS_PATH)?;
		let issued_after = issued_after.to_rfc3339_opts(SecondsFormat::Millis, true);
		let response = self
			.client
			.get(url.clone())
			.query(&[("issued_after", issued_after.as_str())])
			.header(http::header::ACCEPT, "application/x-ndjson")
			.send()
			.await?;
		let response = ensure_success(response, &url).await?;

		tracing::debug!(status = %response.status(), "backfill stream opened");

		let body = Box::pin(response.bytes_stream());
		let decoder = BatchDecoder::new(self.max_batch_bytes);
		let batches = stream::try_unfold((body, decoder), |(mut body, mut decoder)| async move {
			loop {
				if let Some(batch) = decoder.next_batch()? {
					return Ok(Some((batch, (body, decoder))));
				}
				if decoder.finished {
					return Ok(None);
				}

				match body.next().await {
					Some(chunk) => decoder.push(&chunk?),
					None =>
						return Ok(decoder.finish()?.map(|batch| (batch, (body, decoder)))),
				}
			}
		});

		Ok(batches.boxed())
	}

	#[tracing::instrument(
		skip(self, refresh_token),
		fields(credential = %security::credential_fingerprint(refresh_token))
	)]
	async fn refresh(&self, refresh_token: &str, attempt_timeout: Duration) -> Result<TokenPair> {
		let url = self.endpoint(REFRESH_PATH)?;
		let response = self
			.client
			.post(url.clone())
			.bearer_auth(refresh_token)
			.timeout(attempt_timeout)
			.send()
			.await?;
		let status = response.status();

		if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
			return Err(Error::RefreshRejected { status });
		}

		let response = ensure_success(response, &url).await?;
		let pair = response.json::<TokenPair>().await?;

		tracing::debug!(status = %status, "refresh completed");

		Ok(pair)
	}
}

/// Incremental newline-delimited JSON decoder for backfill bodies.
#[derive(Debug)]
struct BatchDecoder {
	buffer: Vec<u8>,
	max_batch_bytes: usize,
	finished: bool,
}
impl BatchDecoder {
	fn new(max_batch_bytes: usize) -> Self {
		Self { buffer: Vec::new(), max_batch_bytes, finished: false }
	}

	fn push(&mut self, chunk: &[u8]) {
		self.buffer.extend_from_slice(chunk);
	}

	fn next_batch(&mut self) -> Result<Option<TokenBatch>> {
		loop {
			let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') else {
				if self.buffer.len() > self.max_batch_bytes {
					return Err(self.oversized(self.buffer.len()));
				}

				return Ok(None);
			};
			let line: Vec<u8> = self.buffer.drain(..=newline).collect();

			if let Some(batch) = self.decode_line(&line)? {
				return Ok(Some(batch));
			}
		}
	}

	fn finish(&mut self) -> Result<Option<TokenBatch>> {
		self.finished = true;

		let rest = std::mem::take(&mut self.buffer);

		self.decode_line(&rest)
	}

	fn decode_line(&self, line: &[u8]) -> Result<Option<TokenBatch>> {
		let line = line.trim_ascii();

		if line.is_empty() {
			return Ok(None);
		}
		if line.len() > self.max_batch_bytes {
			return Err(self.oversized(line.len()));
		}

		Ok(Some(serde_json::from_slice(line)?))
	}

	fn oversized(&self, size: usize) -> Error {
		Error::Validation {
			field: "max_batch_bytes",
			reason: format!(
				"Backfill batch of {size} bytes exceeds the configured guard of {limit} bytes.",
				limit = self.max_batch_bytes
			),
		}
	}
}

async fn ensure_success(response: Response, url: &Url) -> Result<Response> {
	let status = response.status();

	if status.is_success() {
		Ok(response)
	} else {
		let body = response.text().await.ok();

		Err(Error::HttpStatus { status, url: url.clone(), body })
	}
}
