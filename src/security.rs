//! Security utilities covering HTTPS enforcement and credential fingerprinting.
//!
//! # Threat Model
//! Bearer credentials grant access to whoever holds them, so they must never reach logs, status
//! output, or `Debug` renderings. Everywhere a credential needs to be correlated it is replaced by
//! a short SHA-256 fingerprint that cannot be replayed.

// crates.io
use base64::prelude::*;
use sha2::{Digest, Sha256};
use url::Url;
// self
use crate::_prelude::*;

const FINGERPRINT_BYTES: usize = 12;

/// Ensure the provided URL uses HTTPS.
pub fn enforce_https(url: &Url) -> Result<()> {
	if url.scheme() == "https" {
		Ok(())
	} else {
		Err(Error::Security(format!("Authority URL {url} must use HTTPS.")))
	}
}

/// Short, non-reversible fingerprint of a credential for log correlation.
///
/// The value is the URL-safe base64 form of the first 12 bytes of the SHA-256 digest.
pub fn credential_fingerprint(credential: &str) -> String {
	let digest = Sha256::digest(credential.as_bytes());

	BASE64_URL_SAFE_NO_PAD.encode(&digest[..FINGERPRINT_BYTES])
}
