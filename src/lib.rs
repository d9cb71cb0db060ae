//! Local token-trust cache kept consistent with an upstream identity authority through a
//! streaming backfill and a durable event feed, with store-backed request validation and
//! credential rotation.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod config;
pub mod metrics;
pub mod refresh;
pub mod security;
pub mod service;
pub mod store;
pub mod sync;
pub mod upstream;
pub mod validator;

mod error;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use chrono::{DateTime, TimeDelta, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}

#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
pub use crate::{
	auth::{AccessClaims, Authentication, Authenticator, ClaimsVerifier, Credentials},
	config::{ConsumerConfig, JitterStrategy, ReaperConfig, RetryPolicy, TrustCacheConfig},
	error::{Error, Result},
	refresh::RefreshCoordinator,
	service::{TrustCache, TrustCacheBuilder, TrustCacheStatus},
	store::{SqliteStore, TokenKind, TokenRecord, TokenStore},
	sync::{BackfillReport, BackfillSynchronizer, EventConsumer, TokenEvent},
	upstream::{AuthorityClient, HttpAuthority, TokenPair},
	validator::{Decision, RejectReason, Validator},
};
