//! Integration tests for the token trust cache.

mod authenticate;
mod backfill;
mod common;
mod consumer;
mod lifecycle;
