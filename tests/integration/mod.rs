//! Integration tests for txguard.

pub mod batch_test;
pub mod common;
pub mod context_cache_test;
pub mod coordinator_test;
pub mod postgres_test;
