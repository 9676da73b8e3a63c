//! Integration tests for txguard.
//!
//! Most tests run against the in-memory service. PostgreSQL tests require a
//! running database and skip themselves unless DATABASE_URL is set.
//!
//! Run with: `cargo test --test integration_tests`

mod integration;
