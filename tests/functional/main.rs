// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for the Motis controller and instance API.
//!
//! These tests drive reconciliation passes, the worker pool and the HTTP API
//! against the in-memory cluster. No Kubernetes cluster is required; the
//! Deployment and CronJob controllers are simulated by mutating object
//! status and seeding Jobs.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_hessen_lifecycle
//! ```
//!
//! ## Test Categories
//!
//! - **Lifecycle tests**: provisioning, idempotence, spec changes, invalid declarations
//! - **Refresh tests**: scheduled refreshes succeeding, failing and timing out
//! - **Deletion tests**: cascade deletion from every phase
//! - **Runner tests**: retry budget, error classification, concurrent updates
//! - **API tests**: HTTP status codes and bodies of the instance API

#[path = "../common/mod.rs"]
mod common;

mod api_tests;
mod lifecycle_tests;
