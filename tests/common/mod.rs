//! Shared test utilities for integration, property and chaos tests.
//!
//! This module provides:
//! - A mock `RepositoryConnector` with configurable delay and failure
//! - Event and type fixtures
//! - Engine construction and polling helpers

#![allow(dead_code)]

pub mod fixtures;
pub mod mock_connector;

pub use fixtures::*;
pub use mock_connector::*;
