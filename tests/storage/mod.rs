//! Shared storage integration tests.
//!
//! Tests the EventStore interface contract. Each backend module imports
//! these test functions and runs them.

pub mod event_store_tests;
