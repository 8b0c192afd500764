// Integration tests for the position-ledger crate
// This file makes all the test modules in the tests/ directory discoverable by Cargo

// Re-export the main crate for testing
pub use position_ledger;

// Common test utilities
pub mod common;


// Re-export common types for easier access in test files
pub use common::{mocks::FakeUpstream, TestHarness};
