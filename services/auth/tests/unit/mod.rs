//! Integration tests organised by component

pub mod angel_flow_tests;
pub mod hub_tests;

// Common test utilities
pub mod test_utils;
