//! Test suite for the broker session service
//!
//! Login flows run against wiremock stand-ins for each broker; hub and
//! session-store properties run against the in-memory repository.

pub mod unit;
