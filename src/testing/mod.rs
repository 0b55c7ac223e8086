//! Test support
//!
//! In-memory implementations of the service's seams (device store, event
//! sink, firmware sink) used by unit and integration tests.

pub mod mocks;
