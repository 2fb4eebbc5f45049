//! Testing utilities and mock handlers
//!
//! Lets tests exercise the broker with recording, failing, panicking and
//! slow agents without writing handler closures by hand.

pub mod mocks;

pub use mocks::*;
