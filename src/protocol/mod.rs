//! Message envelope, construction helpers and validation
//!
//! This module defines the typed envelope routed by the broker and its JSON
//! wire format, kept stable for a future cross-process transport.

pub mod factory;
pub mod messages;
pub mod validation;

pub use factory::*;
pub use messages::*;
pub use validation::*;
