#![forbid(unsafe_code)]

pub mod common;
pub mod ph1j;
pub mod ph1psync;

pub use common::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};
