#![forbid(unsafe_code)]

pub mod common;
pub mod policy;
pub mod report;
pub mod signal;
pub mod snapshot;

pub use common::{ContractViolation, ReasonCodeId, UnixTimeMs, Validate};
