#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod policy_fetch;
pub mod policy_provider;
