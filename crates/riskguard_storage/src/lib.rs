#![forbid(unsafe_code)]

pub mod policy_cache;
