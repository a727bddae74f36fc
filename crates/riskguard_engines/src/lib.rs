#![forbid(unsafe_code)]

pub mod blind_challenge;
pub mod bucketer;
pub mod decision;
pub mod mutation;
pub mod provider;
pub mod registry;
pub mod scorer;
