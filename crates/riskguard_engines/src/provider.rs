#![forbid(unsafe_code)]

use std::fmt;

use riskguard_contracts::report::ServerFields;
use riskguard_contracts::signal::Signal;
use riskguard_contracts::snapshot::EvaluationSnapshot;

pub const PROVIDER_ERROR_MESSAGE_MAX_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    message: String,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > PROVIDER_ERROR_MESSAGE_MAX_LEN {
            // Cut on a char boundary so the bound holds in bytes.
            let mut end = PROVIDER_ERROR_MESSAGE_MAX_LEN;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider error: {}", self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Leaf detector capability. Implementations must not keep the snapshot
/// past the call and must not share mutable state with other providers.
pub trait SignalProvider: Send + Sync {
    fn id(&self) -> &str;

    fn collect(&self, snapshot: &EvaluationSnapshot) -> Result<Vec<Signal>, ProviderError>;

    fn server_aggregate_fields(&self, _snapshot: &EvaluationSnapshot) -> Option<ServerFields> {
        None
    }
}
