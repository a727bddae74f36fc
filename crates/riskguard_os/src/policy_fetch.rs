#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use crate::config::POLICY_FETCH_TIMEOUT_MS_DEFAULT;

const FETCH_FAILURE_MESSAGE_MAX_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub message: String,
    pub status: Option<u16>,
}

impl FetchFailure {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            message: bounded(message.into()),
            status: None,
        }
    }

    pub fn http_status(status: u16) -> Self {
        Self {
            message: format!("policy fetch failed with http status {status}"),
            status: Some(status),
        }
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FetchFailure {}

/// Caps `message` at `FETCH_FAILURE_MESSAGE_MAX_LEN` bytes, cut on a char
/// boundary.
fn bounded(mut message: String) -> String {
    if message.len() > FETCH_FAILURE_MESSAGE_MAX_LEN {
        let mut end = FETCH_FAILURE_MESSAGE_MAX_LEN;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyResponse {
    pub status: u16,
    pub body: String,
}

/// Narrow transport seam for the remote policy document. Any HTTP status
/// comes back as `Ok`; `Err` is reserved for transport problems.
pub trait PolicyTransport: Send + Sync {
    fn fetch(&self, url: &str) -> Result<PolicyResponse, FetchFailure>;
}

/// Blocking HTTP transport over a shared `ureq` agent.
#[derive(Debug, Clone)]
pub struct UreqPolicyTransport {
    agent: ureq::Agent,
}

impl UreqPolicyTransport {
    pub fn new(timeout_ms: u64) -> Self {
        let timeout = Duration::from_millis(timeout_ms);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .user_agent(concat!("riskguard/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent }
    }
}

impl Default for UreqPolicyTransport {
    fn default() -> Self {
        Self::new(POLICY_FETCH_TIMEOUT_MS_DEFAULT)
    }
}

impl PolicyTransport for UreqPolicyTransport {
    fn fetch(&self, url: &str) -> Result<PolicyResponse, FetchFailure> {
        let response = match self.agent.get(url).set("accept", "application/json").call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, _resp)) => {
                return Ok(PolicyResponse {
                    status: code,
                    body: String::new(),
                })
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(FetchFailure::transport(format!(
                    "policy fetch transport error: {err}"
                )))
            }
        };
        let status = response.status();
        let body = response
            .into_string()
            .map_err(|err| FetchFailure::transport(format!("policy body read failed: {err}")))?;
        Ok(PolicyResponse { status, body })
    }
}
