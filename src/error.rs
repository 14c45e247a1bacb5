//! Error taxonomy for the transfer client.
//!
//! Classes and their scope:
//! - [`FetchError::Auth`] — token unobtainable; fatal for the whole run.
//! - [`FetchError::Transport`] — timeout / connection trouble; retryable.
//! - [`FetchError::ProtocolFault`] — SOAP fault (bad request, unknown
//!   shipment); terminal for that shipment, never retried.
//! - [`FetchError::MalformedResponse`] — MTOM/multipart decode failure;
//!   shipment-scoped, quarantinable.
//! - [`FetchError::Validation`] — payload failed content validation;
//!   shipment marked failed, not retried.

use thiserror::Error;

/// Identifies an insurer (VU) across configuration, tokens and errors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct InsurerId(pub String);

impl std::fmt::Display for InsurerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InsurerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport-level failure kinds, used to decide retryability and to feed
/// throttling signals into the rate governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Request timed out.
    Timeout,
    /// TCP/TLS connection could not be established.
    Connect,
    /// Server signalled throttling (HTTP 429/503 or configured equivalent).
    Throttled,
    /// Anything else on the wire (reset, proxy error, body read failure).
    Io,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// A security token could not be obtained for the insurer.
    /// The only error class that aborts an entire run.
    #[error("authentication failed for insurer {insurer}: {detail}")]
    Auth { insurer: InsurerId, detail: String },

    /// Network-level failure. Retryable by the caller.
    #[error("transport failure ({kind:?}) talking to {insurer}: {detail}")]
    Transport {
        insurer: InsurerId,
        kind: TransportKind,
        detail: String,
    },

    /// The server answered with a SOAP fault. Terminal for the shipment.
    #[error("protocol fault from {insurer} (shipment {shipment:?}): [{code}] {message}")]
    ProtocolFault {
        insurer: InsurerId,
        shipment: Option<String>,
        code: String,
        message: String,
    },

    /// The response body could not be decoded (missing boundary, unresolved
    /// content-id, truncation). Shipment-scoped.
    #[error("malformed response from {insurer} (shipment {shipment:?}): {detail}")]
    MalformedResponse {
        insurer: InsurerId,
        shipment: Option<String>,
        detail: String,
    },

    /// A decoded payload failed content validation (e.g. declared-PDF part
    /// without the PDF magic). Shipment-scoped, not retried.
    #[error("payload validation failed for {insurer} shipment {shipment}: {detail}")]
    Validation {
        insurer: InsurerId,
        shipment: String,
        detail: String,
    },
}

impl FetchError {
    /// Whether the caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transport { .. })
    }

    /// Whether this failure aborts the whole run for the insurer.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, FetchError::Auth { .. })
    }

    /// Whether this failure is a throttling signal the governor should
    /// absorb into scheduling.
    pub fn is_throttle(&self) -> bool {
        matches!(
            self,
            FetchError::Transport {
                kind: TransportKind::Throttled,
                ..
            }
        )
    }
}
