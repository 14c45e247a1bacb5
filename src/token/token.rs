//! Short-lived security tokens issued by the insurer's STS (norm 410).

use crate::error::InsurerId;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Cache key for a token: one token per (insurer, account) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub insurer: InsurerId,
    pub username: String,
}

impl TokenKey {
    pub fn new(insurer: InsurerId, username: impl Into<String>) -> Self {
        Self {
            insurer,
            username: username.into(),
        }
    }
}

/// A security token as returned by the STS.
///
/// Discarded at run end; nothing here is persisted.
#[derive(Debug, Clone)]
pub struct SecurityToken {
    /// Opaque token value placed into subsequent requests.
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub key: TokenKey,
}

impl SecurityToken {
    /// Whether the token expires within `margin` from now.
    ///
    /// A token inside the margin is treated as unusable: it could expire
    /// mid-download, so the store refreshes it instead of handing it out.
    pub fn expires_within(&self, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        Utc::now() + margin >= self.expires_at
    }

    /// Remaining validity, clamped to zero.
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}
