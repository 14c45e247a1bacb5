//! Centralized configuration for the transfer client.
//!
//! Tunable defaults live here so they can be reviewed and adjusted in a
//! single place. Per-insurer settings (endpoints, auth kind, policy name,
//! limit overrides) are data, not code: they come from an
//! [`InsurerDirectory`] loaded from JSON, keeping the ~40 known endpoints
//! as configuration rather than code paths.

use crate::error::InsurerId;
use crate::governor::GovernorLimits;
use crate::protocol::policy::ConnectorPolicy;
use crate::token::AuthKind;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

// ── Token lifecycle ──────────────────────────────────────────────────────────

/// A token this close to expiry is refreshed instead of handed out.
/// BiPRO tokens typically live 20-30 minutes; two minutes of margin covers
/// a full shipment download on slow links.
pub const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(120);

/// Fallback token lifetime when the STS response carries no `Expires`.
pub const TOKEN_DEFAULT_LIFETIME: Duration = Duration::from_secs(20 * 60);

/// Transport-level retries while issuing a token, before the failure is
/// escalated to a run-fatal auth error.
pub const TOKEN_ISSUE_RETRIES: u32 = 3;

/// Delays (in seconds) between token issuance retries.
pub const TOKEN_ISSUE_RETRY_DELAYS: [u64; 3] = [1, 3, 5];

// ── Rate governing ───────────────────────────────────────────────────────────

/// Upper bound on concurrent shipment downloads per run.
pub const CONCURRENCY_CEILING: usize = 10;

/// Lower bound the governor shrinks toward under throttling.
pub const CONCURRENCY_FLOOR: usize = 2;

/// Consecutive successes required before the budget grows by one slot.
pub const RECOVERY_STREAK: u32 = 3;

/// First backoff delay applied after a throttling signal.
pub const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Backoff delay never exceeds this cap.
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

// ── Transport ────────────────────────────────────────────────────────────────

/// Per-request timeout for all outbound SOAP calls. A timeout is a
/// retryable transport failure, not a fatal error.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(45);

/// HTTP status codes treated as throttling signals by default.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 2] = [429, 503];

// ── Download orchestration ───────────────────────────────────────────────────

/// Transport-error retries per shipment before it is recorded as failed.
pub const SHIPMENT_MAX_RETRIES: u32 = 3;

/// Results channel depth between workers and the aggregator.
pub const RESULT_CHANNEL_DEPTH: usize = 64;

// ── Per-insurer configuration ────────────────────────────────────────────────

/// Governor bounds, overridable per insurer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GovernorConfig {
    pub ceiling: usize,
    pub floor: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            ceiling: CONCURRENCY_CEILING,
            floor: CONCURRENCY_FLOOR,
        }
    }
}

impl GovernorConfig {
    pub fn limits(&self) -> GovernorLimits {
        GovernorLimits {
            ceiling: self.ceiling,
            floor: self.floor,
            recovery_streak: RECOVERY_STREAK,
            backoff_base: BACKOFF_BASE,
            backoff_cap: BACKOFF_CAP,
        }
    }
}

/// Everything the connector needs to talk to one insurer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsurerConfig {
    pub id: InsurerId,
    /// Human-readable name for logs.
    pub name: String,
    /// Security Token Service endpoint (norm 410).
    pub sts_url: String,
    /// Transfer service endpoint (norm 430 family).
    pub transfer_url: String,
    pub auth_kind: AuthKind,
    /// Policy profile name resolved via [`ConnectorPolicy::by_name`].
    pub policy: String,
    /// Registered consumer id, required by policies with
    /// `requires_consumer_id` (VEMA assigns one per client installation).
    #[serde(default)]
    pub consumer_id: Option<String>,
    #[serde(default)]
    pub governor: GovernorConfig,
    /// Seconds of expiry margin before a token is refreshed.
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// HTTP statuses treated as throttling signals.
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: Vec<u16>,
}

fn default_refresh_margin_secs() -> u64 {
    TOKEN_REFRESH_MARGIN.as_secs()
}

fn default_request_timeout_secs() -> u64 {
    REQUEST_TIMEOUT.as_secs()
}

fn default_retryable_statuses() -> Vec<u16> {
    DEFAULT_RETRYABLE_STATUSES.to_vec()
}

impl InsurerConfig {
    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connector_policy(&self) -> ConnectorPolicy {
        ConnectorPolicy::by_name(&self.policy)
    }

    pub fn is_throttle_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }
}

/// The set of known insurer endpoints, keyed by insurer id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsurerDirectory {
    insurers: HashMap<InsurerId, InsurerConfig>,
}

impl InsurerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the directory from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read insurer directory {}", path.display()))?;
        serde_json::from_str(&raw).context("invalid insurer directory JSON")
    }

    pub fn insert(&mut self, config: InsurerConfig) {
        self.insurers.insert(config.id.clone(), config);
    }

    pub fn get(&self, id: &InsurerId) -> Option<&InsurerConfig> {
        self.insurers.get(id)
    }

    pub fn len(&self) -> usize {
        self.insurers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insurers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InsurerConfig> {
        self.insurers.values()
    }
}
