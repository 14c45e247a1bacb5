//! Per-insurer request-shaping policies.
//!
//! Insurer gateways interpret the norm with small but incompatible
//! deviations. Rather than branching on endpoint identity, one generic
//! connector consumes a policy table; adding an insurer variant means
//! adding a row here, not a code path.

use serde::{Deserialize, Serialize};

/// How a successfully archived shipment is committed towards the insurer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitSignal {
    /// Explicit `acknowledgeShipment` call after archiving.
    Acknowledge,
    /// No commit operation; the insurer expires delivered shipments on its
    /// own (VEMA-style gateways).
    None,
}

/// Request-shaping rules for one gateway flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorPolicy {
    /// Token requests must carry a `ConsumerId` element.
    pub requires_consumer_id: bool,
    /// List requests set the `bestaetigeLieferungen` (confirm deliveries)
    /// flag.
    pub sets_confirm_flag: bool,
    pub commit: CommitSignal,
}

impl ConnectorPolicy {
    /// The default profile: Degenia and most norm-conformant gateways.
    pub const GENERIC: ConnectorPolicy = ConnectorPolicy {
        requires_consumer_id: false,
        sets_confirm_flag: true,
        commit: CommitSignal::Acknowledge,
    };

    /// VEMA-style gateways: consumer id mandatory, no confirm flag, no
    /// acknowledge operation.
    pub const VEMA: ConnectorPolicy = ConnectorPolicy {
        requires_consumer_id: true,
        sets_confirm_flag: false,
        commit: CommitSignal::None,
    };

    /// Resolve a profile name from configuration. Unknown names fall back
    /// to the generic profile.
    pub fn by_name(name: &str) -> ConnectorPolicy {
        match name.to_ascii_lowercase().as_str() {
            "vema" => Self::VEMA,
            "generic" | "degenia" => Self::GENERIC,
            other => {
                tracing::warn!(policy = other, "unknown policy profile, using generic");
                Self::GENERIC
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_table() {
        let generic = ConnectorPolicy::by_name("generic");
        assert!(!generic.requires_consumer_id);
        assert!(generic.sets_confirm_flag);
        assert_eq!(generic.commit, CommitSignal::Acknowledge);

        let vema = ConnectorPolicy::by_name("VEMA");
        assert!(vema.requires_consumer_id);
        assert!(!vema.sets_confirm_flag);
        assert_eq!(vema.commit, CommitSignal::None);
    }

    #[test]
    fn test_unknown_profile_falls_back_to_generic() {
        assert_eq!(ConnectorPolicy::by_name("allianz-x"), ConnectorPolicy::GENERIC);
        assert_eq!(ConnectorPolicy::by_name("degenia"), ConnectorPolicy::GENERIC);
    }
}
