//! Topology guard for subscription modes.

use crate::error::{PubSubError, Result};
use crate::types::{SubscriptionMode, Topology};

/// Check that `mode` is usable under `topology`.
///
/// Sharded subscriptions only exist on cluster deployments. This runs before
/// any registry mutation so a rejected call leaves no trace.
pub fn validate(mode: SubscriptionMode, topology: Topology) -> Result<()> {
    match (mode, topology) {
        (SubscriptionMode::Sharded, Topology::Standalone) => {
            Err(PubSubError::InvalidModeForTopology { mode, topology })
        }
        _ => Ok(()),
    }
}
