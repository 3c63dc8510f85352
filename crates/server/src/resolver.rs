//! Effective-policy resolution.
//!
//! A pure function over the candidate rows: per scope the highest version
//! wins, the most specific scope dominates (device > group > global), and
//! the metric map is filtered down to the device's advertised capabilities.
//! Equal inputs always produce equal output and an equal entity tag.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::stores::policy::{PolicyRow, PolicyScope};
use fleet_common::api::EffectivePolicy;
use fleet_common::types::{Capability, PolicyConfig};

/// Pick the winning row, if any.
pub fn resolve<'a>(
    policies: &'a [PolicyRow],
    device_id: Uuid,
    group_id: Option<i64>,
) -> Option<&'a PolicyRow> {
    let mut global: Option<&PolicyRow> = None;
    let mut group: Option<&PolicyRow> = None;
    let mut device: Option<&PolicyRow> = None;

    for policy in policies {
        let slot = match policy.scope {
            PolicyScope::Global => &mut global,
            PolicyScope::Group if policy.group_id.is_some() && policy.group_id == group_id => {
                &mut group
            }
            PolicyScope::Device if policy.device_id == Some(device_id) => &mut device,
            _ => continue,
        };
        if slot.map(|p| policy.version > p.version).unwrap_or(true) {
            *slot = Some(policy);
        }
    }

    device.or(group).or(global)
}

/// Resolve, filter by capabilities and compute the entity tag. Returns the
/// default policy when nothing matches.
pub fn effective_policy(
    policies: &[PolicyRow],
    device_id: Uuid,
    group_id: Option<i64>,
    capabilities: &[Capability],
) -> (EffectivePolicy, String) {
    let (mut config, version, etag) = match resolve(policies, device_id, group_id) {
        Some(winner) => (
            winner.config.clone(),
            winner.version,
            etag(winner.policy_id, winner.scope.as_str(), winner.version),
        ),
        None => (PolicyConfig::default(), 0, etag(0, "default", 0)),
    };

    config
        .metrics
        .retain(|name, _| capabilities.iter().any(|c| &c.name == name));

    (EffectivePolicy { version, config }, etag)
}

/// Stable hash of the winning row's identity, served as a quoted ETag.
pub fn etag(policy_id: i64, scope: &str, version: i32) -> String {
    let digest = Sha256::digest(format!("{policy_id}-{scope}-{version}").as_bytes());
    let hex: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
    format!("\"{hex}\"")
}
