//! Node placement for application workloads
//!
//! Applications are pinned to one host of the configured pool with
//! rendezvous (highest random weight) hashing, so placement does not depend
//! on pool order and shrinking the pool only moves the applications that
//! lived on the removed host.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Toleration, TopologySpreadConstraint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use sha2::{Digest, Sha256};

use crate::config::SchedulingConfig;

/// Scheduling constraints for one application's pods
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Placement {
    pub node_selector: Option<BTreeMap<String, String>>,
    pub tolerations: Vec<Toleration>,
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
}

/// Pick the host for `app_id`, or `None` for an empty pool
pub fn select_node<'a>(app_id: &str, pool: &'a [String]) -> Option<&'a str> {
    pool.iter()
        .map(|host| (weight(app_id, host), host))
        .max_by(|(wa, ha), (wb, hb)| wa.cmp(wb).then_with(|| hb.cmp(ha)))
        .map(|(_, host)| host.as_str())
}

fn weight(app_id: &str, host: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(app_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(host.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Build the placement of one application
///
/// `selector_labels` identify the application's pods for topology spread.
pub fn placement(
    app_id: &str,
    scheduling: &SchedulingConfig,
    selector_labels: &BTreeMap<String, String>,
) -> Placement {
    let node_selector = select_node(app_id, &scheduling.node_pool).map(|host| {
        BTreeMap::from([(scheduling.node_label.clone(), host.to_string())])
    });

    let tolerations = scheduling
        .tolerations
        .iter()
        .map(|t| Toleration {
            key: Some(t.key.clone()),
            operator: Some(t.operator.clone()),
            value: t.value.clone(),
            effect: t.effect.clone(),
            ..Default::default()
        })
        .collect();

    let topology_spread_constraints = scheduling
        .spread_constraints
        .iter()
        .map(|c| TopologySpreadConstraint {
            topology_key: c.topology_key.clone(),
            max_skew: c.max_skew,
            when_unsatisfiable: c.when_unsatisfiable.clone(),
            label_selector: Some(LabelSelector {
                match_labels: Some(selector_labels.clone()),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    Placement {
        node_selector,
        tolerations,
        topology_spread_constraints,
    }
}
