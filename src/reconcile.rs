//! Generic diff / apply / prune over one resource kind
//!
//! Every kind the backends manage (StatefulSets, Services, Traefik
//! middlewares, containers, ...) goes through [`sync_resources`]:
//!
//! 1. list the resources carrying the ownership labels,
//! 2. hash each next resource and apply it when the stored hash differs,
//! 3. delete listed resources that are no longer wanted.
//!
//! A failed list aborts the pass. Failures on single resources are logged,
//! counted in the [`SyncReport`] and do not stop the remaining work.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::Result;

/// A backend resource the reconciler can hash, label and address by name
pub trait ManagedResource: Serialize + Clone + Send + Sync {
    fn resource_name(&self) -> String;
    fn resource_labels(&self) -> BTreeMap<String, String>;
    fn set_resource_labels(&mut self, labels: BTreeMap<String, String>);
}

/// Storage of one resource kind, scoped to the engine's ownership labels
#[async_trait]
pub trait ResourceStore<T: ManagedResource>: Send + Sync {
    /// Kind name used in logs and metrics
    fn kind(&self) -> &'static str;

    /// Resources carrying the ownership labels of this store
    async fn list(&self) -> Result<Vec<T>>;

    /// Create or replace `resource`
    async fn apply(&self, resource: &T) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;
}

/// Outcome of one [`sync_resources`] call
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub applied: Vec<String>,
    pub unchanged: Vec<String>,
    pub pruned: Vec<String>,
    /// `(name, error)` of resources that could not be applied or pruned
    pub failed: Vec<(String, String)>,
}

impl SyncReport {
    pub fn merge(&mut self, other: SyncReport) {
        self.applied.extend(other.applied);
        self.unchanged.extend(other.unchanged);
        self.pruned.extend(other.pruned);
        self.failed.extend(other.failed);
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Content hash of a resource, ignoring its own hash label
///
/// First 16 bytes of SHA-256 over the JSON serialization, hex encoded, so it
/// fits a Kubernetes label value.
pub fn resource_hash<T: ManagedResource>(resource: &T, hash_label: &str) -> Result<String> {
    let mut unhashed = resource.clone();
    let mut labels = unhashed.resource_labels();
    if labels.remove(hash_label).is_some() {
        unhashed.set_resource_labels(labels);
    }
    let bytes = serde_json::to_vec(&unhashed)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(&digest[..16]))
}

/// Reconcile one kind towards `next`
pub async fn sync_resources<T, S>(store: &S, next: Vec<T>, hash_label: &str) -> Result<SyncReport>
where
    T: ManagedResource,
    S: ResourceStore<T> + ?Sized,
{
    let kind = store.kind();
    let existing: HashMap<String, Option<String>> = store
        .list()
        .await?
        .into_iter()
        .map(|r| {
            let hash = r.resource_labels().get(hash_label).cloned();
            (r.resource_name(), hash)
        })
        .collect();

    let mut report = SyncReport::default();
    let mut wanted = HashSet::new();

    for mut resource in next {
        let name = resource.resource_name();
        wanted.insert(name.clone());

        let hash = match resource_hash(&resource, hash_label) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(kind, %name, "Failed to hash resource: {}", e);
                report.failed.push((name, e.to_string()));
                continue;
            }
        };
        if existing.get(&name).and_then(|h| h.as_deref()) == Some(hash.as_str()) {
            debug!(kind, %name, "Resource unchanged");
            report.unchanged.push(name);
            continue;
        }

        let mut labels = resource.resource_labels();
        labels.insert(hash_label.to_string(), hash);
        resource.set_resource_labels(labels);

        match store.apply(&resource).await {
            Ok(()) => {
                info!(kind, %name, "Applied resource");
                #[cfg(feature = "metrics")]
                crate::metrics::inc_resource_applied(kind);
                report.applied.push(name);
            }
            Err(e) => {
                warn!(kind, %name, "Failed to apply resource: {}", e);
                #[cfg(feature = "metrics")]
                crate::metrics::inc_resource_error(kind, "apply");
                report.failed.push((name, e.to_string()));
            }
        }
    }

    let mut stale: Vec<_> = existing
        .into_keys()
        .filter(|name| !wanted.contains(name))
        .collect();
    stale.sort();
    for name in stale {
        match store.delete(&name).await {
            Ok(()) => {
                info!(kind, %name, "Pruned resource");
                #[cfg(feature = "metrics")]
                crate::metrics::inc_resource_pruned(kind);
                report.pruned.push(name);
            }
            Err(e) => {
                warn!(kind, %name, "Failed to prune resource: {}", e);
                #[cfg(feature = "metrics")]
                crate::metrics::inc_resource_error(kind, "prune");
                report.failed.push((name, e.to_string()));
            }
        }
    }

    Ok(report)
}
