//! [`ResourceStore`] over the Kubernetes API

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::crd::{Certificate, IngressRoute, Middleware};
use crate::error::{Error, Result};
use crate::reconcile::{ManagedResource, ResourceStore};

/// Field manager of every server-side apply
pub const FIELD_MANAGER: &str = "showcase-deployer";

macro_rules! impl_managed_resource {
    ($($kind:ty),+ $(,)?) => {$(
        impl ManagedResource for $kind {
            fn resource_name(&self) -> String {
                self.name_any()
            }

            fn resource_labels(&self) -> BTreeMap<String, String> {
                self.labels().clone()
            }

            fn set_resource_labels(&mut self, labels: BTreeMap<String, String>) {
                *self.labels_mut() = labels;
            }
        }
    )+};
}

impl_managed_resource!(StatefulSet, Secret, Service, Middleware, IngressRoute, Certificate);

/// Namespaced objects of one kind selected by a label selector
pub struct KubeStore<K> {
    api: Api<K>,
    selector: String,
    kind: &'static str,
}

impl<K> KubeStore<K> {
    pub fn new(api: Api<K>, selector: impl Into<String>, kind: &'static str) -> Self {
        Self {
            api,
            selector: selector.into(),
            kind,
        }
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + ManagedResource
        + DeserializeOwned
        + Debug
        + 'static,
    K::DynamicType: Default,
{
    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn list(&self) -> Result<Vec<K>> {
        let list = self
            .api
            .list(&ListParams::default().labels(&self.selector))
            .await?;
        Ok(list.items)
    }

    async fn apply(&self, resource: &K) -> Result<()> {
        let name = resource.resource_name();
        self.api
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(resource),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::foreground()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(kind = self.kind, name, "Already deleted");
                Ok(())
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}
