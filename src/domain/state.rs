//! Desired state snapshots handed to the backends

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::application::{Application, Website};

/// One runtime application resolved to a concrete image
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeDesiredState {
    pub app: Application,
    pub image_name: String,
    pub image_tag: String,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
}

impl RuntimeDesiredState {
    pub fn image(&self) -> String {
        format!("{}:{}", self.image_name, self.image_tag)
    }
}

/// One website of a static application, served from a build artifact
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticSite {
    pub application: Application,
    pub website: Website,
    pub artifact_id: String,
}

/// Everything that should be running, as of one reconciliation pass
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    #[serde(default)]
    pub runtime: Vec<RuntimeDesiredState>,
    #[serde(default)]
    pub static_sites: Vec<StaticSite>,
}

impl DesiredState {
    /// Websites of runtime applications, paired with their application
    pub fn runtime_websites(&self) -> impl Iterator<Item = (&Application, &Website)> {
        self.runtime
            .iter()
            .flat_map(|rt| rt.app.websites.iter().map(move |w| (&rt.app, w)))
    }

    /// Every website the pass routes, runtime and static
    pub fn all_websites(&self) -> impl Iterator<Item = (&Application, &Website)> {
        self.runtime_websites().chain(
            self.static_sites
                .iter()
                .map(|site| (&site.application, &site.website)),
        )
    }
}

/// Input of the leader-only pass over cluster-wide shared resources
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredStateLeader {
    #[serde(default)]
    pub runtime: Vec<RuntimeDesiredState>,
    #[serde(default)]
    pub static_sites: Vec<StaticSite>,
}

impl From<DesiredState> for DesiredStateLeader {
    fn from(state: DesiredState) -> Self {
        Self {
            runtime: state.runtime,
            static_sites: state.static_sites,
        }
    }
}

impl DesiredStateLeader {
    /// HTTPS websites, whose certificates the leader keeps issued
    pub fn https_websites(&self) -> impl Iterator<Item = &Website> {
        self.runtime
            .iter()
            .flat_map(|rt| rt.app.websites.iter())
            .chain(self.static_sites.iter().map(|site| &site.website))
            .filter(|w| w.https)
    }
}
