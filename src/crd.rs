use std::fmt;

use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "charlescd.io",
    version = "v1",
    kind = "CharlesDeployment",
    plural = "charlesdeployments",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CharlesDeploymentSpec {
    #[serde(default)]
    pub components: Vec<Component>,
}

/// One named entry of a deployment. `chart` points at a kustomization, either
/// a local directory or a remote contents URL.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,
    pub chart: String,
}

impl Component {
    pub fn new(name: impl Into<String>, chart: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chart: chart.into(),
        }
    }
}

impl CharlesDeployment {
    pub fn key(&self) -> ReconcileKey {
        ReconcileKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn owner_kind() -> String {
        Self::kind(&()).to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconcileKey {
    pub namespace: String,
    pub name: String,
}

impl ReconcileKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_namespace_qualified() {
        let mut parent = CharlesDeployment::new(
            "app1",
            CharlesDeploymentSpec {
                components: vec![Component::new("web", "./charts/web")],
            },
        );
        parent.metadata.namespace = Some("ns".into());

        assert_eq!(parent.key(), ReconcileKey::new("ns", "app1"));
        assert_eq!(parent.key().to_string(), "ns/app1");
    }

    #[test]
    fn components_default_to_empty() {
        let spec: CharlesDeploymentSpec = serde_json::from_str("{}").unwrap();
        assert!(spec.components.is_empty());
    }
}
