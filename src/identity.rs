use std::fmt;
use std::hash::{Hash, Hasher};

use kube::api::DynamicObject;
use kube::discovery::ApiResource;

use crate::error::{Error, Result};

/// Collection address of a resource kind: `(group, version, plural)`.
///
/// The plural is `lowercase(kind) + "s"`. Kinds with irregular plurals
/// (`Ingress`, `NetworkPolicy`, ...) resolve to the wrong collection.
#[derive(Clone, Debug)]
pub struct ResourceIdentity {
    pub group: String,
    pub version: String,
    pub plural: String,
    pub kind: String,
}

impl ResourceIdentity {
    pub fn new(api_version: &str, kind: &str) -> Self {
        let (group, version) = split_api_version(api_version);
        Self {
            group: group.to_string(),
            version: version.to_string(),
            plural: pluralize(kind),
            kind: kind.to_string(),
        }
    }

    pub fn of(object: &DynamicObject) -> Result<Self> {
        let types = object
            .types
            .as_ref()
            .ok_or_else(|| Error::Configuration(format!("{} has no apiVersion/kind", describe(object))))?;
        if types.kind.is_empty() || types.api_version.is_empty() {
            return Err(Error::Configuration(format!(
                "{} has an empty apiVersion or kind",
                describe(object)
            )));
        }
        Ok(Self::new(&types.api_version, &types.kind))
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

impl PartialEq for ResourceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group && self.version == other.version && self.plural == other.plural
    }
}

impl Eq for ResourceIdentity {}

impl Hash for ResourceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.group.hash(state);
        self.version.hash(state);
        self.plural.hash(state);
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.plural)
    }
}

pub fn pluralize(kind: &str) -> String {
    format!("{}s", kind.to_lowercase())
}

fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

fn describe(object: &DynamicObject) -> String {
    format!(
        "manifest {}",
        object.metadata.name.as_deref().unwrap_or("<unnamed>")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouped_and_core_api_versions() {
        let deploy = ResourceIdentity::new("apps/v1", "Deployment");
        assert_eq!(deploy.group, "apps");
        assert_eq!(deploy.version, "v1");
        assert_eq!(deploy.plural, "deployments");
        assert_eq!(deploy.to_string(), "apps/v1/deployments");

        let svc = ResourceIdentity::new("v1", "Service");
        assert_eq!(svc.group, "");
        assert_eq!(svc.api_version(), "v1");
        assert_eq!(svc.to_string(), "v1/services");
    }

    #[test]
    fn irregular_plurals_are_not_special_cased() {
        assert_eq!(pluralize("Ingress"), "ingresss");
        assert_eq!(pluralize("NetworkPolicy"), "networkpolicys");
    }

    #[test]
    fn equality_ignores_kind_spelling() {
        let a = ResourceIdentity::new("example.io/v1", "Widget");
        let b = ResourceIdentity::new("example.io/v1", "WIDGET");
        assert_eq!(a, b);
    }

    #[test]
    fn manifest_without_types_is_a_configuration_error() {
        let object: DynamicObject = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "web" }
        }))
        .unwrap();
        let err = ResourceIdentity::of(&object).unwrap_err();
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn api_resource_carries_the_plural() {
        let ar = ResourceIdentity::new("apps/v1", "StatefulSet").api_resource();
        assert_eq!(ar.plural, "statefulsets");
        assert_eq!(ar.api_version, "apps/v1");
        assert_eq!(ar.kind, "StatefulSet");
    }
}
