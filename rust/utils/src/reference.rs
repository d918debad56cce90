//! References to namespaced objects that the operator is configured with, but doesn't own a CRD for.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::api::core::v1::{ConfigMap, Secret},
    kube::runtime::reflector::ObjectRef,
};

/// A `(namespace, name)` pair.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// An [`ObjectRef`] for logging/errors
    pub fn object_ref<K>(&self) -> ObjectRef<K>
    where
        K: stackable_operator::kube::Resource<DynamicType = ()>,
    {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

impl Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&NamespacedName> for ObjectRef<Secret> {
    fn from(val: &NamespacedName) -> Self {
        val.object_ref()
    }
}
impl From<&NamespacedName> for ObjectRef<ConfigMap> {
    fn from(val: &NamespacedName) -> Self {
        val.object_ref()
    }
}
