//! Typed access to the handful of cluster operations the operator needs.
//!
//! All writes go through [`ClusterClient`], which deals in [`DynamicObject`]s so that a single implementation
//! covers every kind (namespaced and cluster-scoped alike). The typed helpers in this module convert at the edge.

use std::fmt::Debug;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use stackable_operator::kube::{
    self,
    api::{ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    runtime::reflector::ObjectRef,
    Api, Resource, ResourceExt,
};

use crate::error::{ClassifyError, FailureKind};

/// Anything that can be sent through a [`ClusterClient`].
pub trait Object:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}
impl<K> Object for K where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get {object}"))]
    Get {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to create {object}"))]
    Create {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to update {object}"))]
    Replace {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to patch {object}"))]
    Patch {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to delete {object}"))]
    Delete {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to list {kind}"))]
    List { source: kube::Error, kind: String },

    #[snafu(display("failed to convert {object}"))]
    Convert {
        source: serde_json::Error,
        object: ObjectRef<DynamicObject>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ClassifyError for Error {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Get { source, .. } => source.failure_kind(),
            Error::Create { source, .. } => source.failure_kind(),
            Error::Replace { source, .. } => source.failure_kind(),
            Error::Patch { source, .. } => source.failure_kind(),
            Error::Delete { source, .. } => source.failure_kind(),
            Error::List { source, .. } => source.failure_kind(),
            Error::Convert { .. } => FailureKind::Fatal,
        }
    }
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, kube::Error>;

    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error>;

    /// Conditional on `obj.metadata.resourceVersion`.
    async fn replace(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error>;

    /// Supports [`Patch::Apply`] (server-side apply) and [`Patch::Merge`] (RFC 7386).
    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &Patch<Value>,
    ) -> Result<DynamicObject, kube::Error>;

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), kube::Error>;

    /// Lists across all namespaces if `namespace` is `None`.
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, kube::Error>;
}

pub struct KubeClusterClient {
    client: kube::Client,
    field_manager: String,
}

impl KubeClusterClient {
    pub fn new(client: &stackable_operator::client::Client, field_manager: impl Into<String>) -> Self {
        Self {
            client: client.as_kube_client(),
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, kube::Error> {
        self.api(resource, namespace).get_opt(name).await
    }

    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        self.api(resource, obj.metadata.namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        self.api(resource, obj.metadata.namespace.as_deref())
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &Patch<Value>,
    ) -> Result<DynamicObject, kube::Error> {
        let params = match patch {
            Patch::Apply(_) => PatchParams::apply(&self.field_manager).force(),
            _ => PatchParams {
                field_manager: Some(self.field_manager.clone()),
                ..PatchParams::default()
            },
        };
        self.api(resource, namespace)
            .patch(name, &params, patch)
            .await
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), kube::Error> {
        self.api(resource, namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, kube::Error> {
        self.api(resource, namespace)
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
    }
}

fn object_ref<K: Object>(namespace: Option<&str>, name: &str) -> ObjectRef<DynamicObject> {
    let object = ObjectRef::<K>::new(name);
    match namespace {
        Some(ns) => object.within(ns),
        None => object,
    }
    .erase()
}

fn to_dynamic<K: Object>(obj: &K) -> Result<DynamicObject> {
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .with_context(|_| ConvertSnafu {
            object: object_ref::<K>(obj.meta().namespace.as_deref(), &obj.name_any()),
        })
}

fn from_dynamic<K: Object>(obj: DynamicObject) -> Result<K> {
    let object = object_ref::<K>(obj.metadata.namespace.as_deref(), &obj.name_any());
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .context(ConvertSnafu { object })
}

pub async fn get_opt<K: Object>(
    client: &impl ClusterClient,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<K>> {
    client
        .get(&ApiResource::erase::<K>(&()), namespace, name)
        .await
        .with_context(|_| GetSnafu {
            object: object_ref::<K>(namespace, name),
        })?
        .map(from_dynamic)
        .transpose()
}

pub async fn create<K: Object>(client: &impl ClusterClient, obj: &K) -> Result<K> {
    let created = client
        .create(&ApiResource::erase::<K>(&()), &to_dynamic(obj)?)
        .await
        .with_context(|_| CreateSnafu {
            object: object_ref::<K>(obj.meta().namespace.as_deref(), &obj.name_any()),
        })?;
    from_dynamic(created)
}

/// Replaces the whole object, failing with a conflict if it changed since `obj` was read.
pub async fn replace<K: Object>(client: &impl ClusterClient, obj: &K) -> Result<K> {
    let replaced = client
        .replace(&ApiResource::erase::<K>(&()), &to_dynamic(obj)?)
        .await
        .with_context(|_| ReplaceSnafu {
            object: object_ref::<K>(obj.meta().namespace.as_deref(), &obj.name_any()),
        })?;
    from_dynamic(replaced)
}

/// Creates `desired`, or replaces the current object with it while keeping the current resourceVersion.
pub async fn create_or_replace<K: Object>(client: &impl ClusterClient, mut desired: K) -> Result<K> {
    let namespace = desired.meta().namespace.clone();
    match get_opt::<K>(client, namespace.as_deref(), &desired.name_any()).await? {
        Some(current) => {
            desired.meta_mut().resource_version = current.meta().resource_version.clone();
            replace(client, &desired).await
        }
        None => create(client, &desired).await,
    }
}

/// Server-side apply of the fields set in `obj`.
pub async fn apply<K: Object>(client: &impl ClusterClient, obj: &K) -> Result<K> {
    let namespace = obj.meta().namespace.clone();
    let name = obj.name_any();
    let object = || object_ref::<K>(namespace.as_deref(), &name);
    let body = serde_json::to_value(obj).with_context(|_| ConvertSnafu { object: object() })?;
    let applied = client
        .patch(
            &ApiResource::erase::<K>(&()),
            namespace.as_deref(),
            &name,
            &Patch::Apply(body),
        )
        .await
        .with_context(|_| PatchSnafu { object: object() })?;
    from_dynamic(applied)
}

/// Sends the JSON merge patch that turns `original` into `modified`.
///
/// The patch carries `original`'s resourceVersion, so it is rejected if the object changed in the meantime.
/// Returns `None` without calling the cluster if there is nothing to change.
pub async fn merge_patch_from<K: Object>(
    client: &impl ClusterClient,
    original: &K,
    modified: &K,
) -> Result<Option<K>> {
    let namespace = original.meta().namespace.clone();
    let name = original.name_any();
    let object = || object_ref::<K>(namespace.as_deref(), &name);
    let before = serde_json::to_value(original).with_context(|_| ConvertSnafu { object: object() })?;
    let after = serde_json::to_value(modified).with_context(|_| ConvertSnafu { object: object() })?;
    let Some(mut patch) = merge_patch_diff(&before, &after) else {
        return Ok(None);
    };
    if let (Value::Object(patch), Some(resource_version)) =
        (&mut patch, &original.meta().resource_version)
    {
        let metadata = patch
            .entry("metadata")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(metadata) = metadata {
            metadata.insert(
                "resourceVersion".to_string(),
                Value::String(resource_version.clone()),
            );
        }
    }
    let patched = client
        .patch(
            &ApiResource::erase::<K>(&()),
            namespace.as_deref(),
            &name,
            &Patch::Merge(patch),
        )
        .await
        .with_context(|_| PatchSnafu { object: object() })?;
    from_dynamic(patched).map(Some)
}

/// Names of all objects of `resource`, in all namespaces if `namespace` is `None`.
pub async fn list_names(
    client: &impl ClusterClient,
    resource: &ApiResource,
    namespace: Option<&str>,
) -> Result<Vec<String>> {
    let objects = client
        .list(resource, namespace)
        .await
        .with_context(|_| ListSnafu {
            kind: resource.kind.clone(),
        })?;
    Ok(objects.iter().map(ResourceExt::name_any).collect())
}

/// Deletes the object, treating an already-missing object as success.
pub async fn delete_ignore_not_found<K: Object>(
    client: &impl ClusterClient,
    namespace: Option<&str>,
    name: &str,
) -> Result<()> {
    match client
        .delete(&ApiResource::erase::<K>(&()), namespace, name)
        .await
    {
        Err(err) if crate::error::is_not_found(&err) => Ok(()),
        res => res.with_context(|_| DeleteSnafu {
            object: object_ref::<K>(namespace, name),
        }),
    }
}

/// Computes the RFC 7386 merge patch from `before` to `after`, or `None` if they are equal.
pub fn merge_patch_diff(before: &Value, after: &Value) -> Option<Value> {
    match (before, after) {
        (Value::Object(before), Value::Object(after)) => {
            let mut patch = serde_json::Map::new();
            for (key, after_value) in after {
                match before.get(key) {
                    Some(before_value) => {
                        if let Some(diff) = merge_patch_diff(before_value, after_value) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), after_value.clone());
                    }
                }
            }
            for key in before.keys() {
                if !after.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        (before, after) if before == after => None,
        // Arrays and scalars are replaced wholesale
        (_, after) => Some(after.clone()),
    }
}


#[cfg(test)]
mod tests {
    use serde_json::json;
    use stackable_operator::{
        k8s_openapi::api::core::v1::ConfigMap, kube::api::ObjectMeta,
    };

    use super::{fake::FakeCluster, *};

    fn config_map(data: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".to_string()),
                namespace: Some("ns".to_string()),
                ..ObjectMeta::default()
            },
            data: Some([("key".to_string(), data.to_string())].into()),
            ..ConfigMap::default()
        }
    }

    #[test]
    fn merge_patch_diff_only_contains_changes() {
        let before = json!({"a": 1, "b": {"c": 2, "d": 3}, "e": [1, 2], "gone": true});
        let after = json!({"a": 1, "b": {"c": 2, "d": 4}, "e": [1, 2, 3], "new": "x"});
        assert_eq!(
            merge_patch_diff(&before, &after),
            Some(json!({"b": {"d": 4}, "e": [1, 2, 3], "new": "x", "gone": null}))
        );
        assert_eq!(merge_patch_diff(&before, &before), None);
    }

    #[tokio::test]
    async fn create_or_replace_creates_then_replaces() {
        let cluster = FakeCluster::default();
        create_or_replace(&cluster, config_map("a")).await.unwrap();
        create_or_replace(&cluster, config_map("b")).await.unwrap();
        assert_eq!(cluster.log(), vec!["create ConfigMap/cm", "replace ConfigMap/cm"]);
        let stored: ConfigMap = cluster.get_typed(Some("ns"), "cm").unwrap();
        assert_eq!(stored.data.unwrap()["key"], "b");
    }

    #[tokio::test]
    async fn stale_merge_patch_is_rejected() {
        let cluster = FakeCluster::default();
        let original = create(&cluster, &config_map("a")).await.unwrap();
        cluster.touch::<ConfigMap>(Some("ns"), "cm");
        let err = merge_patch_from(&cluster, &original, &config_map("b"))
            .await
            .unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::Conflict);
    }

    #[tokio::test]
    async fn merge_patch_without_changes_is_skipped() {
        let cluster = FakeCluster::default();
        let original = create(&cluster, &config_map("a")).await.unwrap();
        cluster.clear_log();
        assert!(merge_patch_from(&cluster, &original, &original.clone())
            .await
            .unwrap()
            .is_none());
        assert!(cluster.log().is_empty());
    }

    #[tokio::test]
    async fn deleting_missing_objects_is_fine() {
        let cluster = FakeCluster::default();
        delete_ignore_not_found::<ConfigMap>(&cluster, Some("ns"), "cm")
            .await
            .unwrap();
        cluster.fail("delete", "ConfigMap", 403);
        let err = delete_ignore_not_found::<ConfigMap>(&cluster, Some("ns"), "cm")
            .await
            .unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::TransportFailure);
    }

    #[tokio::test]
    async fn list_names_filters_by_kind_and_namespace() {
        let cluster = FakeCluster::default();
        create(&cluster, &config_map("a")).await.unwrap();
        let mut other_ns = config_map("a");
        other_ns.metadata.namespace = Some("other".to_string());
        other_ns.metadata.name = Some("cm2".to_string());
        create(&cluster, &other_ns).await.unwrap();

        let resource = ApiResource::erase::<ConfigMap>(&());
        assert_eq!(
            list_names(&cluster, &resource, None).await.unwrap(),
            vec!["cm", "cm2"]
        );
        assert_eq!(
            list_names(&cluster, &resource, Some("other")).await.unwrap(),
            vec!["cm2"]
        );

        cluster.fail("list", "ConfigMap", 500);
        let err = list_names(&cluster, &resource, None).await.unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::TransportFailure);
    }
}
