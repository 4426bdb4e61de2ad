use std::{fmt, future::Future, time::Duration};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{ConfigMap, Secret, Service},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{
    Api, Client,
    api::{
        ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
        PatchParams, PostParams, TypeMeta,
    },
};
use multiclusterhub_operator_apis::MultiClusterHub;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{MANAGER, errors::ControllerError};

/// Identity of a single cluster object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ObjectKey {
    pub gvk: GroupVersionKind,
    /// `None` for cluster scoped objects.
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(gvk: GroupVersionKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            gvk,
            namespace: namespace.map(|v| v.to_string()),
            name: name.to_string(),
        }
    }

    pub fn of<K: k8s_openapi::Resource>(namespace: Option<&str>, name: &str) -> Self {
        Self::new(gvk_of::<K>(), namespace, name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}",
            self.gvk.kind,
            self.namespace.as_deref().unwrap_or(""),
            self.name
        )
    }
}

pub(crate) fn gvk_of<K: k8s_openapi::Resource>() -> GroupVersionKind {
    GroupVersionKind::gvk(K::GROUP, K::VERSION, K::KIND)
}

pub(crate) fn gvk_from_types(types: &TypeMeta) -> GroupVersionKind {
    let (group, version) = match types.api_version.rsplit_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    GroupVersionKind::gvk(group, version, types.kind.as_str())
}

/// Typed read access into schemaless object content.
pub(crate) trait ObjectPath {
    fn value_at(&self, path: &[&str]) -> Option<&Value>;

    fn str_at(&self, path: &[&str]) -> Option<&str> {
        self.value_at(path).and_then(|v| v.as_str())
    }

    fn bool_at(&self, path: &[&str]) -> Option<bool> {
        self.value_at(path).and_then(|v| v.as_bool())
    }

    fn array_at(&self, path: &[&str]) -> Option<&Vec<Value>> {
        self.value_at(path).and_then(|v| v.as_array())
    }
}

impl ObjectPath for Value {
    fn value_at(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(self, |v, segment| v.get(*segment))
    }
}

impl ObjectPath for DynamicObject {
    fn value_at(&self, path: &[&str]) -> Option<&Value> {
        self.data.value_at(path)
    }
}

/// An object managed through the [`ClusterClient`].
///
/// Well known kinds are carried as their typed representation, any other kind
/// (custom resources) as an opaque [`DynamicObject`] with type information.
#[derive(Clone, Debug)]
pub(crate) enum ManagedObject {
    Deployment(Deployment),
    Service(Service),
    Secret(Secret),
    ConfigMap(ConfigMap),
    Unstructured(DynamicObject),
}

impl ManagedObject {
    /// Construct an opaque custom resource, validating that it can be addressed.
    pub fn unstructured(
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
        data: Value,
    ) -> Result<Self, ControllerError> {
        let mut obj = DynamicObject {
            types: Some(TypeMeta {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: namespace.map(|v| v.to_string()),
                ..Default::default()
            },
            data,
        };
        if let Value::Object(map) = &mut obj.data {
            map.remove("apiVersion");
            map.remove("kind");
            map.remove("metadata");
        }
        Self::from_dynamic(obj)
    }

    /// Convert a dynamic object into its typed variant when the kind is known.
    pub fn from_dynamic(obj: DynamicObject) -> Result<Self, ControllerError> {
        let types = obj
            .types
            .as_ref()
            .filter(|t| !t.api_version.is_empty() && !t.kind.is_empty())
            .ok_or_else(|| {
                ControllerError::InvalidObject(format!(
                    "object {} carries no apiVersion/kind",
                    obj.metadata.name.as_deref().unwrap_or("<unnamed>")
                ))
            })?;
        if obj.metadata.name.as_deref().map_or(true, |v| v.is_empty()) {
            return Err(ControllerError::InvalidObject(format!(
                "{} object carries no name",
                types.kind
            )));
        }
        let gvk = gvk_from_types(types);
        Ok(match (gvk.group.as_str(), gvk.kind.as_str()) {
            ("apps", "Deployment") => Self::Deployment(convert(&obj)?),
            ("", "Service") => Self::Service(convert(&obj)?),
            ("", "Secret") => Self::Secret(convert(&obj)?),
            ("", "ConfigMap") => Self::ConfigMap(convert(&obj)?),
            _ => Self::Unstructured(obj),
        })
    }

    pub fn to_dynamic(&self) -> Result<DynamicObject, ControllerError> {
        let mut obj: DynamicObject = match self {
            Self::Deployment(o) => convert(o)?,
            Self::Service(o) => convert(o)?,
            Self::Secret(o) => convert(o)?,
            Self::ConfigMap(o) => convert(o)?,
            Self::Unstructured(o) => o.clone(),
        };
        let gvk = self.gvk();
        obj.types = Some(TypeMeta {
            api_version: gvk.api_version(),
            kind: gvk.kind,
        });
        Ok(obj)
    }

    pub fn gvk(&self) -> GroupVersionKind {
        match self {
            Self::Deployment(_) => gvk_of::<Deployment>(),
            Self::Service(_) => gvk_of::<Service>(),
            Self::Secret(_) => gvk_of::<Secret>(),
            Self::ConfigMap(_) => gvk_of::<ConfigMap>(),
            Self::Unstructured(o) => o
                .types
                .as_ref()
                .map(gvk_from_types)
                .unwrap_or_else(|| GroupVersionKind::gvk("", "", "")),
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Deployment(o) => &o.metadata,
            Self::Service(o) => &o.metadata,
            Self::Secret(o) => &o.metadata,
            Self::ConfigMap(o) => &o.metadata,
            Self::Unstructured(o) => &o.metadata,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Deployment(o) => &mut o.metadata,
            Self::Service(o) => &mut o.metadata,
            Self::Secret(o) => &mut o.metadata,
            Self::ConfigMap(o) => &mut o.metadata,
            Self::Unstructured(o) => &mut o.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or("")
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.gvk(), self.meta().namespace.as_deref(), self.name())
    }

    pub fn is_terminating(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    pub fn as_deployment(&self) -> Option<&Deployment> {
        match self {
            Self::Deployment(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_unstructured(&self) -> Option<&DynamicObject> {
        match self {
            Self::Unstructured(o) => Some(o),
            _ => None,
        }
    }
}

fn convert<A: Serialize, B: DeserializeOwned>(value: &A) -> Result<B, ControllerError> {
    Ok(serde_json::from_value(serde_json::to_value(value)?)?)
}

/// The operations the reconciler needs from the cluster, passed in explicitly.
#[async_trait]
pub(crate) trait ClusterClient: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<ManagedObject, ControllerError>;

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<ManagedObject>, ControllerError>;

    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject, ControllerError>;

    /// Replace an object; `metadata.resourceVersion` of `object` guards against lost updates.
    async fn update(&self, object: &ManagedObject) -> Result<ManagedObject, ControllerError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), ControllerError>;

    async fn get_hub(&self, namespace: &str, name: &str)
    -> Result<MultiClusterHub, ControllerError>;

    async fn patch_hub(
        &self,
        hub: &MultiClusterHub,
        patch: json_patch::Patch,
    ) -> Result<MultiClusterHub, ControllerError>;

    /// Write the status sub-resource, failing with a conflict if `hub` is outdated.
    async fn update_hub_status(
        &self,
        hub: &MultiClusterHub,
    ) -> Result<MultiClusterHub, ControllerError>;
}

/// [`ClusterClient`] backed by the Kubernetes API, each call bounded by `request_timeout`.
pub(crate) struct KubeClusterClient {
    client: Client,
    request_timeout: Duration,
}

impl KubeClusterClient {
    pub fn new(client: Client, request_timeout: Duration) -> Self {
        Self {
            client,
            request_timeout,
        }
    }

    fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let api_resource = ApiResource::from_gvk(gvk);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &api_resource),
            None => Api::all_with(self.client.clone(), &api_resource),
        }
    }

    fn hub_api(&self, namespace: &str) -> Api<MultiClusterHub> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        let mut pp = PostParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        pp
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(MANAGER.to_string()),
            ..Default::default()
        }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, ControllerError>
    where
        F: Future<Output = kube::Result<T>> + Send,
    {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ControllerError::Timeout(self.request_timeout)),
        }
    }

    fn typed(gvk: &GroupVersionKind, mut obj: DynamicObject) -> Result<ManagedObject, ControllerError> {
        // List items and some get responses omit type information.
        if obj.types.as_ref().map_or(true, |t| t.kind.is_empty()) {
            obj.types = Some(TypeMeta {
                api_version: gvk.api_version(),
                kind: gvk.kind.clone(),
            });
        }
        ManagedObject::from_dynamic(obj)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, key: &ObjectKey) -> Result<ManagedObject, ControllerError> {
        let api = self.api(&key.gvk, key.namespace.as_deref());
        let obj = self.bounded(api.get(key.name.as_str())).await?;
        Self::typed(&key.gvk, obj)
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<ManagedObject>, ControllerError> {
        let api = self.api(gvk, namespace);
        let mut lp = ListParams::default();
        if let Some(selector) = label_selector {
            lp = lp.labels(selector);
        }
        let list = self.bounded(api.list(&lp)).await?;
        list.items
            .into_iter()
            .map(|obj| Self::typed(gvk, obj))
            .collect()
    }

    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject, ControllerError> {
        let key = object.key();
        let api = self.api(&key.gvk, key.namespace.as_deref());
        let data = object.to_dynamic()?;
        let created = self.bounded(api.create(&Self::post_params(), &data)).await?;
        Self::typed(&key.gvk, created)
    }

    async fn update(&self, object: &ManagedObject) -> Result<ManagedObject, ControllerError> {
        let key = object.key();
        let api = self.api(&key.gvk, key.namespace.as_deref());
        let data = object.to_dynamic()?;
        let updated = self
            .bounded(api.replace(key.name.as_str(), &Self::post_params(), &data))
            .await?;
        Self::typed(&key.gvk, updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        let api = self.api(&key.gvk, key.namespace.as_deref());
        self.bounded(api.delete(key.name.as_str(), &DeleteParams::background()))
            .await?;
        Ok(())
    }

    async fn get_hub(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<MultiClusterHub, ControllerError> {
        self.bounded(self.hub_api(namespace).get(name)).await
    }

    async fn patch_hub(
        &self,
        hub: &MultiClusterHub,
        patch: json_patch::Patch,
    ) -> Result<MultiClusterHub, ControllerError> {
        let api = self.hub_api(hub.metadata.namespace.as_deref().unwrap_or(""));
        let name = hub.metadata.name.clone().unwrap_or_default();
        self.bounded(api.patch(
            name.as_str(),
            &Self::patch_params(),
            &Patch::<()>::Json(patch),
        ))
        .await
    }

    async fn update_hub_status(
        &self,
        hub: &MultiClusterHub,
    ) -> Result<MultiClusterHub, ControllerError> {
        let api = self.hub_api(hub.metadata.namespace.as_deref().unwrap_or(""));
        let name = hub.metadata.name.clone().unwrap_or_default();
        // Carrying the observed resourceVersion makes the API server reject stale writes.
        let body = serde_json::json!({
            "metadata": { "resourceVersion": hub.metadata.resource_version },
            "status": hub.status,
        });
        self.bounded(api.patch_status(
            name.as_str(),
            &Self::patch_params(),
            &Patch::Merge(&body),
        ))
        .await
    }
}
