//! In-memory [`ClusterClient`] used by unit tests.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;
use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
    chrono::Utc,
};
use kube::api::{DynamicObject, GroupVersionKind};
use multiclusterhub_operator_apis::{MultiClusterHub, MultiClusterHubSpec};

use crate::{
    cluster_client::{ClusterClient, ManagedObject, ObjectKey},
    errors::{ControllerError, api_error},
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Op {
    Get,
    List,
    Create,
    Update,
    Delete,
    PatchHub,
    UpdateHubStatus,
}

#[derive(Default)]
struct State {
    objects: HashMap<ObjectKey, DynamicObject>,
    hubs: HashMap<(String, String), MultiClusterHub>,
    calls: Vec<(Op, String)>,
    failures: HashMap<(Op, String), u16>,
    /// Objects which are only marked for deletion when deleted.
    finalizing: HashSet<ObjectKey>,
    /// Create calls answer with a conflict while still storing the object.
    racing_creates: HashSet<ObjectKey>,
    resource_version: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

#[derive(Default)]
pub(crate) struct FakeClusterClient {
    state: Mutex<State>,
}

impl FakeClusterClient {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&self, object: ManagedObject) -> ManagedObject {
        let mut state = self.state.lock().unwrap();
        let mut obj = object.to_dynamic().unwrap();
        obj.metadata.resource_version = Some(state.next_version());
        state.objects.insert(object.key(), obj.clone());
        ManagedObject::from_dynamic(obj).unwrap()
    }

    pub fn insert_hub(&self, mut hub: MultiClusterHub) -> MultiClusterHub {
        let mut state = self.state.lock().unwrap();
        hub.metadata.resource_version = Some(state.next_version());
        let key = (
            hub.metadata.namespace.clone().unwrap_or_default(),
            hub.metadata.name.clone().unwrap_or_default(),
        );
        state.hubs.insert(key, hub.clone());
        hub
    }

    pub fn hub(&self, namespace: &str, name: &str) -> Option<MultiClusterHub> {
        let state = self.state.lock().unwrap();
        state
            .hubs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn object(&self, key: &ObjectKey) -> Option<ManagedObject> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(key)
            .cloned()
            .map(|o| ManagedObject::from_dynamic(o).unwrap())
    }

    /// Drop `key` as if its finalizers completed.
    pub fn remove(&self, key: &ObjectKey) {
        self.state.lock().unwrap().objects.remove(key);
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.state.lock().unwrap().objects.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    /// Snapshot of all stored objects, for idempotence comparisons.
    pub fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::to_value(v).unwrap()))
            .collect()
    }

    /// Let `op` on an object named `name` fail with the given HTTP status code.
    pub fn fail(&self, op: Op, name: &str, code: u16) {
        let mut state = self.state.lock().unwrap();
        state.failures.insert((op, name.to_string()), code);
    }

    /// Deleting `key` only sets a deletion timestamp, as if a finalizer was pending.
    pub fn finalize_slowly(&self, key: ObjectKey) {
        self.state.lock().unwrap().finalizing.insert(key);
    }

    /// Creating `key` stores the object but answers with a conflict.
    pub fn race_create(&self, key: ObjectKey) {
        self.state.lock().unwrap().racing_creates.insert(key);
    }

    pub fn calls(&self, op: Op) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .calls
            .iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn count(&self, op: Op) -> usize {
        self.calls(op).len()
    }

    pub fn mutations(&self) -> usize {
        self.count(Op::Create) + self.count(Op::Update) + self.count(Op::Delete)
    }

    pub fn reset_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn record(&self, op: Op, name: &str) -> Result<(), ControllerError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push((op.clone(), name.to_string()));
        match state.failures.get(&(op, name.to_string())) {
            Some(code) => Err(api_error(*code, "Injected")),
            None => Ok(()),
        }
    }
}

fn not_found() -> ControllerError {
    api_error(404, "NotFound")
}

fn selector_matches(meta: &ObjectMeta, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels = meta.labels.clone().unwrap_or_default();
    selector.split(',').filter(|s| !s.is_empty()).all(|term| {
        match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(|l| l == v.trim()).unwrap_or(false),
            None => labels.contains_key(term.trim()),
        }
    })
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn get(&self, key: &ObjectKey) -> Result<ManagedObject, ControllerError> {
        self.record(Op::Get, &key.name)?;
        let obj = {
            let state = self.state.lock().unwrap();
            state.objects.get(key).cloned()
        };
        match obj {
            Some(obj) => ManagedObject::from_dynamic(obj),
            None => Err(not_found()),
        }
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<ManagedObject>, ControllerError> {
        self.record(Op::List, &gvk.kind)?;
        let items: Vec<DynamicObject> = {
            let state = self.state.lock().unwrap();
            let mut items: Vec<(&ObjectKey, &DynamicObject)> = state
                .objects
                .iter()
                .filter(|(k, _)| &k.gvk == gvk)
                .filter(|(k, _)| namespace.is_none() || k.namespace.as_deref() == namespace)
                .filter(|(_, o)| selector_matches(&o.metadata, label_selector))
                .collect();
            items.sort_by(|a, b| a.0.name.cmp(&b.0.name));
            items.into_iter().map(|(_, o)| o.clone()).collect()
        };
        items.into_iter().map(ManagedObject::from_dynamic).collect()
    }

    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject, ControllerError> {
        self.record(Op::Create, object.name())?;
        let key = object.key();
        let mut state = self.state.lock().unwrap();
        if state.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut obj = object.to_dynamic()?;
        obj.metadata.resource_version = Some(state.next_version());
        state.objects.insert(key.clone(), obj.clone());
        if state.racing_creates.remove(&key) {
            return Err(api_error(409, "AlreadyExists"));
        }
        ManagedObject::from_dynamic(obj)
    }

    async fn update(&self, object: &ManagedObject) -> Result<ManagedObject, ControllerError> {
        self.record(Op::Update, object.name())?;
        let key = object.key();
        let mut state = self.state.lock().unwrap();
        let current = state.objects.get(&key).ok_or_else(not_found)?;
        if current.metadata.resource_version != object.meta().resource_version {
            return Err(api_error(409, "Conflict"));
        }
        let mut obj = object.to_dynamic()?;
        obj.metadata.resource_version = Some(state.next_version());
        state.objects.insert(key, obj.clone());
        ManagedObject::from_dynamic(obj)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        self.record(Op::Delete, &key.name)?;
        let mut state = self.state.lock().unwrap();
        if !state.objects.contains_key(key) {
            return Err(not_found());
        }
        if state.finalizing.contains(key) {
            if let Some(obj) = state.objects.get_mut(key) {
                obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
            }
        } else {
            state.objects.remove(key);
        }
        Ok(())
    }

    async fn get_hub(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<MultiClusterHub, ControllerError> {
        self.record(Op::Get, name)?;
        self.hub(namespace, name).ok_or_else(not_found)
    }

    async fn patch_hub(
        &self,
        hub: &MultiClusterHub,
        patch: json_patch::Patch,
    ) -> Result<MultiClusterHub, ControllerError> {
        let name = hub.metadata.name.clone().unwrap_or_default();
        let namespace = hub.metadata.namespace.clone().unwrap_or_default();
        self.record(Op::PatchHub, &name)?;
        let mut state = self.state.lock().unwrap();
        let key = (namespace, name);
        let current = state.hubs.get(&key).cloned().ok_or_else(not_found)?;
        let mut doc = serde_json::to_value(&current)?;
        json_patch::patch(&mut doc, &patch.0)
            .map_err(|e| ControllerError::Any(anyhow::anyhow!("{}", e)))?;
        let mut patched: MultiClusterHub = serde_json::from_value(doc)?;
        patched.metadata.resource_version = Some(state.next_version());
        let finalized = patched.metadata.deletion_timestamp.is_some()
            && patched
                .metadata
                .finalizers
                .as_ref()
                .map_or(true, |f| f.is_empty());
        if finalized {
            state.hubs.remove(&key);
        } else {
            state.hubs.insert(key, patched.clone());
        }
        Ok(patched)
    }

    async fn update_hub_status(
        &self,
        hub: &MultiClusterHub,
    ) -> Result<MultiClusterHub, ControllerError> {
        let name = hub.metadata.name.clone().unwrap_or_default();
        let namespace = hub.metadata.namespace.clone().unwrap_or_default();
        self.record(Op::UpdateHubStatus, &name)?;
        let mut state = self.state.lock().unwrap();
        let key = (namespace, name);
        let current = state.hubs.get(&key).cloned().ok_or_else(not_found)?;
        if current.metadata.resource_version != hub.metadata.resource_version {
            return Err(api_error(409, "Conflict"));
        }
        let mut updated = current;
        updated.status = hub.status.clone();
        updated.metadata.resource_version = Some(state.next_version());
        state.hubs.insert(key, updated.clone());
        Ok(updated)
    }
}

/// A hub named `multiclusterhub` in namespace `ocm` with the given spec.
pub(crate) fn hub(spec: MultiClusterHubSpec) -> MultiClusterHub {
    MultiClusterHub {
        metadata: ObjectMeta {
            name: Some("multiclusterhub".to_string()),
            namespace: Some("ocm".to_string()),
            uid: Some("5f6c1a52-1f54-4f7e-9a4d-4bb7c1a9d0e1".to_string()),
            ..Default::default()
        },
        spec,
        status: None,
    }
}
