//! Decides whether an observed object drifted from the desired one in the fields
//! this operator owns and, if so, produces the copy to write back.
//!
//! Fields outside of the owned set (annotations set by others, cluster assigned
//! service IPs, status, ...) are always taken from the observed object.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{ConfigMap, Container, PodSpec, Secret, Service},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};

use crate::{cluster_client::ManagedObject, errors::ControllerError};

/// Outcome of a comparison. When `changed` is false `patched` equals the observed object.
#[derive(Clone, Debug)]
pub(crate) struct Comparison<T> {
    pub patched: T,
    pub changed: bool,
}

impl<T> Comparison<T> {
    fn map<U>(self, f: impl FnOnce(T) -> U) -> Comparison<U> {
        Comparison {
            patched: f(self.patched),
            changed: self.changed,
        }
    }
}

pub(crate) fn compare(
    desired: &ManagedObject,
    observed: &ManagedObject,
) -> Result<Comparison<ManagedObject>, ControllerError> {
    Ok(match (desired, observed) {
        (ManagedObject::Deployment(d), ManagedObject::Deployment(o)) => {
            compare_deployment(d, o).map(ManagedObject::Deployment)
        }
        (ManagedObject::Service(d), ManagedObject::Service(o)) => {
            compare_service(d, o).map(ManagedObject::Service)
        }
        (ManagedObject::Secret(d), ManagedObject::Secret(o)) => {
            compare_secret(d, o).map(ManagedObject::Secret)
        }
        (ManagedObject::ConfigMap(d), ManagedObject::ConfigMap(o)) => {
            compare_configmap(d, o).map(ManagedObject::ConfigMap)
        }
        (ManagedObject::Unstructured(d), ManagedObject::Unstructured(o)) if d.types == o.types => {
            let mut patched = o.clone();
            let mut changed = merge_labels(&d.metadata, &mut patched.metadata);
            let desired_spec = d.data.get("spec");
            if desired_spec.is_some() && desired_spec != o.data.get("spec") {
                if let (Some(target), Some(spec)) = (patched.data.as_object_mut(), desired_spec) {
                    target.insert("spec".to_string(), spec.clone());
                    changed = true;
                }
            }
            Comparison { patched, changed }.map(ManagedObject::Unstructured)
        }
        (d, o) => {
            return Err(ControllerError::InvalidObject(format!(
                "cannot compare {} with {}",
                d.key(),
                o.key()
            )));
        }
    })
}

/// Make sure every desired label is present on `patched`.
fn merge_labels(desired: &ObjectMeta, patched: &mut ObjectMeta) -> bool {
    let Some(wanted) = desired.labels.as_ref().filter(|l| !l.is_empty()) else {
        return false;
    };
    let labels = patched.labels.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (k, v) in wanted {
        if labels.get(k) != Some(v) {
            labels.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

fn contains_map(have: Option<&BTreeMap<String, String>>, want: Option<&BTreeMap<String, String>>) -> bool {
    match want {
        None => true,
        Some(want) => {
            let empty = BTreeMap::new();
            let have = have.unwrap_or(&empty);
            want.iter().all(|(k, v)| have.get(k) == Some(v))
        }
    }
}

fn first_container(pod: &PodSpec) -> Option<&Container> {
    pod.containers.first()
}

pub(crate) fn compare_deployment(desired: &Deployment, observed: &Deployment) -> Comparison<Deployment> {
    let mut patched = observed.clone();
    let mut changed = merge_labels(&desired.metadata, &mut patched.metadata);

    let desired_spec = desired.spec.clone().unwrap_or_default();
    let desired_pod = desired_spec.template.spec.clone().unwrap_or_default();
    let spec = patched.spec.get_or_insert_with(Default::default);

    if spec.replicas != desired_spec.replicas && desired_spec.replicas.is_some() {
        debug!("enforcing replicas on deployment {:?}", desired.metadata.name);
        spec.replicas = desired_spec.replicas;
        changed = true;
    }

    let pod = spec.template.spec.get_or_insert_with(Default::default);

    for secret in desired_pod.image_pull_secrets.iter().flatten() {
        let secrets = pod.image_pull_secrets.get_or_insert_with(Vec::new);
        if !secrets.iter().any(|s| s.name == secret.name) {
            secrets.push(secret.clone());
            changed = true;
        }
    }

    if !contains_map(pod.node_selector.as_ref(), desired_pod.node_selector.as_ref()) {
        pod.node_selector = desired_pod.node_selector.clone();
        changed = true;
    }

    if let Some(want) = first_container(&desired_pod) {
        if pod.containers.is_empty() {
            pod.containers = desired_pod.containers.clone();
            changed = true;
        } else {
            let container = &mut pod.containers[0];
            if container.image != want.image {
                container.image = want.image.clone();
                changed = true;
            }
            if container.image_pull_policy != want.image_pull_policy {
                container.image_pull_policy = want.image_pull_policy.clone();
                changed = true;
            }
            if want.args.is_some() && container.args != want.args {
                container.args = want.args.clone();
                changed = true;
            }
            if want.env.is_some() && container.env != want.env {
                container.env = want.env.clone();
                changed = true;
            }
            if want.volume_mounts.is_some() && container.volume_mounts != want.volume_mounts {
                container.volume_mounts = want.volume_mounts.clone();
                changed = true;
            }
        }
    }

    Comparison { patched, changed }
}

pub(crate) fn compare_service(desired: &Service, observed: &Service) -> Comparison<Service> {
    let mut patched = observed.clone();
    let mut changed = merge_labels(&desired.metadata, &mut patched.metadata);
    let want = desired.spec.clone().unwrap_or_default();
    let spec = patched.spec.get_or_insert_with(Default::default);
    if want.ports.is_some() && spec.ports != want.ports {
        spec.ports = want.ports;
        changed = true;
    }
    if want.selector.is_some() && spec.selector != want.selector {
        spec.selector = want.selector;
        changed = true;
    }
    if want.type_.is_some() && spec.type_ != want.type_ {
        spec.type_ = want.type_;
        changed = true;
    }
    Comparison { patched, changed }
}

pub(crate) fn compare_secret(desired: &Secret, observed: &Secret) -> Comparison<Secret> {
    let mut patched = observed.clone();
    let mut changed = merge_labels(&desired.metadata, &mut patched.metadata);
    if desired.type_.is_some() && patched.type_ != desired.type_ {
        patched.type_ = desired.type_.clone();
        changed = true;
    }
    if patched.data != desired.data {
        patched.data = desired.data.clone();
        changed = true;
    }
    Comparison { patched, changed }
}

pub(crate) fn compare_configmap(desired: &ConfigMap, observed: &ConfigMap) -> Comparison<ConfigMap> {
    let mut patched = observed.clone();
    let mut changed = merge_labels(&desired.metadata, &mut patched.metadata);
    if patched.data != desired.data {
        patched.data = desired.data.clone();
        changed = true;
    }
    Comparison { patched, changed }
}
