//! Ordered removal of everything a hub installed, run while its finalizer is pending,
//! and pruning of objects left behind by earlier releases.

use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{Secret, Service},
    },
    chrono::{DateTime, Utc},
};
use kube::api::GroupVersionKind;
use multiclusterhub_operator_apis::{
    HubCondition, MultiClusterHub, MultiClusterHubStatus, PROGRESSING, TERMINATING,
};

use crate::{
    cluster_client::{ClusterClient, ManagedObject, ObjectKey},
    components::{
        CHANNEL_NAME, REPO_NAME, SUBSCRIPTIONS, channel_gvk, helm_release_gvk, subscription_gvk,
        subscription_name,
    },
    errors::{ControllerError, ExtKubeApiError},
    status::{
        ALL_OLD_RESOURCES_DELETED, HELM_RELEASE_TERMINATING, OLD_RESOURCE_DELETE_FAILED,
        OLD_RESOURCE_DELETED, hub_pruning, set_condition,
    },
    utils::{CERT_MANAGER_NAMESPACE, installer_labels, installer_selector},
};

/// Cluster scoped kinds cleaned up by installer label.
pub(crate) const LABEL_CLEANUP_KINDS: [(&'static str, &'static str, &'static str); 7] = [
    ("hive.openshift.io", "v1", "HiveConfig"),
    ("apiregistration.k8s.io", "v1", "APIService"),
    ("rbac.authorization.k8s.io", "v1", "ClusterRole"),
    ("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding"),
    ("admissionregistration.k8s.io", "v1", "MutatingWebhookConfiguration"),
    ("apiextensions.k8s.io", "v1", "CustomResourceDefinition"),
    ("operator.open-cluster-management.io", "v1", "ClusterManager"),
];

/// Kinds in the hub namespace cleaned up by installer label.
pub(crate) const NAMESPACED_CLEANUP_KINDS: [(&'static str, &'static str, &'static str); 3] = [
    ("apps.open-cluster-management.io", "v1", "Subscription"),
    ("apps", "v1", "Deployment"),
    ("", "v1", "Service"),
];

const LEGACY_SUBSCRIPTIONS: [&'static str; 2] = ["assisted-service-sub", "application-chart-sub"];

const SEARCH_CRDS: [&'static str; 2] = [
    "searchcustomizations.search.open-cluster-management.io",
    "searchoperators.search.open-cluster-management.io",
];

fn crd_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("apiextensions.k8s.io", "v1", "CustomResourceDefinition")
}

/// Objects removed on uninstall, derived from the hub spec alone.
pub(crate) fn uninstall_targets(hub: &MultiClusterHub) -> Vec<ObjectKey> {
    let namespace = hub.metadata.namespace.as_deref();
    let mut targets: Vec<ObjectKey> = LEGACY_SUBSCRIPTIONS
        .iter()
        .map(|name| ObjectKey::new(subscription_gvk(), namespace, name))
        .collect();
    targets.push(ObjectKey::new(channel_gvk(), namespace, CHANNEL_NAME));
    targets.push(ObjectKey::of::<Deployment>(namespace, REPO_NAME));
    targets.push(ObjectKey::of::<Service>(namespace, REPO_NAME));
    targets.extend(SEARCH_CRDS.iter().map(|name| ObjectKey::new(crd_gvk(), None, name)));
    if hub.spec.separate_certificate_management {
        if let Some(secret) = hub.spec.image_pull_secret() {
            targets.push(ObjectKey::of::<Secret>(Some(CERT_MANAGER_NAMESPACE), secret));
        }
    }
    targets
}

/// Objects of earlier releases that the current one no longer installs.
pub(crate) fn prune_targets(hub: &MultiClusterHub) -> Vec<ObjectKey> {
    let namespace = hub.metadata.namespace.as_deref();
    LEGACY_SUBSCRIPTIONS
        .iter()
        .filter(|name| !SUBSCRIPTIONS.iter().any(|chart| subscription_name(chart) == **name))
        .map(|name| ObjectKey::new(subscription_gvk(), namespace, name))
        .chain(SEARCH_CRDS.iter().map(|name| ObjectKey::new(crd_gvk(), None, name)))
        .collect()
}

/// What one pass observed about a single target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TargetState {
    /// Not looked up yet.
    Unknown,
    /// Present without a deletion timestamp.
    FoundLive,
    /// Deletion requested, finalizers still pending.
    Deleting,
    Gone,
}

impl TargetState {
    pub fn is_terminal(&self) -> bool {
        *self == TargetState::Gone
    }
}

/// Observe `key` and request its deletion when it is still live.
///
/// Progress is recorded as a condition of type `condition_type`.
pub(crate) async fn step_target(
    client: &dyn ClusterClient,
    key: &ObjectKey,
    condition_type: &str,
    status: &mut MultiClusterHubStatus,
    now: DateTime<Utc>,
) -> Result<TargetState, ControllerError> {
    let state = match client.get(key).await {
        Ok(found) if found.is_terminating() => TargetState::Deleting,
        Ok(_) => TargetState::FoundLive,
        Err(e) if e.is_not_found() => TargetState::Gone,
        Err(e) => return Err(e),
    };
    match state {
        TargetState::Deleting => {
            debug!("{} is still being finalized", key);
            let c = HubCondition::new(
                condition_type,
                Some(false),
                OLD_RESOURCE_DELETE_FAILED,
                format!("{} has not been removed yet", key),
            );
            set_condition(status, c, now);
            Ok(TargetState::Deleting)
        }
        TargetState::FoundLive => match client.delete(key).await {
            Ok(()) => {
                info!("deleted {}", key);
                let c = HubCondition::new(
                    condition_type,
                    Some(true),
                    OLD_RESOURCE_DELETED,
                    format!("Deleted {}", key),
                );
                set_condition(status, c, now);
                Ok(TargetState::Deleting)
            }
            Err(e) if e.is_not_found() => Ok(TargetState::Gone),
            Err(e) => {
                error!("failed to delete {}: {}", key, e);
                Err(ControllerError::UninstallFailed(format!(
                    "failed to delete {}: {}",
                    key, e
                )))
            }
        },
        other => Ok(other),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct UninstallReport {
    pub states: Vec<(ObjectKey, TargetState)>,
    pub remaining_helm_releases: Vec<String>,
}

impl UninstallReport {
    pub fn all_clear(&self) -> bool {
        self.remaining_helm_releases.is_empty()
            && self.states.iter().all(|(_, s)| s.is_terminal())
    }

    pub fn pending(&self) -> Vec<&ObjectKey> {
        self.states
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(k, _)| k)
            .collect()
    }
}

pub(crate) struct Uninstaller<'a> {
    client: &'a dyn ClusterClient,
}

impl<'a> Uninstaller<'a> {
    pub fn new(client: &'a dyn ClusterClient) -> Self {
        Self { client }
    }

    /// Add every object of `gvk` carrying the installer labels to `targets`.
    async fn labelled(
        &self,
        hub: &MultiClusterHub,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        targets: &mut Vec<ObjectKey>,
    ) -> Result<(), ControllerError> {
        let selector = installer_selector(hub);
        match self.client.list(gvk, namespace, Some(selector.as_str())).await {
            Ok(found) => {
                for key in found.iter().map(|o| o.key()) {
                    if !targets.contains(&key) {
                        targets.push(key);
                    }
                }
                Ok(())
            }
            // The kind is not served by this cluster.
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Spec derived targets followed by everything still carrying the installer labels.
    pub async fn targets(&self, hub: &MultiClusterHub) -> Result<Vec<ObjectKey>, ControllerError> {
        let mut targets = uninstall_targets(hub);
        for (group, version, kind) in LABEL_CLEANUP_KINDS.iter() {
            let gvk = GroupVersionKind::gvk(group, version, kind);
            self.labelled(hub, &gvk, None, &mut targets).await?;
        }
        let namespace = hub.metadata.namespace.as_deref();
        for (group, version, kind) in NAMESPACED_CLEANUP_KINDS.iter() {
            let gvk = GroupVersionKind::gvk(group, version, kind);
            self.labelled(hub, &gvk, namespace, &mut targets).await?;
        }
        Ok(targets)
    }

    /// Put the installer labels on the helm releases of the hub's subscriptions,
    /// so their removal can be awaited once the subscriptions are gone.
    pub async fn label_helm_releases(&self, hub: &MultiClusterHub) -> Result<usize, ControllerError> {
        let namespace = hub.metadata.namespace.as_deref();
        let selector = installer_selector(hub);
        let subscriptions: Vec<String> = match self
            .client
            .list(&subscription_gvk(), namespace, Some(selector.as_str()))
            .await
        {
            Ok(found) => found.iter().map(|o| o.name().to_string()).collect(),
            Err(e) if e.is_not_found() => return Ok(0),
            Err(e) => return Err(e),
        };
        if subscriptions.is_empty() {
            return Ok(0);
        }
        let releases = match self.client.list(&helm_release_gvk(), namespace, None).await {
            Ok(found) => found,
            Err(e) if e.is_not_found() => return Ok(0),
            Err(e) => return Err(e),
        };
        let labels = installer_labels(hub);
        let mut labelled = 0;
        for mut release in releases {
            if !owned_by_any(&release, &subscriptions) {
                continue;
            }
            let current = release.meta().labels.clone().unwrap_or_default();
            if labels.iter().all(|(k, v)| current.get(k) == Some(v)) {
                continue;
            }
            release
                .meta_mut()
                .labels
                .get_or_insert_with(Default::default)
                .extend(labels.clone());
            match self.client.update(&release).await {
                Ok(_) => {
                    debug!("labelled {}", release.key());
                    labelled += 1;
                }
                Err(e) if e.is_not_found() => (),
                Err(e) => {
                    error!("failed to label {}: {}", release.key(), e);
                    return Err(e);
                }
            }
        }
        Ok(labelled)
    }

    /// One uninstall pass; records progress as `Terminating` conditions on `status`.
    pub async fn run(
        &self,
        hub: &MultiClusterHub,
        status: &mut MultiClusterHubStatus,
        now: DateTime<Utc>,
    ) -> Result<UninstallReport, ControllerError> {
        self.label_helm_releases(hub).await?;
        let mut states: Vec<(ObjectKey, TargetState)> = self
            .targets(hub)
            .await?
            .into_iter()
            .map(|key| (key, TargetState::Unknown))
            .collect();
        for (key, state) in states.iter_mut() {
            *state = step_target(self.client, key, TERMINATING, status, now).await?;
        }

        let remaining_helm_releases: Vec<String> = match self
            .client
            .list(
                &helm_release_gvk(),
                hub.metadata.namespace.as_deref(),
                Some(installer_selector(hub).as_str()),
            )
            .await
        {
            Ok(found) => found.iter().map(|o| o.name().to_string()).collect(),
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        if !remaining_helm_releases.is_empty() {
            let message = format!(
                "Waiting for helmreleases to be removed: {}",
                remaining_helm_releases.join(",")
            );
            info!("{}", message);
            let c = HubCondition::new(TERMINATING, Some(true), HELM_RELEASE_TERMINATING, message);
            set_condition(status, c, now);
        }

        let report = UninstallReport {
            states,
            remaining_helm_releases,
        };
        if report.all_clear() {
            let c = HubCondition::new(
                TERMINATING,
                Some(true),
                ALL_OLD_RESOURCES_DELETED,
                "All hub resources have been removed",
            );
            set_condition(status, c, now);
        }
        Ok(report)
    }

    /// One pruning pass over [`prune_targets`]; records progress as `Progressing`
    /// conditions and returns whether every target is gone.
    pub async fn prune(
        &self,
        hub: &MultiClusterHub,
        status: &mut MultiClusterHubStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, ControllerError> {
        let mut all_gone = true;
        for key in prune_targets(hub) {
            let state = step_target(self.client, &key, PROGRESSING, status, now).await?;
            all_gone &= state.is_terminal();
        }
        if all_gone && hub_pruning(status) {
            info!("all old resources of {} pruned", hub.id());
            let c = HubCondition::new(
                PROGRESSING,
                Some(true),
                ALL_OLD_RESOURCES_DELETED,
                "All old resources pruned",
            );
            set_condition(status, c, now);
        }
        Ok(all_gone)
    }
}

fn owned_by_any(object: &ManagedObject, names: &[String]) -> bool {
    object
        .meta()
        .owner_references
        .iter()
        .flatten()
        .any(|o| o.kind == "Subscription" && names.contains(&o.name))
}
