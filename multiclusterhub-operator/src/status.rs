//! Aggregation of component health into the hub status.
//!
//! Everything here is a pure function of observed objects; reading the
//! objects from the cluster is done by the reconciler.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::{
    api::apps::v1::{Deployment, DeploymentCondition},
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::{DateTime, Utc},
};
use kube::api::DynamicObject;
use multiclusterhub_operator_apis::{
    COMPLETE, CONDITION_FALSE, CONDITION_TRUE, HubCondition, HubPhase, MultiClusterHub,
    MultiClusterHubStatus, PROGRESSING, StatusCondition, timestamp,
};
use serde::Deserialize;
use serde_json::Value;

use crate::cluster_client::ObjectPath;

pub(crate) const COMPONENTS_AVAILABLE: &'static str = "ComponentsAvailable";
pub(crate) const COMPONENTS_UNAVAILABLE: &'static str = "ComponentsUnavailable";
pub(crate) const NEW_RESOURCE_CREATED: &'static str = "NewResourceCreated";
pub(crate) const FAILED_DEPLOYING_COMPONENT: &'static str = "FailedDeployingComponent";
pub(crate) const OLD_RESOURCE_DELETED: &'static str = "OldResourceDeleted";
pub(crate) const OLD_RESOURCE_DELETE_FAILED: &'static str = "OldResourceDeleteFailed";
pub(crate) const ALL_OLD_RESOURCES_DELETED: &'static str = "AllOldResourcesDeleted";
pub(crate) const DELETION_TIMESTAMP_PRESENT: &'static str = "DeletionTimestampPresent";
pub(crate) const MCH_PAUSED: &'static str = "MCHPaused";
pub(crate) const MCH_RESUMED: &'static str = "MCHResumed";
pub(crate) const MCH_RECONCILING: &'static str = "MCHReconciling";
pub(crate) const HELM_RELEASE_TERMINATING: &'static str = "HelmReleaseTerminating";

/// Helm release reasons that mark a component as failed.
pub(crate) const HELM_ERROR_REASONS: [&'static str; 4] =
    ["InstallError", "UpdateError", "ReconcileError", "UninstallError"];

/// Annotation linking a deployment to the helm release that rendered it.
pub(crate) const HELM_RELEASE_ANNOTATION: &'static str = "meta.helm.sh/release-name";

const DEPLOYMENT_AVAILABLE: &'static str = "Available";
const DEPLOYMENT_PROGRESSING: &'static str = "Progressing";

/// Names of the components the hub reports on, by the kind of object observed for them.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ComponentList {
    pub deployments: Vec<String>,
    pub subscriptions: Vec<String>,
    pub custom_resources: Vec<String>,
}

/// Objects read from the cluster during one pass.
#[derive(Clone, Debug, Default)]
pub(crate) struct Observed {
    pub deployments: Vec<Deployment>,
    pub helm_releases: Vec<DynamicObject>,
    pub custom_resources: Vec<DynamicObject>,
}

fn time(t: &Option<Time>) -> Option<String> {
    t.as_ref().map(|t| timestamp(t.0))
}

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|v| v.with_timezone(&Utc))
}

pub(crate) fn successful_deploy(d: &Deployment) -> bool {
    let Some(status) = &d.status else {
        return false;
    };
    let unavailable = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == DEPLOYMENT_AVAILABLE && c.status == CONDITION_FALSE);
    if unavailable || status.unavailable_replicas.unwrap_or(0) > 0 {
        return false;
    }
    let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    status.ready_replicas.unwrap_or(0) >= desired
}

fn latest_deploy_condition(conditions: &[DeploymentCondition]) -> Option<&DeploymentCondition> {
    conditions
        .iter()
        .max_by_key(|c| c.last_transition_time.as_ref().map(|t| t.0))
}

fn deploy_condition(c: &DeploymentCondition) -> StatusCondition {
    StatusCondition {
        kind: Some("Deployment".to_string()),
        type_: c.type_.clone(),
        status: c.status.clone(),
        last_update_time: time(&c.last_update_time),
        last_transition_time: time(&c.last_transition_time),
        reason: c.reason.clone().unwrap_or_default(),
        message: c.message.clone().unwrap_or_default(),
        available: false,
    }
}

pub(crate) fn map_deployment(d: &Deployment) -> StatusCondition {
    let conditions = d
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();
    let Some(latest) = latest_deploy_condition(conditions) else {
        return StatusCondition::unknown();
    };
    let mut ret = deploy_condition(latest);
    if successful_deploy(d) {
        ret.available = true;
        ret.message.clear();
    } else if latest.type_ == DEPLOYMENT_AVAILABLE && latest.status == CONDITION_TRUE {
        // The deployment calls itself available while replicas are missing,
        // report its rollout instead.
        if let Some(progressing) = conditions
            .iter()
            .filter(|c| c.type_ == DEPLOYMENT_PROGRESSING)
            .last()
        {
            ret = deploy_condition(progressing);
        }
    }
    ret
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct HelmAppCondition {
    #[serde(rename = "type", default)]
    type_: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
    last_transition_time: Option<String>,
}

fn helm_conditions(hr: &DynamicObject) -> Vec<HelmAppCondition> {
    hr.array_at(&["status", "conditions"])
        .map(|items| {
            items
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn latest_helm_condition(conditions: &[HelmAppCondition]) -> Option<&HelmAppCondition> {
    conditions
        .iter()
        .max_by_key(|c| parse_time(c.last_transition_time.as_deref()))
}

fn has_deployed_release(hr: &DynamicObject) -> bool {
    hr.value_at(&["status", "deployedRelease"])
        .map_or(false, |v| !v.is_null())
}

pub(crate) fn successful_helm_release(hr: &DynamicObject) -> bool {
    let conditions = helm_conditions(hr);
    let Some(latest) = latest_helm_condition(&conditions) else {
        return false;
    };
    if HELM_ERROR_REASONS.contains(&latest.reason.as_str()) {
        return false;
    }
    // Releases are not always labelled as deployed once they are.
    if latest.type_ == "Initialized" && has_deployed_release(hr) {
        return true;
    }
    latest.type_ == "Deployed" && latest.status == CONDITION_TRUE
}

pub(crate) fn map_helm_release(hr: &DynamicObject) -> StatusCondition {
    let conditions = helm_conditions(hr);
    let Some(latest) = latest_helm_condition(&conditions) else {
        return StatusCondition::unknown();
    };
    let mut ret = StatusCondition {
        kind: Some("HelmRelease".to_string()),
        type_: latest.type_.clone(),
        status: latest.status.clone(),
        last_update_time: None,
        last_transition_time: latest.last_transition_time.clone(),
        reason: latest.reason.clone(),
        message: latest.message.clone(),
        available: false,
    };
    if latest.type_ == "Initialized" && has_deployed_release(hr) {
        ret.type_ = "DeployedRelease".to_string();
    }
    if successful_helm_release(hr) {
        ret.available = true;
        ret.message.clear();
    }
    ret
}

fn first_owner(obj: &DynamicObject) -> Option<&str> {
    obj.metadata
        .owner_references
        .as_ref()
        .and_then(|o| o.first())
        .map(|o| o.name.as_str())
}

/// Keep the newest helm release per owning subscription; unowned releases are dropped.
pub(crate) fn filter_duplicate_helm_releases(releases: &[DynamicObject]) -> Vec<&DynamicObject> {
    let mut newest: HashMap<&str, &DynamicObject> = HashMap::new();
    for hr in releases {
        let Some(owner) = first_owner(hr) else {
            continue;
        };
        let created = hr.metadata.creation_timestamp.as_ref().map(|t| t.0);
        match newest.get(owner) {
            Some(existing)
                if existing.metadata.creation_timestamp.as_ref().map(|t| t.0) >= created => {}
            _ => {
                newest.insert(owner, hr);
            }
        }
    }
    let mut list: Vec<&DynamicObject> = newest.into_values().collect();
    list.sort_by(|a, b| first_owner(a).cmp(&first_owner(b)));
    list
}

pub(crate) fn map_cluster_manager(cr: &DynamicObject) -> StatusCondition {
    let Some(conditions) = cr.array_at(&["status", "conditions"]) else {
        return StatusCondition::unknown();
    };
    let mut ret = StatusCondition::unknown();
    for condition in conditions {
        let field = |name: &str| condition.str_at(&[name]).unwrap_or("").to_string();
        ret = StatusCondition {
            kind: Some(cr.types.as_ref().map_or("", |t| t.kind.as_str()).to_string()),
            type_: field("type"),
            status: field("status"),
            last_update_time: None,
            last_transition_time: condition
                .str_at(&["lastTransitionTime"])
                .map(|v| v.to_string()),
            reason: field("reason"),
            message: field("message"),
            available: false,
        };
        if ret.type_ == "Applied" && ret.status == CONDITION_TRUE {
            ret.available = true;
            return ret;
        }
    }
    ret
}

fn deployment_release(d: &Deployment) -> Option<&str> {
    d.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(HELM_RELEASE_ANNOTATION))
        .map(|v| v.as_str())
}

/// Build the full component map: every listed component starts Unknown and
/// is replaced by what was observed for it.
pub(crate) fn component_statuses(
    list: &ComponentList,
    observed: &Observed,
) -> BTreeMap<String, StatusCondition> {
    let mut components: BTreeMap<String, StatusCondition> = list
        .deployments
        .iter()
        .chain(list.subscriptions.iter())
        .chain(list.custom_resources.iter())
        .map(|name| (name.clone(), StatusCondition::unknown()))
        .collect();

    for hr in filter_duplicate_helm_releases(&observed.helm_releases) {
        let Some(subscription) = first_owner(hr) else {
            continue;
        };
        if !list.subscriptions.iter().any(|s| s == subscription) {
            continue;
        }
        let mut condition = map_helm_release(hr);
        if condition.available {
            let release = hr.metadata.name.as_deref();
            if let Some(unready) = observed
                .deployments
                .iter()
                .filter(|d| deployment_release(d).is_some() && deployment_release(d) == release)
                .find(|d| !successful_deploy(d))
            {
                condition = map_deployment(unready);
            }
        }
        components.insert(subscription.to_string(), condition);
    }

    for d in &observed.deployments {
        let name = d.metadata.name.as_deref().unwrap_or("");
        if list.deployments.iter().any(|n| n == name) {
            components.insert(name.to_string(), map_deployment(d));
        }
    }

    for cr in &observed.custom_resources {
        let name = cr.metadata.name.as_deref().unwrap_or("");
        if list.custom_resources.iter().any(|n| n == name) {
            components.insert(name.to_string(), map_cluster_manager(cr));
        }
    }
    components
}

pub(crate) fn component_successful(c: &StatusCondition) -> bool {
    c.available && !c.is_unknown() && !HELM_ERROR_REASONS.contains(&c.reason.as_str())
}

pub(crate) fn all_successful(components: &BTreeMap<String, StatusCondition>) -> bool {
    components.values().all(component_successful)
}

/// Pending when any component is unknown, failed or unavailable, otherwise Running.
pub(crate) fn aggregate_component_phase(components: &BTreeMap<String, StatusCondition>) -> HubPhase {
    if all_successful(components) {
        HubPhase::Running
    } else {
        HubPhase::Pending
    }
}

/// Whether the hub is still removing resources of an older release.
pub(crate) fn hub_pruning(status: &MultiClusterHubStatus) -> bool {
    status.condition(PROGRESSING).map_or(false, |c| {
        c.reason == OLD_RESOURCE_DELETED || c.reason == OLD_RESOURCE_DELETE_FAILED
    })
}

/// Phase of a hub that is not being deleted.
pub(crate) fn aggregate_phase(status: &MultiClusterHubStatus, desired_version: &str) -> HubPhase {
    if aggregate_component_phase(&status.components) == HubPhase::Running {
        return if hub_pruning(status) {
            HubPhase::Pending
        } else {
            HubPhase::Running
        };
    }
    match status.current_version.as_deref() {
        None | Some("") => HubPhase::Installing,
        Some(current) if current != desired_version => HubPhase::Updating,
        Some(_) => HubPhase::Pending,
    }
}

/// Record `c` unless a condition of the same type already states the same status and reason.
pub(crate) fn set_condition(status: &mut MultiClusterHubStatus, c: HubCondition, now: DateTime<Utc>) {
    if let Some(existing) = status.condition(&c.type_) {
        if existing.status == c.status && existing.reason == c.reason {
            return;
        }
    }
    status.add_condition_at(c, now);
}

/// Derive the next status from the observed one and the component map.
pub(crate) fn calculate_status(
    hub: &MultiClusterHub,
    components: BTreeMap<String, StatusCondition>,
    desired_version: &str,
    now: DateTime<Utc>,
) -> MultiClusterHubStatus {
    let mut status = hub.status_or_default();
    status.components = components;
    status.desired_version = Some(desired_version.to_string());

    if all_successful(&status.components) {
        status.current_version = Some(desired_version.to_string());
        if !hub_pruning(&status) {
            let c = HubCondition::new(
                COMPLETE,
                Some(true),
                COMPONENTS_AVAILABLE,
                "All hub components ready.",
            );
            set_condition(&mut status, c, now);
        } else if status.has_condition(COMPLETE) {
            let c = HubCondition::new(
                COMPLETE,
                Some(false),
                OLD_RESOURCE_DELETE_FAILED,
                "Not all components successfully pruned.",
            );
            set_condition(&mut status, c, now);
        }
    } else {
        if !status.has_condition(PROGRESSING) {
            let c = HubCondition::new(PROGRESSING, Some(true), MCH_RECONCILING, "Hub is reconciling.");
            set_condition(&mut status, c, now);
        }
        if status.has_condition(COMPLETE) {
            let c = HubCondition::new(
                COMPLETE,
                Some(false),
                COMPONENTS_UNAVAILABLE,
                "Not all hub components ready.",
            );
            set_condition(&mut status, c, now);
        }
    }

    status.phase = if hub.is_deleted() {
        HubPhase::Uninstalling
    } else {
        aggregate_phase(&status, desired_version)
    };
    status
}

/// JSON difference between two statuses, empty when nothing changed.
pub(crate) fn status_diff(
    original: &MultiClusterHubStatus,
    updated: &MultiClusterHubStatus,
) -> Result<json_patch::Patch, serde_json::Error> {
    let original: Value = serde_json::to_value(original)?;
    let updated: Value = serde_json::to_value(updated)?;
    Ok(json_patch::diff(&original, &updated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::hub;
    use k8s_openapi::{
        api::apps::v1::{DeploymentSpec, DeploymentStatus},
        apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
        chrono::{Duration, TimeZone},
    };
    use kube::api::TypeMeta;
    use multiclusterhub_operator_apis::CONDITION_UNKNOWN;
    use serde_json::json;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(seconds)
    }

    fn condition(tpe: &str, status: &str, reason: &str, seconds: i64) -> DeploymentCondition {
        DeploymentCondition {
            type_: tpe.to_string(),
            status: status.to_string(),
            reason: Some(reason.to_string()),
            message: Some(format!("{} message", reason)),
            last_transition_time: Some(Time(at(seconds))),
            last_update_time: Some(Time(at(seconds))),
        }
    }

    fn deployment(name: &str, ready: i32, conditions: Vec<DeploymentCondition>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ocm".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                ready_replicas: Some(ready),
                replicas: Some(2),
                unavailable_replicas: if ready < 2 { Some(2 - ready) } else { None },
                conditions: Some(conditions),
                ..Default::default()
            }),
        }
    }

    fn helm_release(name: &str, owner: &str, created: i64, status: serde_json::Value) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "apps.open-cluster-management.io/v1".to_string(),
                kind: "HelmRelease".to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ocm".to_string()),
                creation_timestamp: Some(Time(at(created))),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps.open-cluster-management.io/v1".to_string(),
                    kind: "Subscription".to_string(),
                    name: owner.to_string(),
                    uid: format!("{}-uid", owner),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            data: json!({ "status": status }),
        }
    }

    fn available(tpe: &str, status: &str) -> StatusCondition {
        StatusCondition {
            type_: tpe.to_string(),
            status: status.to_string(),
            available: status == CONDITION_TRUE,
            ..Default::default()
        }
    }

    #[test]
    fn phase_follows_component_health() {
        let mut components = BTreeMap::new();
        components.insert("foo".to_string(), available("Available", CONDITION_TRUE));
        components.insert("bar".to_string(), available("Available", CONDITION_TRUE));
        assert_eq!(HubPhase::Running, aggregate_component_phase(&components));
        components.insert("foo".to_string(), available("Available", CONDITION_FALSE));
        assert_eq!(HubPhase::Pending, aggregate_component_phase(&components));
        components.insert("foo".to_string(), StatusCondition::unknown());
        assert_eq!(HubPhase::Pending, aggregate_component_phase(&components));
        let mut failed = available("Deployed", CONDITION_TRUE);
        failed.reason = "InstallError".to_string();
        components.insert("foo".to_string(), failed);
        assert_eq!(HubPhase::Pending, aggregate_component_phase(&components));
    }

    #[test]
    fn deployment_without_conditions_is_unknown() {
        let d = deployment("ocm-webhook", 2, vec![]);
        let c = map_deployment(&d);
        assert_eq!(CONDITION_UNKNOWN, c.status);
        assert_eq!("No conditions available", c.reason);
    }

    #[test]
    fn latest_condition_wins_and_message_clears() {
        let d = deployment(
            "ocm-webhook",
            2,
            vec![
                condition("Available", CONDITION_TRUE, "MinimumReplicasAvailable", 20),
                condition("Progressing", CONDITION_TRUE, "NewReplicaSetAvailable", 10),
            ],
        );
        let c = map_deployment(&d);
        assert!(c.available);
        assert_eq!("Available", c.type_);
        assert_eq!("MinimumReplicasAvailable", c.reason);
        assert_eq!("", c.message);
        assert_eq!(Some("Deployment".to_string()), c.kind);
    }

    #[test]
    fn available_but_short_on_replicas_reports_progress() {
        let d = deployment(
            "ocm-webhook",
            1,
            vec![
                condition("Progressing", CONDITION_TRUE, "ReplicaSetUpdated", 10),
                condition("Available", CONDITION_TRUE, "MinimumReplicasAvailable", 20),
            ],
        );
        let c = map_deployment(&d);
        assert!(!c.available);
        assert_eq!("Progressing", c.type_);
        assert_eq!("ReplicaSetUpdated message", c.message);
    }

    #[test]
    fn helm_release_predicates() {
        let deployed = helm_release(
            "grc-1",
            "grc-sub",
            0,
            json!({"conditions": [
                {"type": "Initialized", "status": "True", "lastTransitionTime": "2023-11-14T22:13:20Z"},
                {"type": "Deployed", "status": "True", "reason": "InstallSuccessful", "message": "done", "lastTransitionTime": "2023-11-14T22:14:20Z"}
            ]}),
        );
        assert!(successful_helm_release(&deployed));
        let c = map_helm_release(&deployed);
        assert!(c.available);
        assert_eq!("", c.message);

        let initialized = helm_release(
            "grc-2",
            "grc-sub",
            0,
            json!({"deployedRelease": {"name": "grc-2"}, "conditions": [
                {"type": "Initialized", "status": "True"}
            ]}),
        );
        assert!(successful_helm_release(&initialized));
        assert_eq!("DeployedRelease", map_helm_release(&initialized).type_);

        let failed = helm_release(
            "grc-3",
            "grc-sub",
            0,
            json!({"conditions": [
                {"type": "ReleaseFailed", "status": "True", "reason": "InstallError", "message": "boom"}
            ]}),
        );
        assert!(!successful_helm_release(&failed));
        assert_eq!("boom", map_helm_release(&failed).message);

        let empty = helm_release("grc-4", "grc-sub", 0, json!({}));
        assert!(map_helm_release(&empty).is_unknown());
    }

    #[test]
    fn duplicate_helm_releases_keep_newest() {
        let releases = vec![
            helm_release("search-old", "search-prod-sub", 0, json!({})),
            helm_release("search-new", "search-prod-sub", 60, json!({})),
            helm_release("grc", "grc-sub", 30, json!({})),
        ];
        let names: Vec<&str> = filter_duplicate_helm_releases(&releases)
            .iter()
            .map(|hr| hr.metadata.name.as_deref().unwrap())
            .collect();
        assert_eq!(vec!["grc", "search-new"], names);
    }

    #[test]
    fn cluster_manager_requires_applied() {
        let mut cr = DynamicObject {
            types: Some(TypeMeta {
                api_version: "operator.open-cluster-management.io/v1".to_string(),
                kind: "ClusterManager".to_string(),
            }),
            metadata: ObjectMeta {
                name: Some("cluster-manager".to_string()),
                ..Default::default()
            },
            data: json!({"status": {"conditions": [
                {"type": "Applied", "status": "False", "reason": "Pending", "message": "waiting"}
            ]}}),
        };
        let c = map_cluster_manager(&cr);
        assert!(!c.available);
        assert_eq!("waiting", c.message);
        cr.data = json!({"status": {"conditions": [
            {"type": "HubRegistrationDegraded", "status": "False"},
            {"type": "Applied", "status": "True", "reason": "ClusterManagerApplied"}
        ]}});
        assert!(map_cluster_manager(&cr).available);
        cr.data = json!({});
        assert!(map_cluster_manager(&cr).is_unknown());
    }

    #[test]
    fn component_map_is_rebuilt() {
        let list = ComponentList {
            deployments: vec!["ocm-webhook".to_string()],
            subscriptions: vec!["grc-sub".to_string()],
            custom_resources: vec!["cluster-manager".to_string()],
        };
        let mut grc_deployment = deployment(
            "grc-policy-propagator",
            0,
            vec![condition("Available", CONDITION_FALSE, "MinimumReplicasUnavailable", 5)],
        );
        grc_deployment.metadata.annotations = Some(
            [(HELM_RELEASE_ANNOTATION.to_string(), "grc-1".to_string())].into(),
        );
        let observed = Observed {
            deployments: vec![
                deployment(
                    "ocm-webhook",
                    2,
                    vec![condition("Available", CONDITION_TRUE, "MinimumReplicasAvailable", 1)],
                ),
                grc_deployment,
                deployment("unrelated", 2, vec![]),
            ],
            helm_releases: vec![helm_release(
                "grc-1",
                "grc-sub",
                0,
                json!({"conditions": [{"type": "Deployed", "status": "True"}]}),
            )],
            custom_resources: vec![],
        };
        let components = component_statuses(&list, &observed);
        assert_eq!(3, components.len());
        assert!(components["ocm-webhook"].available);
        // The release is deployed but one of its deployments is not ready.
        assert_eq!("MinimumReplicasUnavailable", components["grc-sub"].reason);
        assert!(components["cluster-manager"].is_unknown());
        assert!(!components.contains_key("unrelated"));
    }

    #[test]
    fn calculate_status_for_fresh_install() {
        let h = hub(Default::default());
        let mut components = BTreeMap::new();
        components.insert("ocm-webhook".to_string(), StatusCondition::unknown());
        let status = calculate_status(&h, components, "2.1.0", at(0));
        assert_eq!(HubPhase::Installing, status.phase);
        assert_eq!(None, status.current_version);
        assert_eq!(Some("2.1.0".to_string()), status.desired_version);
        assert_eq!(MCH_RECONCILING, status.condition(PROGRESSING).unwrap().reason);
        assert!(!status.has_condition(COMPLETE));
    }

    #[test]
    fn calculate_status_when_available() {
        let mut h = hub(Default::default());
        let mut components = BTreeMap::new();
        components.insert("ocm-webhook".to_string(), available("Available", CONDITION_TRUE));
        let status = calculate_status(&h, components.clone(), "2.1.0", at(0));
        assert_eq!(HubPhase::Running, status.phase);
        assert_eq!(Some("2.1.0".to_string()), status.current_version);
        assert_eq!(CONDITION_TRUE, status.condition(COMPLETE).unwrap().status);

        // Recomputing an unchanged status yields the same value.
        h.status = Some(status.clone());
        assert_eq!(status, calculate_status(&h, components.clone(), "2.1.0", at(30)));

        // A degraded component flips Complete and reports Pending.
        components.insert("ocm-webhook".to_string(), available("Available", CONDITION_FALSE));
        let degraded = calculate_status(&h, components.clone(), "2.1.0", at(60));
        assert_eq!(HubPhase::Pending, degraded.phase);
        let complete = degraded.condition(COMPLETE).unwrap();
        assert_eq!(CONDITION_FALSE, complete.status);
        assert_eq!(COMPONENTS_UNAVAILABLE, complete.reason);

        // A newer desired version means an update is in progress.
        assert_eq!(
            HubPhase::Updating,
            calculate_status(&h, components, "2.2.0", at(90)).phase
        );
    }

    #[test]
    fn pruning_and_deletion_phases() {
        let mut h = hub(Default::default());
        let mut status = MultiClusterHubStatus::default();
        status.add_condition_at(
            HubCondition::new(PROGRESSING, Some(true), OLD_RESOURCE_DELETED, ""),
            at(0),
        );
        h.status = Some(status);
        let mut components = BTreeMap::new();
        components.insert("ocm-webhook".to_string(), available("Available", CONDITION_TRUE));
        let calculated = calculate_status(&h, components.clone(), "2.1.0", at(10));
        assert_eq!(HubPhase::Pending, calculated.phase);
        assert!(!calculated.has_condition(COMPLETE));

        h.metadata.deletion_timestamp = Some(Time(at(20)));
        assert_eq!(
            HubPhase::Uninstalling,
            calculate_status(&h, components, "2.1.0", at(30)).phase
        );
    }

    #[test]
    fn status_diff_detects_changes() {
        let a = MultiClusterHubStatus::default();
        let mut b = a.clone();
        assert!(status_diff(&a, &b).unwrap().0.is_empty());
        b.phase = HubPhase::Running;
        assert!(!status_diff(&a, &b).unwrap().0.is_empty());
    }
}
