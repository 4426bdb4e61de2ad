use std::collections::BTreeMap;

use k8s_openapi::chrono::{DateTime, SecondsFormat, Utc};
use kube::CustomResource;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &'static str = "operator.open-cluster-management.io";

/// Pauses reconciliation of subordinate objects when set to `true` (case-insensitive).
pub const ANNOTATION_PAUSE: &'static str = "mch-pause";
/// Custom image repository substituted into every resolved image reference.
pub const ANNOTATION_IMAGE_REPOSITORY: &'static str = "mch-imageRepository";
/// Switches image references to `<name>:<version>-<suffix>` formatting.
pub const ANNOTATION_IMAGE_TAG_SUFFIX: &'static str = "mch-imageTagSuffix";
/// Name of a config-map (in the hub namespace) holding developer image overrides.
pub const ANNOTATION_IMAGE_OVERRIDES_CM: &'static str = "mch-imageOverridesCM";

/// Maximum number of top-level conditions kept in [`MultiClusterHubStatus::conditions`].
pub const HUB_CONDITION_CAPACITY: usize = 3;

pub const CONDITION_TRUE: &'static str = "True";
pub const CONDITION_FALSE: &'static str = "False";
pub const CONDITION_UNKNOWN: &'static str = "Unknown";

/// Top-level condition types.
pub const PROGRESSING: &'static str = "Progressing";
pub const COMPLETE: &'static str = "Complete";
pub const TERMINATING: &'static str = "Terminating";

const NO_CONDITIONS_AVAILABLE: &'static str = "No conditions available";

/// Render a timestamp the way conditions store it.
pub fn timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|v| v.with_timezone(&Utc))
}

/// Deployment replication tier.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum AvailabilityType {
    /// Single replica per deployment.
    Basic,
    /// Two replicas per deployment.
    High,
}

impl Default for AvailabilityType {
    fn default() -> Self {
        Self::High
    }
}

impl AvailabilityType {
    pub fn replicas(&self) -> i32 {
        match self {
            Self::Basic => 1,
            Self::High => 2,
        }
    }
}

/// Configuration options for ingress management.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// List of SSL ciphers enabled for management ingress. Defaults to the full list of supported ciphers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssl_ciphers: Vec<String>,
    /// Cluster ingress domain, discovered once and kept afterwards.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Developer overrides.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Overrides {
    /// Pull policy of the hub images, defaults to `Always`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
}

/// Desired state of a hub installation.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.open-cluster-management.io",
    version = "v1",
    kind = "MultiClusterHub",
    shortname = "mch",
    derive = "PartialEq",
    derive = "Default",
    status = "MultiClusterHubStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Status",
        "type": "string",
        "jsonPath": ".status.phase",
        "description": "The overall status of the MultiClusterHub."
    }"#,
    printcolumn = r#"{
        "name":"Version",
        "type": "string",
        "jsonPath": ".status.currentVersion",
        "description": "The version of the hub that is fully running."
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterHubSpec {
    /// Pull secret for hub operand and endpoint images.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,
    /// Deployment replication for improved availability, `Basic` or `High` (default).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_config: Option<AvailabilityType>,
    /// Install cert-manager into its own namespace.
    #[serde(default)]
    pub separate_certificate_management: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub ingress: IngressSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Overrides>,
    /// Name of a config-map holding a custom CA bundle.
    #[serde(rename = "customCAConfigmap", skip_serializing_if = "Option::is_none")]
    pub custom_ca_configmap: Option<String>,
    #[serde(default)]
    pub disable_hub_self_management: bool,
}

impl MultiClusterHubSpec {
    pub fn availability(&self) -> AvailabilityType {
        self.availability_config.unwrap_or_default()
    }

    pub fn image_pull_policy(&self) -> &str {
        self.overrides
            .as_ref()
            .and_then(|o| o.image_pull_policy.as_deref())
            .unwrap_or("Always")
    }

    pub fn image_pull_secret(&self) -> Option<&str> {
        self.image_pull_secret.as_deref().filter(|v| !v.is_empty())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum HubPhase {
    Pending,
    Running,
    Installing,
    Updating,
    Uninstalling,
}

impl Default for HubPhase {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for HubPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Installing => "Installing",
            Self::Updating => "Updating",
            Self::Uninstalling => "Uninstalling",
        };
        f.write_str(name)
    }
}

/// Latest observed condition of a single hub component.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    /// Kind of the object the condition was read from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(rename = "type")]
    pub type_: String,
    /// One of True, False, Unknown.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    /// Whether the component passed its success predicate.
    #[serde(default)]
    pub available: bool,
}

impl StatusCondition {
    /// Placeholder for a component that has not reported any condition yet.
    pub fn unknown() -> Self {
        Self {
            kind: None,
            type_: CONDITION_UNKNOWN.to_string(),
            status: CONDITION_UNKNOWN.to_string(),
            last_update_time: None,
            last_transition_time: None,
            reason: NO_CONDITIONS_AVAILABLE.to_string(),
            message: NO_CONDITIONS_AVAILABLE.to_string(),
            available: false,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.status == CONDITION_UNKNOWN
    }
}

/// A condition about the hub as a whole.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// One of True, False, Unknown.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl HubCondition {
    pub fn new(tpe: &str, status: Option<bool>, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: tpe.to_string(),
            status: status
                .map(|v| if v { CONDITION_TRUE } else { CONDITION_FALSE })
                .unwrap_or(CONDITION_UNKNOWN)
                .to_string(),
            last_update_time: None,
            last_transition_time: None,
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn last_transition(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.last_transition_time.as_deref())
    }
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterHubStatus {
    #[serde(default)]
    pub phase: HubPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_version: Option<String>,
    /// Latest condition per component, rebuilt on every reconciliation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, StatusCondition>,
    /// Top-level conditions, newest first, at most [`HUB_CONDITION_CAPACITY`] entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<HubCondition>,
}

impl MultiClusterHubStatus {
    pub fn condition(&self, tpe: &str) -> Option<&HubCondition> {
        self.conditions.iter().find(|c| c.type_ == tpe)
    }

    pub fn has_condition(&self, tpe: &str) -> bool {
        self.condition(tpe).is_some()
    }

    pub fn remove_condition(&mut self, tpe: &str) {
        self.conditions.retain(|c| c.type_ != tpe);
    }

    pub fn add_condition(&mut self, c: HubCondition) {
        self.add_condition_at(c, Utc::now())
    }

    /// Record `c` as observed at `now`.
    ///
    /// An existing condition of the same type is updated in place and keeps its
    /// `lastTransitionTime` unless the status changed, in which case it moves to
    /// the front. New conditions are inserted first and the oldest entry beyond
    /// [`HUB_CONDITION_CAPACITY`] is evicted.
    pub fn add_condition_at(&mut self, mut c: HubCondition, now: DateTime<Utc>) {
        let stamp = timestamp(now);
        if let Some(index) = self.conditions.iter().position(|e| e.type_ == c.type_) {
            let existing = &mut self.conditions[index];
            if existing.status == c.status {
                existing.reason = c.reason;
                existing.message = c.message;
                existing.last_update_time = Some(stamp);
                return;
            }
            self.conditions.remove(index);
        }
        c.last_update_time = Some(stamp.clone());
        c.last_transition_time = Some(stamp);
        self.conditions.insert(0, c);
        self.conditions.truncate(HUB_CONDITION_CAPACITY);
    }
}

impl MultiClusterHub {
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or(""),
        )
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn is_paused(&self) -> bool {
        self.annotation(ANNOTATION_PAUSE)
            .map_or(false, |v| v.eq_ignore_ascii_case("true"))
    }

    pub fn image_repository(&self) -> Option<&str> {
        self.annotation(ANNOTATION_IMAGE_REPOSITORY)
    }

    pub fn image_tag_suffix(&self) -> Option<&str> {
        self.annotation(ANNOTATION_IMAGE_TAG_SUFFIX)
    }

    pub fn image_overrides_configmap(&self) -> Option<&str> {
        self.annotation(ANNOTATION_IMAGE_OVERRIDES_CM)
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn status_or_default(&self) -> MultiClusterHubStatus {
        self.status.clone().unwrap_or_default()
    }
}
