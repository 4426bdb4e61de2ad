//! Desired state of every object the hub installs, and the order they are applied in.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            ConfigMap, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction,
            LocalObjectReference, ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe,
            ResourceRequirements, Secret, SecretVolumeSource, Service, ServicePort, ServiceSpec,
            Toleration, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, ObjectMeta},
        util::intstr::IntOrString,
    },
};
use kube::api::GroupVersionKind;
use multiclusterhub_operator_apis::MultiClusterHub;
use serde_json::json;

use crate::{
    cluster_client::ManagedObject,
    errors::ControllerError,
    image_overrides::ImageOverrideCacheEntry,
    status::ComponentList,
    utils::{CERT_MANAGER_NAMESPACE, installer_labels, owner_reference},
};

pub(crate) const REPO_NAME: &'static str = "multiclusterhub-repo";
const REPO_PORT: i32 = 3000;
const REPO_IMAGE_KEY: &'static str = "multiclusterhub_repo";

pub(crate) const CHANNEL_NAME: &'static str = "charts-v1";

pub(crate) const WEBHOOK_NAME: &'static str = "ocm-webhook";
pub(crate) const PROXYSERVER_NAME: &'static str = "ocm-proxyserver";
pub(crate) const CONTROLLER_NAME: &'static str = "ocm-controller";
pub(crate) const CLUSTER_MANAGER_NAME: &'static str = "cluster-manager";
const FOUNDATION_IMAGE_KEY: &'static str = "multicloud_manager";
const REGISTRATION_IMAGE_KEY: &'static str = "registration";
const FOUNDATION_SERVICE_ACCOUNT: &'static str = "ocm-foundation-sa";
const KLUSTERLET_SECRET: &'static str = "ocm-klusterlet-self-signed-secrets";

/// Charts installed through subscriptions of the `charts-v1` channel.
pub(crate) const SUBSCRIPTIONS: [&'static str; 11] = [
    "cert-manager",
    "cert-manager-webhook",
    "configmap-watcher",
    "management-ingress",
    "application-chart",
    "console-chart",
    "grc",
    "search-prod",
    "topology",
    "rcm",
    "kui-web-terminal",
];

pub(crate) const IMAGE_MANIFEST_PREFIX: &'static str = "mch-image-manifest-";
const CONFIGMAP_TYPE_LABEL: &'static str = "ocm-configmap-type";
const RELEASE_VERSION_LABEL: &'static str = "ocm-release-version";

pub(crate) fn subscription_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("apps.open-cluster-management.io", "v1", "Subscription")
}

pub(crate) fn channel_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("apps.open-cluster-management.io", "v1", "Channel")
}

pub(crate) fn helm_release_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("apps.open-cluster-management.io", "v1", "HelmRelease")
}

pub(crate) fn cluster_manager_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("operator.open-cluster-management.io", "v1", "ClusterManager")
}

pub(crate) fn subscription_name(chart: &str) -> String {
    format!("{}-sub", chart)
}

/// Inputs shared by all builders of one pass.
pub(crate) struct BuildContext<'a> {
    pub hub: &'a MultiClusterHub,
    pub images: &'a ImageOverrideCacheEntry,
    /// The hub's pull secret, read from the hub namespace when it has to be copied.
    pub pull_secret: Option<&'a Secret>,
}

impl<'a> BuildContext<'a> {
    fn namespace(&self) -> Option<String> {
        self.hub.metadata.namespace.clone()
    }

    fn metadata(&self, name: &str, namespace: Option<String>, labels: BTreeMap<String, String>) -> ObjectMeta {
        let mut all = installer_labels(self.hub);
        all.extend(labels);
        ObjectMeta {
            name: Some(name.to_string()),
            owner_references: namespace
                .is_some()
                .then(|| owner_reference(self.hub))
                .flatten()
                .map(|o| vec![o]),
            namespace,
            labels: Some(all),
            ..Default::default()
        }
    }

    fn pull_secrets(&self) -> Option<Vec<LocalObjectReference>> {
        self.hub.spec.image_pull_secret().map(|name| {
            vec![LocalObjectReference {
                name: name.to_string(),
            }]
        })
    }
}

/// How to build one artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Recipe {
    RepoDeployment,
    RepoService,
    Channel,
    Subscription(&'static str),
    CertManagerPullSecret,
    WebhookDeployment,
    WebhookService,
    ProxyServerDeployment,
    ProxyServerService,
    ControllerDeployment,
    ClusterManager,
}

impl Recipe {
    /// The desired object, `None` when the hub does not ask for it.
    pub fn build(&self, ctx: &BuildContext) -> Result<Option<ManagedObject>, ControllerError> {
        Ok(Some(match self {
            Recipe::RepoDeployment => ManagedObject::Deployment(repo_deployment(ctx)?),
            Recipe::RepoService => ManagedObject::Service(service(ctx, REPO_NAME, REPO_PORT, REPO_PORT)),
            Recipe::Channel => channel(ctx)?,
            Recipe::Subscription(chart) => subscription(ctx, chart)?,
            Recipe::CertManagerPullSecret => match cert_manager_pull_secret(ctx) {
                Some(secret) => ManagedObject::Secret(secret),
                None => return Ok(None),
            },
            Recipe::WebhookDeployment => ManagedObject::Deployment(foundation_deployment(
                ctx,
                WEBHOOK_NAME,
                vec![
                    "/webhook",
                    "--tls-cert-file=/var/run/ocm-webhook/tls.crt",
                    "--tls-private-key-file=/var/run/ocm-webhook/tls.key",
                ],
                8000,
                Some((WEBHOOK_NAME, "/var/run/ocm-webhook")),
            )?),
            Recipe::WebhookService => ManagedObject::Service(service(ctx, WEBHOOK_NAME, 443, 8000)),
            Recipe::ProxyServerDeployment => ManagedObject::Deployment(foundation_deployment(
                ctx,
                PROXYSERVER_NAME,
                vec![
                    "/proxyserver",
                    "--secure-port=6443",
                    "--cert-dir=/tmp",
                    "--agent-cafile=/var/run/klusterlet/ca.crt",
                    "--agent-certfile=/var/run/klusterlet/tls.crt",
                    "--agent-keyfile=/var/run/klusterlet/tls.key",
                ],
                6443,
                Some((KLUSTERLET_SECRET, "/var/run/klusterlet")),
            )?),
            Recipe::ProxyServerService => ManagedObject::Service(service(ctx, PROXYSERVER_NAME, 443, 6443)),
            Recipe::ControllerDeployment => ManagedObject::Deployment(foundation_deployment(
                ctx,
                CONTROLLER_NAME,
                vec!["/controller", "--agent-cafile=/var/run/klusterlet/ca.crt"],
                8000,
                Some((KLUSTERLET_SECRET, "/var/run/klusterlet")),
            )?),
            Recipe::ClusterManager => cluster_manager(ctx)?,
        }))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Artifact {
    pub id: String,
    pub recipe: Recipe,
    pub depends_on: Vec<String>,
}

impl Artifact {
    pub fn new(id: impl Into<String>, recipe: Recipe, depends_on: &[&str]) -> Self {
        Self {
            id: id.into(),
            recipe,
            depends_on: depends_on.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// Artifacts in apply order; every dependency precedes its dependents.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ArtifactPlan {
    artifacts: Vec<Artifact>,
}

impl ArtifactPlan {
    pub fn new(artifacts: Vec<Artifact>) -> Result<Self, ControllerError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for artifact in &artifacts {
            for dependency in &artifact.depends_on {
                if !seen.contains(dependency.as_str()) {
                    return Err(ControllerError::malformed(format!(
                        "artifact {} depends on {} which is not applied before it",
                        artifact.id, dependency
                    )));
                }
            }
            if !seen.insert(artifact.id.as_str()) {
                return Err(ControllerError::malformed(format!(
                    "artifact {} is declared twice",
                    artifact.id
                )));
            }
        }
        Ok(Self { artifacts })
    }

    pub fn hub() -> Result<Self, ControllerError> {
        let mut artifacts = vec![
            Artifact::new("repo-deployment", Recipe::RepoDeployment, &[]),
            Artifact::new("repo-service", Recipe::RepoService, &["repo-deployment"]),
            Artifact::new("channel", Recipe::Channel, &["repo-service"]),
        ];
        artifacts.extend(SUBSCRIPTIONS.iter().map(|chart| {
            Artifact::new(subscription_name(chart), Recipe::Subscription(chart), &["channel"])
        }));
        artifacts.extend([
            Artifact::new("cert-manager-pull-secret", Recipe::CertManagerPullSecret, &[]),
            Artifact::new("webhook-deployment", Recipe::WebhookDeployment, &[]),
            Artifact::new("webhook-service", Recipe::WebhookService, &["webhook-deployment"]),
            Artifact::new("proxyserver-deployment", Recipe::ProxyServerDeployment, &[]),
            Artifact::new(
                "proxyserver-service",
                Recipe::ProxyServerService,
                &["proxyserver-deployment"],
            ),
            Artifact::new("controller-deployment", Recipe::ControllerDeployment, &[]),
            Artifact::new("cluster-manager", Recipe::ClusterManager, &[]),
        ]);
        Self::new(artifacts)
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    /// The components reported in the hub status.
    pub fn component_list(&self) -> ComponentList {
        let mut list = ComponentList::default();
        for artifact in &self.artifacts {
            match &artifact.recipe {
                Recipe::RepoDeployment => list.deployments.push(REPO_NAME.to_string()),
                Recipe::WebhookDeployment => list.deployments.push(WEBHOOK_NAME.to_string()),
                Recipe::ProxyServerDeployment => list.deployments.push(PROXYSERVER_NAME.to_string()),
                Recipe::ControllerDeployment => list.deployments.push(CONTROLLER_NAME.to_string()),
                Recipe::Subscription(chart) => list.subscriptions.push(subscription_name(chart)),
                Recipe::ClusterManager => list.custom_resources.push(CLUSTER_MANAGER_NAME.to_string()),
                _ => (),
            }
        }
        list
    }
}

fn app_labels(app: &str) -> BTreeMap<String, String> {
    [
        ("app".to_string(), app.to_string()),
        ("ocm-antiaffinity-selector".to_string(), app.to_string()),
    ]
    .into()
}

fn tolerations() -> Vec<Toleration> {
    vec![Toleration {
        effect: Some("NoSchedule".to_string()),
        key: Some("node-role.kubernetes.io/infra".to_string()),
        operator: Some("Exists".to_string()),
        ..Default::default()
    }]
}

fn resources(cpu: &str, memory: &str, memory_limit: &str) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(
            [
                ("cpu".to_string(), Quantity(cpu.to_string())),
                ("memory".to_string(), Quantity(memory.to_string())),
            ]
            .into(),
        ),
        limits: Some([("memory".to_string(), Quantity(memory_limit.to_string()))].into()),
        ..Default::default()
    }
}

fn http_probe(path: &str, port: i32, scheme: &str) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            scheme: Some(scheme.to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(15),
        period_seconds: Some(15),
        ..Default::default()
    }
}

fn deployment(
    ctx: &BuildContext,
    name: &str,
    replicas: i32,
    container: Container,
    volumes: Option<Vec<Volume>>,
    service_account: Option<&str>,
) -> Deployment {
    let labels = app_labels(name);
    Deployment {
        metadata: ctx.metadata(name, ctx.namespace(), labels.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    image_pull_secrets: ctx.pull_secrets(),
                    node_selector: ctx.hub.spec.node_selector.clone(),
                    tolerations: Some(tolerations()),
                    service_account_name: service_account.map(|v| v.to_string()),
                    volumes,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn repo_deployment(ctx: &BuildContext) -> Result<Deployment, ControllerError> {
    let container = Container {
        name: REPO_NAME.to_string(),
        image: Some(ctx.images.image(REPO_IMAGE_KEY)?.to_string()),
        image_pull_policy: Some(ctx.hub.spec.image_pull_policy().to_string()),
        ports: Some(vec![ContainerPort {
            container_port: REPO_PORT,
            name: Some("helmrepo".to_string()),
            ..Default::default()
        }]),
        env: Some(vec![
            EnvVar {
                name: "POD_NAMESPACE".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        api_version: Some("v1".to_string()),
                        field_path: "metadata.namespace".to_string(),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            EnvVar {
                name: "MCH_REPO_PORT".to_string(),
                value: Some(REPO_PORT.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "MCH_REPO_SERVICE".to_string(),
                value: Some(REPO_NAME.to_string()),
                ..Default::default()
            },
        ]),
        liveness_probe: Some(http_probe("/liveness", REPO_PORT, "HTTP")),
        readiness_probe: Some(http_probe("/readiness", REPO_PORT, "HTTP")),
        resources: Some(resources("50m", "50Mi", "100Mi")),
        ..Default::default()
    };
    Ok(deployment(ctx, REPO_NAME, 1, container, None, None))
}

fn foundation_deployment(
    ctx: &BuildContext,
    name: &str,
    args: Vec<&str>,
    port: i32,
    secret_mount: Option<(&str, &str)>,
) -> Result<Deployment, ControllerError> {
    let volume_name = format!("{}-certs", name);
    let container = Container {
        name: name.to_string(),
        image: Some(ctx.images.image(FOUNDATION_IMAGE_KEY)?.to_string()),
        image_pull_policy: Some(ctx.hub.spec.image_pull_policy().to_string()),
        args: Some(args.into_iter().map(|v| v.to_string()).collect()),
        ports: Some(vec![ContainerPort {
            container_port: port,
            ..Default::default()
        }]),
        liveness_probe: Some(http_probe("/healthz", port, "HTTPS")),
        readiness_probe: Some(http_probe("/healthz", port, "HTTPS")),
        resources: Some(resources("50m", "128Mi", "256Mi")),
        volume_mounts: secret_mount.map(|(_, path)| {
            vec![VolumeMount {
                name: volume_name.clone(),
                mount_path: path.to_string(),
                ..Default::default()
            }]
        }),
        ..Default::default()
    };
    let volumes = secret_mount.map(|(secret, _)| {
        vec![Volume {
            name: volume_name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }]
    });
    Ok(deployment(
        ctx,
        name,
        ctx.hub.spec.availability().replicas(),
        container,
        volumes,
        Some(FOUNDATION_SERVICE_ACCOUNT),
    ))
}

fn service(ctx: &BuildContext, name: &str, port: i32, target_port: i32) -> Service {
    Service {
        metadata: ctx.metadata(name, ctx.namespace(), app_labels(name)),
        spec: Some(ServiceSpec {
            selector: Some(app_labels(name)),
            ports: Some(vec![ServicePort {
                protocol: Some("TCP".to_string()),
                port,
                target_port: Some(IntOrString::Int(target_port)),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

fn unstructured(
    ctx: &BuildContext,
    gvk: &GroupVersionKind,
    namespace: Option<String>,
    name: &str,
    spec: serde_json::Value,
) -> Result<ManagedObject, ControllerError> {
    let mut obj = ManagedObject::unstructured(
        &gvk.api_version(),
        &gvk.kind,
        namespace.as_deref(),
        name,
        json!({ "spec": spec }),
    )?;
    *obj.meta_mut() = ctx.metadata(name, namespace, BTreeMap::new());
    Ok(obj)
}

fn channel(ctx: &BuildContext) -> Result<ManagedObject, ControllerError> {
    let namespace = ctx.namespace();
    let pathname = format!(
        "http://{}.{}:{}/charts",
        REPO_NAME,
        namespace.as_deref().unwrap_or(""),
        REPO_PORT
    );
    unstructured(
        ctx,
        &channel_gvk(),
        namespace,
        CHANNEL_NAME,
        json!({ "type": "HelmRepo", "pathname": pathname }),
    )
}

fn subscription(ctx: &BuildContext, chart: &str) -> Result<ManagedObject, ControllerError> {
    let hub = ctx.hub;
    let namespace = ctx.namespace();
    let values = json!({
        "pullSecret": hub.spec.image_pull_secret(),
        "hubconfig": {
            "replicaCount": hub.spec.availability().replicas(),
            "nodeSelector": hub.spec.node_selector,
        },
        "global": {
            "imageOverrides": ctx.images.resolved,
            "pullPolicy": hub.spec.image_pull_policy(),
        },
        "ingress": {
            "sslCiphers": hub.spec.ingress.ssl_ciphers,
            "domain": hub.spec.ingress.domain,
        },
    });
    unstructured(
        ctx,
        &subscription_gvk(),
        namespace.clone(),
        &subscription_name(chart),
        json!({
            "channel": format!("{}/{}", namespace.as_deref().unwrap_or(""), CHANNEL_NAME),
            "name": chart,
            "placement": { "local": true },
            "packageOverrides": [{
                "packageName": chart,
                "packageOverrides": [{ "path": "spec", "value": values }],
            }],
        }),
    )
}

fn cert_manager_pull_secret(ctx: &BuildContext) -> Option<Secret> {
    if !ctx.hub.spec.separate_certificate_management {
        return None;
    }
    let name = ctx.hub.spec.image_pull_secret()?;
    let source = ctx.pull_secret?;
    Some(Secret {
        // Cross namespace, so no owner reference.
        metadata: ObjectMeta {
            owner_references: None,
            ..ctx.metadata(name, Some(CERT_MANAGER_NAMESPACE.to_string()), BTreeMap::new())
        },
        type_: source.type_.clone(),
        data: source.data.clone(),
        ..Default::default()
    })
}

fn cluster_manager(ctx: &BuildContext) -> Result<ManagedObject, ControllerError> {
    unstructured(
        ctx,
        &cluster_manager_gvk(),
        None,
        CLUSTER_MANAGER_NAME,
        json!({ "registrationImagePullSpec": ctx.images.image(REGISTRATION_IMAGE_KEY)? }),
    )
}

/// Config-map recording the image references resolved for `images.manifest_version`.
pub(crate) fn image_manifest_configmap(
    hub: &MultiClusterHub,
    images: &ImageOverrideCacheEntry,
) -> ConfigMap {
    let mut labels = installer_labels(hub);
    labels.insert(CONFIGMAP_TYPE_LABEL.to_string(), "image-manifest".to_string());
    labels.insert(
        RELEASE_VERSION_LABEL.to_string(),
        images.manifest_version.clone(),
    );
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(format!("{}{}", IMAGE_MANIFEST_PREFIX, images.manifest_version)),
            namespace: hub.metadata.namespace.clone(),
            labels: Some(labels),
            owner_references: owner_reference(hub).map(|o| vec![o]),
            ..Default::default()
        },
        data: Some(images.resolved.clone()),
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        cluster_client::ObjectPath,
        image_overrides::{CacheKey, OverrideType},
        testing::hub,
        utils::INSTALLER_NAME_LABEL,
    };
    use k8s_openapi::ByteString;
    use multiclusterhub_operator_apis::{AvailabilityType, MultiClusterHubSpec};

    pub(crate) fn images() -> ImageOverrideCacheEntry {
        ImageOverrideCacheEntry {
            key: CacheKey {
                override_type: OverrideType::Manifest,
                image_repository: None,
                overrides_configmap: None,
            },
            resolved: [
                (REPO_IMAGE_KEY, "quay.io/ocm/multiclusterhub-repo@sha256:1"),
                (FOUNDATION_IMAGE_KEY, "quay.io/ocm/multicloud-manager@sha256:2"),
                (REGISTRATION_IMAGE_KEY, "quay.io/ocm/registration@sha256:3"),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            manifest_version: "2.1.0".to_string(),
        }
    }

    #[test]
    fn plan_is_ordered_by_dependencies() {
        let plan = ArtifactPlan::hub().unwrap();
        assert_eq!(21, plan.artifacts().len());
        assert_eq!("repo-deployment", plan.artifacts()[0].id);
        let list = plan.component_list();
        assert_eq!(4, list.deployments.len());
        assert_eq!(11, list.subscriptions.len());
        assert_eq!(vec![CLUSTER_MANAGER_NAME.to_string()], list.custom_resources);
    }

    #[test]
    fn plan_rejects_forward_dependencies() {
        let err = ArtifactPlan::new(vec![
            Artifact::new("grc-sub", Recipe::Subscription("grc"), &["channel"]),
            Artifact::new("channel", Recipe::Channel, &[]),
        ])
        .unwrap_err();
        assert!(matches!(err, ControllerError::MalformedConfiguration(_)));
        assert!(ArtifactPlan::new(vec![
            Artifact::new("channel", Recipe::Channel, &[]),
            Artifact::new("channel", Recipe::Channel, &[]),
        ])
        .is_err());
    }

    #[test]
    fn builders_are_deterministic_and_labelled() {
        let h = hub(MultiClusterHubSpec {
            image_pull_secret: Some("pull".to_string()),
            availability_config: Some(AvailabilityType::Basic),
            node_selector: Some([("zone".to_string(), "a".to_string())].into()),
            ..Default::default()
        });
        let images = images();
        let ctx = BuildContext {
            hub: &h,
            images: &images,
            pull_secret: None,
        };
        let plan = ArtifactPlan::hub().unwrap();
        for artifact in plan.artifacts() {
            let first = artifact.recipe.build(&ctx).unwrap();
            let second = artifact.recipe.build(&ctx).unwrap();
            assert_eq!(
                first.as_ref().map(|o| o.to_dynamic().unwrap()),
                second.as_ref().map(|o| o.to_dynamic().unwrap())
            );
            if let Some(obj) = first {
                let labels = obj.meta().labels.clone().unwrap();
                assert_eq!("multiclusterhub", labels[INSTALLER_NAME_LABEL]);
            }
        }

        let webhook = Recipe::WebhookDeployment.build(&ctx).unwrap().unwrap();
        let d = webhook.as_deployment().unwrap();
        let spec = d.spec.as_ref().unwrap();
        assert_eq!(Some(1), spec.replicas);
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!("pull", pod.image_pull_secrets.as_ref().unwrap()[0].name);
        assert_eq!(
            Some("quay.io/ocm/multicloud-manager@sha256:2"),
            pod.containers[0].image.as_deref()
        );
        assert_eq!(Some("Always"), pod.containers[0].image_pull_policy.as_deref());
        assert_eq!(
            "MultiClusterHub",
            d.metadata.owner_references.as_ref().unwrap()[0].kind
        );
    }

    #[test]
    fn cluster_manager_is_cluster_scoped() {
        let h = hub(Default::default());
        let images = images();
        let ctx = BuildContext {
            hub: &h,
            images: &images,
            pull_secret: None,
        };
        let cm = Recipe::ClusterManager.build(&ctx).unwrap().unwrap();
        assert_eq!(None, cm.meta().namespace);
        assert_eq!(None, cm.meta().owner_references);
        assert_eq!(
            Some("quay.io/ocm/registration@sha256:3"),
            cm.as_unstructured()
                .unwrap()
                .str_at(&["spec", "registrationImagePullSpec"])
        );
    }

    #[test]
    fn missing_image_key_is_malformed() {
        let h = hub(Default::default());
        let mut images = images();
        images.resolved.remove(FOUNDATION_IMAGE_KEY);
        let ctx = BuildContext {
            hub: &h,
            images: &images,
            pull_secret: None,
        };
        assert!(matches!(
            Recipe::ControllerDeployment.build(&ctx),
            Err(ControllerError::MalformedConfiguration(_))
        ));
    }

    #[test]
    fn pull_secret_copy_is_conditional() {
        let source = Secret {
            type_: Some("kubernetes.io/dockerconfigjson".to_string()),
            data: Some([(".dockerconfigjson".to_string(), ByteString(b"{}".to_vec()))].into()),
            ..Default::default()
        };
        let images = images();
        let plain = hub(MultiClusterHubSpec {
            image_pull_secret: Some("pull".to_string()),
            ..Default::default()
        });
        let ctx = BuildContext {
            hub: &plain,
            images: &images,
            pull_secret: Some(&source),
        };
        assert!(Recipe::CertManagerPullSecret.build(&ctx).unwrap().is_none());

        let separate = hub(MultiClusterHubSpec {
            image_pull_secret: Some("pull".to_string()),
            separate_certificate_management: true,
            ..Default::default()
        });
        let ctx = BuildContext {
            hub: &separate,
            images: &images,
            pull_secret: Some(&source),
        };
        let copy = Recipe::CertManagerPullSecret.build(&ctx).unwrap().unwrap();
        assert_eq!("Secret cert-manager/pull", copy.key().to_string());
        assert_eq!(None, copy.meta().owner_references);
    }

    #[test]
    fn image_manifest_configmap_shape() {
        let h = hub(Default::default());
        let cm = image_manifest_configmap(&h, &images());
        assert_eq!(Some("mch-image-manifest-2.1.0"), cm.metadata.name.as_deref());
        let labels = cm.metadata.labels.unwrap();
        assert_eq!("image-manifest", labels[CONFIGMAP_TYPE_LABEL]);
        assert_eq!("2.1.0", labels[RELEASE_VERSION_LABEL]);
        assert_eq!(3, cm.data.unwrap().len());
    }
}
