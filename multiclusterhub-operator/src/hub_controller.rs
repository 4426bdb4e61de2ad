use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Instant,
};

use futures::StreamExt;
use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::Secret,
    },
    chrono::{DateTime, Utc},
};
use kube::{
    Api, ResourceExt,
    api::{DynamicObject, GroupVersionKind},
};
use kube_runtime::{
    controller::{Action, Controller},
    watcher::Config,
};
use multiclusterhub_operator_apis::{
    AvailabilityType, HubCondition, HubPhase, MultiClusterHub, PROGRESSING, TERMINATING,
};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use tokio::time::{Duration, sleep};

use crate::{
    FINALIZER, RESYNC_PERIOD,
    cluster_client::{ClusterClient, ManagedObject, ObjectKey, ObjectPath, gvk_of},
    components::{ArtifactPlan, BuildContext, cluster_manager_gvk, helm_release_gvk, image_manifest_configmap},
    ensure::{EnsureOutcome, ensure_converged},
    errors::{ControllerError, ExtKubeApiError},
    hub_modifications::HubModifications,
    image_overrides::{ImageOverrideCache, ImageOverrideCacheEntry, OverrideSources},
    status::{
        DELETION_TIMESTAMP_PRESENT, FAILED_DEPLOYING_COMPONENT, MCH_PAUSED, MCH_RECONCILING,
        MCH_RESUMED, NEW_RESOURCE_CREATED, OLD_RESOURCE_DELETE_FAILED, Observed, all_successful,
        calculate_status, component_statuses, set_condition,
    },
    uninstall::Uninstaller,
    utils::{DEFAULT_SSL_CIPHERS, metric_name},
};

const HUB_CONTROLLER: &'static str = "hub_controller";

/// Backoff of failing hubs, doubled per consecutive failure.
const MIN_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

fn cluster_ingress_key() -> ObjectKey {
    ObjectKey::new(
        GroupVersionKind::gvk("config.openshift.io", "v1", "Ingress"),
        None,
        "cluster",
    )
}

/// Outcome of a single pipeline step.
#[derive(Debug)]
pub(crate) enum StepResult {
    /// Proceed with the next step.
    Continue,
    /// Nothing more to do until the hub changes.
    Done,
    /// Stop here and reconcile again after the given delay.
    RequeueAfter(Duration),
    /// Stop here and hand the error to the error policy.
    Fatal(ControllerError),
}

/// Steps run after the hub has been fetched, in this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Finalize,
    AddFinalizer,
    SetDefaults,
    Pause,
    ImageOverrides,
    ImageManifest,
    Artifacts,
    Status,
    Prune,
}

pub(crate) const PIPELINE: [Step; 9] = [
    Step::Finalize,
    Step::AddFinalizer,
    Step::SetDefaults,
    Step::Pause,
    Step::ImageOverrides,
    Step::ImageManifest,
    Step::Artifacts,
    Step::Status,
    Step::Prune,
];

/// State of one reconciliation pass of a single hub.
struct Pass<'a> {
    controller: &'a HubController,
    event: HubModifications,
    images: Option<Arc<ImageOverrideCacheEntry>>,
    now: DateTime<Utc>,
}

impl<'a> Pass<'a> {
    fn client(&self) -> &'a dyn ClusterClient {
        self.controller.client.as_ref()
    }

    async fn step(&mut self, step: Step) -> StepResult {
        let result = match step {
            Step::Finalize => self.finalize().await,
            Step::AddFinalizer => self.add_finalizer_if_missing().await,
            Step::SetDefaults => self.set_defaults().await,
            Step::Pause => self.pause().await,
            Step::ImageOverrides => self.image_overrides().await,
            Step::ImageManifest => self.image_manifest().await,
            Step::Artifacts => self.artifacts().await,
            Step::Status => self.status().await,
            Step::Prune => self.prune().await,
        };
        match result {
            Ok(r) => r,
            Err(e) => StepResult::Fatal(e),
        }
    }

    fn set_condition(&mut self, c: HubCondition) {
        let now = self.now;
        set_condition(self.event.status_mut(), c, now);
    }

    /// Write pending status changes; a concurrent change of the hub requeues the pass.
    async fn write_status(&mut self) -> Result<StepResult, ControllerError> {
        let client = self.client();
        match self.event.replace_status(client).await {
            Ok(_) => Ok(StepResult::Continue),
            Err(e) if e.is_conflict() => {
                info!("{} changed while reconciling, retrying later", self.event.id());
                Ok(StepResult::RequeueAfter(RESYNC_PERIOD))
            }
            Err(e) => Err(e),
        }
    }

    /// Record `e` on the hub status and surface it.
    async fn fail(&mut self, e: ControllerError) -> Result<StepResult, ControllerError> {
        if e.is_conflict() {
            info!("conflict while reconciling {}, retrying later: {}", self.event.id(), e);
            return Ok(StepResult::RequeueAfter(RESYNC_PERIOD));
        }
        let c = HubCondition::new(
            PROGRESSING,
            Some(false),
            FAILED_DEPLOYING_COMPONENT,
            e.to_string(),
        );
        self.set_condition(c);
        self.event.status_mut().phase = HubPhase::Pending;
        let client = self.client();
        if let Err(write) = self.event.replace_status(client).await {
            error!("failed to record error on {}: {}", self.event.id(), write);
        }
        Err(e)
    }

    async fn finalize(&mut self) -> Result<StepResult, ControllerError> {
        if !self.event.is_deleted() {
            return Ok(StepResult::Continue);
        }
        if !self.event.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(StepResult::Done);
        }
        info!("uninstalling {}", self.event.id());
        let c = HubCondition::new(
            TERMINATING,
            Some(true),
            DELETION_TIMESTAMP_PRESENT,
            "Hub is being deleted",
        );
        self.set_condition(c);
        self.event.status_mut().phase = HubPhase::Uninstalling;

        let client = self.client();
        let hub = self.event.modified.clone();
        let now = self.now;
        let report = match Uninstaller::new(client)
            .run(&hub, self.event.status_mut(), now)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                if let Err(write) = self.event.replace_status(client).await {
                    error!("failed to record uninstall error on {}: {}", self.event.id(), write);
                }
                return Err(e);
            }
        };
        match self.write_status().await? {
            StepResult::Continue => (),
            other => return Ok(other),
        }
        if !report.all_clear() {
            let pending: Vec<String> = report.pending().iter().map(|k| k.to_string()).collect();
            debug!(
                "{} still waiting for {} and helm releases {:?}",
                self.event.id(),
                pending.join(", "),
                report.remaining_helm_releases
            );
            return Ok(StepResult::RequeueAfter(RESYNC_PERIOD));
        }
        self.remove_finalizer().await?;
        self.controller.reset_backoff(&self.event.id());
        info!("uninstalled {}", self.event.id());
        Ok(StepResult::Done)
    }

    async fn add_finalizer_if_missing(&mut self) -> Result<StepResult, ControllerError> {
        let client = self.client();
        let finalizers = self.event.finalizers_mut();
        if !finalizers.iter().any(|f| f == FINALIZER) {
            finalizers.push(FINALIZER.to_string());
            self.event.patch_spec(client).await?;
        }
        Ok(StepResult::Continue)
    }

    async fn remove_finalizer(&mut self) -> Result<(), ControllerError> {
        let client = self.client();
        self.event.finalizers_mut().retain(|f| f != FINALIZER);
        match self.event.patch_spec(client).await {
            Ok(_) => Ok(()),
            // Already gone.
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_defaults(&mut self) -> Result<StepResult, ControllerError> {
        if self.event.spec.ingress.ssl_ciphers.is_empty() {
            self.event.spec.ingress.ssl_ciphers =
                DEFAULT_SSL_CIPHERS.iter().map(|v| v.to_string()).collect();
        }
        if self.event.spec.availability_config.is_none() {
            self.event.spec.availability_config = Some(AvailabilityType::High);
        }
        if self.event.spec.ingress.domain.is_none() {
            match self.client().get(&cluster_ingress_key()).await {
                Ok(ingress) => {
                    self.event.spec.ingress.domain = ingress
                        .as_unstructured()
                        .and_then(|o| o.str_at(&["spec", "domain"]))
                        .filter(|v| !v.is_empty())
                        .map(|v| v.to_string());
                }
                Err(e) if e.is_not_found() => {
                    debug!("no cluster ingress found, leaving the ingress domain empty");
                }
                Err(e) => return Err(e),
            }
        }
        let client = self.client();
        if self.event.patch_spec(client).await? {
            info!("set defaults of {}", self.event.id());
            return Ok(StepResult::RequeueAfter(Duration::ZERO));
        }
        Ok(StepResult::Continue)
    }

    async fn pause(&mut self) -> Result<StepResult, ControllerError> {
        let paused_before = self
            .event
            .status
            .as_ref()
            .and_then(|s| s.condition(PROGRESSING))
            .map_or(false, |c| c.reason == MCH_PAUSED);
        if self.event.is_paused() {
            info!("{} is paused, leaving its components alone", self.event.id());
            self.set_condition(HubCondition::new(
                PROGRESSING,
                None,
                MCH_PAUSED,
                "Hub is paused",
            ));
            return match self.write_status().await? {
                StepResult::Continue => Ok(StepResult::Done),
                other => Ok(other),
            };
        }
        if paused_before {
            info!("{} resumed", self.event.id());
            self.set_condition(HubCondition::new(
                PROGRESSING,
                Some(true),
                MCH_RESUMED,
                "Hub is resumed",
            ));
        }
        Ok(StepResult::Continue)
    }

    async fn image_overrides(&mut self) -> Result<StepResult, ControllerError> {
        let controller = self.controller;
        match controller
            .images
            .resolve(controller.client.as_ref(), &self.event.modified)
            .await
        {
            Ok(entry) => {
                self.images = Some(entry);
                Ok(StepResult::Continue)
            }
            Err(e) => self.fail(e).await,
        }
    }

    fn images(&self) -> Result<Arc<ImageOverrideCacheEntry>, ControllerError> {
        self.images
            .clone()
            .ok_or_else(|| ControllerError::malformed("image references are not resolved"))
    }

    async fn image_manifest(&mut self) -> Result<StepResult, ControllerError> {
        let images = self.images()?;
        let desired = ManagedObject::ConfigMap(image_manifest_configmap(&self.event, &images));
        match ensure_converged(self.client(), &desired).await {
            Ok(_) => Ok(StepResult::Continue),
            Err(e) => self.fail(e).await,
        }
    }

    async fn pull_secret(&self) -> Result<Option<Secret>, ControllerError> {
        let spec = &self.event.spec;
        let Some(name) = spec.image_pull_secret().filter(|_| spec.separate_certificate_management)
        else {
            return Ok(None);
        };
        let key = ObjectKey::of::<Secret>(self.event.namespace().as_deref(), name);
        match self.client().get(&key).await? {
            ManagedObject::Secret(secret) => Ok(Some(secret)),
            other => Err(ControllerError::InvalidObject(format!(
                "expected a Secret, got {}",
                other.key()
            ))),
        }
    }

    async fn apply_artifacts(&mut self) -> Result<(), ControllerError> {
        let images = self.images()?;
        let pull_secret = self.pull_secret().await?;
        let hub = self.event.modified.clone();
        let ctx = BuildContext {
            hub: &hub,
            images: &images,
            pull_secret: pull_secret.as_ref(),
        };
        let controller = self.controller;
        for artifact in controller.plan.artifacts() {
            let Some(desired) = artifact.recipe.build(&ctx)? else {
                continue;
            };
            if ensure_converged(controller.client.as_ref(), &desired).await? == EnsureOutcome::Created {
                self.set_condition(HubCondition::new(
                    PROGRESSING,
                    Some(true),
                    NEW_RESOURCE_CREATED,
                    format!("New resource {} created", desired.key()),
                ));
            }
        }
        Ok(())
    }

    async fn artifacts(&mut self) -> Result<StepResult, ControllerError> {
        if let Err(e) = self.apply_artifacts().await {
            return self.fail(e).await;
        }
        let failed_before = self
            .event
            .status
            .as_ref()
            .and_then(|s| s.condition(PROGRESSING))
            .map_or(false, |c| c.reason == FAILED_DEPLOYING_COMPONENT);
        if failed_before {
            self.set_condition(HubCondition::new(
                PROGRESSING,
                Some(true),
                MCH_RECONCILING,
                "Hub is reconciling.",
            ));
        }
        Ok(StepResult::Continue)
    }

    async fn list_or_empty(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Vec<ManagedObject>, ControllerError> {
        match self.client().list(gvk, namespace, None).await {
            Ok(found) => Ok(found),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn observe(&self) -> Result<Observed, ControllerError> {
        let namespace = self.event.namespace();
        let deployments = self
            .list_or_empty(&gvk_of::<Deployment>(), namespace.as_deref())
            .await?
            .iter()
            .filter_map(|o| o.as_deployment().cloned())
            .collect();
        let helm_releases = self
            .list_or_empty(&helm_release_gvk(), namespace.as_deref())
            .await?
            .iter()
            .filter_map(|o| o.as_unstructured().cloned())
            .collect();
        let mut custom_resources: Vec<DynamicObject> = Vec::new();
        for name in self.controller.plan.component_list().custom_resources {
            match self
                .client()
                .get(&ObjectKey::new(cluster_manager_gvk(), None, &name))
                .await
            {
                Ok(found) => custom_resources.extend(found.as_unstructured().cloned()),
                Err(e) if e.is_not_found() => (),
                Err(e) => return Err(e),
            }
        }
        Ok(Observed {
            deployments,
            helm_releases,
            custom_resources,
        })
    }

    async fn status(&mut self) -> Result<StepResult, ControllerError> {
        let observed = self.observe().await?;
        let components = component_statuses(&self.controller.plan.component_list(), &observed);
        let ready = all_successful(&components);
        let status = calculate_status(&self.event, components, &self.controller.version, self.now);
        let phase = status.phase;
        self.event.modified.status = Some(status);
        match self.write_status().await? {
            StepResult::Continue => (),
            other => return Ok(other),
        }
        if !ready {
            debug!("{} is {}, checking again later", self.event.id(), phase);
            return Ok(StepResult::RequeueAfter(RESYNC_PERIOD));
        }
        Ok(StepResult::Continue)
    }

    /// Remove what earlier releases left behind, once every component is up.
    async fn prune(&mut self) -> Result<StepResult, ControllerError> {
        let client = self.client();
        let hub = self.event.modified.clone();
        let now = self.now;
        let pruned = Uninstaller::new(client)
            .prune(&hub, self.event.status_mut(), now)
            .await;
        let all_gone = match pruned {
            Ok(all_gone) => all_gone,
            Err(e) => {
                self.set_condition(HubCondition::new(
                    PROGRESSING,
                    Some(false),
                    OLD_RESOURCE_DELETE_FAILED,
                    e.to_string(),
                ));
                if let Err(write) = self.event.replace_status(client).await {
                    error!("failed to record pruning error on {}: {}", self.event.id(), write);
                }
                return Err(e);
            }
        };
        let components = self.event.status_or_default().components;
        let status = calculate_status(&self.event, components, &self.controller.version, now);
        let phase = status.phase;
        self.event.modified.status = Some(status);
        match self.write_status().await? {
            StepResult::Continue => (),
            other => return Ok(other),
        }
        if !all_gone || phase != HubPhase::Running {
            debug!("{} is still pruning old resources", self.event.id());
            return Ok(StepResult::RequeueAfter(RESYNC_PERIOD));
        }
        Ok(StepResult::Continue)
    }
}

/// Reconciles [`MultiClusterHub`] objects into the components they describe.
pub(crate) struct HubController {
    client: Arc<dyn ClusterClient>,
    images: ImageOverrideCache,
    plan: ArtifactPlan,
    /// Version of the hub this operator installs.
    version: String,
    /// Current backoff per hub (`namespace/name`).
    backoff: Mutex<HashMap<String, Duration>>,

    reconcile_count: Counter<u64>,
    reconcile_duration: Histogram<u64>,
}

impl HubController {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        sources: OverrideSources,
    ) -> Result<Self, ControllerError> {
        let meter: Meter = global::meter(HUB_CONTROLLER);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of MultiClusterHub reconcile invocations")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration of MultiClusterHub objects in milliseconds")
            .with_unit("ms")
            .build();
        Ok(Self {
            client,
            version: sources.version.clone(),
            images: ImageOverrideCache::new(sources),
            plan: ArtifactPlan::hub()?,
            backoff: Default::default(),
            reconcile_count,
            reconcile_duration,
        })
    }

    /// Run one pass for the hub `namespace/name`.
    ///
    /// Returns the delay after which the hub should be looked at again, `None`
    /// if nothing is left to do until it changes.
    pub(crate) async fn reconcile_hub(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Duration>, ControllerError> {
        // fetch
        let hub = match self.client.get_hub(namespace, name).await {
            Ok(hub) => hub,
            Err(e) if e.is_not_found() => {
                debug!("{}/{} is gone", namespace, name);
                self.reset_backoff(&format!("{}/{}", namespace, name));
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let mut pass = Pass {
            controller: self,
            event: HubModifications::new(hub),
            images: None,
            now: Utc::now(),
        };
        for step in PIPELINE {
            match pass.step(step).await {
                StepResult::Continue => (),
                StepResult::Done => return Ok(None),
                StepResult::RequeueAfter(d) => return Ok(Some(d)),
                StepResult::Fatal(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn next_backoff(&self, id: &str, error: &ControllerError) -> Duration {
        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        let next = if error.is_temporary() {
            backoff
                .get(id)
                .map_or(MIN_BACKOFF, |d| (*d * 2).min(MAX_BACKOFF))
        } else {
            MAX_BACKOFF
        };
        backoff.insert(id.to_string(), next);
        next
    }

    fn reset_backoff(&self, id: &str) {
        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        backoff.remove(id);
    }

    /// Controller triggers this whenever a hub or one of its deployments changed
    async fn reconcile(
        object: Arc<MultiClusterHub>,
        ctx: Arc<Self>,
    ) -> Result<Action, ControllerError> {
        let me = ctx.as_ref();
        let namespace = object.namespace().unwrap_or_default();
        let name = object.name_any();
        let start = Instant::now();
        let result = me.reconcile_hub(namespace.as_str(), name.as_str()).await;
        let duration = Instant::now() - start;
        let labels = &[
            KeyValue::new("hub_name", name),
            KeyValue::new("hub_namespace", namespace),
        ];
        me.reconcile_count.add(1, labels);
        me.reconcile_duration
            .record(duration.as_millis() as u64, labels);
        let requeue = result?;
        me.reset_backoff(&object.id());
        Ok(match requeue {
            Some(delay) => Action::requeue(delay),
            None => Action::await_change(),
        })
    }

    /// The controller triggers this on reconcile errors
    fn error_policy(object: Arc<MultiClusterHub>, error: &ControllerError, ctx: Arc<Self>) -> Action {
        let delay = ctx.next_backoff(&object.id(), error);
        warn!("reconciling {} failed, retrying in {:?}: {}", object.id(), delay, error);
        Action::requeue(delay)
    }

    pub fn start(
        self,
        hubs: Api<MultiClusterHub>,
        deployments: Api<Deployment>,
    ) -> impl Future<Output = ()> {
        let context = Arc::new(self);
        let known = context.clone();
        let controller = Controller::new(hubs, Config::default())
            .owns(deployments, Config::default())
            .run(Self::reconcile, Self::error_policy, context)
            .for_each(move |res| {
                let known = known.clone();
                async move {
                    match res {
                        Ok(o) => {
                            debug!("reconciled {:?}", o);
                        }
                        Err(e) => {
                            let meter: Meter = global::meter(HUB_CONTROLLER);
                            let reconcile_errors = meter
                                .u64_counter(metric_name("reconcile_errors"))
                                .with_description(
                                    "Count of reconcile invocation errors for MultiClusterHub resources",
                                )
                                .build();
                            let labels = &[];
                            match e {
                                a @ kube_runtime::controller::Error::QueueError { .. } => {
                                    debug!("reconcile failed: {:?}", a);
                                    reconcile_errors.add(1, labels);
                                    // Slow down on errors caused by missing CRDs or permissions.
                                    sleep(Duration::from_secs(30)).await;
                                }
                                kube_runtime::controller::Error::ObjectNotFound(obj) => {
                                    debug!("reconcile failed: {:?}", obj);
                                    known.reset_backoff(&format!(
                                        "{}/{}",
                                        obj.namespace.as_deref().unwrap_or(""),
                                        obj.name
                                    ));
                                }
                                e => {
                                    warn!("reconcile failed: {:?}", e);
                                    reconcile_errors.add(1, labels);
                                }
                            };
                        }
                    }
                }
            });
        controller
    }
}
