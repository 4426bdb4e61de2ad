#[macro_use]
extern crate log;

use std::{path::PathBuf, sync::Arc, time::Duration};

use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client};
use multiclusterhub_operator_apis::MultiClusterHub;
use prometheus::Registry;

use cluster_client::KubeClusterClient;
use hub_controller::HubController;
use image_overrides::{MANIFESTS_PATH_ENV, OverrideSources};
use prometheus_exporter::{init_meter_provider, start_prometheus_metrics_server};

mod cluster_client;
mod comparator;
mod components;
mod ensure;
mod errors;
mod hub_controller;
mod hub_modifications;
mod image_overrides;
mod prometheus_exporter;
mod status;
mod uninstall;
mod utils;

#[cfg(test)]
mod testing;

/// The K8s field manager name.
const MANAGER: &'static str = "multiclusterhub-operator";

/// The K8s finalizer name.
///
/// Note, changing the finalizer name is a breaking change: hubs created by an
/// older operator would keep the old finalizer and could not be deleted.
const FINALIZER: &'static str = "finalizer.operator.open-cluster-management.io";

/// Delay before looking again at a hub which is not yet fully running.
const RESYNC_PERIOD: Duration = Duration::from_secs(20);

const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 10;

#[derive(Clone)]
struct Configuration {
    client: Client,
    /// Only hubs in this namespace are reconciled, all namespaces if `None`.
    watch_namespace: Option<String>,
    manifests_path: Option<PathBuf>,
    /// Hub release this operator installs.
    version: String,
    request_timeout: Duration,
}

impl Configuration {
    pub fn new(client: Client) -> anyhow::Result<Self> {
        let watch_namespace = env_var("WATCH_NAMESPACE");
        match &watch_namespace {
            Some(ns) => info!("Controller is only watching hubs in namespace {}", ns),
            None => info!("Controller is watching hubs in all namespaces"),
        }
        let request_timeout = match env_var("REQUEST_TIMEOUT_SECONDS") {
            Some(v) => v.parse::<u64>().map_err(|e| {
                anyhow::anyhow!("invalid REQUEST_TIMEOUT_SECONDS {}: {}", v, e)
            })?,
            None => DEFAULT_REQUEST_TIMEOUT_SECONDS,
        };
        Ok(Configuration {
            client,
            watch_namespace,
            manifests_path: env_var(MANIFESTS_PATH_ENV).map(PathBuf::from),
            version: env_var("OPERATOR_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            request_timeout: Duration::from_secs(request_timeout),
        })
    }

    fn hubs(&self) -> Api<MultiClusterHub> {
        match &self.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns.as_str()),
            None => Api::all(self.client.clone()),
        }
    }

    fn deployments(&self) -> Api<Deployment> {
        match &self.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns.as_str()),
            None => Api::all(self.client.clone()),
        }
    }

    fn override_sources(&self) -> OverrideSources {
        OverrideSources {
            manifests_path: self.manifests_path.clone(),
            version: self.version.clone(),
            env: std::env::vars().collect(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install the rustls crypto provider"))?;
    let metrics_addr = env_var("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
    let metrics_port = env_var("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
    let metrics_addr = format!("{}:{}", metrics_addr, metrics_port).parse()?;
    let registry = Registry::new();
    init_meter_provider(&registry)?;
    let prometheus_metrics_exporter = start_prometheus_metrics_server(metrics_addr, registry);

    let client = Client::try_default().await?;
    let configuration = Configuration::new(client)?;
    info!("installing hub release {}", configuration.version);
    let cluster = Arc::new(KubeClusterClient::new(
        configuration.client.clone(),
        configuration.request_timeout,
    ));
    let controller = HubController::new(cluster, configuration.override_sources())?
        .start(configuration.hubs(), configuration.deployments());
    info!("start controllers ...");
    tokio::select! {
       _ = controller => (),
       result = prometheus_metrics_exporter => result?,
    };
    Ok(())
}
