use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use multiclusterhub_operator_apis::MultiClusterHub;

pub(crate) const INSTALLER_NAME_LABEL: &'static str = "installer.name";
pub(crate) const INSTALLER_NAMESPACE_LABEL: &'static str = "installer.namespace";

/// Namespace cert-manager is installed into when certificate management is separated.
pub(crate) const CERT_MANAGER_NAMESPACE: &'static str = "cert-manager";

/// Ciphers enabled for the management ingress unless the hub names its own.
pub(crate) const DEFAULT_SSL_CIPHERS: [&'static str; 6] = [
    "ECDHE-ECDSA-AES256-GCM-SHA384",
    "ECDHE-RSA-AES256-GCM-SHA384",
    "ECDHE-ECDSA-CHACHA20-POLY1305",
    "ECDHE-RSA-CHACHA20-POLY1305",
    "ECDHE-ECDSA-AES128-GCM-SHA256",
    "ECDHE-RSA-AES128-GCM-SHA256",
];

/// Labels marking an object as installed by `hub`.
pub(crate) fn installer_labels(hub: &MultiClusterHub) -> BTreeMap<String, String> {
    [
        (INSTALLER_NAME_LABEL.to_string(), hub.name_any()),
        (
            INSTALLER_NAMESPACE_LABEL.to_string(),
            hub.namespace().unwrap_or_default(),
        ),
    ]
    .into()
}

pub(crate) fn installer_selector(hub: &MultiClusterHub) -> String {
    installer_labels(hub)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Controller owner reference pointing at `hub`, if it has been persisted.
pub(crate) fn owner_reference(hub: &MultiClusterHub) -> Option<OwnerReference> {
    hub.controller_owner_ref(&())
}

pub(crate) fn metric_name(name: &str) -> String {
    format!("multiclusterhub_{}", name)
}
