//! Resolution and caching of the image references used by hub components.
//!
//! References are resolved from the version pinned image manifest, then the
//! optional override config-map, then `RELATED_IMAGE_*` / `OPERAND_IMAGE_*`
//! environment variables (later sources win per image key), and finally the
//! custom repository annotation is substituted into every reference.
//!
//! The cache holds one immutable [`ImageOverrideCacheEntry`]. A rebuild creates
//! a new entry and swaps it in, so readers see either the old or the new entry.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use k8s_openapi::api::core::v1::ConfigMap;
use multiclusterhub_operator_apis::MultiClusterHub;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{
    cluster_client::{ClusterClient, ManagedObject, ObjectKey},
    errors::ControllerError,
};

pub(crate) const MANIFESTS_PATH_ENV: &'static str = "MANIFESTS_PATH";

const ENV_PREFIXES: [&'static str; 2] = ["RELATED_IMAGE_", "OPERAND_IMAGE_"];

/// One entry of an image manifest.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub(crate) struct ManifestImage {
    #[serde(rename = "image-key", default)]
    pub image_key: String,
    #[serde(rename = "image-name", default)]
    pub image_name: String,
    /// Remote registry where the image is stored.
    #[serde(rename = "image-remote", default)]
    pub image_remote: String,
    /// Immutable sha version identifier.
    #[serde(rename = "image-digest", default, skip_serializing_if = "String::is_empty")]
    pub image_digest: String,
    #[serde(rename = "image-tag", default, skip_serializing_if = "String::is_empty")]
    pub image_tag: String,
    #[serde(rename = "image-version", default, skip_serializing_if = "String::is_empty")]
    pub image_version: String,
}

impl ManifestImage {
    /// Render as `remote/name@digest`, `remote/name:tag` or, for suffix overrides,
    /// `remote/name:version-suffix`.
    pub fn reference(&self, override_type: &OverrideType) -> Result<String, ControllerError> {
        if self.image_key.is_empty() {
            return Err(ControllerError::malformed(format!(
                "manifest image {} has no image-key",
                self.image_name
            )));
        }
        let base = format!("{}/{}", self.image_remote, self.image_name);
        match override_type {
            OverrideType::Suffix(suffix) if !self.image_version.is_empty() => {
                Ok(format!("{}:{}-{}", base, self.image_version, suffix))
            }
            _ if !self.image_digest.is_empty() => Ok(format!("{}@{}", base, self.image_digest)),
            _ if !self.image_tag.is_empty() => Ok(format!("{}:{}", base, self.image_tag)),
            _ => Err(ControllerError::malformed(format!(
                "image {} has neither a digest nor a tag",
                self.image_key
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum OverrideType {
    Manifest,
    /// Tag suffix appended to the image version.
    Suffix(String),
}

impl OverrideType {
    pub fn of(hub: &MultiClusterHub) -> Self {
        match hub.image_tag_suffix() {
            Some(suffix) => Self::Suffix(suffix.to_string()),
            None => Self::Manifest,
        }
    }
}

/// The hub configuration an entry was built from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CacheKey {
    pub override_type: OverrideType,
    pub image_repository: Option<String>,
    pub overrides_configmap: Option<String>,
}

impl CacheKey {
    pub fn of(hub: &MultiClusterHub) -> Self {
        Self {
            override_type: OverrideType::of(hub),
            image_repository: hub.image_repository().map(|v| v.to_string()),
            overrides_configmap: hub.image_overrides_configmap().map(|v| v.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ImageOverrideCacheEntry {
    pub key: CacheKey,
    /// image-key to full image reference.
    pub resolved: BTreeMap<String, String>,
    pub manifest_version: String,
}

impl ImageOverrideCacheEntry {
    pub fn is_stale(&self, key: &CacheKey) -> bool {
        &self.key != key
    }

    pub fn image(&self, image_key: &str) -> Result<&str, ControllerError> {
        self.resolved
            .get(image_key)
            .map(|v| v.as_str())
            .ok_or_else(|| {
                ControllerError::malformed(format!("no image reference for key {}", image_key))
            })
    }
}

/// Where image references come from.
#[derive(Clone, Debug)]
pub(crate) struct OverrideSources {
    pub manifests_path: Option<PathBuf>,
    pub version: String,
    pub env: Vec<(String, String)>,
}

impl OverrideSources {
    pub fn manifest_file(&self) -> Result<PathBuf, ControllerError> {
        let dir = self.manifests_path.as_ref().ok_or_else(|| {
            ControllerError::malformed(format!(
                "{} environment variable is required",
                MANIFESTS_PATH_ENV
            ))
        })?;
        Ok(dir.join(format!("{}.json", self.version)))
    }
}

pub(crate) fn parse_manifest(data: &str, origin: &str) -> Result<Vec<ManifestImage>, ControllerError> {
    serde_json::from_str(data).map_err(|e| {
        ControllerError::malformed(format!("image manifest {} is not valid: {}", origin, e))
    })
}

pub(crate) fn read_manifest(path: &Path) -> Result<Vec<ManifestImage>, ControllerError> {
    let data = std::fs::read_to_string(path).map_err(|e| {
        ControllerError::malformed(format!(
            "failed to read image manifest {}: {}",
            path.display(),
            e
        ))
    })?;
    parse_manifest(&data, &path.display().to_string())
}

/// Overrides from a config-map holding exactly one key whose value is a manifest.
pub(crate) fn configmap_overrides(
    configmap: &ConfigMap,
) -> Result<BTreeMap<String, String>, ControllerError> {
    let name = configmap.metadata.name.as_deref().unwrap_or("");
    let data = configmap.data.clone().unwrap_or_default();
    if data.len() != 1 {
        return Err(ControllerError::malformed(format!(
            "unexpected number of keys in configmap {}: {}",
            name,
            data.len()
        )));
    }
    let mut overrides = BTreeMap::new();
    for value in data.values() {
        for image in parse_manifest(value, name)? {
            let reference = image.reference(&OverrideType::Manifest)?;
            overrides.insert(image.image_key, reference);
        }
    }
    Ok(overrides)
}

/// Overrides from prefixed environment variables, keyed by the lower-cased remainder.
pub(crate) fn env_overrides<'a>(
    vars: impl IntoIterator<Item = &'a (String, String)>,
) -> BTreeMap<String, String> {
    let mut overrides = BTreeMap::new();
    for (name, value) in vars {
        if let Some(key) = ENV_PREFIXES.iter().find_map(|p| name.strip_prefix(p)) {
            if !key.is_empty() && !value.trim().is_empty() {
                overrides.insert(key.to_lowercase(), value.trim().to_string());
            }
        }
    }
    overrides
}

/// Replace everything up to the last `/` of `reference` with `repository`.
pub(crate) fn override_repository(reference: &str, repository: &str) -> String {
    let repository = repository.trim_end_matches('/');
    match reference.rfind('/') {
        Some(i) => format!("{}/{}", repository, &reference[i + 1..]),
        None => format!("{}/{}", repository, reference),
    }
}

/// Process wide cache of resolved image references.
pub(crate) struct ImageOverrideCache {
    sources: OverrideSources,
    entry: RwLock<Option<Arc<ImageOverrideCacheEntry>>>,
}

impl ImageOverrideCache {
    pub fn new(sources: OverrideSources) -> Self {
        Self {
            sources,
            entry: RwLock::new(None),
        }
    }

    pub async fn current(&self) -> Option<Arc<ImageOverrideCacheEntry>> {
        self.entry.read().await.clone()
    }

    /// Return the cached entry for `hub`, rebuilding it first when stale.
    ///
    /// On error the previous entry stays in place.
    pub async fn resolve(
        &self,
        client: &dyn ClusterClient,
        hub: &MultiClusterHub,
    ) -> Result<Arc<ImageOverrideCacheEntry>, ControllerError> {
        let key = CacheKey::of(hub);
        if let Some(entry) = self.current().await {
            if !entry.is_stale(&key) {
                return Ok(entry);
            }
            info!("image overrides of {} are stale, rebuilding", hub.id());
        }
        let entry = Arc::new(self.build(client, hub, key).await?);
        *self.entry.write().await = Some(entry.clone());
        Ok(entry)
    }

    async fn build(
        &self,
        client: &dyn ClusterClient,
        hub: &MultiClusterHub,
        key: CacheKey,
    ) -> Result<ImageOverrideCacheEntry, ControllerError> {
        let mut resolved = BTreeMap::new();
        for image in read_manifest(&self.sources.manifest_file()?)? {
            let reference = image.reference(&key.override_type)?;
            resolved.insert(image.image_key, reference);
        }

        if let Some(name) = &key.overrides_configmap {
            let namespace = hub.metadata.namespace.as_deref();
            info!(
                "overriding images from configmap {}/{}",
                namespace.unwrap_or(""),
                name
            );
            match client.get(&ObjectKey::of::<ConfigMap>(namespace, name)).await? {
                ManagedObject::ConfigMap(cm) => resolved.extend(configmap_overrides(&cm)?),
                other => {
                    return Err(ControllerError::InvalidObject(format!(
                        "expected a ConfigMap, got {}",
                        other.key()
                    )));
                }
            }
        }

        let from_env = env_overrides(&self.sources.env);
        if !from_env.is_empty() {
            debug!("found {} image overrides in the environment", from_env.len());
        }
        resolved.extend(from_env);

        if let Some(repository) = &key.image_repository {
            info!("overriding image repository with {}", repository);
            for reference in resolved.values_mut() {
                *reference = override_repository(reference, repository);
            }
        }

        Ok(ImageOverrideCacheEntry {
            key,
            resolved,
            manifest_version: self.sources.version.clone(),
        })
    }
}
