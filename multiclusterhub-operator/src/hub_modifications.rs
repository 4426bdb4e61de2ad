use std::ops::{Deref, DerefMut};

use json_patch::diff;
use multiclusterhub_operator_apis::{MultiClusterHub, MultiClusterHubStatus};

use crate::{cluster_client::ClusterClient, errors::ControllerError, status::status_diff};

/// Helper construct to track changes made to a [`MultiClusterHub`] during one pass
/// and to write back only what actually changed.
pub(crate) struct HubModifications {
    original: MultiClusterHub,
    pub modified: MultiClusterHub,
}

impl Deref for HubModifications {
    type Target = MultiClusterHub;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl DerefMut for HubModifications {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

impl HubModifications {
    pub(crate) fn new(original: MultiClusterHub) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    /// Mutable access to the status, creating an empty one if needed.
    pub(crate) fn status_mut(&mut self) -> &mut MultiClusterHubStatus {
        self.modified.status.get_or_insert_with(Default::default)
    }

    pub(crate) fn status_has_changed(&self) -> Result<bool, ControllerError> {
        let original = self.original.status_or_default();
        let modified = self.modified.status_or_default();
        Ok(!status_diff(&original, &modified)?.0.is_empty())
    }

    fn get_spec_patch(&self) -> Result<Option<json_patch::Patch>, ControllerError> {
        let mut original = self.original.clone();
        let mut modified = self.modified.clone();
        original.status = None;
        modified.status = None;
        let patch = diff(
            &serde_json::to_value(&original)?,
            &serde_json::to_value(&modified)?,
        );
        if patch.0.is_empty() {
            Ok(None)
        } else {
            Ok(Some(patch))
        }
    }

    /// Patch spec and metadata changes onto the hub, keeping the status edits.
    pub(crate) async fn patch_spec(&mut self, client: &dyn ClusterClient) -> Result<bool, ControllerError> {
        let Some(patch) = self.get_spec_patch()? else {
            return Ok(false);
        };
        debug!(
            "patch {} ({:?}) with {}",
            self.original.id(),
            self.original.metadata.resource_version,
            serde_json::to_string(&patch)?
        );
        let patched = client.patch_hub(&self.original, patch).await?;
        let status = self.modified.status.take();
        self.original = patched.clone();
        self.modified = patched;
        self.modified.status = status;
        Ok(true)
    }

    /// Write the status sub-resource if it differs from the observed one.
    ///
    /// The write carries the observed resource version, so a concurrent change
    /// of the hub surfaces as a conflict.
    pub(crate) async fn replace_status(&mut self, client: &dyn ClusterClient) -> Result<bool, ControllerError> {
        if !self.status_has_changed()? {
            return Ok(false);
        }
        let mut update = self.original.clone();
        update.status = self.modified.status.clone();
        let written = client.update_hub_status(&update).await?;
        self.original.metadata.resource_version = written.metadata.resource_version.clone();
        self.original.status = written.status.clone();
        self.modified.metadata.resource_version = written.metadata.resource_version;
        Ok(true)
    }
}
