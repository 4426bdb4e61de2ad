use crate::{
    cluster_client::{ClusterClient, ManagedObject},
    comparator::compare,
    errors::{ControllerError, ExtKubeApiError},
};

/// What an ensure call did to the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EnsureOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Get-or-create `desired`. An existing object is returned untouched.
///
/// Errors other than not-found on lookup are surfaced unmodified. A create that
/// conflicts with a concurrent creator is resolved by looking the object up again.
pub(crate) async fn ensure_present(
    client: &dyn ClusterClient,
    desired: &ManagedObject,
) -> Result<(ManagedObject, EnsureOutcome), ControllerError> {
    let key = desired.key();
    match client.get(&key).await {
        Ok(found) => return Ok((found, EnsureOutcome::Unchanged)),
        Err(e) if e.is_not_found() => (),
        Err(e) => return Err(e),
    }
    match client.create(desired).await {
        Ok(created) => {
            info!("created {}", key);
            Ok((created, EnsureOutcome::Created))
        }
        Err(e) if e.is_conflict() => {
            debug!("{} was created concurrently, checking again", key);
            let found = client.get(&key).await?;
            Ok((found, EnsureOutcome::Unchanged))
        }
        Err(e) => Err(e),
    }
}

/// [`ensure_present`] followed by a comparison and, on drift, a single update.
pub(crate) async fn ensure_converged(
    client: &dyn ClusterClient,
    desired: &ManagedObject,
) -> Result<EnsureOutcome, ControllerError> {
    let (observed, outcome) = ensure_present(client, desired).await?;
    if outcome == EnsureOutcome::Created {
        return Ok(outcome);
    }
    let comparison = compare(desired, &observed)?;
    if comparison.changed {
        info!("updating {} to match the desired state", desired.key());
        client.update(&comparison.patched).await?;
        Ok(EnsureOutcome::Updated)
    } else {
        Ok(EnsureOutcome::Unchanged)
    }
}
