use crate::cluster::DynamicCluster;
use crate::errors::{ErrorKind, MnemoError};
use crate::prelude::*;
use crate::types::{self, OwnerRef, RestoreObject};

use tracing::debug;

fn resolve_error(owner: &OwnerRef, reason: impl Into<String>) -> MnemoError {
    ErrorKind::OwnerResolveError {
        kind: owner.reference.kind.clone(),
        name: owner.reference.name.clone(),
        reason: reason.into(),
    }
    .into()
}

/// Replaces the stale uid of every owner-reference entry with the parent's
/// post-restore uid, read live immediately before apply. Entries with an
/// empty `apiVersion` or `kind` are skipped.
pub async fn rewrite_owner_uids(
    cluster: &dyn DynamicCluster,
    object: &mut RestoreObject,
) -> Result<()> {
    for owner in types::owner_references(&object.payload) {
        let (group, version) = owner.group_version();
        let mapping = cluster
            .resolve_kind(group, version, &owner.reference.kind)
            .await?;
        // Owners live in the dependent's namespace; Kubernetes forbids
        // cross-namespace references.
        let parent_namespace = if mapping.namespaced {
            object.namespace.as_deref()
        } else {
            None
        };
        let parent = cluster
            .get(&mapping.gvr, parent_namespace, &owner.reference.name)
            .await
            .map_err(|err| resolve_error(&owner, err.to_string()))?
            .ok_or_else(|| resolve_error(&owner, "not found in the target cluster"))?;
        let uid = types::uid(&parent)
            .ok_or_else(|| resolve_error(&owner, "live parent carries no uid"))?;
        debug!(
            "Rewrote owner {} {} of {} to uid {uid}",
            owner.reference.kind, owner.reference.name, object.source_path
        );
        types::set_owner_uid(&mut object.payload, owner.index, uid);
    }
    Ok(())
}
