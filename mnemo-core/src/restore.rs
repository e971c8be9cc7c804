use crate::archive::{self, ArchiveLayout};
use crate::cluster::DynamicCluster;
use crate::crd;
use crate::crypto::TransformerMap;
use crate::errors::{ErrorKind, MnemoError, RestoreFailures};
use crate::graph::build_graph;
use crate::prelude::*;
use crate::replay::replay;
use crate::types::RestoreSpec;

use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Outcome of one restore run. Per-object failures do not abort the run;
/// they are carried here and can be converted into the composite error the
/// request status reports.
#[derive(Debug)]
pub struct RestoreSummary {
    pub definitions: usize,
    pub applied: usize,
    pub failures: RestoreFailures,
}

impl RestoreSummary {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// The aggregated per-object error, when any object failed.
    pub fn into_error(self) -> Option<MnemoError> {
        if self.failures.is_empty() {
            None
        } else {
            Some(ErrorKind::RestoreIncomplete(self.failures).into())
        }
    }
}

/// Replays an already-extracted archive tree into the cluster: definitions
/// first, then every other object in dependency order. A cancelled token
/// stops the run and surfaces the failures accumulated so far inside the
/// cancellation error.
pub async fn restore_from_dir(
    root: &Path,
    cluster: &dyn DynamicCluster,
    transformers: &TransformerMap,
    cancel: &CancellationToken,
) -> Result<RestoreSummary> {
    if cancel.is_cancelled() {
        return Err(ErrorKind::CancellationError {
            failures: RestoreFailures::default(),
        }
        .into());
    }
    let layout = ArchiveLayout::new(root);
    let status_subresources = layout.status_subresources()?;
    let mut failures = RestoreFailures::default();

    let definitions = crd::install_definitions(&layout, transformers, cluster).await?;
    if cancel.is_cancelled() {
        return Err(ErrorKind::CancellationError { failures }.into());
    }
    let mut graph = build_graph(&layout, transformers, cluster, &definitions, &mut failures).await?;
    info!(
        "Restoring {} object(s) after {} definition(s)",
        graph.object_count(),
        definitions.len()
    );
    let applied = replay(
        &mut graph,
        cluster,
        &status_subresources,
        &mut failures,
        cancel,
    )
    .await?;

    Ok(RestoreSummary {
        definitions: definitions.len(),
        applied,
        failures,
    })
}

/// Unpacks `<name>.tar.gz` into a temporary directory and replays it. The
/// directory is removed when this function returns, on every exit path.
pub async fn restore_from_archive(
    tarball: &Path,
    cluster: &dyn DynamicCluster,
    transformers: &TransformerMap,
    cancel: &CancellationToken,
) -> Result<RestoreSummary> {
    let unpacked = archive::unpack(tarball)?;
    restore_from_dir(unpacked.path(), cluster, transformers, cancel).await
}

/// Entry point for a controller-delivered restore request: resolves the
/// storage location, loads the named encryption configuration from the
/// cluster, and replays the backup.
pub async fn run(
    request: &RestoreSpec,
    cluster: &dyn DynamicCluster,
    cancel: &CancellationToken,
) -> Result<RestoreSummary> {
    let transformers = match request.encryption_config_name.as_deref() {
        Some(name) if !name.is_empty() => TransformerMap::from_cluster(cluster, name).await?,
        _ => TransformerMap::default(),
    };
    let Some(local) = request.storage_location.local.as_deref() else {
        return Err(ErrorKind::StorageLocationError(
            "no local storage location; fetching from object storage is the S3 client's job"
                .to_string(),
        )
        .into());
    };
    let tarball = Path::new(local).join(&request.backup_filename);
    restore_from_archive(&tarball, cluster, &transformers, cancel).await
}
