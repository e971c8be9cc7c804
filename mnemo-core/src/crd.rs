use crate::apply::apply_object;
use crate::archive::ArchiveLayout;
use crate::cluster::DynamicCluster;
use crate::crypto::{decode_object, TransformerMap};
use crate::prelude::*;
use crate::types::{self, RestoreObject};

use serde_json::Value;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

pub const SERVED_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const SERVED_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A kind a definition registers with the API surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

/// Applies every custom-resource-definition file ahead of the dependency
/// graph, in directory order, then waits until discovery serves the declared
/// kinds. Any failure here aborts the whole restore.
///
/// Returns the source paths of the installed definitions; the graph treats
/// them as already created so instances owned by a definition are
/// pre-satisfied.
pub async fn install_definitions(
    layout: &ArchiveLayout,
    transformers: &TransformerMap,
    cluster: &dyn DynamicCluster,
) -> Result<Vec<String>> {
    let mut installed = Vec::new();
    let mut declared = Vec::new();

    for (gvr, dir) in layout.definition_dirs() {
        for file in layout.object_files(&gvr, &dir)? {
            let raw = file.read()?;
            let payload = decode_object(&raw, &file, transformers)?;
            let name = types::name(&payload)
                .map(str::to_string)
                .unwrap_or_else(|| file.name.clone());
            let mut object = RestoreObject {
                name,
                namespace: None,
                gvr: gvr.clone(),
                source_path: file.source_path(),
                payload,
            };
            apply_object(cluster, &mut object, false).await?;
            info!("Installed definition {}", object.name);
            declared.extend(declared_kinds(&object.payload));
            installed.push(object.source_path);
        }
    }

    if !declared.is_empty() {
        wait_until_served(cluster, &declared, SERVED_WAIT_TIMEOUT).await?;
    }
    Ok(installed)
}

/// Kinds a definition payload declares: `spec.group` + `spec.names.kind`
/// crossed with every served version (`spec.versions[*].name`, or the single
/// `spec.version` of the v1beta1 shape).
pub fn declared_kinds(payload: &Value) -> Vec<DeclaredKind> {
    let Some(group) = payload.pointer("/spec/group").and_then(Value::as_str) else {
        return Vec::new();
    };
    let Some(kind) = payload.pointer("/spec/names/kind").and_then(Value::as_str) else {
        return Vec::new();
    };

    let mut versions: Vec<String> = payload
        .pointer("/spec/versions")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter(|entry| {
                    entry
                        .get("served")
                        .and_then(Value::as_bool)
                        .unwrap_or(true)
                })
                .filter_map(|entry| entry.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if versions.is_empty() {
        if let Some(version) = payload.pointer("/spec/version").and_then(Value::as_str) {
            versions.push(version.to_string());
        }
    }

    versions
        .into_iter()
        .map(|version| DeclaredKind {
            group: group.to_string(),
            version,
            kind: kind.to_string(),
        })
        .collect()
}

/// Polls REST mapping for each declared kind until discovery resolves it or
/// the deadline passes; the last mapping error is surfaced on timeout.
pub async fn wait_until_served(
    cluster: &dyn DynamicCluster,
    kinds: &[DeclaredKind],
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    for declared in kinds {
        loop {
            match cluster
                .resolve_kind(&declared.group, &declared.version, &declared.kind)
                .await
            {
                Ok(_) => {
                    debug!(
                        "Discovery serves {}/{} {}",
                        declared.group, declared.version, declared.kind
                    );
                    break;
                }
                Err(err) => {
                    if Instant::now() >= deadline {
                        return Err(err);
                    }
                    sleep(SERVED_POLL_INTERVAL).await;
                }
            }
        }
    }
    Ok(())
}
