use crate::cluster::DynamicCluster;
use crate::errors::{ErrorKind, MnemoError};
use crate::prelude::*;
use crate::types::{self, RestoreObject};

use tracing::debug;

/// Makes the live cluster reflect `object`'s payload: CREATE when absent,
/// otherwise copy the live `resourceVersion` into the payload and REPLACE.
/// When `has_status` the payload is written a second time through the status
/// subresource and the returned body replaces the local copy.
fn apply_error(path: &str, err: MnemoError) -> MnemoError {
    ErrorKind::ApplyError {
        path: path.to_string(),
        reason: err.to_string(),
    }
    .into()
}

pub async fn apply_object(
    cluster: &dyn DynamicCluster,
    object: &mut RestoreObject,
    has_status: bool,
) -> Result<()> {
    let namespace = object.namespace.as_deref();

    let existing = cluster
        .get(&object.gvr, namespace, &object.name)
        .await
        .map_err(|err| apply_error(&object.source_path, err))?;
    match existing {
        None => {
            debug!("Creating {}", object.source_path);
            object.payload = cluster
                .create(&object.gvr, namespace, &object.payload)
                .await
                .map_err(|err| apply_error(&object.source_path, err))?;
        }
        Some(live) => {
            if let Some(resource_version) = types::resource_version(&live) {
                let resource_version = resource_version.to_string();
                types::set_resource_version(&mut object.payload, &resource_version);
            }
            debug!("Updating {}", object.source_path);
            object.payload = cluster
                .replace(&object.gvr, namespace, &object.name, &object.payload)
                .await
                .map_err(|err| apply_error(&object.source_path, err))?;
        }
    }

    if has_status {
        debug!("Writing status of {}", object.source_path);
        object.payload = cluster
            .replace_status(&object.gvr, namespace, &object.name, &object.payload)
            .await
            .map_err(|err| apply_error(&object.source_path, err))?;
    }
    Ok(())
}
