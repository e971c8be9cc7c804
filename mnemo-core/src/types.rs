use crate::errors::{ErrorKind, MnemoError};
use crate::prelude::*;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Group/version/resource triple as encoded in archive directory names,
/// e.g. `catalogs.management.cattle.io#v3` or `namespaces#v1` for the core
/// group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        GroupVersionResource {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }

    /// Parses a kind-directory name. The right half of `#` is the version;
    /// the left half splits at the first `.` into resource and group. A left
    /// half without a dot is a core-group resource.
    pub fn parse_dir_name(name: &str) -> Result<Self> {
        let (left, version) = name.split_once('#').ok_or_else(|| {
            MnemoError::from(ErrorKind::ArchiveError(format!(
                "directory name {name:?} is missing the '#<version>' suffix"
            )))
        })?;
        if left.is_empty() || version.is_empty() {
            return Err(ErrorKind::ArchiveError(format!(
                "directory name {name:?} has an empty resource or version"
            ))
            .into());
        }
        let (resource, group) = match left.split_once('.') {
            Some((resource, group)) => (resource, group),
            None => (left, ""),
        };
        Ok(GroupVersionResource::new(group, version, resource))
    }

    /// Directory name for this triple. The dot before the group is suppressed
    /// for the core group, matching the backup writer.
    pub fn dir_name(&self) -> String {
        if self.group.is_empty() {
            format!("{}#{}", self.resource, self.version)
        } else {
            format!("{}.{}#{}", self.resource, self.group, self.version)
        }
    }

    /// `group/version/resource` key as used by `filters/statussubresource.json`.
    /// The core group renders as `version/resource`.
    pub fn api_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.resource)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.resource)
        }
    }

    /// Fully-qualified resource name, `resource.group` or bare `resource` for
    /// the core group. Encryption transformers are keyed by this.
    pub fn fq_resource(&self) -> String {
        if self.group.is_empty() {
            self.resource.clone()
        } else {
            format!("{}.{}", self.resource, self.group)
        }
    }
}

/// The unit of work for one restore run: a decoded archive object plus the
/// coordinates needed to apply it.
#[derive(Debug, Clone)]
pub struct RestoreObject {
    pub name: String,
    pub namespace: Option<String>,
    pub gvr: GroupVersionResource,
    /// Canonical archive file path; node identity in the dependency graph.
    pub source_path: String,
    pub payload: Value,
}

/// One entry of `metadata.ownerReferences`, with its position in the list so
/// the rewriter can splice the uid back in place.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerRef {
    pub index: usize,
    pub reference: OwnerReference,
}

impl OwnerRef {
    /// Splits `apiVersion` into (group, version); no `/` means core group.
    pub fn group_version(&self) -> (&str, &str) {
        match self.reference.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.reference.api_version.as_str()),
        }
    }
}

pub fn name(payload: &Value) -> Option<&str> {
    payload.pointer("/metadata/name").and_then(Value::as_str)
}

pub fn namespace(payload: &Value) -> Option<&str> {
    payload
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
}

pub fn uid(payload: &Value) -> Option<&str> {
    payload.pointer("/metadata/uid").and_then(Value::as_str)
}

pub fn resource_version(payload: &Value) -> Option<&str> {
    payload
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
}

pub fn set_resource_version(payload: &mut Value, resource_version: &str) {
    if let Some(metadata) = payload
        .pointer_mut("/metadata")
        .and_then(Value::as_object_mut)
    {
        metadata.insert(
            "resourceVersion".to_string(),
            Value::String(resource_version.to_string()),
        );
    }
}

/// Valid owner-reference entries of `payload`. Entries with an empty or
/// absent `apiVersion` or `kind` are skipped, as are entries that do not
/// parse as owner references at all; an absent list and `[]` are both empty.
pub fn owner_references(payload: &Value) -> Vec<OwnerRef> {
    let Some(entries) = payload
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let reference: OwnerReference = serde_json::from_value(entry.clone()).ok()?;
            if reference.api_version.is_empty() || reference.kind.is_empty() {
                return None;
            }
            Some(OwnerRef { index, reference })
        })
        .collect()
}

pub fn set_owner_uid(payload: &mut Value, index: usize, uid: &str) {
    if let Some(entry) = payload
        .pointer_mut("/metadata/ownerReferences")
        .and_then(Value::as_array_mut)
        .and_then(|entries| entries.get_mut(index))
        .and_then(Value::as_object_mut)
    {
        entry.insert("uid".to_string(), Value::String(uid.to_string()));
    }
}

/// Restore request surface handed over by the controller wiring.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// `<name>.tar.gz` within the storage location.
    pub backup_filename: String,
    pub storage_location: StorageLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_config_name: Option<String>,
    #[serde(default)]
    pub prune: bool,
    /// Seconds granted to the post-restore prune pass; unused by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Location>,
}

/// Parsed but delegated: fetching from object storage is the job of the
/// external S3 collaborator, not this engine.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Location {
    pub bucket: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_secret_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dir_name_round_trips_grouped_resources() -> Result<()> {
        let gvr = GroupVersionResource::parse_dir_name("catalogs.management.cattle.io#v3")?;
        assert_eq!(gvr.group, "management.cattle.io");
        assert_eq!(gvr.version, "v3");
        assert_eq!(gvr.resource, "catalogs");
        assert_eq!(gvr.dir_name(), "catalogs.management.cattle.io#v3");
        Ok(())
    }

    #[test]
    fn dir_name_suppresses_dot_for_core_group() -> Result<()> {
        let gvr = GroupVersionResource::parse_dir_name("namespaces#v1")?;
        assert_eq!(gvr.group, "");
        assert_eq!(gvr.resource, "namespaces");
        assert_eq!(gvr.dir_name(), "namespaces#v1");
        assert_eq!(gvr.api_key(), "v1/namespaces");
        assert_eq!(gvr.fq_resource(), "namespaces");
        Ok(())
    }

    #[test]
    fn dir_name_without_version_is_rejected() {
        assert!(GroupVersionResource::parse_dir_name("deployments.apps").is_err());
        assert!(GroupVersionResource::parse_dir_name("#v1").is_err());
    }

    #[test]
    fn api_key_includes_group_when_present() {
        let gvr = GroupVersionResource::new("apps", "v1", "deployments");
        assert_eq!(gvr.api_key(), "apps/v1/deployments");
        assert_eq!(gvr.fq_resource(), "deployments.apps");
    }

    #[test]
    fn owner_references_skips_incomplete_entries() {
        let payload = json!({
            "metadata": {
                "name": "child",
                "ownerReferences": [
                    {"apiVersion": "", "kind": "Widget", "name": "w", "uid": "u0"},
                    {"apiVersion": "apps/v1", "kind": "", "name": "d", "uid": "u1"},
                    {"apiVersion": "apps/v1", "kind": "Deployment", "name": "d", "uid": "u2"},
                ]
            }
        });
        let refs = owner_references(&payload);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].index, 2);
        assert_eq!(refs[0].group_version(), ("apps", "v1"));
    }

    #[test]
    fn owner_references_absent_and_empty_are_equivalent() {
        let absent = json!({"metadata": {"name": "a"}});
        let empty = json!({"metadata": {"name": "a", "ownerReferences": []}});
        assert!(owner_references(&absent).is_empty());
        assert!(owner_references(&empty).is_empty());
    }

    #[test]
    fn set_owner_uid_targets_the_original_index() {
        let mut payload = json!({
            "metadata": {
                "ownerReferences": [
                    {"apiVersion": "", "kind": "Skipped"},
                    {"apiVersion": "v1", "kind": "Namespace", "name": "ns", "uid": "old"},
                ]
            }
        });
        let refs = owner_references(&payload);
        assert_eq!(refs.len(), 1);
        set_owner_uid(&mut payload, refs[0].index, "new");
        assert_eq!(
            payload.pointer("/metadata/ownerReferences/1/uid"),
            Some(&json!("new"))
        );
        assert_eq!(
            payload.pointer("/metadata/ownerReferences/0/uid"),
            None
        );
    }

    #[test]
    fn core_group_api_version_parses_without_slash() {
        let owner = OwnerRef {
            index: 0,
            reference: OwnerReference {
                api_version: "v1".to_string(),
                kind: "Namespace".to_string(),
                name: "ns".to_string(),
                uid: "u".to_string(),
                ..Default::default()
            },
        };
        assert_eq!(owner.group_version(), ("", "v1"));
    }

    #[test]
    fn restore_spec_deserializes_camel_case() -> Result<()> {
        let spec: RestoreSpec = serde_json::from_value(json!({
            "backupFilename": "nightly.tar.gz",
            "storageLocation": {"local": "/var/backups"},
            "encryptionConfigName": "at-rest",
            "prune": true,
            "deleteTimeout": 30
        }))?;
        assert_eq!(spec.backup_filename, "nightly.tar.gz");
        assert_eq!(spec.storage_location.local.as_deref(), Some("/var/backups"));
        assert_eq!(spec.encryption_config_name.as_deref(), Some("at-rest"));
        assert!(spec.prune);
        Ok(())
    }

    #[test]
    fn set_resource_version_overwrites_in_place() {
        let mut payload = json!({"metadata": {"name": "x", "resourceVersion": "7"}});
        set_resource_version(&mut payload, "42");
        assert_eq!(resource_version(&payload), Some("42"));
    }
}
