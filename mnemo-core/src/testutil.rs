//! In-memory [`DynamicCluster`] used by the scenario tests, plus archive
//! fixture helpers.

use crate::cluster::{DynamicCluster, RestMapping};
use crate::errors::{ErrorKind, MnemoError};
use crate::prelude::*;
use crate::types::GroupVersionResource;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

type ObjectKey = (String, String, String);

/// A fake API surface: objects in a map, uids and resource versions handed
/// out by counters, REST mappings registered explicitly or implicitly when a
/// CustomResourceDefinition is created.
pub(crate) struct MemCluster {
    mappings: Mutex<HashMap<(String, String, String), RestMapping>>,
    objects: Mutex<HashMap<ObjectKey, Value>>,
    log: Mutex<Vec<String>>,
    fail_creates: Mutex<HashSet<String>>,
    uid_counter: AtomicU64,
    rv_counter: AtomicU64,
}

impl MemCluster {
    pub(crate) fn new() -> Self {
        MemCluster {
            mappings: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            fail_creates: Mutex::new(HashSet::new()),
            uid_counter: AtomicU64::new(0),
            rv_counter: AtomicU64::new(0),
        }
    }

    pub(crate) fn add_mapping(
        &self,
        group: &str,
        version: &str,
        kind: &str,
        gvr: GroupVersionResource,
        namespaced: bool,
    ) {
        self.mappings.lock().unwrap().insert(
            (group.to_string(), version.to_string(), kind.to_string()),
            RestMapping { gvr, namespaced },
        );
    }

    /// Seeds a pre-existing live object, assigning it a uid and resource
    /// version like the server would have.
    pub(crate) fn seed(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
        mut value: Value,
    ) {
        value["metadata"]["uid"] = json!(self.next_uid());
        value["metadata"]["resourceVersion"] = json!(self.next_rv());
        self.objects
            .lock()
            .unwrap()
            .insert(key(gvr, namespace, name), value);
    }

    /// Makes CREATE of the named object fail with a server error.
    pub(crate) fn fail_create(&self, name: &str) {
        self.fail_creates.lock().unwrap().insert(name.to_string());
    }

    pub(crate) fn stored(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<Value> {
        self.objects
            .lock()
            .unwrap()
            .get(&key(gvr, namespace, name))
            .cloned()
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn next_uid(&self) -> String {
        format!("uid-{}", self.uid_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn next_rv(&self) -> String {
        format!("{}", 100 + self.rv_counter.fetch_add(1, Ordering::SeqCst))
    }

    /// A created CustomResourceDefinition immediately registers its served
    /// kinds, the way the API server's discovery eventually does.
    fn register_definition(&self, payload: &Value) {
        let Some(group) = payload.pointer("/spec/group").and_then(Value::as_str) else {
            return;
        };
        let Some(kind) = payload.pointer("/spec/names/kind").and_then(Value::as_str) else {
            return;
        };
        let plural = payload
            .pointer("/spec/names/plural")
            .and_then(Value::as_str)
            .unwrap_or(&kind.to_lowercase())
            .to_string();
        let namespaced = payload.pointer("/spec/scope").and_then(Value::as_str)
            == Some("Namespaced");
        let mut versions: Vec<String> = payload
            .pointer("/spec/versions")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
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
        for version in versions {
            self.add_mapping(
                group,
                &version,
                kind,
                GroupVersionResource::new(group, &version, &plural),
                namespaced,
            );
        }
    }
}

fn key(gvr: &GroupVersionResource, namespace: Option<&str>, name: &str) -> ObjectKey {
    (
        gvr.dir_name(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn server_error(name: &str, reason: &str) -> MnemoError {
    ErrorKind::ApplyError {
        path: name.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

#[async_trait]
impl DynamicCluster for MemCluster {
    async fn resolve_kind(&self, group: &str, version: &str, kind: &str) -> Result<RestMapping> {
        self.mappings
            .lock()
            .unwrap()
            .get(&(group.to_string(), version.to_string(), kind.to_string()))
            .cloned()
            .ok_or_else(|| {
                ErrorKind::MappingError {
                    group: group.to_string(),
                    version: version.to_string(),
                    kind: kind.to_string(),
                    reason: "no mapping registered".to_string(),
                }
                .into()
            })
    }

    async fn get(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>> {
        Ok(self.stored(gvr, namespace, name))
    }

    async fn create(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        payload: &Value,
    ) -> Result<Value> {
        let name = crate::types::name(payload).unwrap_or_default().to_string();
        if self.fail_creates.lock().unwrap().contains(&name) {
            return Err(server_error(&name, "injected create failure"));
        }
        let mut stored = payload.clone();
        stored["metadata"]["uid"] = json!(self.next_uid());
        stored["metadata"]["resourceVersion"] = json!(self.next_rv());
        if gvr.resource == "customresourcedefinitions" {
            self.register_definition(payload);
        }
        self.objects
            .lock()
            .unwrap()
            .insert(key(gvr, namespace, &name), stored.clone());
        self.log.lock().unwrap().push(format!("create {name}"));
        Ok(stored)
    }

    async fn replace(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
        payload: &Value,
    ) -> Result<Value> {
        let mut objects = self.objects.lock().unwrap();
        let existing = objects
            .get(&key(gvr, namespace, name))
            .ok_or_else(|| server_error(name, "replace of a missing object"))?;
        let uid = existing
            .pointer("/metadata/uid")
            .cloned()
            .unwrap_or(Value::Null);
        let mut stored = payload.clone();
        // The server keeps the original uid across updates.
        stored["metadata"]["uid"] = uid;
        stored["metadata"]["resourceVersion"] = json!(self.next_rv());
        objects.insert(key(gvr, namespace, name), stored.clone());
        self.log.lock().unwrap().push(format!("update {name}"));
        Ok(stored)
    }

    async fn replace_status(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
        payload: &Value,
    ) -> Result<Value> {
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get_mut(&key(gvr, namespace, name))
            .ok_or_else(|| server_error(name, "status write to a missing object"))?;
        stored["status"] = payload.get("status").cloned().unwrap_or(Value::Null);
        self.log.lock().unwrap().push(format!("status {name}"));
        Ok(stored.clone())
    }
}

/// Writes one object file into an archive fixture tree.
pub(crate) fn write_archive_object(
    root: &Path,
    dir: &str,
    namespace: Option<&str>,
    name: &str,
    payload: &Value,
) {
    let mut path = root.join(dir);
    if let Some(namespace) = namespace {
        path = path.join(namespace);
    }
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(
        path.join(format!("{name}.json")),
        serde_json::to_vec(payload).unwrap(),
    )
    .unwrap();
}
