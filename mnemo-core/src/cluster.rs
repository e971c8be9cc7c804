use crate::errors::{ErrorKind, MnemoError};
use crate::prelude::*;
use crate::types::GroupVersionResource;

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, PostParams};
use kube::discovery::Scope;
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

/// Discovery-resolved coordinates of a kind: which resource serves it and
/// whether objects live in namespaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestMapping {
    pub gvr: GroupVersionResource,
    pub namespaced: bool,
}

/// The live API surface the engine replays into. GET distinguishes absence
/// from failure so the apply executor can branch to CREATE; everything else
/// is an error.
#[async_trait]
pub trait DynamicCluster: Send + Sync {
    /// Resolves (group, version, kind) to its REST mapping via discovery.
    async fn resolve_kind(&self, group: &str, version: &str, kind: &str) -> Result<RestMapping>;

    async fn get(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>>;

    async fn create(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        payload: &Value,
    ) -> Result<Value>;

    async fn replace(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
        payload: &Value,
    ) -> Result<Value>;

    async fn replace_status(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
        payload: &Value,
    ) -> Result<Value>;
}

/// Production implementation over a [`kube::Client`] and the dynamic API.
/// REST mappings are memoized per (group, version, kind) for the lifetime of
/// the restore invocation.
pub struct KubeDynamicCluster {
    client: Client,
    mappings: Mutex<HashMap<(String, String, String), RestMapping>>,
}

impl KubeDynamicCluster {
    /// Loads kubeconfig with the given options, falling back to in-cluster
    /// config when that fails.
    pub async fn new(options: &KubeConfigOptions) -> Result<Self> {
        let cfg = match Config::from_kubeconfig(options).await {
            Ok(cfg) => {
                info!(
                    "Loaded kubeconfig (context: {:?}), cluster_url: {}",
                    options.context, cfg.cluster_url
                );
                cfg
            }
            Err(err) => {
                info!("Failed to load kubeconfig, falling back to in-cluster config. The error was: {err:?}");
                Config::incluster()?
            }
        };
        let client = Client::try_from(cfg)?;
        Ok(KubeDynamicCluster::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        KubeDynamicCluster {
            client,
            mappings: Mutex::new(HashMap::new()),
        }
    }

    fn api(&self, gvr: &GroupVersionResource, namespace: Option<&str>) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(&gvr.group, &gvr.version, "");
        let resource = ApiResource::from_gvk_with_plural(&gvk, &gvr.resource);
        match namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

fn to_dynamic(payload: &Value) -> Result<DynamicObject> {
    Ok(serde_json::from_value(payload.clone())?)
}

fn to_value(object: DynamicObject) -> Result<Value> {
    Ok(serde_json::to_value(object)?)
}

#[async_trait]
impl DynamicCluster for KubeDynamicCluster {
    async fn resolve_kind(&self, group: &str, version: &str, kind: &str) -> Result<RestMapping> {
        let key = (group.to_string(), version.to_string(), kind.to_string());
        if let Some(mapping) = self.mappings.lock().expect("mapping cache poisoned").get(&key) {
            return Ok(mapping.clone());
        }
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let resource = kube::discovery::oneshot::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|err| {
                MnemoError::from(ErrorKind::MappingError {
                    group: group.to_string(),
                    version: version.to_string(),
                    kind: kind.to_string(),
                    reason: err.to_string(),
                })
            })?;
        let (resource, capabilities) = resource;
        let mapping = RestMapping {
            gvr: GroupVersionResource::new(&resource.group, &resource.version, &resource.plural),
            namespaced: matches!(capabilities.scope, Scope::Namespaced),
        };
        self.mappings
            .lock()
            .expect("mapping cache poisoned")
            .insert(key, mapping.clone());
        Ok(mapping)
    }

    async fn get(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>> {
        match self.api(gvr, namespace).get(name).await {
            Ok(object) => Ok(Some(to_value(object)?)),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn create(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        payload: &Value,
    ) -> Result<Value> {
        let object = to_dynamic(payload)?;
        let created = self
            .api(gvr, namespace)
            .create(&PostParams::default(), &object)
            .await?;
        to_value(created)
    }

    async fn replace(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
        payload: &Value,
    ) -> Result<Value> {
        let object = to_dynamic(payload)?;
        let replaced = self
            .api(gvr, namespace)
            .replace(name, &PostParams::default(), &object)
            .await?;
        to_value(replaced)
    }

    async fn replace_status(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
        payload: &Value,
    ) -> Result<Value> {
        let object = to_dynamic(payload)?;
        let updated = self
            .api(gvr, namespace)
            .replace_status(name, &PostParams::default(), &object)
            .await?;
        to_value(updated)
    }
}
