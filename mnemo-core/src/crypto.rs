use crate::archive::ObjectFile;
use crate::cluster::DynamicCluster;
use crate::errors::{ErrorKind, MnemoError};
use crate::prelude::*;
use crate::types::GroupVersionResource;

use aes_gcm::aead::{Aead, AeadCore, OsRng, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Nonce length of the envelope format; the nonce is prefixed to the
/// ciphertext inside the JSON-encoded byte array.
pub const NONCE_LEN: usize = 12;

/// The group/version/resource of the operator's encryption-configuration
/// objects; read from namespace `default` by name.
pub fn encryption_config_gvr() -> GroupVersionResource {
    GroupVersionResource::new("mnemo.dev", "v1", "encryptionconfigurations")
}

pub const ENCRYPTION_CONFIG_NAMESPACE: &str = "default";

/// AES-256-GCM transformer for one resource group. Symmetric with the backup
/// engine's sealing step: same key, same AAD derivation.
pub struct EncryptionTransformer {
    cipher: Aes256Gcm,
}

impl EncryptionTransformer {
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| {
            MnemoError::from(ErrorKind::EncryptionConfigError(format!(
                "expected a 32-byte key, got {} bytes",
                key.len()
            )))
        })?;
        Ok(EncryptionTransformer { cipher })
    }

    pub fn from_base64(key: &str) -> Result<Self> {
        let key = BASE64.decode(key.trim()).map_err(|err| {
            MnemoError::from(ErrorKind::EncryptionConfigError(format!(
                "key is not valid base64: {err}"
            )))
        })?;
        EncryptionTransformer::new(&key)
    }

    /// Opens a nonce-prefixed envelope, binding `aad`. Fails on truncation,
    /// tag mismatch or AAD mismatch.
    pub fn open(&self, envelope: &[u8], aad: &str) -> std::result::Result<Vec<u8>, String> {
        if envelope.len() <= NONCE_LEN {
            return Err(format!(
                "envelope of {} bytes is shorter than the nonce",
                envelope.len()
            ));
        }
        let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| "integrity check failed".to_string())
    }

    /// Seals `plaintext` under a fresh nonce; the backup-side counterpart of
    /// [`EncryptionTransformer::open`].
    pub fn seal(&self, plaintext: &[u8], aad: &str) -> std::result::Result<Vec<u8>, String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|err| err.to_string())?;
        let mut envelope = nonce.to_vec();
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }
}

#[derive(Debug, Deserialize)]
struct EncryptionConfigResource {
    resources: Vec<String>,
    key: String,
}

#[derive(Debug, Deserialize)]
struct EncryptionConfigSpec {
    resources: Vec<EncryptionConfigResource>,
}

/// Transformers keyed by fully-qualified resource name (`resource.group`,
/// bare `resource` for the core group). Absence means the resource group is
/// stored in clear text.
#[derive(Default, Clone)]
pub struct TransformerMap {
    by_resource: HashMap<String, Arc<EncryptionTransformer>>,
}

impl TransformerMap {
    pub fn is_empty(&self) -> bool {
        self.by_resource.is_empty()
    }

    pub fn insert(&mut self, fq_resource: impl Into<String>, transformer: EncryptionTransformer) {
        self.by_resource
            .insert(fq_resource.into(), Arc::new(transformer));
    }

    pub fn for_gvr(&self, gvr: &GroupVersionResource) -> Option<&Arc<EncryptionTransformer>> {
        self.by_resource.get(&gvr.fq_resource())
    }

    /// Parses the spec of an encryption-configuration object: a list of
    /// resource-name groups, each with one base64 256-bit key.
    pub fn from_config(payload: &Value) -> Result<Self> {
        let spec = payload.get("spec").cloned().ok_or_else(|| {
            MnemoError::from(ErrorKind::EncryptionConfigError(
                "encryption configuration has no spec".to_string(),
            ))
        })?;
        let spec: EncryptionConfigSpec = serde_json::from_value(spec)?;
        let mut map = TransformerMap::default();
        for group in spec.resources {
            let transformer = Arc::new(EncryptionTransformer::from_base64(&group.key)?);
            for fq_resource in group.resources {
                map.by_resource.insert(fq_resource, transformer.clone());
            }
        }
        Ok(map)
    }

    /// Reads the named encryption-configuration object from the live cluster
    /// and parses it.
    pub async fn from_cluster(cluster: &dyn DynamicCluster, name: &str) -> Result<Self> {
        let gvr = encryption_config_gvr();
        let payload = cluster
            .get(&gvr, Some(ENCRYPTION_CONFIG_NAMESPACE), name)
            .await?
            .ok_or_else(|| {
                MnemoError::from(ErrorKind::EncryptionConfigError(format!(
                    "encryption configuration {ENCRYPTION_CONFIG_NAMESPACE}/{name} not found"
                )))
            })?;
        TransformerMap::from_config(&payload)
    }
}

/// The decryption layer entry point: decodes one object file's bytes into its
/// payload. With a transformer registered for the file's group-resource the
/// bytes are a JSON-encoded byte array holding a sealed envelope; otherwise
/// they are plaintext JSON.
pub fn decode_object(raw: &[u8], file: &ObjectFile, transformers: &TransformerMap) -> Result<Value> {
    match transformers.for_gvr(&file.gvr) {
        None => Ok(serde_json::from_slice(raw)?),
        Some(transformer) => {
            let envelope: Vec<u8> = serde_json::from_slice(raw)
                .map_err(|err| decryption_error(file, format!("not a JSON byte array: {err}")))?;
            let plaintext = transformer
                .open(&envelope, &file.aad())
                .map_err(|reason| decryption_error(file, reason))?;
            serde_json::from_slice(&plaintext).map_err(|err| {
                decryption_error(file, format!("decrypted payload is not JSON: {err}"))
            })
        }
    }
}

fn decryption_error(file: &ObjectFile, reason: String) -> MnemoError {
    ErrorKind::DecryptionError {
        path: file.source_path(),
        reason,
    }
    .into()
}
