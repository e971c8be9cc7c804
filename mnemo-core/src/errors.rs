use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
#[error(transparent)]
pub struct MnemoError(Box<ErrorKind>);

impl MnemoError {
    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }
}

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("SerdeJsonError: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),
    #[error("KubeClientError: {0}")]
    KubeClientError(#[from] kube::Error),
    #[error("KubeconfigError: {0}")]
    KubeconfigError(#[from] kube::config::KubeconfigError),
    #[error("KubeconfigInferError: {0}")]
    KubeconfigInferError(#[from] kube::config::InClusterError),
    #[error("ArchiveError: {0}")]
    ArchiveError(String),
    #[error("DecryptionError for {path}: {reason}")]
    DecryptionError { path: String, reason: String },
    #[error("MappingError: no REST mapping for {group}/{version} {kind}: {reason}")]
    MappingError {
        group: String,
        version: String,
        kind: String,
        reason: String,
    },
    #[error("OwnerResolveError: owner {kind} {name}: {reason}")]
    OwnerResolveError {
        kind: String,
        name: String,
        reason: String,
    },
    #[error("ApplyError for {path}: {reason}")]
    ApplyError { path: String, reason: String },
    #[error("EncryptionConfigError: {0}")]
    EncryptionConfigError(String),
    #[error("StorageLocationError: {0}")]
    StorageLocationError(String),
    #[error("{0}")]
    RestoreIncomplete(RestoreFailures),
    #[error(
        "CancellationError: restore cancelled with {} accumulated failure(s)",
        .failures.failures.len()
    )]
    CancellationError { failures: RestoreFailures },
}

impl<E> From<E> for MnemoError
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        MnemoError(Box::new(ErrorKind::from(err)))
    }
}

/// A single object the replay engine failed to apply.
#[derive(Debug)]
pub struct ObjectFailure {
    pub source_path: String,
    pub error: MnemoError,
}

/// Per-object failures collected over one restore run. The replay engine
/// never aborts on an individual object, so this is the composite surfaced
/// on the restore-request status.
#[derive(Debug, Default)]
pub struct RestoreFailures {
    pub failures: Vec<ObjectFailure>,
}

impl RestoreFailures {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn push(&mut self, source_path: impl Into<String>, error: MnemoError) {
        self.failures.push(ObjectFailure {
            source_path: source_path.into(),
            error,
        });
    }
}

impl fmt::Display for RestoreFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "restore failed for {} object(s):", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  {}: {}", failure.source_path, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for RestoreFailures {}
