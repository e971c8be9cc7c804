use crate::errors::{ErrorKind, MnemoError};
use crate::prelude::*;
use crate::types::GroupVersionResource;

use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

pub const FILTERS_DIR: &str = "filters";
pub const STATUS_SUBRESOURCE_FILE: &str = "statussubresource.json";

/// Definition directories are replayed before everything else; either
/// version may be present, both, or neither.
pub const DEFINITION_DIRS: [&str; 2] = [
    "customresourcedefinitions.apiextensions.k8s.io#v1",
    "customresourcedefinitions.apiextensions.k8s.io#v1beta1",
];

/// One object file inside the archive tree.
#[derive(Debug, Clone)]
pub struct ObjectFile {
    pub gvr: GroupVersionResource,
    pub namespace: Option<String>,
    pub name: String,
    pub path: PathBuf,
}

impl ObjectFile {
    /// Additional authenticated data the backup writer bound this object's
    /// envelope to: `<name>` for cluster-scoped, `<namespace>#<name>` for
    /// namespaced objects.
    pub fn aad(&self) -> String {
        match &self.namespace {
            Some(namespace) => format!("{namespace}#{}", self.name),
            None => self.name.clone(),
        }
    }

    /// Canonical key identifying this file; node identity in the graph.
    pub fn source_path(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.path)?)
    }
}

/// The extracted archive directory tree produced by the backup engine.
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    root: PathBuf,
}

impl ArchiveLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ArchiveLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All kind-directories, sorted by name, `filters/` excluded. Definition
    /// directories are included; callers installing them separately skip by
    /// name.
    pub fn resource_dirs(&self) -> Result<Vec<(GroupVersionResource, PathBuf)>> {
        let mut dirs = Vec::new();
        if !self.root.exists() {
            return Err(ErrorKind::ArchiveError(format!(
                "archive root {} does not exist",
                self.root.display()
            ))
            .into());
        }
        let mut names: Vec<String> = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == FILTERS_DIR {
                continue;
            }
            names.push(name);
        }
        names.sort();
        for name in names {
            let gvr = GroupVersionResource::parse_dir_name(&name)?;
            dirs.push((gvr, self.root.join(&name)));
        }
        Ok(dirs)
    }

    /// Definition directories present in this archive, in the fixed
    /// v1-before-v1beta1 order.
    pub fn definition_dirs(&self) -> Vec<(GroupVersionResource, PathBuf)> {
        DEFINITION_DIRS
            .iter()
            .filter_map(|name| {
                let path = self.root.join(name);
                if !path.is_dir() {
                    return None;
                }
                let gvr = GroupVersionResource::parse_dir_name(name)
                    .expect("definition directory names are well-formed");
                Some((gvr, path))
            })
            .collect()
    }

    /// Object files of one kind-directory, sorted: regular files at depth 1
    /// are cluster-scoped, files at depth 2 are namespaced under their parent
    /// directory's name.
    pub fn object_files(&self, gvr: &GroupVersionResource, dir: &Path) -> Result<Vec<ObjectFile>> {
        let mut files = Vec::new();
        for entry in sorted_entries(dir)? {
            if entry.is_dir() {
                let namespace = entry
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                for object in sorted_entries(&entry)? {
                    if let Some(name) = object_name(&object) {
                        files.push(ObjectFile {
                            gvr: gvr.clone(),
                            namespace: Some(namespace.clone()),
                            name,
                            path: object,
                        });
                    }
                }
            } else if let Some(name) = object_name(&entry) {
                files.push(ObjectFile {
                    gvr: gvr.clone(),
                    namespace: None,
                    name,
                    path: entry,
                });
            }
        }
        Ok(files)
    }

    /// `group/version/resource` keys whose kinds expose a status subresource.
    /// A missing sidecar means none do.
    pub fn status_subresources(&self) -> Result<HashSet<String>> {
        let path = self.root.join(FILTERS_DIR).join(STATUS_SUBRESOURCE_FILE);
        if !path.is_file() {
            return Ok(HashSet::new());
        }
        let bytes = fs::read(&path)?;
        let entries: std::collections::HashMap<String, bool> = serde_json::from_slice(&bytes)?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, has_status)| has_status.then_some(key))
            .collect())
    }

    /// Canonical archive path for an object; the graph builder uses this to
    /// name parents whether or not their file exists.
    pub fn object_path(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
    ) -> PathBuf {
        let mut path = self.root.join(gvr.dir_name());
        if let Some(namespace) = namespace {
            path = path.join(namespace);
        }
        path.join(format!("{name}.json"))
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|entry| entry.path())
        .collect();
    entries.sort();
    Ok(entries)
}

fn object_name(path: &Path) -> Option<String> {
    if !path.is_file() {
        return None;
    }
    let file_name = path.file_name()?.to_string_lossy();
    match file_name.strip_suffix(".json") {
        Some(name) => Some(name.to_string()),
        None => {
            debug!("Skipping non-object file {}", path.display());
            None
        }
    }
}

/// A backup tarball extracted into a temporary directory. The directory is
/// removed when this value drops, on every exit path of the restore.
#[derive(Debug)]
pub struct UnpackedArchive {
    dir: TempDir,
}

impl UnpackedArchive {
    pub fn layout(&self) -> ArchiveLayout {
        ArchiveLayout::new(self.dir.path())
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Gunzips and untars `<name>.tar.gz` into a fresh temporary directory.
pub fn unpack(tarball: &Path) -> Result<UnpackedArchive> {
    let dir = TempDir::new()?;
    let tar_gz = fs::File::open(tarball).map_err(|err| {
        MnemoError::from(ErrorKind::ArchiveError(format!(
            "cannot open backup archive {}: {err}",
            tarball.display()
        )))
    })?;
    let tar = GzDecoder::new(tar_gz);
    let mut archive = tar::Archive::new(tar);
    archive.unpack(dir.path()).map_err(|err| {
        MnemoError::from(ErrorKind::ArchiveError(format!(
            "cannot extract backup archive {}: {err}",
            tarball.display()
        )))
    })?;
    debug!(
        "Extracted {} into {}",
        tarball.display(),
        dir.path().display()
    );
    Ok(UnpackedArchive { dir })
}
