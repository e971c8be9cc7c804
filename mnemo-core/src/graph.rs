use crate::archive::{ArchiveLayout, DEFINITION_DIRS};
use crate::cluster::DynamicCluster;
use crate::crypto::{decode_object, TransformerMap};
use crate::errors::RestoreFailures;
use crate::prelude::*;
use crate::types::{self, RestoreObject};

use petgraph::graphmap::DiGraphMap;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

pub type NodeId = usize;

/// Interns archive source paths as indices into an arena, so the graph works
/// with small integers instead of hashing long path strings on every edge
/// operation.
#[derive(Debug, Default)]
struct PathInterner {
    paths: Vec<String>,
    ids: HashMap<String, NodeId>,
}

impl PathInterner {
    fn intern(&mut self, path: &str) -> NodeId {
        if let Some(id) = self.ids.get(path) {
            return *id;
        }
        let id = self.paths.len();
        self.paths.push(path.to_string());
        self.ids.insert(path.to_string(), id);
        id
    }

    fn get(&self, path: &str) -> Option<NodeId> {
        self.ids.get(path).copied()
    }
}

/// Owner→dependent adjacency over archive paths, with the per-object
/// unresolved-parent counters and the FIFO ready queue the replay engine
/// drains.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    interner: PathInterner,
    graph: DiGraphMap<NodeId, ()>,
    objects: HashMap<NodeId, RestoreObject>,
    unresolved: HashMap<NodeId, usize>,
    ready: VecDeque<NodeId>,
    created: HashSet<NodeId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        DependencyGraph::default()
    }

    /// Marks a source path applied outside the graph (definitions installed
    /// by the bootstrap pass), so dependents find the parent pre-satisfied.
    pub fn mark_created(&mut self, source_path: &str) {
        let id = self.interner.intern(source_path);
        self.created.insert(id);
    }

    pub fn is_created(&self, source_path: &str) -> bool {
        self.interner
            .get(source_path)
            .is_some_and(|id| self.created.contains(&id))
    }

    /// Inserts one object with the archive paths of its parents. Parents
    /// already created count as satisfied; all other parents, present in the
    /// archive or not, keep the object off the ready queue.
    pub fn insert(&mut self, object: RestoreObject, parents: &[String]) {
        let id = self.interner.intern(&object.source_path);
        self.graph.add_node(id);
        self.objects.insert(id, object);

        let mut pending: HashSet<NodeId> = HashSet::new();
        for parent in parents {
            let parent_id = self.interner.intern(parent);
            if self.created.contains(&parent_id) {
                continue;
            }
            self.graph.add_edge(parent_id, id, ());
            pending.insert(parent_id);
        }
        self.unresolved.insert(id, pending.len());
        if pending.is_empty() {
            self.ready.push_back(id);
        }
    }

    /// Next ready object in first-in-first-out order; the object leaves the
    /// graph and is owned by the caller until applied.
    pub fn pop_ready(&mut self) -> Option<RestoreObject> {
        while let Some(id) = self.ready.pop_front() {
            if let Some(object) = self.objects.remove(&id) {
                return Some(object);
            }
        }
        None
    }

    /// Records a successful apply and enqueues dependents whose last
    /// unresolved parent this was.
    pub fn mark_applied(&mut self, source_path: &str) {
        let id = self.interner.intern(source_path);
        if !self.created.insert(id) {
            return;
        }
        let dependents: Vec<NodeId> = self.graph.neighbors(id).collect();
        for dependent in dependents {
            let Some(count) = self.unresolved.get_mut(&dependent) else {
                continue;
            };
            if *count > 0 {
                *count -= 1;
            }
            if *count == 0 && self.objects.contains_key(&dependent) {
                self.ready.push_back(dependent);
            }
        }
    }

    pub fn unresolved_parents(&self, source_path: &str) -> Option<usize> {
        let id = self.interner.get(source_path)?;
        self.unresolved.get(&id).copied()
    }

    /// Objects never enqueued because a parent was never applied (missing
    /// from the archive, or its own apply failed).
    pub fn blocked(&self) -> Vec<&RestoreObject> {
        let mut blocked: Vec<&RestoreObject> = self.objects.values().collect();
        blocked.sort_by(|a, b| a.source_path.cmp(&b.source_path));
        blocked
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

/// Reads, decrypts and wires every non-definition object file into a
/// [`DependencyGraph`]. Decryption failures skip the object and are recorded
/// in `failures`; mapping failures abort the build.
pub async fn build_graph(
    layout: &ArchiveLayout,
    transformers: &TransformerMap,
    cluster: &dyn DynamicCluster,
    pre_created: &[String],
    failures: &mut RestoreFailures,
) -> Result<DependencyGraph> {
    let mut graph = DependencyGraph::new();
    for source_path in pre_created {
        graph.mark_created(source_path);
    }

    for (gvr, dir) in layout.resource_dirs()? {
        if DEFINITION_DIRS.contains(&gvr.dir_name().as_str()) {
            continue;
        }
        for file in layout.object_files(&gvr, &dir)? {
            let raw = file.read()?;
            let payload = match decode_object(&raw, &file, transformers) {
                Ok(payload) => payload,
                Err(err) => {
                    failures.push(file.source_path(), err);
                    continue;
                }
            };

            let name = types::name(&payload)
                .map(str::to_string)
                .unwrap_or_else(|| file.name.clone());
            let namespace = types::namespace(&payload)
                .map(str::to_string)
                .or_else(|| file.namespace.clone());

            let mut parents = Vec::new();
            for owner in types::owner_references(&payload) {
                let (group, version) = owner.group_version();
                let mapping = cluster
                    .resolve_kind(group, version, &owner.reference.kind)
                    .await?;
                // Owners live in the dependent's namespace; cluster-scoped
                // parents sit at directory depth 1.
                let parent_namespace = if mapping.namespaced {
                    namespace.as_deref()
                } else {
                    None
                };
                let parent_path =
                    layout.object_path(&mapping.gvr, parent_namespace, &owner.reference.name);
                parents.push(parent_path.to_string_lossy().into_owned());
            }

            debug!(
                "Graphed {} ({} parent(s))",
                file.source_path(),
                parents.len()
            );
            let object = RestoreObject {
                name,
                namespace,
                gvr: gvr.clone(),
                source_path: file.source_path(),
                payload,
            };
            graph.insert(object, &parents);
        }
    }
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GroupVersionResource;
    use serde_json::json;

    fn object(path: &str, name: &str) -> RestoreObject {
        RestoreObject {
            name: name.to_string(),
            namespace: None,
            gvr: GroupVersionResource::new("example.io", "v1", "widgets"),
            source_path: path.to_string(),
            payload: json!({"metadata": {"name": name}}),
        }
    }

    #[test]
    fn objects_without_owners_are_ready_in_insertion_order() {
        let mut graph = DependencyGraph::new();
        graph.insert(object("/a.json", "a"), &[]);
        graph.insert(object("/b.json", "b"), &[]);

        assert_eq!(graph.pop_ready().unwrap().name, "a");
        assert_eq!(graph.pop_ready().unwrap().name, "b");
        assert!(graph.pop_ready().is_none());
    }

    #[test]
    fn linear_chain_unblocks_one_level_per_apply() {
        let mut graph = DependencyGraph::new();
        graph.insert(object("/a.json", "a"), &[]);
        graph.insert(object("/b.json", "b"), &["/a.json".to_string()]);
        graph.insert(object("/c.json", "c"), &["/b.json".to_string()]);

        let a = graph.pop_ready().unwrap();
        assert_eq!(a.name, "a");
        assert!(graph.pop_ready().is_none(), "b is blocked until a applies");
        graph.mark_applied(&a.source_path);

        let b = graph.pop_ready().unwrap();
        assert_eq!(b.name, "b");
        graph.mark_applied(&b.source_path);

        assert_eq!(graph.pop_ready().unwrap().name, "c");
    }

    #[test]
    fn diamond_counts_down_two_to_zero() {
        let mut graph = DependencyGraph::new();
        graph.insert(object("/a.json", "a"), &[]);
        graph.insert(object("/b.json", "b"), &["/a.json".to_string()]);
        graph.insert(object("/c.json", "c"), &["/a.json".to_string()]);
        graph.insert(
            object("/d.json", "d"),
            &["/b.json".to_string(), "/c.json".to_string()],
        );
        assert_eq!(graph.unresolved_parents("/d.json"), Some(2));

        let a = graph.pop_ready().unwrap();
        graph.mark_applied(&a.source_path);
        let b = graph.pop_ready().unwrap();
        assert_eq!(b.name, "b");
        graph.mark_applied(&b.source_path);
        assert_eq!(graph.unresolved_parents("/d.json"), Some(1));

        let c = graph.pop_ready().unwrap();
        assert_eq!(c.name, "c");
        graph.mark_applied(&c.source_path);
        assert_eq!(graph.unresolved_parents("/d.json"), Some(0));
        assert_eq!(graph.pop_ready().unwrap().name, "d");
    }

    #[test]
    fn missing_archive_parent_blocks_forever() {
        let mut graph = DependencyGraph::new();
        graph.insert(object("/x.json", "x"), &["/z.json".to_string()]);

        assert!(graph.pop_ready().is_none());
        let blocked: Vec<&str> = graph.blocked().iter().map(|o| o.name.as_str()).collect();
        assert_eq!(blocked, vec!["x"]);
    }

    #[test]
    fn pre_created_parents_are_satisfied() {
        let mut graph = DependencyGraph::new();
        graph.mark_created("/crd.json");
        graph.insert(object("/w1.json", "w1"), &["/crd.json".to_string()]);

        assert_eq!(graph.unresolved_parents("/w1.json"), Some(0));
        assert_eq!(graph.pop_ready().unwrap().name, "w1");
    }

    #[test]
    fn duplicate_parent_entries_count_once() {
        let mut graph = DependencyGraph::new();
        graph.insert(object("/a.json", "a"), &[]);
        graph.insert(
            object("/b.json", "b"),
            &["/a.json".to_string(), "/a.json".to_string()],
        );
        assert_eq!(graph.unresolved_parents("/b.json"), Some(1));

        let a = graph.pop_ready().unwrap();
        graph.mark_applied(&a.source_path);
        assert_eq!(graph.pop_ready().unwrap().name, "b");
    }

    #[test]
    fn mark_applied_twice_decrements_once() {
        let mut graph = DependencyGraph::new();
        graph.insert(object("/a.json", "a"), &[]);
        graph.insert(
            object("/d.json", "d"),
            &["/a.json".to_string(), "/b.json".to_string()],
        );

        let a = graph.pop_ready().unwrap();
        graph.mark_applied(&a.source_path);
        graph.mark_applied(&a.source_path);
        assert_eq!(graph.unresolved_parents("/d.json"), Some(1));
    }
}
