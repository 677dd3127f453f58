//! Arena-owned tree modeling the FUSE-mounted telemetry filesystem the real deployment mounts:
//! a directory of directories and read-only leaf files, each leaf backed by a callback returning
//! a [`Content`] value, plus aggregation files that reduce over a glob of sibling paths.
//!
//! The original design gives every node a pointer back to its parent so it can reconstruct its
//! own path; that shared-ownership/back-pointer shape doesn't fit an arena well, so this tree
//! instead stores each node's full path directly at the point it's inserted (§9's "tree owned by
//! an arena with child-only links plus an explicit `full_path()`").

use std::collections::HashMap;

use thiserror::Error;

/// Errors raised while building or reading a [`TelemetryTree`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TelemetryError {
    /// A path segment was looked up that doesn't name any node.
    #[error("no telemetry node at path `{0}`")]
    NotFound(String),
    /// `read` was called on a path that names a directory, not a leaf or aggregation.
    #[error("`{0}` is a directory, not a readable leaf")]
    IsDirectory(String),
}

/// The value a telemetry leaf (or a directory, recursively) produces when read.
#[derive(Clone, Debug, PartialEq)]
pub enum Content {
    Scalar(f64),
    ScalarWithUnit(f64, String),
    Dict(Vec<(String, Content)>),
}

impl Content {
    /// Flattens this content to a single number, for use by an [`Aggregator`]. `Dict` values
    /// have no single numeric reading and are skipped by aggregation.
    fn as_number(&self) -> Option<f64> {
        match self {
            Content::Scalar(v) => Some(*v),
            Content::ScalarWithUnit(v, _) => Some(*v),
            Content::Dict(_) => None,
        }
    }
}

/// How an aggregation file reduces the numeric content of every path matching its glob pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregator {
    Sum,
    Min,
    Max,
}

impl Aggregator {
    fn reduce(&self, values: &[f64]) -> f64 {
        match self {
            Aggregator::Sum => values.iter().sum(),
            Aggregator::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
            Aggregator::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

/// A read-only leaf's content source: either a plain callback, or a reduction over every
/// existing path matching a glob pattern (`*` matches exactly one path segment).
enum NodeKind {
    Dir,
    Leaf(Box<dyn Fn() -> Content + Send + Sync>),
    Aggregation { pattern: String, aggregator: Aggregator },
}

struct Node {
    name: String,
    full_path: String,
    children: Vec<NodeId>,
    kind: NodeKind,
}

/// A stable index into a [`TelemetryTree`]'s arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// An arena-owned tree of telemetry directories and leaves. Built once at driver startup and
/// populated with the counters described throughout this repository's `§4` component designs.
pub struct TelemetryTree {
    nodes: Vec<Node>,
    paths: HashMap<String, NodeId>,
}

impl Default for TelemetryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryTree {
    /// An empty tree with just a root directory at path `""`.
    pub fn new() -> Self {
        let root = Node {
            name: String::new(),
            full_path: String::new(),
            children: Vec::new(),
            kind: NodeKind::Dir,
        };
        let mut paths = HashMap::new();
        paths.insert(String::new(), NodeId(0));
        TelemetryTree {
            nodes: vec![root],
            paths,
        }
    }

    /// The tree's root directory.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    fn join_path(&self, parent: NodeId, name: &str) -> String {
        let parent_path = &self.nodes[parent.0].full_path;
        if parent_path.is_empty() {
            name.to_string()
        } else {
            format!("{parent_path}/{name}")
        }
    }

    fn push_child(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> NodeId {
        let full_path = self.join_path(parent, name);
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.to_string(),
            full_path: full_path.clone(),
            children: Vec::new(),
            kind,
        });
        self.nodes[parent.0].children.push(id);
        self.paths.insert(full_path, id);
        id
    }

    /// Creates a subdirectory under `parent`.
    pub fn mkdir(&mut self, parent: NodeId, name: &str) -> NodeId {
        self.push_child(parent, name, NodeKind::Dir)
    }

    /// Adds a leaf file whose content is produced by `callback` on every read.
    pub fn add_leaf(
        &mut self,
        parent: NodeId,
        name: &str,
        callback: impl Fn() -> Content + Send + Sync + 'static,
    ) -> NodeId {
        self.push_child(parent, name, NodeKind::Leaf(Box::new(callback)))
    }

    /// Adds an aggregation file that reduces the numeric content of every existing path matching
    /// `pattern` (a `/`-separated glob where `*` matches exactly one segment) through
    /// `aggregator`.
    pub fn add_aggregation(
        &mut self,
        parent: NodeId,
        name: &str,
        pattern: impl Into<String>,
        aggregator: Aggregator,
    ) -> NodeId {
        self.push_child(
            parent,
            name,
            NodeKind::Aggregation {
                pattern: pattern.into(),
                aggregator,
            },
        )
    }

    /// Resolves a `/`-separated path to its node id.
    pub fn resolve(&self, path: &str) -> Option<NodeId> {
        self.paths.get(path).copied()
    }

    /// The full `/`-separated path of a node, reconstructed from the path stored at insertion
    /// rather than by walking parent pointers.
    pub fn full_path(&self, id: NodeId) -> &str {
        &self.nodes[id.0].full_path
    }

    fn glob_matches(pattern: &str, path: &str) -> bool {
        let pattern_segments: Vec<&str> = pattern.split('/').collect();
        let path_segments: Vec<&str> = path.split('/').collect();
        pattern_segments.len() == path_segments.len()
            && pattern_segments
                .iter()
                .zip(path_segments.iter())
                .all(|(p, s)| *p == "*" || p == s)
    }

    fn matching_numbers(&self, pattern: &str) -> Vec<f64> {
        self.paths
            .iter()
            .filter(|(path, _)| Self::glob_matches(pattern, path))
            .filter_map(|(_, id)| match &self.nodes[id.0].kind {
                NodeKind::Leaf(cb) => cb().as_number(),
                NodeKind::Dir | NodeKind::Aggregation { .. } => None,
            })
            .collect()
    }

    /// Reads a node's content: a leaf invokes its callback, an aggregation reduces over its
    /// matching siblings, and a directory reads as a [`Content::Dict`] of its children, in
    /// insertion order.
    pub fn read(&self, id: NodeId) -> Content {
        match &self.nodes[id.0].kind {
            NodeKind::Leaf(cb) => cb(),
            NodeKind::Aggregation { pattern, aggregator } => {
                Content::Scalar(aggregator.reduce(&self.matching_numbers(pattern)))
            }
            NodeKind::Dir => Content::Dict(
                self.nodes[id.0]
                    .children
                    .iter()
                    .map(|child| (self.nodes[child.0].name.clone(), self.read(*child)))
                    .collect(),
            ),
        }
    }

    /// Reads by path rather than [`NodeId`]. Fails with [`TelemetryError::NotFound`] if nothing
    /// is mounted there; this never fails with [`TelemetryError::IsDirectory`] since directories
    /// read as a nested [`Content::Dict`] like any other node.
    pub fn read_path(&self, path: &str) -> Result<Content, TelemetryError> {
        self.resolve(path)
            .map(|id| self.read(id))
            .ok_or_else(|| TelemetryError::NotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn leaf_path_concatenates_through_directories() {
        let mut tree = TelemetryTree::new();
        let dedup = tree.mkdir(tree.root(), "dedup");
        let leaf = tree.add_leaf(dedup, "inserted", || Content::Scalar(3.0));
        assert_eq!(tree.full_path(leaf), "dedup/inserted");
        assert_eq!(tree.read(leaf), Content::Scalar(3.0));
    }

    #[test]
    fn leaf_callback_reflects_live_state() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut tree = TelemetryTree::new();
        let counter_for_leaf = Arc::clone(&counter);
        let leaf = tree.add_leaf(tree.root(), "count", move || {
            Content::Scalar(counter_for_leaf.load(Ordering::Relaxed) as f64)
        });
        assert_eq!(tree.read(leaf), Content::Scalar(0.0));
        counter.fetch_add(5, Ordering::Relaxed);
        assert_eq!(tree.read(leaf), Content::Scalar(5.0));
    }

    #[test]
    fn directory_reads_as_dict_of_children() {
        let mut tree = TelemetryTree::new();
        let dir = tree.mkdir(tree.root(), "rules");
        tree.add_leaf(dir, "r0", || Content::Scalar(1.0));
        tree.add_leaf(dir, "r1", || Content::Scalar(2.0));
        match tree.read(dir) {
            Content::Dict(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0], ("r0".to_string(), Content::Scalar(1.0)));
            }
            other => panic!("expected a dict, got {other:?}"),
        }
    }

    #[test]
    fn aggregation_sums_across_a_glob_of_siblings() {
        let mut tree = TelemetryTree::new();
        let rules = tree.mkdir(tree.root(), "rules");
        let r0 = tree.mkdir(rules, "0");
        let r1 = tree.mkdir(rules, "1");
        tree.add_leaf(r0, "matchedCount", || Content::Scalar(4.0));
        tree.add_leaf(r1, "matchedCount", || Content::Scalar(6.0));
        let total = tree.add_aggregation(
            tree.root(),
            "totalMatched",
            "rules/*/matchedCount",
            Aggregator::Sum,
        );
        assert_eq!(tree.read(total), Content::Scalar(10.0));
    }

    #[test]
    fn read_path_reports_missing_paths() {
        let tree = TelemetryTree::new();
        assert_eq!(
            tree.read_path("no/such/path"),
            Err(TelemetryError::NotFound("no/such/path".to_string()))
        );
    }

    #[test]
    fn scalar_with_unit_preserves_both_parts() {
        let mut tree = TelemetryTree::new();
        let leaf = tree.add_leaf(tree.root(), "uptime", || {
            Content::ScalarWithUnit(120.0, "seconds".to_string())
        });
        assert_eq!(
            tree.read(leaf),
            Content::ScalarWithUnit(120.0, "seconds".to_string())
        );
    }
}
