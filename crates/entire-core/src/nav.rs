//! Branch → session → checkpoint navigation tree.
//!
//! Nodes live in one arena and refer to each other by [`NodeId`]; the parent
//! link is an index, so walking up the tree needs no shared ownership.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use git2::Repository;
use serde::Serialize;

use crate::checkpoint::committed::{CommittedStore, METADATA_BRANCH};
use crate::checkpoint::temporary::{self, MAX_TEMPORARY_WALK};
use crate::error::EntireResult;
use crate::shadow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Root,
    Branch {
        name: String,
    },
    Session {
        session_id: String,
    },
    Checkpoint {
        /// Commit hash for temporary checkpoints, checkpoint ID for committed ones.
        id: String,
        label: String,
        created_at: DateTime<Utc>,
        committed: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct NavNode {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NavTree {
    nodes: Vec<NavNode>,
}

impl Default for NavTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NavTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![NavNode {
                kind: NodeKind::Root,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Add a child under `parent`.
    pub fn add(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(NavNode {
            kind,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&NavNode> {
        self.nodes.get(id.0)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.get(id).map(|n| n.children.as_slice()).unwrap_or_default()
    }

    /// Parents of `id`, nearest first, ending at the root.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cursor = self.parent(id);
        while let Some(p) = cursor {
            out.push(p);
            cursor = self.parent(p);
        }
        out
    }

    pub fn depth(&self, id: NodeId) -> usize {
        self.ancestors(id).len()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Depth-first walk from the root, yielding `(depth, id)`.
    pub fn walk(&self) -> Vec<(usize, NodeId)> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(0usize, self.root())];
        while let Some((depth, id)) = stack.pop() {
            out.push((depth, id));
            for child in self.children(id).iter().rev() {
                stack.push((depth + 1, *child));
            }
        }
        out
    }
}

/// Build the tree from every shadow branch plus the metadata branch.
pub fn build_navigation_tree(repo: &Repository) -> EntireResult<NavTree> {
    let mut tree = NavTree::new();
    let root = tree.root();

    for branch in shadow::list_shadow_branches(repo)? {
        let checkpoints = temporary::list_temporary(repo, &branch, MAX_TEMPORARY_WALK)?;
        let branch_node = tree.add(root, NodeKind::Branch { name: branch });
        let mut sessions: HashMap<String, NodeId> = HashMap::new();
        for cp in checkpoints {
            let session_node = *sessions.entry(cp.session_id.clone()).or_insert_with(|| {
                tree.add(branch_node, NodeKind::Session { session_id: cp.session_id.clone() })
            });
            tree.add(
                session_node,
                NodeKind::Checkpoint {
                    id: cp.commit,
                    label: cp.subject,
                    created_at: cp.created_at,
                    committed: false,
                },
            );
        }
    }

    let committed = CommittedStore::new(repo).list_committed()?;
    if !committed.is_empty() {
        let branch_node = tree.add(root, NodeKind::Branch { name: METADATA_BRANCH.to_string() });
        let mut sessions: HashMap<String, NodeId> = HashMap::new();
        for meta in committed {
            let label = meta
                .summary
                .as_ref()
                .map(|s| s.intent.clone())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("{} file(s)", meta.files_touched.len()));
            for sid in &meta.session_ids {
                let session_node = *sessions.entry(sid.clone()).or_insert_with(|| {
                    tree.add(branch_node, NodeKind::Session { session_id: sid.clone() })
                });
                tree.add(
                    session_node,
                    NodeKind::Checkpoint {
                        id: meta.checkpoint_id.to_string(),
                        label: label.clone(),
                        created_at: meta.created_at,
                        committed: true,
                    },
                );
            }
        }
    }

    Ok(tree)
}
