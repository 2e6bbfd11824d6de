//! Tagged file-tree nodes and the recursive operations over them.
//!
//! Folder membership is explicit in the variant, never inferred from a
//! missing content field. Every walk matches both variants exhaustively.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::NodeId;

/// A node in a project's file tree.
///
/// Serialized with an explicit `type` tag (`"file"` / `"folder"`) so the
/// wire shape mirrors the stored shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileNode {
    File {
        id: NodeId,
        name: String,
        #[serde(default)]
        content: String,
    },
    Folder {
        id: NodeId,
        name: String,
        #[serde(default)]
        children: Vec<FileNode>,
    },
}

impl FileNode {
    /// Create a file node with content.
    pub fn file(id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::File {
            id: id.into(),
            name: name.into(),
            content: content.into(),
        }
    }

    /// Create a folder node with children.
    pub fn folder(id: impl Into<String>, name: impl Into<String>, children: Vec<FileNode>) -> Self {
        Self::Folder {
            id: id.into(),
            name: name.into(),
            children,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            FileNode::File { id, .. } => id,
            FileNode::Folder { id, .. } => id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FileNode::File { name, .. } => name,
            FileNode::Folder { name, .. } => name,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, FileNode::File { .. })
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, FileNode::Folder { .. })
    }
}

/// Errors raised by tree validation.
#[derive(Debug, Clone, Error)]
pub enum TreeError {
    #[error("duplicate node id in file tree: {0}")]
    DuplicateId(NodeId),

    #[error("empty node id in file tree")]
    EmptyId,
}

/// Find a file node by id. Depth-first, first match wins.
pub fn find_file<'a>(nodes: &'a [FileNode], file_id: &str) -> Option<&'a FileNode> {
    for node in nodes {
        match node {
            FileNode::File { id, .. } => {
                if id == file_id {
                    return Some(node);
                }
            }
            FileNode::Folder { children, .. } => {
                if let Some(found) = find_file(children, file_id) {
                    return Some(found);
                }
            }
        }
    }
    None
}

/// Replace the content of the file with the given id.
///
/// Returns the file's name on success, `None` when no file node carries
/// the id (folders are descended into, never matched).
pub fn set_content_by_id(nodes: &mut [FileNode], file_id: &str, new_content: &str) -> Option<String> {
    for node in nodes.iter_mut() {
        match node {
            FileNode::File { id, name, content } => {
                if id == file_id {
                    *content = new_content.to_owned();
                    return Some(name.clone());
                }
            }
            FileNode::Folder { children, .. } => {
                if let Some(name) = set_content_by_id(children, file_id, new_content) {
                    return Some(name);
                }
            }
        }
    }
    None
}

/// Replace the content of the first file whose name matches.
///
/// Used by rollback, where history records carry a file name rather than a
/// node id. Returns the node id of the updated file.
pub fn set_content_by_name(nodes: &mut [FileNode], file_name: &str, new_content: &str) -> Option<NodeId> {
    for node in nodes.iter_mut() {
        match node {
            FileNode::File { id, name, content } => {
                if name == file_name {
                    *content = new_content.to_owned();
                    return Some(id.clone());
                }
            }
            FileNode::Folder { children, .. } => {
                if let Some(id) = set_content_by_name(children, file_name, new_content) {
                    return Some(id);
                }
            }
        }
    }
    None
}

/// Check that every node id in the forest is non-empty and unique.
pub fn validate_unique_ids(nodes: &[FileNode]) -> Result<(), TreeError> {
    fn walk<'a>(nodes: &'a [FileNode], seen: &mut HashSet<&'a str>) -> Result<(), TreeError> {
        for node in nodes {
            let id = node.id();
            if id.is_empty() {
                return Err(TreeError::EmptyId);
            }
            if !seen.insert(id) {
                return Err(TreeError::DuplicateId(id.to_owned()));
            }
            match node {
                FileNode::File { .. } => {}
                FileNode::Folder { children, .. } => walk(children, seen)?,
            }
        }
        Ok(())
    }

    let mut seen = HashSet::new();
    walk(nodes, &mut seen)
}

/// Count file nodes in the forest.
pub fn file_count(nodes: &[FileNode]) -> usize {
    nodes
        .iter()
        .map(|node| match node {
            FileNode::File { .. } => 1,
            FileNode::Folder { children, .. } => file_count(children),
        })
        .sum()
}

/// Count folder nodes in the forest.
pub fn folder_count(nodes: &[FileNode]) -> usize {
    nodes
        .iter()
        .map(|node| match node {
            FileNode::File { .. } => 0,
            FileNode::Folder { children, .. } => 1 + folder_count(children),
        })
        .sum()
}
