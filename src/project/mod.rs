//! Project file-tree model.
//!
//! A project's files are represented as a forest of tagged nodes (file or
//! folder) that is replaced wholesale by tree-sync events and mutated in
//! place by single-file updates. All tree walks are depth-first recursive
//! searches that short-circuit on the first match.

mod tree;

pub use tree::{
    file_count, find_file, folder_count, set_content_by_id, set_content_by_name,
    validate_unique_ids, FileNode, TreeError,
};

/// Unique identifier for a file or folder node within a project.
pub type NodeId = String;
