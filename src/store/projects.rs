//! Durable current-state record per project.
//!
//! A project holds its file tree, the legacy single-file code scalar, and
//! its member list. Tree replacement is guarded by a monotonic revision
//! counter so a stale whole-tree write arriving late cannot overwrite
//! newer state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use uuid::Uuid;

use super::{StoreError, StoreResult};
use crate::project::{self, FileNode};

const TREE_PROJECTS: &str = "projects";

/// A persisted project record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Ordered member user ids. No duplicates.
    pub members: Vec<String>,
    #[serde(default)]
    pub files: Vec<FileNode>,
    /// Legacy quick-open code scalar mirroring one file's content.
    #[serde(default)]
    pub code: String,
    /// Bumped on every whole-tree replacement.
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Sled-backed project snapshot store.
#[derive(Clone)]
pub struct ProjectStore {
    projects: Tree,
}

impl ProjectStore {
    pub(super) fn open(db: &Db) -> StoreResult<Self> {
        Ok(Self {
            projects: db.open_tree(TREE_PROJECTS)?,
        })
    }

    fn put(&self, project: &Project) -> StoreResult<()> {
        let bytes = bincode::serialize(project)?;
        self.projects.insert(project.id.as_bytes(), bytes)?;
        Ok(())
    }

    fn load(&self, project_id: &str) -> StoreResult<Project> {
        self.get(project_id)?
            .ok_or_else(|| StoreError::NotFound(format!("project {}", project_id)))
    }

    /// Create a new project record with a fresh id.
    pub fn create(&self, name: &str, members: Vec<String>) -> StoreResult<Project> {
        let now = Utc::now();
        let mut unique = Vec::new();
        for member in members {
            if !unique.contains(&member) {
                unique.push(member);
            }
        }

        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            members: unique,
            files: Vec::new(),
            code: String::new(),
            revision: 0,
            created_at: now,
            updated_at: now,
        };
        self.put(&project)?;
        Ok(project)
    }

    pub fn get(&self, project_id: &str) -> StoreResult<Option<Project>> {
        match self.projects.get(project_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> StoreResult<Vec<Project>> {
        let mut out = Vec::new();
        for item in self.projects.iter() {
            let (_, bytes) = item?;
            out.push(bincode::deserialize(&bytes)?);
        }
        Ok(out)
    }

    /// Replace the file tree wholesale.
    ///
    /// `expected_revision` must match the stored revision; a mismatch means
    /// the caller acted on stale state and the write is rejected. Node ids
    /// are validated for uniqueness before anything is written. Returns the
    /// new revision.
    pub fn replace_file_tree(
        &self,
        project_id: &str,
        files: Vec<FileNode>,
        expected_revision: u64,
    ) -> StoreResult<u64> {
        project::validate_unique_ids(&files)
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;

        let mut project = self.load(project_id)?;
        if project.revision != expected_revision {
            return Err(StoreError::StaleRevision {
                current: project.revision,
                provided: expected_revision,
            });
        }

        project.files = files;
        project.revision += 1;
        project.updated_at = Utc::now();
        self.put(&project)?;
        Ok(project.revision)
    }

    /// Update the legacy code scalar.
    pub fn set_code(&self, project_id: &str, code: &str) -> StoreResult<()> {
        let mut project = self.load(project_id)?;
        project.code = code.to_string();
        project.updated_at = Utc::now();
        self.put(&project)
    }

    /// Add a member. Idempotent: returns false when already present.
    pub fn add_member(&self, project_id: &str, user_id: &str) -> StoreResult<bool> {
        let mut project = self.load(project_id)?;
        if project.members.iter().any(|m| m == user_id) {
            return Ok(false);
        }
        project.members.push(user_id.to_string());
        project.updated_at = Utc::now();
        self.put(&project)?;
        Ok(true)
    }

    /// Replace the content of a single file, located by node id.
    ///
    /// Returns the file's name. `NotFound` when the project or the file id
    /// does not exist.
    pub fn update_file(
        &self,
        project_id: &str,
        file_id: &str,
        new_content: &str,
    ) -> StoreResult<String> {
        let mut project = self.load(project_id)?;

        let Some(file_name) = project::set_content_by_id(&mut project.files, file_id, new_content)
        else {
            return Err(StoreError::NotFound(format!("file {}", file_id)));
        };

        project.updated_at = Utc::now();
        self.put(&project)?;
        Ok(file_name)
    }

    /// Re-apply a historical snapshot as the new current state.
    ///
    /// Sets the legacy code scalar and, when a file node with the given
    /// name exists in the tree, its content as well. History is never
    /// touched.
    pub fn restore_file(
        &self,
        project_id: &str,
        file_name: &str,
        content: &str,
    ) -> StoreResult<()> {
        let mut project = self.load(project_id)?;
        project.code = content.to_string();
        project::set_content_by_name(&mut project.files, file_name, content);
        project.updated_at = Utc::now();
        self.put(&project)
    }
}
