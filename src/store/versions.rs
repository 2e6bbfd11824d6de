//! Append-only version history for rollback.
//!
//! Every code-change or file-save appends one immutable snapshot. Rollback
//! only reads; re-applying a historical snapshot is the caller's move and
//! never deletes newer records. An order tree keyed by
//! `{project}:{file}:{seq}` gives newest-first reverse scans; seq is a
//! millisecond timestamp with a process-local counter to break ties.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use uuid::Uuid;

use super::{StoreError, StoreResult};

const TREE_VERSIONS: &str = "versions";
const TREE_VERSION_ORDER: &str = "version_order";

/// One immutable historical snapshot of a file's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub id: String,
    pub project_id: String,
    pub file_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Sled-backed version log.
#[derive(Clone)]
pub struct VersionLog {
    versions: Tree,
    order: Tree,
    counter: Arc<AtomicU64>,
}

impl VersionLog {
    pub(super) fn open(db: &Db) -> StoreResult<Self> {
        Ok(Self {
            versions: db.open_tree(TREE_VERSIONS)?,
            order: db.open_tree(TREE_VERSION_ORDER)?,
            counter: Arc::new(AtomicU64::new(0)),
        })
    }

    fn order_key(&self, record: &VersionRecord) -> String {
        let tie = self.counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}:{}:{:016}-{:06}",
            record.project_id,
            record.file_name,
            record.timestamp.timestamp_millis(),
            tie % 1_000_000
        )
    }

    /// Append a snapshot and return the persisted record.
    pub fn append(
        &self,
        project_id: &str,
        file_name: &str,
        content: &str,
    ) -> StoreResult<VersionRecord> {
        let record = VersionRecord {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            file_name: file_name.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        };

        let bytes = bincode::serialize(&record)?;
        self.versions.insert(record.id.as_bytes(), bytes)?;
        self.order
            .insert(self.order_key(&record).as_bytes(), record.id.as_bytes())?;
        Ok(record)
    }

    /// List recent snapshots, newest first.
    ///
    /// With a file name the order tree is scanned directly; without one all
    /// of the project's records are collected and sorted by timestamp.
    pub fn list_recent(
        &self,
        project_id: &str,
        file_name: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<VersionRecord>> {
        let prefix = match file_name {
            Some(file) => format!("{}:{}:", project_id, file),
            None => format!("{}:", project_id),
        };

        let mut out = Vec::new();
        for item in self.order.scan_prefix(prefix.as_bytes()).rev() {
            let (_, id) = item?;
            if let Some(bytes) = self.versions.get(&id)? {
                out.push(bincode::deserialize::<VersionRecord>(&bytes)?);
            }
            if file_name.is_some() && out.len() >= limit {
                break;
            }
        }

        if file_name.is_none() {
            // Records of different files interleave in key order; settle
            // ordering on the record timestamps.
            out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            out.truncate(limit);
        }

        Ok(out)
    }

    /// Read the historical (file name, content) pair for a version id.
    pub fn rollback(&self, version_id: &str) -> StoreResult<VersionRecord> {
        match self.versions.get(version_id.as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Err(StoreError::NotFound(format!("version {}", version_id))),
        }
    }
}
