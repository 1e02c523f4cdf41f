//! 传输集：交给传输后端的版本化文件描述

use super::changeset::{Arena, Buckets};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// 一个待传输的版本化文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedFile {
    pub path: String,
    pub size: u64,
    pub last_write_time_utc: Option<DateTime<Utc>>,
    /// 生成它的运行 ID
    pub version: String,
    /// 从不计算
    pub checksum: Option<String>,
}

/// 本次运行需要传输的全部文件
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferSet {
    files: Vec<VersionedFile>,
}

impl TransferSet {
    pub fn files(&self) -> &[VersionedFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, VersionedFile> {
        self.files.iter()
    }
}

impl IntoIterator for TransferSet {
    type Item = VersionedFile;
    type IntoIter = std::vec::IntoIter<VersionedFile>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.into_iter()
    }
}

/// 为 ADDED ∪ MODIFIED 中的每个条目生成描述，并校验数量
pub fn build(arena: &Arena, buckets: &Buckets, version: &str) -> Result<TransferSet> {
    let mut files = Vec::with_capacity(buckets.added.len() + buckets.modified.len());

    for path in buckets.transferable() {
        let Some(entry) = arena.get(path) else {
            continue;
        };
        if !entry.status.needs_transfer() {
            continue;
        }
        files.push(VersionedFile {
            path: entry.path.clone(),
            size: entry.last_size,
            last_write_time_utc: entry.last_written_at,
            version: version.to_string(),
            checksum: None,
        });
    }

    let expected = buckets.added.len() + buckets.modified.len();
    if files.len() != expected {
        return Err(EngineError::Invariant(format!(
            "transfer set has {} files, expected added + modified = {}",
            files.len(),
            expected
        )));
    }

    Ok(TransferSet { files })
}
