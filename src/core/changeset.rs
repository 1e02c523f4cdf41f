//! 变更集推导
//!
//! 工作集是一个按路径索引的 arena，运行期间只归引擎所有。
//! 四个桶只保存路径，条目本身始终留在 arena 中。

use super::cancel::CancelHandle;
use super::status::RunKind;
use crate::db::{CatalogEntry, FileStatus};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// 计划的完整目录（包括本次新增的条目）
pub type Arena = BTreeMap<String, CatalogEntry>;

/// 非致命的单条扫描错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanIssue {
    pub path: String,
    pub reason: String,
}

/// 四个互不相交的路径集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buckets {
    pub added: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl Buckets {
    /// ADDED ∪ MODIFIED，即需要传输的路径
    pub fn transferable(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(self.modified.iter())
    }
}

/// 单次运行的变更集视图
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub added: BTreeMap<String, CatalogEntry>,
    pub modified: BTreeMap<String, CatalogEntry>,
    pub removed: BTreeMap<String, CatalogEntry>,
    pub deleted: BTreeMap<String, CatalogEntry>,
    pub scan_errors: Vec<ScanIssue>,
}

impl ChangeSet {
    pub(crate) fn view(arena: &Arena, buckets: &Buckets, scan_errors: &[ScanIssue]) -> Self {
        let pick = |paths: &BTreeSet<String>| {
            paths
                .iter()
                .filter_map(|p| arena.get(p).map(|e| (p.clone(), e.clone())))
                .collect::<BTreeMap<_, _>>()
        };

        Self {
            added: pick(&buckets.added),
            modified: pick(&buckets.modified),
            removed: pick(&buckets.removed),
            deleted: pick(&buckets.deleted),
            scan_errors: scan_errors.to_vec(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty() && self.deleted.is_empty()
    }

    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary {
            added: self.added.len(),
            modified: self.modified.len(),
            removed: self.removed.len(),
            deleted: self.deleted.len(),
            scan_errors: self.scan_errors.len(),
        }
    }
}

/// 变更计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSummary {
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub deleted: usize,
    pub scan_errors: usize,
}

/// 把已分类的条目划分到四个桶中。
///
/// 全新运行时，未提供且不是墓碑的目录条目会被就地标记为 DELETED。
pub fn derive(
    arena: &mut Arena,
    supplied: &BTreeSet<String>,
    kind: RunKind,
    cancel: &CancelHandle,
    now: DateTime<Utc>,
) -> Result<Buckets> {
    let mut buckets = Buckets::default();

    for path in supplied {
        cancel.check()?;
        let Some(entry) = arena.get(path) else {
            continue;
        };
        match entry.status {
            FileStatus::Added => {
                buckets.added.insert(path.clone());
            }
            FileStatus::Modified => {
                buckets.modified.insert(path.clone());
            }
            // 本次分类中消失的已提供文件
            FileStatus::Deleted if kind.is_fresh() => {
                buckets.deleted.insert(path.clone());
            }
            _ => {}
        }
    }

    // 续传不检测移除/删除
    if !kind.is_fresh() {
        return Ok(buckets);
    }

    for (path, entry) in arena.iter_mut() {
        cancel.check()?;
        if supplied.contains(path) {
            continue;
        }
        match entry.status {
            FileStatus::Removed => {
                buckets.removed.insert(path.clone());
            }
            FileStatus::Deleted => {}
            _ => {
                debug!("未提供的路径标记为删除: {}", path);
                entry.status = FileStatus::Deleted;
                entry.updated_at = now;
                buckets.deleted.insert(path.clone());
            }
        }
    }

    Ok(buckets)
}

/// 检查变更集的交叉不变量，失败即为引擎缺陷
pub fn verify(arena: &Arena, supplied: &BTreeSet<String>, buckets: &Buckets, kind: RunKind) -> Result<()> {
    let all = [
        ("added", &buckets.added),
        ("modified", &buckets.modified),
        ("removed", &buckets.removed),
        ("deleted", &buckets.deleted),
    ];

    // 成员关系与互斥
    let mut seen = BTreeSet::new();
    for (name, paths) in all {
        for path in paths {
            if !arena.contains_key(path) {
                return Err(EngineError::Invariant(format!("{} entry {} is not in the catalog", name, path)));
            }
            if !seen.insert(path) {
                return Err(EngineError::Invariant(format!("{} appears in more than one bucket", path)));
            }
        }
    }

    let status_of = |path: &String| arena.get(path).map(|e| e.status);
    let expect = |paths: &BTreeSet<String>, status: FileStatus| -> Result<()> {
        match paths.iter().find(|p| status_of(*p) != Some(status)) {
            Some(path) => Err(EngineError::Invariant(format!(
                "{} is bucketed as {} but has status {:?}",
                path,
                status,
                status_of(path)
            ))),
            None => Ok(()),
        }
    };
    expect(&buckets.added, FileStatus::Added)?;
    expect(&buckets.modified, FileStatus::Modified)?;
    expect(&buckets.removed, FileStatus::Removed)?;
    expect(&buckets.deleted, FileStatus::Deleted)?;

    if let Some(path) = buckets.added.iter().find(|p| !supplied.contains(*p)) {
        return Err(EngineError::Invariant(format!("added entry {} was not supplied", path)));
    }
    if let Some(path) = buckets.removed.iter().find(|p| supplied.contains(*p)) {
        return Err(EngineError::Invariant(format!("removed entry {} was supplied", path)));
    }
    if !kind.is_fresh() && !(buckets.removed.is_empty() && buckets.deleted.is_empty()) {
        return Err(EngineError::Invariant(
            "resumed run produced removed or deleted entries".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, status: FileStatus) -> (String, CatalogEntry) {
        let mut entry = CatalogEntry::new(1, path, Utc::now());
        entry.id = Some(path.len() as i64);
        entry.status = status;
        (path.to_string(), entry)
    }

    fn supplied(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    fn set(paths: &[&str]) -> BTreeSet<String> {
        supplied(paths)
    }

    #[test]
    fn test_fresh_derivation() {
        let mut arena: Arena = [
            entry("/a", FileStatus::Unchanged),
            entry("/b", FileStatus::Unchanged),
            entry("/c", FileStatus::Added),
            entry("/d", FileStatus::Modified),
            entry("/gone", FileStatus::Deleted),
            entry("/old", FileStatus::Deleted),
            entry("/unselected", FileStatus::Removed),
        ]
        .into_iter()
        .collect();
        let supplied = supplied(&["/a", "/c", "/d", "/gone"]);
        let now = Utc::now();

        let buckets = derive(&mut arena, &supplied, RunKind::Fresh, &CancelHandle::new(), now).unwrap();

        assert_eq!(buckets.added, set(&["/c"]));
        assert_eq!(buckets.modified, set(&["/d"]));
        assert_eq!(buckets.removed, set(&["/unselected"]));
        // /old 已是墓碑，不会重复进入
        assert_eq!(buckets.deleted, set(&["/b", "/gone"]));
        assert_eq!(arena["/b"].status, FileStatus::Deleted);
        assert_eq!(arena["/b"].updated_at, now);
        verify(&arena, &supplied, &buckets, RunKind::Fresh).unwrap();
    }

    #[test]
    fn test_resumed_derivation_skips_tombstones() {
        let mut arena: Arena = [
            entry("/a", FileStatus::Added),
            entry("/b", FileStatus::Unchanged),
            entry("/missing", FileStatus::Deleted),
            entry("/unselected", FileStatus::Removed),
        ]
        .into_iter()
        .collect();
        let supplied = supplied(&["/a", "/missing"]);

        let buckets = derive(&mut arena, &supplied, RunKind::Resumed, &CancelHandle::new(), Utc::now()).unwrap();

        assert_eq!(buckets.added, set(&["/a"]));
        assert!(buckets.removed.is_empty());
        assert!(buckets.deleted.is_empty());
        assert_eq!(arena["/b"].status, FileStatus::Unchanged);
        verify(&arena, &supplied, &buckets, RunKind::Resumed).unwrap();
    }

    #[test]
    fn test_derive_observes_cancellation() {
        let mut arena: Arena = [entry("/a", FileStatus::Unchanged)].into_iter().collect();
        let cancel = CancelHandle::new();
        cancel.cancel();

        let err = derive(&mut arena, &supplied(&[]), RunKind::Fresh, &cancel, Utc::now()).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(arena["/a"].status, FileStatus::Unchanged);
    }

    #[test]
    fn test_verify_rejects_broken_buckets() {
        let arena: Arena = [entry("/a", FileStatus::Added), entry("/r", FileStatus::Removed)]
            .into_iter()
            .collect();
        let supplied = supplied(&["/a", "/r"]);

        let unknown = Buckets {
            added: set(&["/zzz"]),
            ..Default::default()
        };
        assert!(matches!(
            verify(&arena, &supplied, &unknown, RunKind::Fresh),
            Err(EngineError::Invariant(_))
        ));

        let overlapping = Buckets {
            added: set(&["/a"]),
            deleted: set(&["/a"]),
            ..Default::default()
        };
        assert!(verify(&arena, &supplied, &overlapping, RunKind::Fresh).is_err());

        let supplied_removed = Buckets {
            removed: set(&["/r"]),
            ..Default::default()
        };
        assert!(verify(&arena, &supplied, &supplied_removed, RunKind::Fresh).is_err());

        let resumed_removed = Buckets {
            removed: set(&["/r"]),
            ..Default::default()
        };
        assert!(verify(&arena, &BTreeSet::new(), &resumed_removed, RunKind::Resumed).is_err());
    }

    #[test]
    fn test_view_copies_entries() {
        let arena: Arena = [entry("/a", FileStatus::Added)].into_iter().collect();
        let buckets = Buckets {
            added: set(&["/a"]),
            ..Default::default()
        };
        let issues = vec![ScanIssue {
            path: "/x".to_string(),
            reason: "missing".to_string(),
        }];

        let change_set = ChangeSet::view(&arena, &buckets, &issues);
        assert_eq!(change_set.added["/a"].status, FileStatus::Added);
        assert_eq!(
            change_set.summary(),
            ChangeSummary {
                added: 1,
                scan_errors: 1,
                ..Default::default()
            }
        );
        assert!(!change_set.is_empty());
    }
}
