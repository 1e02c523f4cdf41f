//! 状态机：根据上次状态和文件系统现状决定条目的新状态，不做任何 I/O

use crate::db::FileStatus;
use chrono::{DateTime, Utc};

/// 运行类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Fresh,
    /// 续传：不重新判断修改，也不检测移除/删除
    Resumed,
}

impl RunKind {
    pub fn is_fresh(&self) -> bool {
        matches!(self, RunKind::Fresh)
    }
}

/// 计算条目的新状态。
///
/// 返回 `None` 表示首次出现的路径在文件系统上不存在，无法跟踪。
pub fn classify(
    previous: Option<FileStatus>,
    exists: bool,
    mtime_changed: bool,
    kind: RunKind,
) -> Option<FileStatus> {
    let Some(previous) = previous else {
        return exists.then_some(FileStatus::Added);
    };

    if !exists {
        return Some(FileStatus::Deleted);
    }

    let next = match previous {
        FileStatus::Deleted | FileStatus::Removed => FileStatus::Added,
        FileStatus::Added | FileStatus::Modified | FileStatus::Unchanged => match kind {
            RunKind::Fresh if mtime_changed => FileStatus::Modified,
            RunKind::Fresh => FileStatus::Unchanged,
            RunKind::Resumed => previous,
        },
    };
    Some(next)
}

/// 两个时间戳截断到整秒后是否不同，没有记录视为已改变
pub fn mtime_changed(recorded: Option<DateTime<Utc>>, current: DateTime<Utc>) -> bool {
    match recorded {
        Some(recorded) => recorded.timestamp() != current.timestamp(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use FileStatus::*;

    #[test]
    fn test_new_path() {
        assert_eq!(classify(None, true, false, RunKind::Fresh), Some(Added));
        assert_eq!(classify(None, true, true, RunKind::Resumed), Some(Added));
        assert_eq!(classify(None, false, false, RunKind::Fresh), None);
        assert_eq!(classify(None, false, false, RunKind::Resumed), None);
    }

    #[test]
    fn test_tombstones_come_back_as_added() {
        for kind in [RunKind::Fresh, RunKind::Resumed] {
            assert_eq!(classify(Some(Deleted), true, false, kind), Some(Added));
            assert_eq!(classify(Some(Removed), true, true, kind), Some(Added));
            assert_eq!(classify(Some(Removed), false, false, kind), Some(Deleted));
            assert_eq!(classify(Some(Deleted), false, false, kind), Some(Deleted));
        }
    }

    #[test]
    fn test_fresh_run_checks_mtime() {
        for previous in [Added, Modified, Unchanged] {
            assert_eq!(classify(Some(previous), true, true, RunKind::Fresh), Some(Modified));
            assert_eq!(classify(Some(previous), true, false, RunKind::Fresh), Some(Unchanged));
            assert_eq!(classify(Some(previous), false, false, RunKind::Fresh), Some(Deleted));
        }
    }

    #[test]
    fn test_resumed_run_keeps_status() {
        for previous in [Added, Modified, Unchanged] {
            assert_eq!(classify(Some(previous), true, true, RunKind::Resumed), Some(previous));
            assert_eq!(classify(Some(previous), false, true, RunKind::Resumed), Some(Deleted));
        }
    }

    #[test]
    fn test_mtime_ignores_sub_second_jitter() {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert!(!mtime_changed(Some(base), base + Duration::milliseconds(999)));
        assert!(!mtime_changed(Some(base + Duration::milliseconds(10)), base + Duration::milliseconds(900)));
        assert!(mtime_changed(Some(base), base + Duration::seconds(1)));
        assert!(mtime_changed(Some(base + Duration::milliseconds(999)), base + Duration::milliseconds(1001)));
        assert!(mtime_changed(None, base));
    }
}
