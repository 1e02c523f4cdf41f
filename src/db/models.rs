use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type PlanId = i64;
pub type RunId = i64;
pub type EntryId = i64;

/// 文件生命周期状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileStatus {
    Added,
    Modified,
    Unchanged,
    /// 路径被用户从计划中移除（由选择层标记）
    Removed,
    /// 文件已从文件系统中消失
    Deleted,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Added => "ADDED",
            FileStatus::Modified => "MODIFIED",
            FileStatus::Unchanged => "UNCHANGED",
            FileStatus::Removed => "REMOVED",
            FileStatus::Deleted => "DELETED",
        }
    }

    /// REMOVED / DELETED 条目只保留作审计
    pub fn is_tombstone(&self) -> bool {
        matches!(self, FileStatus::Removed | FileStatus::Deleted)
    }

    pub fn needs_transfer(&self) -> bool {
        matches!(self, FileStatus::Added | FileStatus::Modified)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADDED" => Ok(FileStatus::Added),
            "MODIFIED" => Ok(FileStatus::Modified),
            "UNCHANGED" => Ok(FileStatus::Unchanged),
            "REMOVED" => Ok(FileStatus::Removed),
            "DELETED" => Ok(FileStatus::Deleted),
            _ => Err(StoreError::InvalidValue {
                column: "status",
                value: s.to_string(),
            }),
        }
    }
}

/// 运行状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "RUNNING",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
            RunState::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(RunState::Running),
            "COMPLETED" => Ok(RunState::Completed),
            "FAILED" => Ok(RunState::Failed),
            "CANCELED" => Ok(RunState::Canceled),
            _ => Err(StoreError::InvalidValue {
                column: "state",
                value: s.to_string(),
            }),
        }
    }
}

/// 审计行的传输状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferState {
    Pending,
    Completed,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Pending => "PENDING",
            TransferState::Completed => "COMPLETED",
        }
    }
}

impl FromStr for TransferState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransferState::Pending),
            "COMPLETED" => Ok(TransferState::Completed),
            _ => Err(StoreError::InvalidValue {
                column: "transfer_state",
                value: s.to_string(),
            }),
        }
    }
}

/// 计划源类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Drive,
    Folder,
    File,
}

/// 计划中选中的一个源
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceEntry {
    pub kind: SourceKind,
    pub path: String,
}

impl FromStr for SourceEntry {
    type Err = String;

    /// 解析 `kind:path`，例如 `folder:/home/me/docs`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, path) = s
            .split_once(':')
            .ok_or_else(|| format!("expected KIND:PATH, got {:?}", s))?;
        let kind = match kind.to_lowercase().as_str() {
            "drive" => SourceKind::Drive,
            "folder" | "dir" => SourceKind::Folder,
            "file" => SourceKind::File,
            other => return Err(format!("unknown source kind {:?}", other)),
        };
        if path.is_empty() {
            return Err("source path is empty".to_string());
        }
        Ok(SourceEntry {
            kind,
            path: path.to_string(),
        })
    }
}

/// 备份计划
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupPlan {
    pub id: Option<PlanId>,
    pub name: String,
    pub sources: Vec<SourceEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackupPlan {
    pub fn new(name: impl Into<String>, sources: Vec<SourceEntry>) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            name: name.into(),
            sources,
            created_at: now,
            updated_at: now,
        }
    }

    /// 选中源的路径摘要，每次调用都重新计算
    pub fn sources_summary(&self, delimiter: &str, max_len: usize, trail: &str) -> String {
        if self.sources.is_empty() {
            return "No selected sources".to_string();
        }

        let joined = self
            .sources
            .iter()
            .map(|s| s.path.as_str())
            .collect::<Vec<_>>()
            .join(delimiter);

        if joined.chars().count() <= max_len {
            return joined;
        }

        let mut cut: String = joined.chars().take(max_len).collect();
        cut.push_str(trail);
        cut
    }
}

/// 计划目录条目：每个 (plan, path) 一条，跨运行持久化，永不删除
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    /// 首次持久化前为 None
    pub id: Option<EntryId>,
    pub plan_id: PlanId,
    pub path: String,
    pub status: FileStatus,
    pub last_size: u64,
    pub last_written_at: Option<DateTime<Utc>>,
    /// 表结构中保留，从不计算
    pub last_checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogEntry {
    pub fn new(plan_id: PlanId, path: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: None,
            plan_id,
            path: path.into(),
            status: FileStatus::Added,
            last_size: 0,
            last_written_at: None,
            last_checksum: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 一次运行
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: Option<RunId>,
    pub plan_id: PlanId,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub files: Vec<RunFileRecord>,
}

impl RunRecord {
    /// 新建一个 RUNNING 状态的运行
    pub fn start(plan_id: PlanId) -> Self {
        Self {
            id: None,
            plan_id,
            state: RunState::Running,
            started_at: Utc::now(),
            finished_at: None,
            files: Vec::new(),
        }
    }

    /// 版本标记：运行 ID 的字符串形式
    pub fn version_tag(&self) -> Option<String> {
        self.id.map(|id| id.to_string())
    }

    /// 按路径替换或追加审计行
    pub fn put_file(&mut self, record: RunFileRecord) {
        match self.files.iter_mut().find(|f| f.path == record.path) {
            Some(existing) => *existing = record,
            None => self.files.push(record),
        }
    }

    pub fn file(&self, path: &str) -> Option<&RunFileRecord> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn finish(&mut self, state: RunState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }
}

/// 运行内某个目录条目的审计行
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunFileRecord {
    pub id: Option<i64>,
    pub run_id: RunId,
    pub entry_id: Option<EntryId>,
    pub path: String,
    pub status: FileStatus,
    pub transfer_state: TransferState,
    pub size: u64,
    pub last_written_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl RunFileRecord {
    pub fn for_entry(run_id: RunId, entry: &CatalogEntry) -> Self {
        Self {
            id: None,
            run_id,
            entry_id: entry.id,
            path: entry.path.clone(),
            status: entry.status,
            transfer_state: TransferState::Pending,
            size: entry.last_size,
            last_written_at: entry.last_written_at,
            updated_at: entry.updated_at,
        }
    }

    /// 用条目当前状态刷新快照
    pub fn snapshot(&mut self, entry: &CatalogEntry, transfer_state: TransferState, now: DateTime<Utc>) {
        self.entry_id = entry.id;
        self.status = entry.status;
        self.size = entry.last_size;
        self.last_written_at = entry.last_written_at;
        self.transfer_state = transfer_state;
        self.updated_at = now;
    }
}

// 数据库表模型
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BackupPlanRow {
    pub id: i64,
    pub name: String,
    pub sources: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<BackupPlanRow> for BackupPlan {
    type Error = StoreError;

    fn try_from(row: BackupPlanRow) -> Result<Self, Self::Error> {
        Ok(BackupPlan {
            id: Some(row.id),
            name: row.name,
            sources: serde_json::from_str(&row.sources)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CatalogEntryRow {
    pub id: i64,
    pub plan_id: i64,
    pub path: String,
    pub status: String,
    pub last_size: i64,
    pub last_written_at: Option<DateTime<Utc>>,
    pub last_checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<CatalogEntryRow> for CatalogEntry {
    type Error = StoreError;

    fn try_from(row: CatalogEntryRow) -> Result<Self, Self::Error> {
        Ok(CatalogEntry {
            id: Some(row.id),
            plan_id: row.plan_id,
            path: row.path,
            status: row.status.parse()?,
            last_size: row.last_size.max(0) as u64,
            last_written_at: row.last_written_at,
            last_checksum: row.last_checksum,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRow {
    pub id: i64,
    pub plan_id: i64,
    pub state: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRow {
    pub fn into_record(self, files: Vec<RunFileRecord>) -> Result<RunRecord, StoreError> {
        Ok(RunRecord {
            id: Some(self.id),
            plan_id: self.plan_id,
            state: self.state.parse()?,
            started_at: self.started_at,
            finished_at: self.finished_at,
            files,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunFileRow {
    pub id: i64,
    pub run_id: i64,
    pub entry_id: Option<i64>,
    pub path: String,
    pub status: String,
    pub transfer_state: String,
    pub size: i64,
    pub last_written_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<RunFileRow> for RunFileRecord {
    type Error = StoreError;

    fn try_from(row: RunFileRow) -> Result<Self, Self::Error> {
        Ok(RunFileRecord {
            id: Some(row.id),
            run_id: row.run_id,
            entry_id: row.entry_id,
            path: row.path,
            status: row.status.parse()?,
            transfer_state: row.transfer_state.parse()?,
            size: row.size.max(0) as u64,
            last_written_at: row.last_written_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_round_trip() {
        for status in [
            FileStatus::Added,
            FileStatus::Modified,
            FileStatus::Unchanged,
            FileStatus::Removed,
            FileStatus::Deleted,
        ] {
            assert_eq!(status.as_str().parse::<FileStatus>().unwrap(), status);
        }
        assert!("GONE".parse::<FileStatus>().is_err());
    }

    #[test]
    fn test_sources_summary() {
        let mut plan = BackupPlan::new("docs", vec![]);
        assert_eq!(plan.sources_summary(", ", 20, "..."), "No selected sources");

        plan.sources = vec![
            "folder:/home/a".parse().unwrap(),
            "file:/etc/hosts".parse().unwrap(),
        ];
        assert_eq!(plan.sources_summary(", ", 100, "..."), "/home/a, /etc/hosts");
        assert_eq!(plan.sources_summary(", ", 7, "..."), "/home/a...");

        // 修改源后摘要随之变化
        plan.sources.pop();
        assert_eq!(plan.sources_summary(", ", 100, "..."), "/home/a");
    }

    #[test]
    fn test_parse_source_entry() {
        let entry: SourceEntry = "Folder:/data".parse().unwrap();
        assert_eq!(entry.kind, SourceKind::Folder);
        assert_eq!(entry.path, "/data");
        assert!("/data".parse::<SourceEntry>().is_err());
        assert!("tape:/dev/st0".parse::<SourceEntry>().is_err());
        assert!("file:".parse::<SourceEntry>().is_err());
    }

    #[test]
    fn test_put_file_replaces_by_path() {
        let now = Utc::now();
        let mut run = RunRecord::start(1);
        run.id = Some(9);
        assert_eq!(run.version_tag().as_deref(), Some("9"));

        let mut entry = CatalogEntry::new(1, "/a", now);
        run.put_file(RunFileRecord::for_entry(9, &entry));
        entry.status = FileStatus::Modified;
        run.put_file(RunFileRecord::for_entry(9, &entry));

        assert_eq!(run.files.len(), 1);
        assert_eq!(run.file("/a").unwrap().status, FileStatus::Modified);
    }
}
