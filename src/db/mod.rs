//! 计划目录存储
//!
//! `CatalogStore` 是引擎唯一的持久化入口。引擎按顺序逐个调用，
//! 从不并发请求；并发控制由存储自身负责。

pub mod memory;
pub mod models;

pub use memory::MemoryCatalog;
pub use models::*;

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// 一次提交需要写入的全部内容
#[derive(Debug, Default)]
pub struct CommitBatch {
    /// 需要新建或更新的审计行（按处理顺序）
    pub records: Vec<RunFileRecord>,
    /// 计划的完整目录，按路径索引
    pub entries: BTreeMap<String, CatalogEntry>,
    pub run: Option<RunRecord>,
}

/// 目录存储接口
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn upsert_plan(&self, plan: &mut BackupPlan) -> StoreResult<PlanId>;

    async fn get_plan(&self, plan_id: PlanId) -> StoreResult<Option<BackupPlan>>;

    async fn list_plans(&self) -> StoreResult<Vec<BackupPlan>>;

    /// 计划的全部目录条目（包括墓碑）
    async fn list_entries(&self, plan_id: PlanId) -> StoreResult<Vec<CatalogEntry>>;

    /// 读取已持久化的条目，不受引擎内存副本影响
    async fn get_entry_snapshot(&self, entry_id: EntryId) -> StoreResult<Option<CatalogEntry>>;

    /// 插入或更新条目，首次插入时回填 `entry.id`
    async fn upsert_entry(&self, entry: &mut CatalogEntry) -> StoreResult<EntryId>;

    /// 读取运行及其全部审计行
    async fn get_run(&self, run_id: RunId) -> StoreResult<Option<RunRecord>>;

    async fn list_runs(&self, plan_id: PlanId) -> StoreResult<Vec<RunRecord>>;

    /// 只写运行本身，审计行通过 `upsert_run_file_record` 写入
    async fn upsert_run(&self, run: &mut RunRecord) -> StoreResult<RunId>;

    async fn get_run_file_record(&self, run_id: RunId, path: &str) -> StoreResult<Option<RunFileRecord>>;

    async fn upsert_run_file_record(&self, record: &mut RunFileRecord) -> StoreResult<i64>;

    /// 传输完成后把审计行标记为 COMPLETED
    async fn mark_transferred(&self, run_id: RunId, path: &str) -> StoreResult<bool> {
        match self.get_run_file_record(run_id, path).await? {
            Some(mut record) => {
                record.transfer_state = TransferState::Completed;
                record.updated_at = Utc::now();
                self.upsert_run_file_record(&mut record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 应用一次提交。
    ///
    /// 默认实现逐条写入，两个阶段之间不是原子的；
    /// 支持事务的存储应覆盖此方法。
    async fn apply_commit(&self, batch: &mut CommitBatch) -> StoreResult<()> {
        // 1. 审计行：先保证引用的条目有 ID
        for record in batch.records.iter_mut() {
            if let Some(entry) = batch.entries.get_mut(&record.path) {
                record.entry_id = Some(self.upsert_entry(entry).await?);
            }
            self.upsert_run_file_record(record).await?;
        }

        // 2. 完整目录，然后是运行本身
        for entry in batch.entries.values_mut() {
            self.upsert_entry(entry).await?;
        }

        if let Some(run) = batch.run.as_mut() {
            self.upsert_run(run).await?;
            for record in &batch.records {
                run.put_file(record.clone());
            }
        }

        Ok(())
    }
}

/// 基于 SQLite 的目录存储
#[derive(Clone)]
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 连接数据库并运行迁移
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5) // SQLite 单文件，不需要太多连接
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600)) // 10分钟空闲超时
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// 内存数据库，仅单连接（每个连接都是独立的内存库）
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// SQLite INTEGER 是有符号的，超出 i64 的大小拒绝写入
fn size_column(column: &'static str, size: u64) -> StoreResult<i64> {
    i64::try_from(size).map_err(|_| StoreError::InvalidValue {
        column,
        value: size.to_string(),
    })
}

async fn write_entry(conn: &mut SqliteConnection, entry: &mut CatalogEntry) -> StoreResult<EntryId> {
    let last_size = size_column("catalog_entries.last_size", entry.last_size)?;
    let id = sqlx::query_scalar::<_, i64>(
        r#"INSERT INTO catalog_entries
               (plan_id, path, status, last_size, last_written_at, last_checksum, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(plan_id, path) DO UPDATE SET
               status = excluded.status,
               last_size = excluded.last_size,
               last_written_at = excluded.last_written_at,
               last_checksum = excluded.last_checksum,
               updated_at = excluded.updated_at
           RETURNING id"#,
    )
    .bind(entry.plan_id)
    .bind(&entry.path)
    .bind(entry.status.as_str())
    .bind(last_size)
    .bind(entry.last_written_at)
    .bind(&entry.last_checksum)
    .bind(entry.created_at)
    .bind(entry.updated_at)
    .fetch_one(&mut *conn)
    .await?;

    entry.id = Some(id);
    Ok(id)
}

async fn write_run(conn: &mut SqliteConnection, run: &mut RunRecord) -> StoreResult<RunId> {
    let id = match run.id {
        Some(id) => {
            sqlx::query("UPDATE runs SET state = ?, started_at = ?, finished_at = ? WHERE id = ?")
                .bind(run.state.as_str())
                .bind(run.started_at)
                .bind(run.finished_at)
                .bind(id)
                .execute(&mut *conn)
                .await?;
            id
        }
        None => {
            sqlx::query_scalar::<_, i64>(
                "INSERT INTO runs (plan_id, state, started_at, finished_at) VALUES (?, ?, ?, ?) RETURNING id",
            )
            .bind(run.plan_id)
            .bind(run.state.as_str())
            .bind(run.started_at)
            .bind(run.finished_at)
            .fetch_one(&mut *conn)
            .await?
        }
    };

    run.id = Some(id);
    Ok(id)
}

async fn write_run_file(conn: &mut SqliteConnection, record: &mut RunFileRecord) -> StoreResult<i64> {
    let size = size_column("run_files.size", record.size)?;
    let id = sqlx::query_scalar::<_, i64>(
        r#"INSERT INTO run_files
               (run_id, entry_id, path, status, transfer_state, size, last_written_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(run_id, path) DO UPDATE SET
               entry_id = excluded.entry_id,
               status = excluded.status,
               transfer_state = excluded.transfer_state,
               size = excluded.size,
               last_written_at = excluded.last_written_at,
               updated_at = excluded.updated_at
           RETURNING id"#,
    )
    .bind(record.run_id)
    .bind(record.entry_id)
    .bind(&record.path)
    .bind(record.status.as_str())
    .bind(record.transfer_state.as_str())
    .bind(size)
    .bind(record.last_written_at)
    .bind(record.updated_at)
    .fetch_one(&mut *conn)
    .await?;

    record.id = Some(id);
    Ok(id)
}

async fn read_run_files(conn: &mut SqliteConnection, run_id: RunId) -> StoreResult<Vec<RunFileRecord>> {
    let rows = sqlx::query_as::<_, RunFileRow>("SELECT * FROM run_files WHERE run_id = ? ORDER BY path")
        .bind(run_id)
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter().map(RunFileRecord::try_from).collect()
}

#[async_trait]
impl CatalogStore for SqliteCatalog {
    async fn upsert_plan(&self, plan: &mut BackupPlan) -> StoreResult<PlanId> {
        let sources = serde_json::to_string(&plan.sources)?;
        plan.updated_at = Utc::now();

        let id = match plan.id {
            Some(id) => {
                sqlx::query("UPDATE backup_plans SET name = ?, sources = ?, updated_at = ? WHERE id = ?")
                    .bind(&plan.name)
                    .bind(&sources)
                    .bind(plan.updated_at)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                id
            }
            None => {
                sqlx::query_scalar::<_, i64>(
                    "INSERT INTO backup_plans (name, sources, created_at, updated_at) VALUES (?, ?, ?, ?) RETURNING id",
                )
                .bind(&plan.name)
                .bind(&sources)
                .bind(plan.created_at)
                .bind(plan.updated_at)
                .fetch_one(&self.pool)
                .await?
            }
        };

        plan.id = Some(id);
        Ok(id)
    }

    async fn get_plan(&self, plan_id: PlanId) -> StoreResult<Option<BackupPlan>> {
        let row = sqlx::query_as::<_, BackupPlanRow>("SELECT * FROM backup_plans WHERE id = ?")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(BackupPlan::try_from).transpose()
    }

    async fn list_plans(&self) -> StoreResult<Vec<BackupPlan>> {
        let rows = sqlx::query_as::<_, BackupPlanRow>("SELECT * FROM backup_plans ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(BackupPlan::try_from).collect()
    }

    async fn list_entries(&self, plan_id: PlanId) -> StoreResult<Vec<CatalogEntry>> {
        let rows = sqlx::query_as::<_, CatalogEntryRow>("SELECT * FROM catalog_entries WHERE plan_id = ?")
            .bind(plan_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(CatalogEntry::try_from).collect()
    }

    async fn get_entry_snapshot(&self, entry_id: EntryId) -> StoreResult<Option<CatalogEntry>> {
        let row = sqlx::query_as::<_, CatalogEntryRow>("SELECT * FROM catalog_entries WHERE id = ?")
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(CatalogEntry::try_from).transpose()
    }

    async fn upsert_entry(&self, entry: &mut CatalogEntry) -> StoreResult<EntryId> {
        let mut conn = self.pool.acquire().await?;
        write_entry(&mut conn, entry).await
    }

    async fn get_run(&self, run_id: RunId) -> StoreResult<Option<RunRecord>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query_as::<_, RunRow>("SELECT * FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&mut *conn)
            .await?;

        match row {
            Some(row) => {
                let files = read_run_files(&mut conn, run_id).await?;
                Ok(Some(row.into_record(files)?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(&self, plan_id: PlanId) -> StoreResult<Vec<RunRecord>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query_as::<_, RunRow>("SELECT * FROM runs WHERE plan_id = ? ORDER BY id DESC")
            .bind(plan_id)
            .fetch_all(&mut *conn)
            .await?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            let files = read_run_files(&mut conn, row.id).await?;
            runs.push(row.into_record(files)?);
        }
        Ok(runs)
    }

    async fn upsert_run(&self, run: &mut RunRecord) -> StoreResult<RunId> {
        let mut conn = self.pool.acquire().await?;
        write_run(&mut conn, run).await
    }

    async fn get_run_file_record(&self, run_id: RunId, path: &str) -> StoreResult<Option<RunFileRecord>> {
        let row = sqlx::query_as::<_, RunFileRow>("SELECT * FROM run_files WHERE run_id = ? AND path = ?")
            .bind(run_id)
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RunFileRecord::try_from).transpose()
    }

    async fn upsert_run_file_record(&self, record: &mut RunFileRecord) -> StoreResult<i64> {
        let mut conn = self.pool.acquire().await?;
        write_run_file(&mut conn, record).await
    }

    async fn mark_transferred(&self, run_id: RunId, path: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE run_files SET transfer_state = 'COMPLETED', updated_at = ? WHERE run_id = ? AND path = ?",
        )
        .bind(Utc::now())
        .bind(run_id)
        .bind(path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// 审计行、目录和运行在同一个事务内写入
    async fn apply_commit(&self, batch: &mut CommitBatch) -> StoreResult<()> {
        if batch.run.as_ref().is_some_and(|run| run.id.is_none()) {
            return Err(StoreError::InvalidValue {
                column: "runs.id",
                value: "NULL".to_string(),
            });
        }

        let mut tx = self.pool.begin().await?;

        for record in batch.records.iter_mut() {
            if let Some(entry) = batch.entries.get_mut(&record.path) {
                record.entry_id = Some(write_entry(&mut tx, entry).await?);
            }
            write_run_file(&mut tx, record).await?;
        }

        for entry in batch.entries.values_mut() {
            write_entry(&mut tx, entry).await?;
        }

        if let Some(run) = batch.run.as_mut() {
            write_run(&mut tx, run).await?;
            for record in &batch.records {
                run.put_file(record.clone());
            }
        }

        tx.commit().await?;
        debug!(
            "提交完成: {} 条审计行, {} 个目录条目",
            batch.records.len(),
            batch.entries.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn catalog_with_plan() -> (SqliteCatalog, PlanId) {
        let catalog = SqliteCatalog::in_memory().await.unwrap();
        let mut plan = BackupPlan::new("docs", vec!["folder:/data".parse().unwrap()]);
        let plan_id = catalog.upsert_plan(&mut plan).await.unwrap();
        (catalog, plan_id)
    }

    #[tokio::test]
    async fn test_plan_round_trip() {
        let (catalog, plan_id) = catalog_with_plan().await;
        let plan = catalog.get_plan(plan_id).await.unwrap().unwrap();
        assert_eq!(plan.name, "docs");
        assert_eq!(plan.sources.len(), 1);
        assert_eq!(catalog.list_plans().await.unwrap().len(), 1);
        assert!(catalog.get_plan(plan_id + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entry_upsert_is_idempotent() {
        let (catalog, plan_id) = catalog_with_plan().await;
        let mut entry = CatalogEntry::new(plan_id, "/data/a.txt", Utc::now());
        entry.last_size = 12;

        let id = catalog.upsert_entry(&mut entry).await.unwrap();
        assert_eq!(entry.id, Some(id));

        entry.status = FileStatus::Unchanged;
        let again = catalog.upsert_entry(&mut entry).await.unwrap();
        assert_eq!(id, again);

        let entries = catalog.list_entries(plan_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, FileStatus::Unchanged);
        assert_eq!(entries[0].last_size, 12);

        let snapshot = catalog.get_entry_snapshot(id).await.unwrap().unwrap();
        assert_eq!(snapshot.path, "/data/a.txt");
    }

    #[tokio::test]
    async fn test_run_with_files() {
        let (catalog, plan_id) = catalog_with_plan().await;
        let mut run = RunRecord::start(plan_id);
        let run_id = catalog.upsert_run(&mut run).await.unwrap();

        let mut entry = CatalogEntry::new(plan_id, "/data/a.txt", Utc::now());
        catalog.upsert_entry(&mut entry).await.unwrap();

        let mut record = RunFileRecord::for_entry(run_id, &entry);
        catalog.upsert_run_file_record(&mut record).await.unwrap();
        assert!(catalog.mark_transferred(run_id, "/data/a.txt").await.unwrap());
        assert!(!catalog.mark_transferred(run_id, "/data/missing").await.unwrap());

        let loaded = catalog.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, RunState::Running);
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.files[0].transfer_state, TransferState::Completed);
        assert_eq!(loaded.files[0].entry_id, entry.id);

        run.finish(RunState::Completed);
        catalog.upsert_run(&mut run).await.unwrap();
        let runs = catalog.list_runs(plan_id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].state, RunState::Completed);
        assert!(runs[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn test_apply_commit_assigns_entry_ids() {
        let (catalog, plan_id) = catalog_with_plan().await;
        let mut run = RunRecord::start(plan_id);
        let run_id = catalog.upsert_run(&mut run).await.unwrap();

        let entry = CatalogEntry::new(plan_id, "/data/new.txt", Utc::now());
        let mut batch = CommitBatch {
            records: vec![RunFileRecord::for_entry(run_id, &entry)],
            entries: BTreeMap::from([(entry.path.clone(), entry)]),
            run: Some(run),
        };

        catalog.apply_commit(&mut batch).await.unwrap();

        let entry_id = batch.entries["/data/new.txt"].id;
        assert!(entry_id.is_some());
        assert_eq!(batch.records[0].entry_id, entry_id);
        assert_eq!(batch.run.as_ref().unwrap().files.len(), 1);

        let stored = catalog.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(stored.files[0].entry_id, entry_id);
    }

    #[tokio::test]
    async fn test_oversized_size_is_rejected() {
        let (catalog, plan_id) = catalog_with_plan().await;
        let mut run = RunRecord::start(plan_id);
        let run_id = catalog.upsert_run(&mut run).await.unwrap();

        let mut entry = CatalogEntry::new(plan_id, "/data/huge.bin", Utc::now());
        entry.last_size = u64::MAX;
        let err = catalog.upsert_entry(&mut entry).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidValue {
                column: "catalog_entries.last_size",
                ..
            }
        ));
        assert!(entry.id.is_none());

        // 整个提交回滚，目录和审计行都不落盘
        let mut batch = CommitBatch {
            records: vec![RunFileRecord::for_entry(run_id, &entry)],
            entries: BTreeMap::from([(entry.path.clone(), entry)]),
            run: Some(run),
        };
        assert!(catalog.apply_commit(&mut batch).await.is_err());
        assert!(catalog.list_entries(plan_id).await.unwrap().is_empty());
        assert!(catalog.get_run(run_id).await.unwrap().unwrap().files.is_empty());

        let mut entry = CatalogEntry::new(plan_id, "/data/max.bin", Utc::now());
        entry.last_size = i64::MAX as u64;
        catalog.upsert_entry(&mut entry).await.unwrap();
        assert_eq!(catalog.list_entries(plan_id).await.unwrap()[0].last_size, i64::MAX as u64);
    }
}
