//! 内存目录存储，用于测试和嵌入场景

use super::{
    BackupPlan, CatalogEntry, CatalogStore, CommitBatch, EntryId, PlanId, RunFileRecord, RunId,
    RunRecord,
};
use crate::error::StoreResult;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    plans: BTreeMap<PlanId, BackupPlan>,
    entries: BTreeMap<EntryId, CatalogEntry>,
    /// 不含审计行，读取时再组装
    runs: BTreeMap<RunId, RunRecord>,
    run_files: BTreeMap<(RunId, String), RunFileRecord>,
}

impl Inner {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn put_entry(&mut self, entry: &mut CatalogEntry) -> EntryId {
        let id = match entry.id {
            Some(id) => id,
            None => {
                // 与 SQLite 的 UNIQUE(plan_id, path) 语义一致
                let existing = self
                    .entries
                    .values()
                    .find(|e| e.plan_id == entry.plan_id && e.path == entry.path)
                    .and_then(|e| e.id);
                match existing {
                    Some(id) => id,
                    None => self.allocate_id(),
                }
            }
        };
        entry.id = Some(id);
        self.entries.insert(id, entry.clone());
        id
    }

    fn put_run(&mut self, run: &mut RunRecord) -> RunId {
        let id = match run.id {
            Some(id) => id,
            None => self.allocate_id(),
        };
        run.id = Some(id);
        let mut stored = run.clone();
        stored.files.clear();
        self.runs.insert(id, stored);
        id
    }

    fn put_run_file(&mut self, record: &mut RunFileRecord) -> i64 {
        let key = (record.run_id, record.path.clone());
        let id = match self.run_files.get(&key).and_then(|r| r.id).or(record.id) {
            Some(id) => id,
            None => self.allocate_id(),
        };
        record.id = Some(id);
        self.run_files.insert(key, record.clone());
        id
    }

    fn load_run(&self, run_id: RunId) -> Option<RunRecord> {
        let mut run = self.runs.get(&run_id)?.clone();
        run.files = self
            .run_files
            .range((run_id, String::new())..)
            .take_while(|((id, _), _)| *id == run_id)
            .map(|(_, record)| record.clone())
            .collect();
        Some(run)
    }
}

/// 内存目录存储
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    inner: RwLock<Inner>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn upsert_plan(&self, plan: &mut BackupPlan) -> StoreResult<PlanId> {
        let mut inner = self.inner.write().await;
        let id = match plan.id {
            Some(id) => id,
            None => inner.allocate_id(),
        };
        plan.id = Some(id);
        plan.updated_at = Utc::now();
        inner.plans.insert(id, plan.clone());
        Ok(id)
    }

    async fn get_plan(&self, plan_id: PlanId) -> StoreResult<Option<BackupPlan>> {
        Ok(self.inner.read().await.plans.get(&plan_id).cloned())
    }

    async fn list_plans(&self) -> StoreResult<Vec<BackupPlan>> {
        Ok(self.inner.read().await.plans.values().cloned().collect())
    }

    async fn list_entries(&self, plan_id: PlanId) -> StoreResult<Vec<CatalogEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .values()
            .filter(|e| e.plan_id == plan_id)
            .cloned()
            .collect())
    }

    async fn get_entry_snapshot(&self, entry_id: EntryId) -> StoreResult<Option<CatalogEntry>> {
        Ok(self.inner.read().await.entries.get(&entry_id).cloned())
    }

    async fn upsert_entry(&self, entry: &mut CatalogEntry) -> StoreResult<EntryId> {
        Ok(self.inner.write().await.put_entry(entry))
    }

    async fn get_run(&self, run_id: RunId) -> StoreResult<Option<RunRecord>> {
        Ok(self.inner.read().await.load_run(run_id))
    }

    async fn list_runs(&self, plan_id: PlanId) -> StoreResult<Vec<RunRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .runs
            .values()
            .rev()
            .filter(|r| r.plan_id == plan_id)
            .filter_map(|r| r.id.and_then(|id| inner.load_run(id)))
            .collect())
    }

    async fn upsert_run(&self, run: &mut RunRecord) -> StoreResult<RunId> {
        Ok(self.inner.write().await.put_run(run))
    }

    async fn get_run_file_record(&self, run_id: RunId, path: &str) -> StoreResult<Option<RunFileRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.run_files.get(&(run_id, path.to_string())).cloned())
    }

    async fn upsert_run_file_record(&self, record: &mut RunFileRecord) -> StoreResult<i64> {
        Ok(self.inner.write().await.put_run_file(record))
    }

    /// 整个批次在同一把写锁下完成
    async fn apply_commit(&self, batch: &mut CommitBatch) -> StoreResult<()> {
        let mut inner = self.inner.write().await;

        for record in batch.records.iter_mut() {
            if let Some(entry) = batch.entries.get_mut(&record.path) {
                record.entry_id = Some(inner.put_entry(entry));
            }
            inner.put_run_file(record);
        }

        for entry in batch.entries.values_mut() {
            inner.put_entry(entry);
        }

        if let Some(run) = batch.run.as_mut() {
            inner.put_run(run);
            for record in &batch.records {
                run.put_file(record.clone());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{FileStatus, TransferState};

    #[tokio::test]
    async fn test_entry_identity_is_stable_by_path() {
        let catalog = MemoryCatalog::new();
        let mut first = CatalogEntry::new(1, "/a", Utc::now());
        let id = catalog.upsert_entry(&mut first).await.unwrap();

        // 同一路径的新副本命中已有 ID
        let mut copy = CatalogEntry::new(1, "/a", Utc::now());
        copy.status = FileStatus::Unchanged;
        assert_eq!(catalog.upsert_entry(&mut copy).await.unwrap(), id);

        let entries = catalog.list_entries(1).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, FileStatus::Unchanged);
        assert!(catalog.list_entries(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_files_are_scoped_to_run() {
        let catalog = MemoryCatalog::new();
        let mut run_a = RunRecord::start(1);
        let mut run_b = RunRecord::start(1);
        let a = catalog.upsert_run(&mut run_a).await.unwrap();
        let b = catalog.upsert_run(&mut run_b).await.unwrap();

        let entry = CatalogEntry::new(1, "/x", Utc::now());
        catalog
            .upsert_run_file_record(&mut RunFileRecord::for_entry(a, &entry))
            .await
            .unwrap();

        assert_eq!(catalog.get_run(a).await.unwrap().unwrap().files.len(), 1);
        assert!(catalog.get_run(b).await.unwrap().unwrap().files.is_empty());

        assert!(catalog.mark_transferred(a, "/x").await.unwrap());
        let record = catalog.get_run_file_record(a, "/x").await.unwrap().unwrap();
        assert_eq!(record.transfer_state, TransferState::Completed);

        // 最新的运行排在前面
        let runs = catalog.list_runs(1).await.unwrap();
        assert_eq!(runs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![Some(b), Some(a)]);
    }
}
