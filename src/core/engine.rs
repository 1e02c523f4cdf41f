//! 增量变更集引擎
//!
//! 单次运行的生命周期：
//!
//! ```text
//! Idle ──run_fresh/run_resumed──▶ Classified ──commit──▶ Sealed
//!   ▲            │ (错误/取消)          │ (错误)
//!   │            ▼                      ▼
//!   └──rollback── Aborted ◀─────────────┘
//! ```
//!
//! 引擎独占工作集，按顺序调用存储和探测器，从不并发请求。

use super::cancel::CancelHandle;
use super::changeset::{self, Arena, Buckets, ChangeSet, ScanIssue};
use super::status::{classify, mtime_changed, RunKind};
use super::transfer::{self, TransferSet};
use crate::db::{
    CatalogEntry, CatalogStore, CommitBatch, FileStatus, RunFileRecord, RunId, RunRecord, RunState,
    TransferState,
};
use crate::error::{EngineError, PreconditionError, Result, StoreError};
use crate::storage::FileProbe;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 已分类、尚未提交的运行
struct RunContext {
    run: RunRecord,
    run_id: RunId,
    kind: RunKind,
    arena: Arena,
    supplied: BTreeSet<String>,
    buckets: Buckets,
    scan_errors: Vec<ScanIssue>,
}

enum Phase {
    Idle,
    Classified(Box<RunContext>),
    /// 分类或提交失败（包括取消），只能回滚
    Aborted { run_id: RunId },
    Sealed { run: RunRecord, transfer_set: TransferSet },
}

/// 变更集引擎，每个进行中的运行一个实例
pub struct ChangeSetEngine {
    store: Arc<dyn CatalogStore>,
    probe: Arc<dyn FileProbe>,
    cancel: CancelHandle,
    phase: Phase,
}

impl ChangeSetEngine {
    pub fn new(store: Arc<dyn CatalogStore>, probe: Arc<dyn FileProbe>) -> Self {
        Self::with_cancel(store, probe, CancelHandle::new())
    }

    /// 使用调用方共享的取消标志
    pub fn with_cancel(store: Arc<dyn CatalogStore>, probe: Arc<dyn FileProbe>, cancel: CancelHandle) -> Self {
        Self {
            store,
            probe,
            cancel,
            phase: Phase::Idle,
        }
    }

    /// 请求取消，在下一个条目边界生效
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.phase, Phase::Sealed { .. })
    }

    /// 全新运行：检测修改、移除和删除
    pub async fn run_fresh<I, S>(&mut self, run: RunRecord, paths: I) -> Result<ChangeSet>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths = paths.into_iter().map(Into::into).collect();
        self.start(RunKind::Fresh, run, paths).await
    }

    /// 续传：保留已有状态，只拾取新增和重新出现的文件
    pub async fn run_resumed<I, S>(&mut self, run: RunRecord, paths: I) -> Result<ChangeSet>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths = paths.into_iter().map(Into::into).collect();
        self.start(RunKind::Resumed, run, paths).await
    }

    async fn start(&mut self, kind: RunKind, run: RunRecord, paths: Vec<String>) -> Result<ChangeSet> {
        match self.phase {
            Phase::Idle => {}
            Phase::Sealed { .. } => return Err(PreconditionError::AlreadyCommitted.into()),
            _ => return Err(PreconditionError::RunInProgress.into()),
        }
        if run.state != RunState::Running {
            return Err(PreconditionError::RunNotRunning(run.state).into());
        }
        let run_id = run.id.ok_or(PreconditionError::RunNotPersisted)?;

        info!("开始分类运行 {} ({:?}), 候选路径 {} 个", run_id, kind, paths.len());
        self.phase = Phase::Aborted { run_id };

        match self.classify_run(kind, run, run_id, paths).await {
            Ok(ctx) => {
                let change_set = ChangeSet::view(&ctx.arena, &ctx.buckets, &ctx.scan_errors);
                let summary = change_set.summary();
                info!(
                    "运行 {} 分类完成: 新增 {}, 修改 {}, 移除 {}, 删除 {}, 扫描错误 {}",
                    run_id, summary.added, summary.modified, summary.removed, summary.deleted, summary.scan_errors
                );
                self.phase = Phase::Classified(Box::new(ctx));
                Ok(change_set)
            }
            Err(e) => {
                log_failure(run_id, "分类", &e);
                Err(e)
            }
        }
    }

    async fn classify_run(
        &self,
        kind: RunKind,
        run: RunRecord,
        run_id: RunId,
        paths: Vec<String>,
    ) -> Result<RunContext> {
        let mut arena: Arena = self
            .store
            .list_entries(run.plan_id)
            .await?
            .into_iter()
            .map(|entry| (entry.path.clone(), entry))
            .collect();
        debug!("计划 {} 的目录已加载: {} 个条目", run.plan_id, arena.len());

        let mut supplied = BTreeSet::new();
        let mut scan_errors = Vec::new();

        for path in paths {
            self.cancel.check()?;
            // 重复路径只处理一次
            if supplied.contains(&path) {
                continue;
            }

            let meta = self.probe.stat(&path).await?;
            let previous = arena.get(&path).map(|entry| {
                let changed = meta.is_some_and(|m| mtime_changed(entry.last_written_at, m.modified));
                (entry.status, changed)
            });
            let next = classify(
                previous.map(|(status, _)| status),
                meta.is_some(),
                previous.is_some_and(|(_, changed)| changed),
                kind,
            );

            match (arena.get_mut(&path), next) {
                (_, None) => {
                    warn!("新路径不存在，跳过: {}", path);
                    scan_errors.push(ScanIssue {
                        path,
                        reason: "path does not exist".to_string(),
                    });
                    continue;
                }
                (Some(entry), Some(status)) => {
                    if entry.status != status {
                        debug!("{}: {} -> {}", path, entry.status, status);
                        entry.status = status;
                        entry.updated_at = Utc::now();
                    }
                }
                (None, Some(status)) => {
                    debug!("{}: 新条目 {}", path, status);
                    let mut entry = CatalogEntry::new(run.plan_id, path.clone(), Utc::now());
                    entry.status = status;
                    arena.insert(path.clone(), entry);
                }
            }
            supplied.insert(path);
        }

        let mut buckets = changeset::derive(&mut arena, &supplied, kind, &self.cancel, Utc::now())?;
        self.refresh_properties(kind, &mut arena, &mut supplied, &mut buckets, &mut scan_errors)
            .await?;
        changeset::verify(&arena, &supplied, &buckets, kind)?;

        Ok(RunContext {
            run,
            run_id,
            kind,
            arena,
            supplied,
            buckets,
            scan_errors,
        })
    }

    /// 重新读取待传输条目的大小和修改时间
    async fn refresh_properties(
        &self,
        kind: RunKind,
        arena: &mut Arena,
        supplied: &mut BTreeSet<String>,
        buckets: &mut Buckets,
        scan_errors: &mut Vec<ScanIssue>,
    ) -> Result<()> {
        let targets: Vec<String> = buckets.transferable().cloned().collect();

        for path in targets {
            self.cancel.check()?;
            let meta = self.probe.stat(&path).await?;
            let Some(entry) = arena.get_mut(&path) else {
                continue;
            };

            match meta {
                Some(meta) => {
                    entry.last_size = meta.size;
                    entry.last_written_at = Some(meta.modified);
                    if entry.id.is_some() {
                        entry.updated_at = Utc::now();
                    }
                }
                None => {
                    warn!("文件在分类后消失: {}", path);
                    buckets.added.remove(&path);
                    buckets.modified.remove(&path);

                    if entry.id.is_some() {
                        entry.status = FileStatus::Deleted;
                        entry.updated_at = Utc::now();
                        if kind.is_fresh() {
                            buckets.deleted.insert(path.clone());
                        }
                    } else {
                        arena.remove(&path);
                        supplied.remove(&path);
                    }

                    scan_errors.push(ScanIssue {
                        path,
                        reason: "file vanished before its properties were read".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// 持久化审计行和目录，返回传输集。每次运行只能调用一次。
    pub async fn commit(&mut self) -> Result<TransferSet> {
        let ctx = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Classified(ctx) => ctx,
            other => {
                let err = match other {
                    Phase::Sealed { .. } => PreconditionError::AlreadyCommitted,
                    _ => PreconditionError::NotClassified,
                };
                self.phase = other;
                return Err(err.into());
            }
        };

        let run_id = ctx.run_id;
        self.phase = Phase::Aborted { run_id };

        match self.persist(*ctx).await {
            Ok((run, transfer_set)) => {
                info!(
                    "运行 {} 已提交: 待传输 {} 个文件, {} 字节",
                    run_id,
                    transfer_set.len(),
                    transfer_set.total_bytes()
                );
                self.phase = Phase::Sealed {
                    run,
                    transfer_set: transfer_set.clone(),
                };
                Ok(transfer_set)
            }
            Err(e) => {
                log_failure(run_id, "提交", &e);
                Err(e)
            }
        }
    }

    async fn persist(&self, ctx: RunContext) -> Result<(RunRecord, TransferSet)> {
        let RunContext {
            run,
            run_id,
            kind,
            arena,
            supplied,
            buckets,
            ..
        } = ctx;

        // 1. 审计对账：只读，先于任何写入
        let now = Utc::now();
        let tracked: BTreeSet<&String> = supplied.iter().chain(buckets.deleted.iter()).collect();
        let mut records = Vec::new();

        for path in tracked {
            let Some(entry) = arena.get(path) else {
                continue;
            };

            let transfer_state = match entry.status {
                FileStatus::Unchanged => continue,
                FileStatus::Added | FileStatus::Modified => TransferState::Pending,
                FileStatus::Removed | FileStatus::Deleted => {
                    if let Some(entry_id) = entry.id {
                        let recorded = self.store.get_entry_snapshot(entry_id).await?;
                        if recorded.is_some_and(|r| r.status == entry.status) {
                            debug!("墓碑已记录，跳过审计: {}", path);
                            continue;
                        }
                    }
                    TransferState::Completed
                }
            };

            let mut record = match self.store.get_run_file_record(run_id, path).await? {
                Some(record) => record,
                None => RunFileRecord::for_entry(run_id, entry),
            };
            record.snapshot(entry, transfer_state, now);
            records.push(record);
        }

        let transfer_set = transfer::build(&arena, &buckets, &run_id.to_string())?;
        debug!(
            "运行 {} ({:?}) 审计行 {} 条, 目录条目 {} 个",
            run_id,
            kind,
            records.len(),
            arena.len()
        );

        // 2. 目录和运行
        let mut batch = CommitBatch {
            records,
            entries: arena,
            run: Some(run),
        };
        self.store.apply_commit(&mut batch).await?;

        let run = batch
            .run
            .take()
            .ok_or_else(|| EngineError::Invariant("commit batch lost its run".to_string()))?;
        Ok((run, transfer_set))
    }

    /// 提交后可读
    pub fn transfer_set(&self) -> Result<&TransferSet> {
        match &self.phase {
            Phase::Sealed { transfer_set, .. } => Ok(transfer_set),
            _ => Err(PreconditionError::NotCommitted.into()),
        }
    }

    /// 提交后的运行记录（包含本次写入的审计行）
    pub fn committed_run(&self) -> Option<&RunRecord> {
        match &self.phase {
            Phase::Sealed { run, .. } => Some(run),
            _ => None,
        }
    }

    /// 丢弃内存状态，从存储重新加载运行记录
    pub async fn rollback(&mut self) -> Result<RunRecord> {
        let run_id = match &self.phase {
            Phase::Idle => return Err(PreconditionError::NothingToRollback.into()),
            Phase::Sealed { .. } => return Err(PreconditionError::AlreadyCommitted.into()),
            Phase::Aborted { run_id } => *run_id,
            Phase::Classified(ctx) => ctx.run_id,
        };

        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(StoreError::NotFound { kind: "run", id: run_id })?;

        self.phase = Phase::Idle;
        self.cancel.reset();
        info!("运行 {} 已回滚", run_id);
        Ok(run)
    }
}

fn log_failure(run_id: RunId, stage: &str, err: &EngineError) {
    match err {
        EngineError::Cancelled => info!("运行 {} 在{}阶段被取消，未提交任何内容", run_id, stage),
        EngineError::Invariant(msg) => error!("运行 {} {}时内部不变量被破坏: {}", run_id, stage, msg),
        other => warn!("运行 {} {}失败: {}", run_id, stage, other),
    }
}
