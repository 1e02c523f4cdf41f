//! 备份操作：围绕引擎编排一次完整的运行
//!
//! 扫描 → 分类 → 提交 → 逐个传输 → 关闭运行。
//! 提交之前的任何失败都会回滚，提交之后的失败保留 PENDING 审计行供续传。

use super::cancel::CancelHandle;
use super::changeset::ChangeSummary;
use super::engine::ChangeSetEngine;
use super::scanner::PathSupplier;
use super::status::RunKind;
use super::transfer::VersionedFile;
use crate::db::{CatalogStore, PlanId, RunId, RunRecord, RunState, TransferState};
use crate::error::StoreError;
use crate::storage::FileProbe;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 字节传输后端
#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// 传输一个文件，返回传输的字节数
    async fn transfer(&self, file: &VersionedFile) -> Result<u64>;

    /// 获取后端名称（用于日志）
    fn name(&self) -> &str;
}

/// 操作配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationConfig {
    /// 最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试基础延迟（毫秒）
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

/// 操作报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    pub run_id: RunId,
    pub plan_id: PlanId,
    pub state: RunState,
    pub summary: ChangeSummary,
    pub files_transferred: u32,
    pub files_skipped: u32,
    pub files_failed: u32,
    pub bytes_transferred: u64,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl OperationReport {
    fn new(run: &RunRecord, run_id: RunId) -> Self {
        Self {
            run_id,
            plan_id: run.plan_id,
            state: RunState::Running,
            summary: ChangeSummary::default(),
            files_transferred: 0,
            files_skipped: 0,
            files_failed: 0,
            bytes_transferred: 0,
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }
}

/// 取出要续传的运行。
///
/// 运行必须属于 `plan_id`，否则分类会把本计划的文件写进另一个计划的目录。
/// COMPLETED 的运行被拒绝，FAILED/CANCELED 的运行重新打开为 RUNNING。
pub async fn reopen_run(store: &dyn CatalogStore, plan_id: PlanId, run_id: RunId) -> Result<RunRecord> {
    let mut run = store
        .get_run(run_id)
        .await?
        .ok_or(StoreError::NotFound { kind: "run", id: run_id })?;

    if run.plan_id != plan_id {
        bail!("运行 {} 属于计划 {}，不属于计划 {}", run_id, run.plan_id, plan_id);
    }

    match run.state {
        RunState::Running => {}
        RunState::Completed => bail!("运行 {} 已完成，无需续传", run_id),
        RunState::Failed | RunState::Canceled => {
            info!("重新打开运行 {} ({})", run_id, run.state);
            run.state = RunState::Running;
            run.finished_at = None;
            store.upsert_run(&mut run).await?;
        }
    }
    Ok(run)
}

/// 一次备份操作
pub struct BackupOperation {
    store: Arc<dyn CatalogStore>,
    probe: Arc<dyn FileProbe>,
    backend: Arc<dyn TransferBackend>,
    config: OperationConfig,
    cancel: CancelHandle,
}

impl BackupOperation {
    pub fn new(store: Arc<dyn CatalogStore>, probe: Arc<dyn FileProbe>, backend: Arc<dyn TransferBackend>) -> Self {
        Self::with_config(store, probe, backend, OperationConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn CatalogStore>,
        probe: Arc<dyn FileProbe>,
        backend: Arc<dyn TransferBackend>,
        config: OperationConfig,
    ) -> Self {
        Self {
            store,
            probe,
            backend,
            config,
            cancel: CancelHandle::new(),
        }
    }

    /// 使用调用方共享的取消标志
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// 取消操作
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// 为计划创建新运行并执行
    pub async fn start_new(&self, plan_id: PlanId, supplier: &dyn PathSupplier) -> Result<OperationReport> {
        if self.store.get_plan(plan_id).await?.is_none() {
            return Err(StoreError::NotFound { kind: "plan", id: plan_id }.into());
        }

        let mut run = RunRecord::start(plan_id);
        let run_id = self.store.upsert_run(&mut run).await.context("创建运行失败")?;
        info!("开始备份计划 {} (运行 {})", plan_id, run_id);

        self.execute(RunKind::Fresh, run, run_id, HashSet::new(), supplier)
            .await
    }

    /// 续传计划中一个未完成的运行，已传输完成的文件不会重复传输
    pub async fn resume(&self, plan_id: PlanId, run_id: RunId, supplier: &dyn PathSupplier) -> Result<OperationReport> {
        let run = reopen_run(self.store.as_ref(), plan_id, run_id).await?;

        let completed: HashSet<String> = run
            .files
            .iter()
            .filter(|f| f.transfer_state == TransferState::Completed)
            .map(|f| f.path.clone())
            .collect();
        info!("续传运行 {}: {} 个文件已完成", run_id, completed.len());

        self.execute(RunKind::Resumed, run, run_id, completed, supplier)
            .await
    }

    async fn execute(
        &self,
        kind: RunKind,
        run: RunRecord,
        run_id: RunId,
        completed: HashSet<String>,
        supplier: &dyn PathSupplier,
    ) -> Result<OperationReport> {
        // 重置取消标志
        self.cancel.reset();
        let mut report = OperationReport::new(&run, run_id);

        let paths = match supplier.candidate_paths().await {
            Ok(paths) => paths,
            Err(_) if self.cancel.is_cancelled() => {
                return self.close(run, RunState::Canceled, report).await;
            }
            Err(e) => {
                error!("扫描失败: {}", e);
                report.errors.push(format!("scan failed: {}", e));
                return self.close(run, RunState::Failed, report).await;
            }
        };

        let mut engine = ChangeSetEngine::with_cancel(self.store.clone(), self.probe.clone(), self.cancel.clone());
        let classified = match kind {
            RunKind::Fresh => engine.run_fresh(run, paths).await,
            RunKind::Resumed => engine.run_resumed(run, paths).await,
        };

        let committed = match classified {
            Ok(change_set) => {
                report.summary = change_set.summary();
                report.errors.extend(
                    change_set
                        .scan_errors
                        .iter()
                        .map(|issue| format!("{}: {}", issue.path, issue.reason)),
                );
                engine.commit().await
            }
            Err(e) => Err(e),
        };

        let transfer_set = match committed {
            Ok(transfer_set) => transfer_set,
            Err(e) => {
                let state = if e.is_cancelled() { RunState::Canceled } else { RunState::Failed };
                if !e.is_cancelled() {
                    report.errors.push(e.to_string());
                }
                let run = engine.rollback().await.context("回滚失败")?;
                return self.close(run, state, report).await;
            }
        };

        info!(
            "运行 {} 需要传输 {} 个文件 ({} 字节) 到 {}",
            run_id,
            transfer_set.len(),
            transfer_set.total_bytes(),
            self.backend.name()
        );

        for file in transfer_set.iter() {
            if self.cancel.is_cancelled() {
                info!("传输已取消，剩余文件保留为 PENDING");
                break;
            }

            if completed.contains(&file.path) {
                debug!("已传输，跳过: {}", file.path);
                self.store.mark_transferred(run_id, &file.path).await?;
                report.files_skipped += 1;
                continue;
            }

            match self.transfer_with_retry(file).await {
                Ok(bytes) => {
                    self.store.mark_transferred(run_id, &file.path).await?;
                    report.files_transferred += 1;
                    report.bytes_transferred += bytes;
                }
                Err(e) => {
                    report.files_failed += 1;
                    report.errors.push(e);
                }
            }
        }

        let state = if self.cancel.is_cancelled() {
            RunState::Canceled
        } else if report.files_failed > 0 {
            RunState::Failed
        } else {
            RunState::Completed
        };

        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(StoreError::NotFound { kind: "run", id: run_id })?;
        self.close(run, state, report).await
    }

    /// 带重试的传输
    async fn transfer_with_retry(&self, file: &VersionedFile) -> std::result::Result<u64, String> {
        let max_retries = self.config.max_retries;
        let mut last_error = String::new();

        for attempt in 0..=max_retries {
            if self.cancel.is_cancelled() {
                return Err(format!("{}: 操作已取消", file.path));
            }

            match self.backend.transfer(file).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    last_error = e.to_string();

                    if attempt < max_retries {
                        // 指数退避
                        let delay = self
                            .config
                            .retry_base_delay_ms
                            .saturating_mul(2_u64.saturating_pow(attempt));
                        warn!(
                            "传输失败，{}ms 后重试 ({}/{}): {}",
                            delay,
                            attempt + 1,
                            max_retries,
                            last_error
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    } else {
                        error!("传输最终失败 (已重试{}次): {}", max_retries, last_error);
                    }
                }
            }
        }

        Err(format!("{}: {}", file.path, last_error))
    }

    async fn close(&self, mut run: RunRecord, state: RunState, mut report: OperationReport) -> Result<OperationReport> {
        run.finish(state);
        self.store.upsert_run(&mut run).await.context("关闭运行失败")?;

        report.state = state;
        report.finished_at = run.finished_at.unwrap_or_else(Utc::now);
        info!(
            "运行 {} 结束: {}, 传输 {}, 跳过 {}, 失败 {}",
            report.run_id, state, report.files_transferred, report.files_skipped, report.files_failed
        );
        Ok(report)
    }
}
