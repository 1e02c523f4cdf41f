use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use deltaplan_lib::config;
use deltaplan_lib::core::{reopen_run, CancelHandle, PathSupplier, SourceScanner};
use deltaplan_lib::db::{PlanId, RunId, SourceEntry, TransferState};
use deltaplan_lib::logging::{self, LogConfig};
use deltaplan_lib::storage::{LocalProbe, LocalTarget};
use deltaplan_lib::{
    AppState, BackupOperation, BackupPlan, CatalogStore, ChangeSet, ChangeSetEngine, RunRecord, RunState, TransferSet,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "deltaplan", version, about = "Incremental change-set engine for plan-based file backup")]
struct Cli {
    /// 数据目录（默认跟随配置中的 data_path）
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// 输出 debug 日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 管理备份计划
    #[command(subcommand)]
    Plan(PlanCommand),
    /// 执行一次运行
    Run(RunArgs),
    /// 查看计划的运行历史
    History {
        #[arg(long)]
        plan: PlanId,
    },
    /// 查看或修改配置
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum PlanCommand {
    /// 新建计划
    Add {
        #[arg(long)]
        name: String,
        /// KIND:PATH，KIND 为 drive、folder 或 file
        #[arg(long = "source", required = true)]
        sources: Vec<SourceEntry>,
    },
    /// 列出全部计划
    List,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    plan: PlanId,
    /// 续传指定的运行
    #[arg(long)]
    resume: Option<RunId>,
    /// 把变更文件复制到该目录；不指定时只提交并保留 PENDING 审计行
    #[arg(long)]
    target: Option<PathBuf>,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// 打印当前配置
    Show,
    /// 修改日志配置
    Log {
        #[arg(long)]
        level: Option<String>,
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        max_files: Option<usize>,
    },
    /// 设置或清除自定义数据路径
    DataPath {
        path: Option<PathBuf>,
        #[arg(long, conflicts_with = "path")]
        clear: bool,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlanView<'a> {
    id: Option<PlanId>,
    name: &'a str,
    sources: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunView<'a> {
    run_id: RunId,
    state: RunState,
    change_set: &'a ChangeSet,
    transfer_set: &'a TransferSet,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryView {
    id: Option<RunId>,
    state: RunState,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    files: usize,
    pending: usize,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Ctrl-C 触发取消，在下一个文件边界生效
fn cancel_on_ctrl_c(cancel: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在取消...");
            cancel.cancel();
        }
    });
}

async fn load_plan(state: &AppState, plan_id: PlanId) -> Result<BackupPlan> {
    state
        .catalog
        .get_plan(plan_id)
        .await?
        .with_context(|| format!("计划不存在: {}", plan_id))
}

async fn run_plan(state: &AppState, args: RunArgs) -> Result<()> {
    let plan = load_plan(state, args.plan).await?;
    let cancel = CancelHandle::new();
    cancel_on_ctrl_c(cancel.clone());

    let scanner = SourceScanner::with_config(plan.sources.clone(), state.config.scan.clone()).with_cancel(cancel.clone());
    let probe = Arc::new(LocalProbe::new());

    if let Some(target) = args.target {
        let backend = Arc::new(LocalTarget::new(&target)?);
        let operation = BackupOperation::with_config(state.store(), probe, backend, state.config.operation.clone())
            .with_cancel(cancel);
        let report = match args.resume {
            Some(run_id) => operation.resume(args.plan, run_id, &scanner).await?,
            None => operation.start_new(args.plan, &scanner).await?,
        };
        return print_json(&report);
    }

    let mut run = match args.resume {
        Some(run_id) => reopen_run(state.catalog.as_ref(), args.plan, run_id).await?,
        None => {
            let mut run = RunRecord::start(args.plan);
            state.catalog.upsert_run(&mut run).await?;
            run
        }
    };
    let run_id = run.id.context("运行没有 ID")?;

    let paths = match scanner.candidate_paths().await {
        Ok(paths) => paths,
        Err(e) => {
            let final_state = if cancel.is_cancelled() { RunState::Canceled } else { RunState::Failed };
            run.finish(final_state);
            state.catalog.upsert_run(&mut run).await?;
            return Err(e).context("扫描失败");
        }
    };
    let mut engine = ChangeSetEngine::with_cancel(state.store(), probe, cancel);
    let classified = match args.resume {
        Some(_) => engine.run_resumed(run.clone(), paths).await,
        None => engine.run_fresh(run.clone(), paths).await,
    };

    let outcome = match classified {
        Ok(change_set) => engine.commit().await.map(|transfer_set| (change_set, transfer_set)),
        Err(e) => Err(e),
    };

    match outcome {
        Ok((change_set, transfer_set)) => {
            info!("运行 {} 已提交，{} 个文件等待传输", run_id, transfer_set.len());
            print_json(&RunView {
                run_id,
                state: RunState::Running,
                change_set: &change_set,
                transfer_set: &transfer_set,
            })
        }
        Err(e) => {
            run = engine.rollback().await?;
            let final_state = if e.is_cancelled() { RunState::Canceled } else { RunState::Failed };
            run.finish(final_state);
            state.catalog.upsert_run(&mut run).await?;
            if e.is_cancelled() {
                info!("运行 {} 已取消", run_id);
                Ok(())
            } else {
                Err(e.into())
            }
        }
    }
}

async fn show_history(state: &AppState, plan_id: PlanId) -> Result<()> {
    load_plan(state, plan_id).await?;
    let runs = state.catalog.list_runs(plan_id).await?;
    let views: Vec<HistoryView> = runs
        .iter()
        .map(|run| HistoryView {
            id: run.id,
            state: run.state,
            started_at: run.started_at,
            finished_at: run.finished_at,
            files: run.files.len(),
            pending: run
                .files
                .iter()
                .filter(|f| f.transfer_state == TransferState::Pending)
                .count(),
        })
        .collect();
    print_json(&views)
}

async fn run_command(state: &AppState, command: Command) -> Result<()> {
    match command {
        Command::Plan(PlanCommand::Add { name, sources }) => {
            let mut plan = BackupPlan::new(name, sources);
            let id = state.catalog.upsert_plan(&mut plan).await?;
            info!("已创建计划 {}: {}", id, plan.sources_summary(", ", 80, "..."));
            print_json(&plan)
        }
        Command::Plan(PlanCommand::List) => {
            let plans = state.catalog.list_plans().await?;
            let views: Vec<PlanView> = plans
                .iter()
                .map(|plan| PlanView {
                    id: plan.id,
                    name: &plan.name,
                    sources: plan.sources_summary(", ", 80, "..."),
                })
                .collect();
            print_json(&views)
        }
        Command::Run(args) => run_plan(state, args).await,
        Command::History { plan } => show_history(state, plan).await,
        Command::Config(command) => config_command(&state.config_dir, command),
    }
}

/// 配置命令不需要打开数据库
fn config_command(data_dir: &std::path::Path, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => print_json(&config::AppConfig::load(data_dir)),
        ConfigCommand::Log {
            level,
            enabled,
            max_files,
        } => {
            let mut log = LogConfig::load(data_dir);
            if let Some(level) = level {
                log.set_level(&level)?;
            }
            if let Some(enabled) = enabled {
                log.enabled = enabled;
            }
            if let Some(max_files) = max_files {
                // 限制范围 1-365
                log.max_files = max_files.clamp(1, 365);
            }
            log.save(data_dir)?;
            print_json(&log)
        }
        ConfigCommand::DataPath { path, clear } => {
            let default_dir = config::default_config_dir();
            match (path, clear) {
                (Some(path), _) => config::set_data_path(&default_dir, Some(path.as_path()))?,
                (None, true) => config::set_data_path(&default_dir, None)?,
                (None, false) => {}
            }
            println!("{}", config::resolve_data_dir(&default_dir).display());
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => {
            let default_dir = config::default_config_dir();
            std::fs::create_dir_all(&default_dir)?;
            config::resolve_data_dir(&default_dir)
        }
    };

    // 初始化日志系统，guard 存活到进程结束
    let _guard = logging::init_logging(&data_dir, cli.verbose);

    let command = match cli.command {
        Command::Config(command) => return config_command(&data_dir, command),
        other => other,
    };

    let state = AppState::new(data_dir).await?;
    let result = run_command(&state, command).await;
    state.cleanup().await;
    result
}
