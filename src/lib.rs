use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;

pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;
pub mod storage;

pub use crate::config::AppConfig;
pub use crate::core::{BackupOperation, CancelHandle, ChangeSet, ChangeSetEngine, TransferSet};
pub use db::{BackupPlan, CatalogEntry, CatalogStore, FileStatus, RunRecord, RunState, SqliteCatalog};
pub use error::{EngineError, PreconditionError, StoreError};

pub const DATABASE_FILE: &str = "deltaplan.db";

/// 应用状态，在 CLI 命令之间共享
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<SqliteCatalog>,
    pub config_dir: PathBuf,
    pub config: AppConfig,
}

impl AppState {
    /// 打开数据目录下的数据库并运行迁移
    pub async fn new(config_dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("无法创建数据目录: {:?}", config_dir))?;

        // 初始化数据库（带连接池配置）
        let db_path = config_dir.join(DATABASE_FILE);
        // SQLite 连接字符串格式: sqlite://path 或 sqlite:path
        // Windows 路径需要转换反斜杠为正斜杠
        let db_path_str = db_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid database path"))?
            .replace('\\', "/");

        let catalog = SqliteCatalog::connect(&format!("sqlite:{}?mode=rwc", db_path_str))
            .await
            .with_context(|| format!("无法打开数据库: {}", db_path_str))?;
        let config = AppConfig::load(&config_dir);

        Ok(Self {
            catalog: Arc::new(catalog),
            config_dir,
            config,
        })
    }

    /// 默认位置（跟随 `data_path` 重定向）
    pub async fn from_default_location() -> anyhow::Result<Self> {
        let default_dir = config::default_config_dir();
        std::fs::create_dir_all(&default_dir)?;
        Self::new(config::resolve_data_dir(&default_dir)).await
    }

    pub fn store(&self) -> Arc<dyn CatalogStore> {
        self.catalog.clone()
    }

    /// 清理资源（进程退出前调用）
    pub async fn cleanup(&self) {
        tracing::debug!("关闭数据库连接池...");
        self.catalog.close().await;
    }
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux，优先 XDG
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_app_state_opens_database() {
        let dir = TempDir::new().unwrap();
        let state = AppState::new(dir.path().join("data")).await.unwrap();
        assert!(dir.path().join("data").join(DATABASE_FILE).exists());

        let mut plan = BackupPlan::new("docs", vec![]);
        let id = state.store().upsert_plan(&mut plan).await.unwrap();
        assert_eq!(state.catalog.get_plan(id).await.unwrap().unwrap().name, "docs");
        state.cleanup().await;

        // 重新打开后数据仍在，迁移可重复执行
        let state = AppState::new(dir.path().join("data")).await.unwrap();
        assert_eq!(state.catalog.list_plans().await.unwrap().len(), 1);
    }
}
