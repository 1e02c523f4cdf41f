//! 日志模块 - 控制台输出加按天滚动的文件日志

use crate::config;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_PREFIX: &str = "deltaplan";

const VALID_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用文件日志
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 保留的日志文件个数
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

fn default_max_files() -> usize {
    7 // 默认保留一周
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            level: default_level(),
            max_files: default_max_files(),
        }
    }
}

impl LogConfig {
    /// 从配置文件加载日志配置
    pub fn load(config_dir: &Path) -> Self {
        config::load_section(config_dir, "log")
    }

    /// 保存日志配置
    pub fn save(&self, config_dir: &Path) -> Result<()> {
        config::save_section(config_dir, "log", self)
    }

    /// 设置日志级别，只接受已知级别
    pub fn set_level(&mut self, level: &str) -> Result<()> {
        let level = level.to_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            anyhow::bail!("无效的日志级别: {}", level);
        }
        self.level = level;
        Ok(())
    }

    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 日志目录（跟随数据存储位置）
pub fn get_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

fn build_filter(level: tracing::Level) -> EnvFilter {
    let mut filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    // 隐藏 sqlx 的逐条语句日志
    for directive in ["sqlx=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// 初始化日志系统。返回的 guard 必须存活到进程结束，否则文件日志会丢失。
pub fn init_logging(data_dir: &Path, verbose: bool) -> Option<WorkerGuard> {
    let config = LogConfig::load(data_dir);
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        config.tracing_level()
    };

    // 控制台输出到 stderr，stdout 留给 JSON 结果
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let appender = config
        .enabled
        .then(|| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .filename_suffix("log")
                .max_log_files(config.max_files.max(1))
                .build(get_log_dir(data_dir))
        })
        .and_then(|result| match result {
            Ok(appender) => Some(appender),
            Err(e) => {
                // 文件日志创建失败，回退到控制台
                eprintln!("无法创建日志文件: {}", e);
                None
            }
        });

    match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);

            let _ = tracing_subscriber::registry()
                .with(build_filter(level))
                .with(console_layer)
                .with(file_layer)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(build_filter(level))
                .with(console_layer)
                .try_init();
            None
        }
    }
}
