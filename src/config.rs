//! 应用配置模块
//!
//! 所有配置保存在数据目录下的 `config.json` 中，每个模块一个顶层键。
//! 缺失或无法解析的部分回退到默认值；保存时保留文件中的其他键。

use crate::core::operation::OperationConfig;
use crate::core::scanner::ScanConfig;
use crate::logging::LogConfig;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const APP_DIR_NAME: &str = "deltaplan";
pub const CONFIG_FILE: &str = "config.json";

/// 完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub log: LogConfig,
    pub scan: ScanConfig,
    pub operation: OperationConfig,
}

impl AppConfig {
    pub fn load(config_dir: &Path) -> Self {
        Self {
            log: load_section(config_dir, "log"),
            scan: load_section(config_dir, "scan"),
            operation: load_section(config_dir, "operation"),
        }
    }
}

fn read_config(config_dir: &Path) -> Option<serde_json::Value> {
    let content = fs::read_to_string(config_dir.join(CONFIG_FILE)).ok()?;
    serde_json::from_str(&content).ok()
}

/// 读取一个配置段，失败时返回默认值
pub fn load_section<T: DeserializeOwned + Default>(config_dir: &Path, key: &str) -> T {
    read_config(config_dir)
        .and_then(|config| config.get(key).cloned())
        .and_then(|section| match serde_json::from_value(section) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("配置段 {} 无效，使用默认值: {}", key, e);
                None
            }
        })
        .unwrap_or_default()
}

/// 写入一个配置段
pub fn save_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> Result<()> {
    let config_file = config_dir.join(CONFIG_FILE);

    // 读取现有配置
    let mut config = read_config(config_dir)
        .filter(|c| c.is_object())
        .unwrap_or_else(|| serde_json::json!({}));

    config[key] = serde_json::to_value(value)?;

    fs::create_dir_all(config_dir)?;
    fs::write(&config_file, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("写入配置失败: {:?}", config_file))?;
    Ok(())
}

/// 默认配置目录
pub fn default_config_dir() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(format!(".{}", APP_DIR_NAME)))
}

/// 跟随 `data_path` 重定向，目标不存在时使用默认目录
pub fn resolve_data_dir(default_dir: &Path) -> PathBuf {
    read_config(default_dir)
        .and_then(|config| config.get("data_path")?.as_str().map(PathBuf::from))
        .filter(|p| p.is_dir())
        .inspect(|p| debug!("使用自定义数据路径: {:?}", p))
        .unwrap_or_else(|| default_dir.to_path_buf())
}

/// 设置或清除自定义数据路径
pub fn set_data_path(default_dir: &Path, data_path: Option<&Path>) -> Result<()> {
    match data_path {
        Some(path) => {
            fs::create_dir_all(path).with_context(|| format!("无法创建数据目录: {:?}", path))?;
            let path = path.to_str().context("数据路径不是有效的 UTF-8")?;
            save_section(default_dir, "data_path", &path)
        }
        None => save_section(default_dir, "data_path", &serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load(dir.path());
        assert!(config.log.enabled);
        assert_eq!(config.log.level, "info");
        assert!(!config.scan.exclude_patterns.is_empty());
        assert_eq!(config.operation.max_retries, 5);
    }

    #[test]
    fn test_invalid_section_falls_back() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"log": {"enabled": "yes"}, "operation": {"maxRetries": 1}}"#,
        )
        .unwrap();

        let config = AppConfig::load(dir.path());
        assert!(config.log.enabled);
        assert_eq!(config.operation.max_retries, 1);
        assert_eq!(config.operation.retry_base_delay_ms, 2000);
    }

    #[test]
    fn test_save_preserves_other_keys() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), r#"{"custom": 42}"#).unwrap();

        let mut log = LogConfig::default();
        log.level = "debug".to_string();
        save_section(dir.path(), "log", &log).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap()).unwrap();
        assert_eq!(raw["custom"], 42);
        assert_eq!(AppConfig::load(dir.path()).log.level, "debug");
    }

    #[test]
    fn test_data_path_redirect() {
        let default_dir = TempDir::new().unwrap();
        let data_dir = TempDir::new().unwrap();
        assert_eq!(resolve_data_dir(default_dir.path()), default_dir.path());

        set_data_path(default_dir.path(), Some(data_dir.path())).unwrap();
        assert_eq!(resolve_data_dir(default_dir.path()), data_dir.path());

        set_data_path(default_dir.path(), None).unwrap();
        assert_eq!(resolve_data_dir(default_dir.path()), default_dir.path());
    }
}
