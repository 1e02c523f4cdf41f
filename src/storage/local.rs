use super::{FileMeta, FileProbe};
use crate::core::operation::TransferBackend;
use crate::core::transfer::VersionedFile;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 本地文件系统探测器，路径按原样使用
#[derive(Debug, Default, Clone)]
pub struct LocalProbe;

impl LocalProbe {
    pub fn new() -> Self {
        Self
    }

    /// 只认普通文件，目录和不存在的路径都返回 None
    async fn metadata(path: &str) -> io::Result<Option<Metadata>> {
        match fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(metadata)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl FileProbe for LocalProbe {
    async fn exists(&self, path: &str) -> io::Result<bool> {
        Ok(Self::metadata(path).await?.is_some())
    }

    async fn size(&self, path: &str) -> io::Result<Option<u64>> {
        Ok(Self::metadata(path).await?.map(|m| m.len()))
    }

    async fn last_write_time_utc(&self, path: &str) -> io::Result<Option<DateTime<Utc>>> {
        match Self::metadata(path).await? {
            Some(metadata) => Ok(Some(metadata.modified()?.into())),
            None => Ok(None),
        }
    }

    async fn stat(&self, path: &str) -> io::Result<Option<FileMeta>> {
        match Self::metadata(path).await? {
            Some(metadata) => Ok(Some(FileMeta {
                size: metadata.len(),
                modified: metadata.modified()?.into(),
            })),
            None => Ok(None),
        }
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// 本地目录传输目标：每个版本一个子目录，保留源路径结构
pub struct LocalTarget {
    base_path: PathBuf,
    name: String,
}

impl LocalTarget {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", base_path.display());
        Ok(Self { base_path, name })
    }

    /// `C:\data\a.txt` 和 `/data/a.txt` 分别落在 `<base>/<version>/C/data/a.txt` 和 `<base>/<version>/data/a.txt`
    pub fn resolve_path(&self, version: &str, path: &str) -> PathBuf {
        let relative = path.replace('\\', "/").replace(':', "");
        let mut full_path = self.base_path.join(version);
        for part in relative.split('/').filter(|p| !p.is_empty() && *p != "." && *p != "..") {
            full_path.push(part);
        }
        full_path
    }
}

#[async_trait]
impl TransferBackend for LocalTarget {
    async fn transfer(&self, file: &VersionedFile) -> Result<u64> {
        let full_path = self.resolve_path(&file.version, &file.path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 使用临时文件写入，然后原子重命名
        let mut temp_path = full_path.clone().into_os_string();
        temp_path.push(".part");
        let temp_path = PathBuf::from(temp_path);
        let bytes = fs::copy(&file.path, &temp_path)
            .await
            .with_context(|| format!("复制失败: {}", file.path))?;
        fs::rename(&temp_path, &full_path).await?;

        Ok(bytes)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_probe() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        let file = file.to_str().unwrap();

        let probe = LocalProbe::new();
        assert!(probe.exists(file).await.unwrap());
        assert_eq!(probe.size(file).await.unwrap(), Some(5));

        let meta = probe.stat(file).await.unwrap().unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(Some(meta.modified), probe.last_write_time_utc(file).await.unwrap());

        // 目录不是可备份的文件
        let dir = temp_dir.path().to_str().unwrap();
        assert!(!probe.exists(dir).await.unwrap());

        let missing = temp_dir.path().join("missing.txt");
        assert!(probe.stat(missing.to_str().unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_target_copies_into_version_dir() {
        let source_dir = TempDir::new().unwrap();
        let target_dir = TempDir::new().unwrap();
        let file = source_dir.path().join("docs").join("a.txt");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"payload").unwrap();

        let target = LocalTarget::new(target_dir.path()).unwrap();
        let descriptor = VersionedFile {
            path: file.to_string_lossy().into_owned(),
            size: 7,
            last_write_time_utc: None,
            version: "12".to_string(),
            checksum: None,
        };

        assert_eq!(target.transfer(&descriptor).await.unwrap(), 7);
        let copied = target.resolve_path("12", &descriptor.path);
        assert!(copied.starts_with(target_dir.path().join("12")));
        assert_eq!(std::fs::read(&copied).unwrap(), b"payload");

        let missing = VersionedFile {
            path: source_dir.path().join("gone.txt").to_string_lossy().into_owned(),
            ..descriptor
        };
        assert!(target.transfer(&missing).await.is_err());
    }

    #[test]
    fn test_resolve_path_stays_inside_base() {
        let target = LocalTarget {
            base_path: PathBuf::from("/backup"),
            name: "local:/backup".to_string(),
        };
        assert_eq!(target.resolve_path("3", "/data/a.txt"), PathBuf::from("/backup/3/data/a.txt"));
        assert_eq!(target.resolve_path("3", "C:\\data\\a.txt"), PathBuf::from("/backup/3/C/data/a.txt"));
        assert_eq!(target.resolve_path("3", "/data/../../etc/x"), PathBuf::from("/backup/3/data/etc/x"));
    }
}
