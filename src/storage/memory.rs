//! 内存文件系统探测器，用于测试和基准
use super::{FileMeta, FileProbe};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemoryProbe {
    files: Mutex<HashMap<String, FileMeta>>,
}

impl MemoryProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, size: u64, modified: DateTime<Utc>) {
        self.lock().insert(path.to_string(), FileMeta { size, modified });
    }

    pub fn remove(&self, path: &str) {
        self.lock().remove(path);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, FileMeta>> {
        // 持锁期间不会 panic，中毒时直接取回数据
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, path: &str) -> Option<FileMeta> {
        self.lock().get(path).copied()
    }
}

#[async_trait]
impl FileProbe for MemoryProbe {
    async fn exists(&self, path: &str) -> io::Result<bool> {
        Ok(self.get(path).is_some())
    }

    async fn size(&self, path: &str) -> io::Result<Option<u64>> {
        Ok(self.get(path).map(|m| m.size))
    }

    async fn last_write_time_utc(&self, path: &str) -> io::Result<Option<DateTime<Utc>>> {
        Ok(self.get(path).map(|m| m.modified))
    }

    async fn stat(&self, path: &str) -> io::Result<Option<FileMeta>> {
        Ok(self.get(path))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
