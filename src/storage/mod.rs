pub mod local;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;

pub use local::{LocalProbe, LocalTarget};
pub use memory::MemoryProbe;

/// 文件元数据（分类和属性刷新只需要这两项）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// 文件系统探测接口
///
/// 任一属性查询返回 `None` 都按文件不存在处理。
#[async_trait]
pub trait FileProbe: Send + Sync {
    /// 检查文件是否存在
    async fn exists(&self, path: &str) -> io::Result<bool>;

    async fn size(&self, path: &str) -> io::Result<Option<u64>>;

    async fn last_write_time_utc(&self, path: &str) -> io::Result<Option<DateTime<Utc>>>;

    /// 一次取齐大小和修改时间
    async fn stat(&self, path: &str) -> io::Result<Option<FileMeta>> {
        if !self.exists(path).await? {
            return Ok(None);
        }
        let size = self.size(path).await?;
        let modified = self.last_write_time_utc(path).await?;
        Ok(size.zip(modified).map(|(size, modified)| FileMeta { size, modified }))
    }

    /// 获取探测器名称（用于日志）
    fn name(&self) -> &str;
}
