use super::cancel::CancelHandle;
use crate::db::{SourceEntry, SourceKind};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 候选路径提供者，引擎只消费扁平的路径序列
#[async_trait]
pub trait PathSupplier: Send + Sync {
    async fn candidate_paths(&self) -> io::Result<Vec<String>>;
}

#[async_trait]
impl PathSupplier for Vec<String> {
    async fn candidate_paths(&self) -> io::Result<Vec<String>> {
        Ok(self.clone())
    }
}

/// 文件扫描器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    /// 排除规则（glob patterns）
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
    /// 是否跟随符号链接
    #[serde(default)]
    pub follow_links: bool,
}

fn default_exclude_patterns() -> Vec<String> {
    // 常见的排除模式
    [".git/**", ".svn/**", "node_modules/**", ".DS_Store", "Thumbs.db", "*.tmp", "*.temp", "~*"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: default_exclude_patterns(),
            follow_links: false,
        }
    }
}

/// 编译后的排除规则，匹配不区分大小写，且只在路径分量边界上生效
#[derive(Debug, Clone, Default)]
struct ExcludeSet {
    patterns: Vec<Regex>,
}

impl ExcludeSet {
    fn compile(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|pattern| match Regex::new(&glob_to_regex(pattern)) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("无效的排除规则 {}: {}", pattern, e);
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    fn is_excluded(&self, path: &str) -> bool {
        let path = path.replace('\\', "/");
        self.patterns.iter().any(|re| re.is_match(&path))
    }
}

/// `**` 跨目录，`*` 和 `?` 不跨目录
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("(?i)(^|/)");
    let mut chars = pattern.trim_start_matches('/').chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '\\' => out.push('/'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }

    out.push_str("(/|$)");
    out
}

/// 按计划源遍历本地文件系统
pub struct SourceScanner {
    sources: Vec<SourceEntry>,
    config: ScanConfig,
    cancel: Option<CancelHandle>,
}

impl SourceScanner {
    pub fn new(sources: Vec<SourceEntry>) -> Self {
        Self::with_config(sources, ScanConfig::default())
    }

    pub fn with_config(sources: Vec<SourceEntry>, config: ScanConfig) -> Self {
        Self {
            sources,
            config,
            cancel: None,
        }
    }

    /// 创建带取消标志的扫描器
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// 同步遍历，在阻塞线程中调用
    fn scan_blocking(sources: &[SourceEntry], config: &ScanConfig, cancel: Option<&CancelHandle>) -> io::Result<Vec<String>> {
        let excludes = ExcludeSet::compile(&config.exclude_patterns);
        let is_cancelled = || cancel.is_some_and(|c| c.is_cancelled());
        let mut paths = Vec::new();
        let mut excluded_count = 0;
        let mut unreadable_count = 0;

        for source in sources {
            if is_cancelled() {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "scan cancelled"));
            }

            let root = Path::new(&source.path);
            match source.kind {
                SourceKind::File => {
                    if !root.is_file() {
                        warn!("文件不存在: {}", source.path);
                        continue;
                    }
                    if excludes.is_excluded(&source.path) {
                        debug!("排除文件: {}", source.path);
                        excluded_count += 1;
                        continue;
                    }
                    debug!("添加文件: {}", source.path);
                    paths.push(source.path.clone());
                }
                SourceKind::Drive | SourceKind::Folder => {
                    if !root.is_dir() {
                        warn!("目录不存在: {}", source.path);
                        continue;
                    }

                    let walker = WalkDir::new(root)
                        .follow_links(config.follow_links)
                        .sort_by_file_name()
                        .into_iter()
                        .filter_entry(|entry| {
                            // 根目录本身不参与排除
                            if entry.depth() == 0 {
                                return true;
                            }
                            let path = entry.path().to_string_lossy();
                            let candidate = if entry.file_type().is_dir() {
                                format!("{}/", path)
                            } else {
                                path.into_owned()
                            };
                            let excluded = excludes.is_excluded(&candidate);
                            if excluded {
                                debug!("排除: {}", candidate);
                                excluded_count += 1;
                            }
                            !excluded
                        });

                    for (i, entry) in walker.enumerate() {
                        // 每处理一定数量检查一次取消状态
                        if i % 100 == 0 && is_cancelled() {
                            return Err(io::Error::new(io::ErrorKind::Interrupted, "scan cancelled"));
                        }

                        let entry = match entry {
                            Ok(entry) => entry,
                            Err(e) => {
                                warn!("遍历失败: {}", e);
                                continue;
                            }
                        };
                        if !entry.file_type().is_file() {
                            continue;
                        }
                        // 有损转换后的路径在探测时找不到，直接跳过
                        match entry.path().to_str() {
                            Some(path) => paths.push(path.to_string()),
                            None => {
                                warn!("文件名不是有效的 UTF-8，跳过: {}", entry.path().display());
                                unreadable_count += 1;
                            }
                        }
                    }
                }
            }
        }

        // 选中的源可能有重叠
        let before = paths.len();
        paths.sort();
        paths.dedup();
        info!(
            "扫描完成: {} 个文件, {} 个被排除, {} 个重复, {} 个名称无法识别",
            paths.len(),
            excluded_count,
            before - paths.len(),
            unreadable_count
        );
        Ok(paths)
    }
}

#[async_trait]
impl PathSupplier for SourceScanner {
    async fn candidate_paths(&self) -> io::Result<Vec<String>> {
        info!("开始扫描 {} 个源", self.sources.len());
        let sources = self.sources.clone();
        let config = self.config.clone();
        let cancel = self.cancel.clone();

        tokio::task::spawn_blocking(move || Self::scan_blocking(&sources, &config, cancel.as_ref()))
            .await
            .map_err(io::Error::other)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn source(kind: SourceKind, path: &Path) -> SourceEntry {
        SourceEntry {
            kind,
            path: path.to_string_lossy().into_owned(),
        }
    }

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("docs/deep")).unwrap();
        fs::create_dir_all(root.join(".git/objects")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::write(root.join("docs/a.txt"), b"a").unwrap();
        fs::write(root.join("docs/deep/b.txt"), b"b").unwrap();
        fs::write(root.join("docs/scratch.TMP"), b"t").unwrap();
        fs::write(root.join("docs/~lock"), b"l").unwrap();
        fs::write(root.join(".git/objects/x"), b"x").unwrap();
        fs::write(root.join("node_modules/pkg/index.js"), b"j").unwrap();
        fs::write(root.join("top.txt"), b"t").unwrap();
        dir
    }

    #[test]
    fn test_glob_patterns() {
        let set = ExcludeSet::compile(&default_exclude_patterns());
        assert!(set.is_excluded("/home/me/.git/config"));
        assert!(set.is_excluded("/home/me/.git/"));
        assert!(set.is_excluded("C:\\work\\node_modules\\x\\y.js"));
        assert!(set.is_excluded("/a/b/report.tmp"));
        assert!(set.is_excluded("/a/b/REPORT.TMP"));
        assert!(set.is_excluded("/a/.DS_Store"));
        assert!(set.is_excluded("/a/~$doc.docx"));
        assert!(!set.is_excluded("/a/b/report.txt"));
        assert!(!set.is_excluded("/a/my.git/config"));
        assert!(!set.is_excluded("/a/b/tmp"));
    }

    #[tokio::test]
    async fn test_scan_folder_applies_excludes() {
        let dir = tree();
        let scanner = SourceScanner::new(vec![source(SourceKind::Folder, dir.path())]);

        let paths = scanner.candidate_paths().await.unwrap();
        let relative: Vec<String> = paths
            .iter()
            .map(|p| {
                Path::new(p)
                    .strip_prefix(dir.path())
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();

        assert_eq!(relative, ["docs/a.txt", "docs/deep/b.txt", "top.txt"]);
    }

    #[tokio::test]
    async fn test_missing_sources_are_skipped() {
        let dir = tree();
        let scanner = SourceScanner::new(vec![
            source(SourceKind::Folder, &dir.path().join("nope")),
            source(SourceKind::File, &dir.path().join("missing.txt")),
            source(SourceKind::File, &dir.path().join("top.txt")),
            // 重叠的源只产生一次
            source(SourceKind::Folder, &dir.path().join("docs/deep")),
            source(SourceKind::File, &dir.path().join("docs/deep/b.txt")),
        ]);

        let paths = scanner.candidate_paths().await.unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().any(|p| p.ends_with("top.txt")));
        assert!(paths.iter().any(|p| p.ends_with("b.txt")));
    }

    #[tokio::test]
    async fn test_custom_config_and_cancel() {
        let dir = tree();
        let config = ScanConfig {
            exclude_patterns: vec!["deep/**".to_string()],
            follow_links: false,
        };
        let scanner = SourceScanner::with_config(vec![source(SourceKind::Folder, &dir.path().join("docs"))], config);
        let paths = scanner.candidate_paths().await.unwrap();
        assert_eq!(paths.len(), 3);
        assert!(!paths.iter().any(|p| p.contains("deep")));

        let cancel = CancelHandle::new();
        cancel.cancel();
        let scanner = SourceScanner::new(vec![source(SourceKind::Folder, dir.path())]).with_cancel(cancel);
        let err = scanner.candidate_paths().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: ScanConfig = serde_json::from_str(r#"{"followLinks": true}"#).unwrap();
        assert!(config.follow_links);
        assert_eq!(config.exclude_patterns, default_exclude_patterns());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_names_are_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("ok.txt"), b"ok").unwrap();
        let bad = dir.path().join(OsStr::from_bytes(b"bad\xff.txt"));
        if fs::write(&bad, b"x").is_err() {
            // 某些文件系统不接受非 UTF-8 名称
            return;
        }

        let scanner = SourceScanner::new(vec![source(SourceKind::Folder, dir.path())]);
        let paths = scanner.candidate_paths().await.unwrap();

        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("ok.txt"));
        assert!(!paths.iter().any(|p| p.contains('\u{FFFD}')));
    }
}
