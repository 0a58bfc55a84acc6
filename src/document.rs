//! 配置文档模块
//!
//! 负责读取原始配置文档（YAML、JSON 或 TOML，统一转换为 YAML 值树），
//! 以及多次解析结果之间的合并。

use crate::error::{ConfigSourceError, Result};
use crate::source::{CloseHandle, ChangeEvent, WatchScope, WatcherFunc};
use crate::sources::file_watch::FileWatchHub;
use async_trait::async_trait;
use futures::FutureExt;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 文档格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
    Toml,
}

impl DocumentFormat {
    /// 根据扩展名判断格式，无法识别时按 YAML 处理
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("json") => DocumentFormat::Json,
            Some("toml") => DocumentFormat::Toml,
            _ => DocumentFormat::Yaml,
        }
    }
}

/// 解析文档内容
///
/// # 参数
/// * `content` - 文档文本
/// * `format` - 文档格式
///
/// # 返回
/// * `Result<Mapping>` - 顶层映射，空文档返回空映射
pub fn parse_document(content: &str, format: DocumentFormat) -> Result<Mapping> {
    let value: Value = match format {
        DocumentFormat::Yaml => serde_yaml::from_str(content)?,
        DocumentFormat::Json => {
            if content.trim().is_empty() {
                Value::Null
            } else {
                serde_yaml::to_value(serde_json::from_str::<serde_json::Value>(content)?)?
            }
        }
        DocumentFormat::Toml => serde_yaml::to_value(toml::from_str::<toml::Table>(content)?)?,
    };

    match value {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(mapping) => Ok(mapping),
        other => Err(ConfigSourceError::InvalidDocument(format!(
            "顶层必须是映射，实际为 {}",
            match other {
                Value::Sequence(_) => "序列",
                _ => "标量",
            }
        ))),
    }
}

/// 把 `incoming` 合并到 `base`
///
/// 同名键以 `incoming` 为准；两边都是映射时递归合并，其余类型（包括序列）直接替换。
pub fn merge_documents(base: &mut Mapping, incoming: Mapping) {
    for (key, value) in incoming {
        match value {
            Value::Mapping(incoming) => match base.get_mut(&key) {
                Some(Value::Mapping(existing)) => merge_documents(existing, incoming),
                _ => {
                    base.insert(key, Value::Mapping(incoming));
                }
            },
            value => {
                base.insert(key, value);
            }
        }
    }
}

/// 获取默认配置文件路径
///
/// 当前目录存在 `config.yaml` 时使用它，否则使用用户配置目录下的
/// `config-resolver/config.yaml`。
pub fn get_default_config_path() -> PathBuf {
    if Path::new("config.yaml").exists() {
        return PathBuf::from("config.yaml");
    }
    dirs::config_dir()
        .map(|config_dir| config_dir.join("config-resolver").join("config.yaml"))
        .unwrap_or_else(|| PathBuf::from("config.yaml"))
}

/// 一次加载得到的原始文档
#[derive(Debug, Default)]
pub struct RawDocument {
    pub document: Mapping,
    /// 文档自身监控的关闭函数
    pub close: CloseHandle,
}

/// 原始文档来源
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// 加载文档；给出 `watcher` 时，文档本身变化也会通过它通知
    async fn load(&self, watcher: Option<WatcherFunc>) -> Result<RawDocument>;

    /// 用于日志的来源描述
    fn describe(&self) -> String;

    /// 释放来源持有的资源
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// 从文件读取文档
#[derive(Debug)]
pub struct FileDocumentSource {
    path: PathBuf,
    format: DocumentFormat,
    watch: bool,
    hub: Arc<FileWatchHub>,
    scope: WatchScope,
}

impl FileDocumentSource {
    /// 创建文件文档来源
    ///
    /// # 参数
    /// * `path` - 文档路径，格式按扩展名判断
    /// * `watch` - 是否监控文档文件本身
    /// * `cancel` - 父取消令牌
    pub fn new(path: impl Into<PathBuf>, watch: bool, cancel: &CancellationToken) -> Self {
        let path = path.into();
        Self {
            format: DocumentFormat::from_path(&path),
            path,
            watch,
            hub: FileWatchHub::new(),
            scope: WatchScope::new(cancel),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> DocumentFormat {
        self.format
    }
}

#[async_trait]
impl DocumentSource for FileDocumentSource {
    async fn load(&self, watcher: Option<WatcherFunc>) -> Result<RawDocument> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ConfigSourceError::MissingFile {
                path: self.path.clone(),
                source: e,
            }
        })?;
        let document = parse_document(&content, self.format)?;
        debug!("已加载配置文档: {}", self.path.display());

        let mut close = CloseHandle::new();
        if let Some(watcher) = watcher.filter(|_| self.watch) {
            let registration = self.hub.watch_file(&self.path, &self.scope, watcher)?;
            close.push(Box::new(move || registration.close().boxed()));
        }
        Ok(RawDocument { document, close })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn shutdown(&self) -> Result<()> {
        self.scope.shutdown().await;
        self.hub.shutdown();
        info!("配置文档监控已关闭: {}", self.path.display());
        Ok(())
    }
}

/// 内存中的文档，可随时替换
///
/// 替换时会通知最近一次加载时登记的监控回调。
#[derive(Default)]
pub struct StaticDocumentSource {
    document: RwLock<Mapping>,
    watcher: Mutex<Option<WatcherFunc>>,
}

impl std::fmt::Debug for StaticDocumentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticDocumentSource").finish()
    }
}

impl StaticDocumentSource {
    pub fn new(document: Mapping) -> Self {
        Self {
            document: RwLock::new(document),
            watcher: Mutex::new(None),
        }
    }

    /// 从 YAML 文本创建
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(Self::new(parse_document(content, DocumentFormat::Yaml)?))
    }

    /// 替换文档内容并通知监控回调
    pub async fn replace(&self, document: Mapping) {
        *self.document.write().await = document;
        let watcher = match self.watcher.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(watcher) = watcher {
            watcher(ChangeEvent::updated());
        }
    }
}

#[async_trait]
impl DocumentSource for StaticDocumentSource {
    async fn load(&self, watcher: Option<WatcherFunc>) -> Result<RawDocument> {
        let document = self.document.read().await.clone();
        match self.watcher.lock() {
            Ok(mut guard) => *guard = watcher,
            Err(poisoned) => *poisoned.into_inner() = watcher,
        }
        Ok(RawDocument {
            document,
            close: CloseHandle::new(),
        })
    }

    fn describe(&self) -> String {
        "<内存文档>".to_string()
    }
}
