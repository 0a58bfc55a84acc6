//! 文件配置源
//!
//! 选择器为文件路径，返回文件原始内容。支持读取后删除和写入监控。

use super::file_watch::FileWatchHub;
use crate::error::{ConfigSourceError, Result};
use crate::source::{
    decode_params, unmarshal_onto, ConfigSource, CreateParams, Factory, Retrieved,
    SourceSettings, WatchScope, WatcherFunc,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 配置源类型名
pub const TYPE: &str = "file";

/// 文件配置源设置（没有可配置项）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSettings {}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RetrieveParams {
    /// 读取后删除文件
    delete: bool,
    /// 不监控该文件
    disable_watch: bool,
}

/// 文件配置源
#[derive(Debug)]
pub struct FileConfigSource {
    hub: Arc<FileWatchHub>,
    scope: WatchScope,
}

impl FileConfigSource {
    pub fn new(cancel: &CancellationToken) -> Self {
        Self {
            hub: FileWatchHub::new(),
            scope: WatchScope::new(cancel),
        }
    }

    /// 共享的文件监控器
    pub fn hub(&self) -> &Arc<FileWatchHub> {
        &self.hub
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn retrieve(
        &self,
        selector: &str,
        params: Option<&Mapping>,
        watcher: Option<WatcherFunc>,
    ) -> Result<Retrieved> {
        let params: RetrieveParams = decode_params(params)?;
        let path = PathBuf::from(selector);

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ConfigSourceError::MissingFile {
                path: path.clone(),
                source: e,
            })?;
        let content = String::from_utf8(bytes).map_err(|e| ConfigSourceError::NonUtf8Value {
            location: path.display().to_string(),
            source: e,
        })?;
        let retrieved = Retrieved::new(content);

        if params.delete {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| ConfigSourceError::FailedToDeleteFile {
                    path: path.clone(),
                    source: e,
                })?;
            debug!("文件已在读取后删除: {}", path.display());
            return Ok(retrieved);
        }

        match watcher {
            Some(watcher) if !params.disable_watch => {
                let registration = self.hub.watch_file(&path, &self.scope, watcher)?;
                Ok(retrieved.with_watch(registration))
            }
            _ => Ok(retrieved),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.scope.shutdown().await;
        self.hub.shutdown();
        Ok(())
    }
}

/// 文件配置源工厂
#[derive(Debug, Default)]
pub struct FileFactory;

#[async_trait]
impl Factory for FileFactory {
    fn source_type(&self) -> &'static str {
        TYPE
    }

    fn create_default_settings(&self) -> Box<dyn SourceSettings> {
        Box::new(FileSettings::default())
    }

    fn unmarshal_settings(
        &self,
        defaults: &dyn SourceSettings,
        body: &Value,
    ) -> Result<Box<dyn SourceSettings>> {
        unmarshal_onto::<FileSettings>(defaults, body)
    }

    async fn create_config_source(
        &self,
        params: &CreateParams,
        _settings: &dyn SourceSettings,
    ) -> Result<Arc<dyn ConfigSource>> {
        info!("创建文件配置源: {}", params.name);
        Ok(Arc::new(FileConfigSource::new(&params.cancel)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ChangeEvent;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn params(key: &str) -> Mapping {
        let mut params = Mapping::new();
        params.insert(key.into(), true.into());
        params
    }

    fn channel_watcher() -> (WatcherFunc, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher: WatcherFunc = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (watcher, rx)
    }

    #[tokio::test]
    async fn test_read_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("value.txt");
        std::fs::write(&path, "42").unwrap();

        let source = FileConfigSource::new(&CancellationToken::new());
        let retrieved = source
            .retrieve(path.to_str().unwrap(), None, None)
            .await
            .unwrap();
        assert_eq!(retrieved.value(), &Value::from("42"));
        assert!(!retrieved.is_watched());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.txt");
        let source = FileConfigSource::new(&CancellationToken::new());
        let err = source
            .retrieve(path.to_str().unwrap(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigSourceError::MissingFile { .. }));
    }

    #[tokio::test]
    async fn test_non_utf8_file_is_rejected_and_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("binary.bin");
        std::fs::write(&path, [0x66, 0x6f, 0xff, 0xfe]).unwrap();

        let source = FileConfigSource::new(&CancellationToken::new());
        let delete = params("delete");
        let err = source
            .retrieve(path.to_str().unwrap(), Some(&delete), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigSourceError::NonUtf8Value { .. }));
        // 内容无效时不删除文件
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_delete_after_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret.txt");
        std::fs::write(&path, "s3cr3t").unwrap();

        let source = FileConfigSource::new(&CancellationToken::new());
        let (watcher, _rx) = channel_watcher();
        let delete = params("delete");
        let retrieved = source
            .retrieve(path.to_str().unwrap(), Some(&delete), Some(watcher))
            .await
            .unwrap();

        assert_eq!(retrieved.value(), &Value::from("s3cr3t"));
        assert!(!retrieved.is_watched());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_disable_watch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("static.txt");
        std::fs::write(&path, "v").unwrap();

        let source = FileConfigSource::new(&CancellationToken::new());
        let (watcher, _rx) = channel_watcher();
        let disable = params("disable_watch");
        let retrieved = source
            .retrieve(path.to_str().unwrap(), Some(&disable), Some(watcher))
            .await
            .unwrap();
        assert!(!retrieved.is_watched());
        assert!(!source.hub().is_active());
    }

    #[tokio::test]
    async fn test_watch_fires_on_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watched.txt");
        std::fs::write(&path, "1").unwrap();

        let source = FileConfigSource::new(&CancellationToken::new());
        let (watcher, mut rx) = channel_watcher();
        let retrieved = source
            .retrieve(path.to_str().unwrap(), None, Some(watcher))
            .await
            .unwrap();
        assert!(retrieved.is_watched());

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&path, "2").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("3 秒内应收到文件变更")
            .unwrap();
        assert!(event.is_update());
        retrieved.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_watches_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.txt");
        std::fs::write(&path, "1").unwrap();

        let source = FileConfigSource::new(&CancellationToken::new());
        let (w1, mut rx1) = channel_watcher();
        let (w2, mut rx2) = channel_watcher();
        let _r1 = source
            .retrieve(path.to_str().unwrap(), None, Some(w1))
            .await
            .unwrap();
        let _r2 = source
            .retrieve(path.to_str().unwrap(), None, Some(w2))
            .await
            .unwrap();
        assert_eq!(source.hub().watched_paths(), 1);
        assert_eq!(source.hub().reference_count(&path), 2);

        source.shutdown().await.unwrap();
        source.shutdown().await.unwrap();

        assert!(!source.hub().is_active());
        assert!(rx1.recv().await.is_none());
        assert!(rx2.recv().await.is_none());
    }
}
