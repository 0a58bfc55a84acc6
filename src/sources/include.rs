//! 模板包含配置源
//!
//! 选择器为模板文件路径，以检索参数作为模板上下文渲染（handlebars），
//! 返回渲染结果。`delete_files` 与 `watch_files` 不能同时启用。

use super::file_watch::FileWatchHub;
use crate::error::{ConfigSourceError, Result};
use crate::source::{
    downcast_settings, unmarshal_onto, ConfigSource, CreateParams, Factory, Retrieved,
    SourceSettings, WatchScope, WatcherFunc,
};
use async_trait::async_trait;
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 配置源类型名
pub const TYPE: &str = "include";

/// 模板包含配置源设置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IncludeSettings {
    /// 渲染后删除模板文件
    pub delete_files: bool,
    /// 监控模板文件的写入
    pub watch_files: bool,
}

/// 模板包含配置源
pub struct IncludeConfigSource {
    settings: IncludeSettings,
    templates: Handlebars<'static>,
    hub: Arc<FileWatchHub>,
    scope: WatchScope,
}

impl std::fmt::Debug for IncludeConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncludeConfigSource")
            .field("settings", &self.settings)
            .finish()
    }
}

impl IncludeConfigSource {
    /// 创建模板包含配置源
    ///
    /// # 返回
    /// * `Err(InvalidSettings)` - `delete_files` 与 `watch_files` 同时启用
    pub fn new(settings: IncludeSettings, cancel: &CancellationToken) -> Result<Self> {
        if settings.delete_files && settings.watch_files {
            return Err(ConfigSourceError::InvalidSettings {
                source_type: TYPE.to_string(),
                reason: "delete_files 与 watch_files 不能同时启用".to_string(),
            });
        }

        let mut templates = Handlebars::new();
        templates.register_escape_fn(handlebars::no_escape);

        Ok(Self {
            settings,
            templates,
            hub: FileWatchHub::new(),
            scope: WatchScope::new(cancel),
        })
    }

    fn render(&self, template: &str, params: Option<&Mapping>) -> Result<String> {
        let context = match params {
            Some(params) => serde_json::to_value(params)
                .map_err(|e| ConfigSourceError::Template(format!("模板参数无法转换: {e}")))?,
            None => serde_json::Value::Object(serde_json::Map::new()),
        };
        self.templates
            .render_template(template, &context)
            .map_err(|e| ConfigSourceError::Template(e.to_string()))
    }
}

#[async_trait]
impl ConfigSource for IncludeConfigSource {
    async fn retrieve(
        &self,
        selector: &str,
        params: Option<&Mapping>,
        watcher: Option<WatcherFunc>,
    ) -> Result<Retrieved> {
        let path = PathBuf::from(selector);
        let template = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ConfigSourceError::MissingFile {
                path: path.clone(),
                source: e,
            }
        })?;
        let rendered = self.render(&template, params)?;
        let retrieved = Retrieved::new(rendered);

        if self.settings.delete_files {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| ConfigSourceError::FailedToDeleteFile {
                    path: path.clone(),
                    source: e,
                })?;
            debug!("模板文件已在渲染后删除: {}", path.display());
            return Ok(retrieved);
        }

        match watcher {
            Some(watcher) if self.settings.watch_files => {
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

/// 模板包含配置源工厂
#[derive(Debug, Default)]
pub struct IncludeFactory;

#[async_trait]
impl Factory for IncludeFactory {
    fn source_type(&self) -> &'static str {
        TYPE
    }

    fn create_default_settings(&self) -> Box<dyn SourceSettings> {
        Box::new(IncludeSettings::default())
    }

    fn unmarshal_settings(
        &self,
        defaults: &dyn SourceSettings,
        body: &Value,
    ) -> Result<Box<dyn SourceSettings>> {
        unmarshal_onto::<IncludeSettings>(defaults, body)
    }

    async fn create_config_source(
        &self,
        params: &CreateParams,
        settings: &dyn SourceSettings,
    ) -> Result<Arc<dyn ConfigSource>> {
        let settings = downcast_settings::<IncludeSettings>(settings, TYPE)?;
        Ok(Arc::new(IncludeConfigSource::new(
            settings.clone(),
            &params.cancel,
        )?))
    }
}
