//! 环境变量配置源
//!
//! 选择器为环境变量名。变量不存在时回退到 `defaults`，仍不存在且未设置
//! `optional` 时失败。环境变量不支持监控。

use crate::error::{ConfigSourceError, Result};
use crate::source::{
    decode_params, downcast_settings, unmarshal_onto, ConfigSource, CreateParams, Factory,
    Retrieved, SourceSettings, WatcherFunc,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::sync::Arc;
use tracing::debug;

/// 配置源类型名
pub const TYPE: &str = "env";

/// 环境变量配置源设置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvVarSettings {
    /// 变量不存在时使用的默认值
    pub defaults: Mapping,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RetrieveParams {
    optional: bool,
}

/// 环境变量配置源
#[derive(Debug)]
pub struct EnvVarConfigSource {
    defaults: Mapping,
}

impl EnvVarConfigSource {
    pub fn new(defaults: Mapping) -> Self {
        Self { defaults }
    }
}

#[async_trait]
impl ConfigSource for EnvVarConfigSource {
    async fn retrieve(
        &self,
        selector: &str,
        params: Option<&Mapping>,
        _watcher: Option<WatcherFunc>,
    ) -> Result<Retrieved> {
        let params: RetrieveParams = decode_params(params)?;

        if let Some(value) = std::env::var_os(selector) {
            return Ok(Retrieved::new(value.to_string_lossy().into_owned()));
        }

        if let Some(value) = self.defaults.get(selector) {
            debug!("环境变量 {} 未设置，使用默认值", selector);
            return Ok(Retrieved::new(value.clone()));
        }

        if params.optional {
            return Ok(Retrieved::new(Value::Null));
        }

        Err(ConfigSourceError::MissingRequiredEnvVar {
            name: selector.to_string(),
        })
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// 环境变量配置源工厂
#[derive(Debug, Default)]
pub struct EnvVarFactory;

#[async_trait]
impl Factory for EnvVarFactory {
    fn source_type(&self) -> &'static str {
        TYPE
    }

    fn create_default_settings(&self) -> Box<dyn SourceSettings> {
        Box::new(EnvVarSettings::default())
    }

    fn unmarshal_settings(
        &self,
        defaults: &dyn SourceSettings,
        body: &Value,
    ) -> Result<Box<dyn SourceSettings>> {
        unmarshal_onto::<EnvVarSettings>(defaults, body)
    }

    async fn create_config_source(
        &self,
        _params: &CreateParams,
        settings: &dyn SourceSettings,
    ) -> Result<Arc<dyn ConfigSource>> {
        let settings = downcast_settings::<EnvVarSettings>(settings, TYPE)?;
        Ok(Arc::new(EnvVarConfigSource::new(settings.defaults.clone())))
    }
}
