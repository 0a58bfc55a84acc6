//! 配置源抽象模块
//!
//! 定义配置源、配置源工厂及其注册表，以及从文档的 `config_sources` 节
//! 加载设置并构建配置源实例的流程。

pub mod retrieved;
pub mod settings;
pub mod watch;

pub use retrieved::{merge_close_funcs, CloseFunc, CloseHandle, Retrieved};
pub use settings::{
    build_config_sources, settings_from_document, shutdown_config_sources, unmarshal_onto,
    LoadedSettings, SourceId, CONFIG_SOURCES_KEY,
};
pub use watch::{
    BackoffSettings, ChangeEvent, ExponentialBackoff, WatchOutcome, WatchRegistration, WatchScope,
    WatcherFunc,
};

use crate::error::{ConfigSourceError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 配置源
///
/// 根据选择器和可选参数检索值。传入监控回调时，配置源可以为该值建立监控；
/// 不支持监控的配置源忽略回调即可。
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// 检索一个值
    ///
    /// # 参数
    /// * `selector` - 配置源自定义的选择器
    /// * `params` - 检索参数，不需要参数时为 `None`
    /// * `watcher` - 监控回调，`None` 表示调用方不关心变更
    async fn retrieve(
        &self,
        selector: &str,
        params: Option<&Mapping>,
        watcher: Option<WatcherFunc>,
    ) -> Result<Retrieved>;

    /// 关闭配置源，结束其所有监控，可重复调用
    async fn shutdown(&self) -> Result<()>;
}

/// 配置源设置
///
/// 任何可序列化的设置结构都自动实现此 trait，用于在工厂之间以 trait 对象传递。
pub trait SourceSettings: Any + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// 序列化为 YAML 值，用于在默认值上叠加用户设置
    fn to_value(&self) -> Result<Value>;
}

impl<T> SourceSettings for T
where
    T: Serialize + Any + Debug + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_value(&self) -> Result<Value> {
        Ok(serde_yaml::to_value(self)?)
    }
}

/// 构建配置源时传入的参数
#[derive(Debug, Clone)]
pub struct CreateParams {
    /// 配置源全名（`type` 或 `type/name`）
    pub name: String,
    /// 引擎的取消令牌，配置源的监控应以它为父令牌
    pub cancel: CancellationToken,
}

/// 配置源工厂
#[async_trait]
pub trait Factory: Send + Sync {
    /// 工厂负责的配置源类型
    fn source_type(&self) -> &'static str;

    /// 默认设置
    fn create_default_settings(&self) -> Box<dyn SourceSettings>;

    /// 在默认设置上叠加用户给出的设置
    ///
    /// 实现通常直接调用 [`settings::unmarshal_onto`]。
    fn unmarshal_settings(
        &self,
        defaults: &dyn SourceSettings,
        body: &Value,
    ) -> Result<Box<dyn SourceSettings>>;

    /// 根据设置创建配置源实例
    async fn create_config_source(
        &self,
        params: &CreateParams,
        settings: &dyn SourceSettings,
    ) -> Result<Arc<dyn ConfigSource>>;
}

/// 配置源工厂注册表
#[derive(Clone, Default)]
pub struct Factories {
    factories: HashMap<String, Arc<dyn Factory>>,
}

impl Debug for Factories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factories")
            .field("types", &self.types())
            .finish()
    }
}

impl Factories {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从工厂列表构建注册表
    ///
    /// # 返回
    /// * `Err(DuplicateFactory)` - 同一类型出现两次
    pub fn from_factories<I>(factories: I) -> Result<Self>
    where
        I: IntoIterator<Item = Arc<dyn Factory>>,
    {
        let mut registry = Self::new();
        for factory in factories {
            registry.register(factory)?;
        }
        Ok(registry)
    }

    /// 注册一个工厂
    pub fn register(&mut self, factory: Arc<dyn Factory>) -> Result<()> {
        let source_type = factory.source_type();
        if self.factories.contains_key(source_type) {
            return Err(ConfigSourceError::DuplicateFactory {
                source_type: source_type.to_string(),
            });
        }
        self.factories.insert(source_type.to_string(), factory);
        Ok(())
    }

    pub fn get(&self, source_type: &str) -> Option<&Arc<dyn Factory>> {
        self.factories.get(source_type)
    }

    /// 已注册的类型，按字母序
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// 把检索参数解码为配置源自己的参数结构
///
/// 参数结构应带 `#[serde(deny_unknown_fields, default)]`，未知参数会被拒绝。
pub fn decode_params<T>(params: Option<&Mapping>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match params {
        None => Ok(T::default()),
        Some(params) if params.is_empty() => Ok(T::default()),
        Some(params) => serde_yaml::from_value(Value::Mapping(params.clone()))
            .map_err(|e| ConfigSourceError::InvalidParams(e.to_string())),
    }
}

/// 不接受任何检索参数的配置源使用的参数结构
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoParams {}

/// 把设置 trait 对象还原为具体类型
pub fn downcast_settings<'a, T: 'static>(
    settings: &'a dyn SourceSettings,
    source_type: &str,
) -> Result<&'a T> {
    settings
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ConfigSourceError::InvalidSettings {
            source_type: source_type.to_string(),
            reason: "设置类型与工厂不匹配".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct NopSettings {}

    struct NopFactory(&'static str);

    #[async_trait]
    impl Factory for NopFactory {
        fn source_type(&self) -> &'static str {
            self.0
        }

        fn create_default_settings(&self) -> Box<dyn SourceSettings> {
            Box::new(NopSettings::default())
        }

        fn unmarshal_settings(
            &self,
            defaults: &dyn SourceSettings,
            body: &Value,
        ) -> Result<Box<dyn SourceSettings>> {
            settings::unmarshal_onto::<NopSettings>(defaults, body)
        }

        async fn create_config_source(
            &self,
            _params: &CreateParams,
            _settings: &dyn SourceSettings,
        ) -> Result<Arc<dyn ConfigSource>> {
            Err(ConfigSourceError::InvalidSettings {
                source_type: self.0.to_string(),
                reason: "nop".to_string(),
            })
        }
    }

    #[test]
    fn test_duplicate_factory_rejected() {
        let result = Factories::from_factories(vec![
            Arc::new(NopFactory("a")) as Arc<dyn Factory>,
            Arc::new(NopFactory("b")),
            Arc::new(NopFactory("a")),
        ]);
        assert!(matches!(
            result,
            Err(ConfigSourceError::DuplicateFactory { ref source_type }) if source_type == "a"
        ));
    }

    #[test]
    fn test_factories_types_sorted() {
        let factories = Factories::from_factories(vec![
            Arc::new(NopFactory("zeta")) as Arc<dyn Factory>,
            Arc::new(NopFactory("alpha")),
        ])
        .unwrap();
        assert_eq!(factories.types(), vec!["alpha", "zeta"]);
        assert_eq!(factories.len(), 2);
        assert!(factories.get("alpha").is_some());
        assert!(factories.get("beta").is_none());
    }

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(deny_unknown_fields, default)]
    struct Params {
        optional: bool,
    }

    #[test]
    fn test_decode_params() {
        let none: Params = decode_params(None).unwrap();
        assert_eq!(none, Params::default());

        let mut mapping = Mapping::new();
        mapping.insert("optional".into(), true.into());
        let parsed: Params = decode_params(Some(&mapping)).unwrap();
        assert!(parsed.optional);

        mapping.insert("unknown".into(), 1.into());
        let err = decode_params::<Params>(Some(&mapping)).unwrap_err();
        assert!(matches!(err, ConfigSourceError::InvalidParams(_)));
    }

    #[test]
    fn test_no_params_rejects_any_key() {
        assert!(decode_params::<NoParams>(None).is_ok());
        assert!(decode_params::<NoParams>(Some(&Mapping::new())).is_ok());

        let mut mapping = Mapping::new();
        mapping.insert("optional".into(), true.into());
        assert!(matches!(
            decode_params::<NoParams>(Some(&mapping)),
            Err(ConfigSourceError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_downcast_settings() {
        let boxed: Box<dyn SourceSettings> = Box::new(NopSettings::default());
        assert!(downcast_settings::<NopSettings>(boxed.as_ref(), "nop").is_ok());
        assert!(downcast_settings::<String>(boxed.as_ref(), "nop").is_err());
    }
}
