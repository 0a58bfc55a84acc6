//! 配置源设置加载
//!
//! 从文档顶层的 `config_sources` 节读取每个配置源的设置。节中的键为 `type`
//! 或 `type/name`，值为该配置源的设置映射。设置中的 `$VAR` / `${VAR}` 会先做
//! 环境变量展开，但不能引用其他配置源。

use super::{ConfigSource, CreateParams, Factories, SourceSettings};
use crate::error::{ConfigSourceError, Result};
use crate::resolver::expand_env_only;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 文档中声明配置源的顶层键
pub const CONFIG_SOURCES_KEY: &str = "config_sources";

/// 类型名正则
static TYPE_PATTERN: OnceLock<Regex> = OnceLock::new();

fn type_pattern() -> &'static Regex {
    TYPE_PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z][0-9a-zA-Z_]{0,62}$").expect("类型名正则表达式无效")
    })
}

/// 配置源标识：类型加可选的实例名
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId {
    source_type: String,
    name: Option<String>,
}

impl SourceId {
    /// 解析 `type` 或 `type/name`
    pub fn parse(key: &str) -> Result<Self> {
        let invalid = |reason: &str| ConfigSourceError::InvalidTypeAndName {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        // 类型和名称两侧的空白不参与比较，`env/ a` 与 `env/a` 视为同一名称
        let (source_type, name) = match key.split_once('/') {
            Some((source_type, name)) => (source_type.trim(), Some(name.trim())),
            None => (key.trim(), None),
        };

        if !type_pattern().is_match(source_type) {
            return Err(invalid("类型必须以字母开头，只能包含字母、数字和下划线"));
        }

        if let Some(name) = name {
            if name.is_empty() {
                return Err(invalid("名称不能为空"));
            }
            if name.contains('/') || name.chars().any(char::is_whitespace) {
                return Err(invalid("名称不能包含 '/' 或空白字符"));
            }
        }

        Ok(Self {
            source_type: source_type.to_string(),
            name: name.map(str::to_string),
        })
    }

    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}/{}", self.source_type, name),
            None => f.write_str(&self.source_type),
        }
    }
}

/// 已加载的单个配置源设置
#[derive(Debug)]
pub struct LoadedSettings {
    pub id: SourceId,
    pub settings: Box<dyn SourceSettings>,
}

/// 从文档中拆出配置源设置
///
/// # 参数
/// * `document` - 完整文档
/// * `factories` - 已注册的工厂
///
/// # 返回
/// * 以全名为键的设置表，以及去掉 `config_sources` 后的剩余文档
pub fn settings_from_document(
    document: &Mapping,
    factories: &Factories,
) -> Result<(BTreeMap<String, LoadedSettings>, Mapping)> {
    let mut rest = document.clone();
    let settings = match rest.remove(CONFIG_SOURCES_KEY) {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Mapping(section)) => load_settings(&section, factories)?,
        Some(other) => {
            return Err(ConfigSourceError::InvalidSettingsSection(format!(
                "期望映射，实际为 {}",
                value_kind(&other)
            )))
        }
    };
    Ok((settings, rest))
}

fn load_settings(
    section: &Mapping,
    factories: &Factories,
) -> Result<BTreeMap<String, LoadedSettings>> {
    let mut loaded = BTreeMap::new();

    for (key, body) in section {
        let key = key
            .as_str()
            .ok_or_else(|| ConfigSourceError::InvalidTypeAndName {
                key: format!("{key:?}"),
                reason: "键必须是字符串".to_string(),
            })?;
        let id = SourceId::parse(key)?;

        let factory =
            factories
                .get(id.source_type())
                .ok_or_else(|| ConfigSourceError::UnknownType {
                    source_type: id.source_type().to_string(),
                    key: key.to_string(),
                })?;

        let full_name = id.to_string();
        if loaded.contains_key(&full_name) {
            return Err(ConfigSourceError::DuplicateName { name: full_name });
        }

        let body = match expand_env_only(body)? {
            Value::Null => Value::Mapping(Mapping::new()),
            body @ Value::Mapping(_) => body,
            other => {
                return Err(ConfigSourceError::Unmarshal {
                    name: full_name,
                    message: format!("设置必须是映射，实际为 {}", value_kind(&other)),
                })
            }
        };

        let defaults = factory.create_default_settings();
        let settings = factory
            .unmarshal_settings(defaults.as_ref(), &body)
            .map_err(|e| ConfigSourceError::Unmarshal {
                name: full_name.clone(),
                message: e.to_string(),
            })?;

        debug!("已加载配置源设置: {}", full_name);
        loaded.insert(full_name, LoadedSettings { id, settings });
    }

    Ok(loaded)
}

/// 在默认设置之上叠加用户设置并反序列化为具体类型
///
/// 具体类型应带 `#[serde(deny_unknown_fields)]`，未知字段会导致失败。
pub fn unmarshal_onto<T>(
    defaults: &dyn SourceSettings,
    body: &Value,
) -> Result<Box<dyn SourceSettings>>
where
    T: DeserializeOwned + SourceSettings,
{
    let mut merged = defaults.to_value()?;
    overlay(&mut merged, body);
    let settings: T = serde_yaml::from_value(merged)?;
    Ok(Box::new(settings))
}

fn overlay(base: &mut Value, body: &Value) {
    match (base, body) {
        (_, Value::Null) => {}
        (Value::Mapping(base), Value::Mapping(body)) => {
            for (key, value) in body {
                match base.get_mut(key) {
                    Some(existing) => overlay(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, body) => *base = body.clone(),
    }
}

/// 按设置表构建全部配置源
///
/// 任一配置源构建失败时，已经构建的配置源会被关闭，然后返回带配置源名称的错误。
pub async fn build_config_sources(
    settings: &BTreeMap<String, LoadedSettings>,
    factories: &Factories,
    cancel: &CancellationToken,
) -> Result<BTreeMap<String, Arc<dyn ConfigSource>>> {
    let mut built: BTreeMap<String, Arc<dyn ConfigSource>> = BTreeMap::new();

    for (name, loaded) in settings {
        let result = match factories.get(loaded.id.source_type()) {
            Some(factory) => {
                let params = CreateParams {
                    name: name.clone(),
                    cancel: cancel.clone(),
                };
                factory
                    .create_config_source(&params, loaded.settings.as_ref())
                    .await
            }
            None => Err(ConfigSourceError::UnknownType {
                source_type: loaded.id.source_type().to_string(),
                key: name.clone(),
            }),
        };

        match result {
            Ok(source) => {
                info!("配置源已创建: {}", name);
                built.insert(name.clone(), source);
            }
            Err(e) => {
                if let Err(close_err) = shutdown_config_sources(&built).await {
                    warn!("构建失败后关闭已创建的配置源出错: {}", close_err);
                }
                return Err(ConfigSourceError::Build {
                    name: name.clone(),
                    source: Box::new(e),
                });
            }
        }
    }

    Ok(built)
}

/// 依次关闭配置源并聚合错误
pub async fn shutdown_config_sources(sources: &BTreeMap<String, Arc<dyn ConfigSource>>) -> Result<()> {
    let mut errors = Vec::new();
    for (name, source) in sources {
        if let Err(e) = source.shutdown().await {
            warn!("关闭配置源 {} 失败: {}", name, e);
            errors.push(e);
        }
    }
    match ConfigSourceError::combine(errors) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "布尔值",
        Value::Number(_) => "数字",
        Value::String(_) => "字符串",
        Value::Sequence(_) => "序列",
        Value::Mapping(_) => "映射",
        Value::Tagged(_) => "带标签的值",
    }
}
