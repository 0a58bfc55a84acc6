//! 错误处理模块
//!
//! 定义配置源解析引擎的统一错误类型。
//!
//! 错误按阶段划分：配置结构错误（启动前即失败）、构建错误（创建配置源时失败）、
//! 检索错误（导致本轮解析失败）以及监控错误。监控信号（值已更新、会话已关闭）
//! 不是错误，见 [`crate::source::WatchOutcome`]。

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// 配置源引擎的主要错误类型
#[derive(Error, Debug)]
pub enum ConfigSourceError {
    // ---------- 配置结构错误 ----------
    /// 重复注册同一类型的工厂
    #[error("重复的配置源工厂类型: {source_type}")]
    DuplicateFactory { source_type: String },

    /// `type` 或 `type/name` 键格式错误
    #[error("config_sources 中的类型与名称键无效 {key:?}: {reason}")]
    InvalidTypeAndName { key: String, reason: String },

    /// 未知的配置源类型
    #[error("config_sources 中未知的类型 {source_type:?}（键 {key:?}）")]
    UnknownType { source_type: String, key: String },

    /// 重复的配置源全名
    #[error("重复的 config_sources 名称: {name}")]
    DuplicateName { name: String },

    /// 配置源设置反序列化失败（包括未知字段）
    #[error("读取配置源 {name:?} 的设置失败: {message}")]
    Unmarshal { name: String, message: String },

    /// `config_sources` 节本身的结构不合法
    #[error("config_sources 节内容无效: {0}")]
    InvalidSettingsSection(String),

    // ---------- 构建错误 ----------
    /// 配置源设置不满足构建前置条件
    #[error("配置源 {source_type:?} 设置无效: {reason}")]
    InvalidSettings { source_type: String, reason: String },

    /// 创建配置源实例失败
    #[error("创建配置源 {name} 失败: {source}")]
    Build {
        name: String,
        #[source]
        source: Box<ConfigSourceError>,
    },

    // ---------- 检索错误 ----------
    /// 引用了未声明的配置源
    #[error("配置源 {name:?} 不存在")]
    UnknownConfigSource { name: String },

    /// 引用表达式语法错误
    #[error("配置源引用 {reference:?} 语法无效: {reason}")]
    InvalidReference { reference: String, reason: String },

    /// 检索参数不合法
    #[error("检索参数无效: {0}")]
    InvalidParams(String),

    /// 缺少必需的环境变量
    #[error("缺少必需的环境变量: {name}")]
    MissingRequiredEnvVar { name: String },

    /// 文件不存在或无法读取
    #[error("无法读取文件 {path}: {source}")]
    MissingFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 检索到的内容不是有效的 UTF-8
    #[error("{location} 的内容不是有效的 UTF-8: {source}")]
    NonUtf8Value {
        location: String,
        #[source]
        source: std::string::FromUtf8Error,
    },

    /// 读取后删除文件失败
    #[error("按要求删除文件 {path} 失败: {source}")]
    FailedToDeleteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 模板渲染失败
    #[error("模板渲染失败: {0}")]
    Template(String),

    /// 指定路径下没有值
    #[error("路径 {path:?} 下没有键 {key:?} 对应的值")]
    NoValueAtPath { path: String, key: String },

    /// 从某个配置源检索失败（附带配置源与选择器）
    #[error("配置源 {source_name:?} 检索选择器 {selector:?} 失败: {source}")]
    Retrieve {
        source_name: String,
        selector: String,
        #[source]
        source: Box<ConfigSourceError>,
    },

    /// 引用嵌套超过最大深度（可能存在循环引用）
    #[error("配置源引用嵌套超过最大深度 {max_depth}，可能存在循环引用")]
    ReferenceDepthExceeded { max_depth: usize },

    // ---------- 传输错误 ----------
    /// HTTP 请求错误
    #[error("HTTP请求失败: {0}")]
    Http(#[from] reqwest::Error),

    /// 后端返回了无法处理的响应
    #[error("后端传输错误: {0}")]
    Transport(String),

    // ---------- 监控错误 ----------
    /// 监控过程中发生的不可恢复错误
    #[error("监控失败: {0}")]
    Watch(String),

    /// 退避重试预算耗尽
    #[error("监控重试在 {elapsed:?} 后仍未恢复: {last_error}")]
    BackoffExhausted { elapsed: Duration, last_error: String },

    // ---------- 配置文档 ----------
    /// 配置文档内容无效（例如顶层不是映射）
    #[error("配置文档无效: {0}")]
    InvalidDocument(String),

    // ---------- 生命周期 ----------
    /// 操作被取消
    #[error("操作已取消")]
    Cancelled,

    /// 多个错误（关闭多个资源时聚合）
    #[error("发生多个错误: {}", join_errors(.0))]
    Multiple(Vec<ConfigSourceError>),

    // ---------- 基础设施 ----------
    /// IO错误
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    /// YAML解析错误
    #[error("YAML错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON序列化/反序列化错误
    #[error("JSON错误: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML解析错误
    #[error("TOML错误: {0}")]
    Toml(#[from] toml::de::Error),

    /// 文件监控错误
    #[error("文件监控错误: {0}")]
    Notify(#[from] notify::Error),
}

fn join_errors(errors: &[ConfigSourceError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConfigSourceError {
    /// 将多个错误合并为一个，空列表返回 `None`
    pub fn combine(mut errors: Vec<ConfigSourceError>) -> Option<ConfigSourceError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(ConfigSourceError::Multiple(errors)),
        }
    }

    /// 去掉 `Retrieve`/`Build` 包装后的根因
    pub fn root_cause(&self) -> &ConfigSourceError {
        match self {
            ConfigSourceError::Retrieve { source, .. } | ConfigSourceError::Build { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, ConfigSourceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_errors() {
        assert!(ConfigSourceError::combine(vec![]).is_none());

        let single = ConfigSourceError::combine(vec![ConfigSourceError::Cancelled]);
        assert!(matches!(single, Some(ConfigSourceError::Cancelled)));

        let multiple = ConfigSourceError::combine(vec![
            ConfigSourceError::Cancelled,
            ConfigSourceError::Watch("boom".to_string()),
        ])
        .unwrap();
        assert!(matches!(multiple, ConfigSourceError::Multiple(ref v) if v.len() == 2));
        assert!(multiple.to_string().contains("boom"));
    }

    #[test]
    fn test_root_cause_unwraps_retrieve() {
        let err = ConfigSourceError::Retrieve {
            source_name: "env".to_string(),
            selector: "FOO".to_string(),
            source: Box::new(ConfigSourceError::MissingRequiredEnvVar {
                name: "FOO".to_string(),
            }),
        };
        assert!(matches!(
            err.root_cause(),
            ConfigSourceError::MissingRequiredEnvVar { .. }
        ));
        assert!(err.to_string().contains("FOO"));
    }
}
