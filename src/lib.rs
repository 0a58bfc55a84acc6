//! Config Resolver - 动态配置解析引擎
//!
//! 配置文档的 `config_sources` 节声明若干可插拔配置源，文档其余部分通过
//! `$type/name:selector` 形式的引用从这些配置源检索值。支持：
//! - 环境变量、文件、包含文件、etcd v2、Vault 以及可选的 ZooKeeper 配置源
//! - 带检索参数与嵌套引用的递归解析
//! - 配置源变更监控与自动重新加载
//! - 配置快照调试服务
//! - 结构化日志记录

pub mod cli;
pub mod debug_server;
pub mod document;
pub mod error;
pub mod logging;
pub mod manager;
pub mod resolver;
pub mod signal;
pub mod source;
pub mod sources;

// 重新导出主要类型
pub use document::{DocumentSource, FileDocumentSource, StaticDocumentSource};
pub use error::{ConfigSourceError, Result};
pub use manager::{ConfigManager, ConfigUpdateNotification, ManagerOptions};
pub use resolver::{Resolver, ResolverOptions};
pub use source::{ConfigSource, Factories, Factory, Retrieved, WatchOutcome, WatcherFunc};

/// 应用程序版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 应用程序名称
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// 应用程序描述
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
