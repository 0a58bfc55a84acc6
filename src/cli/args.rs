//! 命令行参数定义
//!
//! 使用clap定义应用程序的命令行接口

use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

/// 从标准输入读取配置文档时使用的路径
pub const STDIN_PATH: &str = "-";

/// Config Resolver - 动态配置解析引擎
#[derive(Parser, Debug, Clone)]
#[command(
    name = "config-resolver",
    version = crate::VERSION,
    about = crate::APP_DESCRIPTION,
    long_about = None
)]
pub struct Args {
    /// 配置文件路径
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "配置文件路径（YAML/JSON/TOML，- 表示标准输入）",
        env = "CONFIG_RESOLVER_CONFIG",
        global = true
    )]
    pub config: Option<PathBuf>,

    /// 日志级别
    #[arg(
        short,
        long,
        value_enum,
        default_value = "info",
        help = "日志级别",
        env = "CONFIG_RESOLVER_LOG_LEVEL",
        global = true
    )]
    pub log_level: LogLevel,

    /// 以JSON格式输出日志
    #[arg(long, help = "以JSON格式输出日志", global = true)]
    pub json_logs: bool,

    /// 子命令
    #[command(subcommand)]
    pub command: Commands,
}

/// 日志级别枚举
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum LogLevel {
    /// 跟踪级别
    Trace,
    /// 调试级别
    Debug,
    /// 信息级别
    Info,
    /// 警告级别
    Warn,
    /// 错误级别
    Error,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

/// 子命令定义
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// 解析一次并输出结果
    Resolve {
        /// 输出格式
        #[arg(short, long, value_enum, default_value = "yaml", help = "输出格式")]
        format: OutputFormat,
    },

    /// 解析并持续监控变更，每次重新加载后输出结果
    Watch {
        /// 输出格式
        #[arg(short, long, value_enum, default_value = "yaml", help = "输出格式")]
        format: OutputFormat,

        /// 调试服务监听地址
        #[arg(long, value_name = "ADDR", help = "启动配置快照调试服务，例如 127.0.0.1:55679")]
        debug_server: Option<SocketAddr>,

        /// 不监控配置文件本身
        #[arg(long, help = "不监控配置文件本身的修改")]
        no_watch_document: bool,
    },

    /// 校验配置源设置并构建所有配置源，不进行检索
    Validate {
        /// 是否显示详细信息
        #[arg(short, long, help = "显示详细信息")]
        verbose: bool,
    },

    /// 列出内置的配置源类型
    Sources {
        /// 输出格式
        #[arg(short, long, value_enum, default_value = "text", help = "输出格式")]
        format: ListFormat,
    },

    /// 显示版本信息
    Version {
        /// 输出格式
        #[arg(short, long, value_enum, default_value = "text", help = "输出格式")]
        format: ListFormat,
    },
}

/// 文档输出格式
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum OutputFormat {
    /// YAML格式
    Yaml,
    /// JSON格式
    Json,
}

/// 列表输出格式
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum ListFormat {
    /// 文本格式
    Text,
    /// JSON格式
    Json,
}

impl Args {
    /// 获取配置文件路径，未指定时使用默认路径
    pub fn get_config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(crate::document::get_default_config_path)
    }

    /// 是否从标准输入读取配置
    pub fn reads_stdin(&self) -> bool {
        self.config
            .as_deref()
            .is_some_and(|path| path.as_os_str() == STDIN_PATH)
    }
}
