//! Config Resolver 主程序入口
//!
//! 解析配置文档中的配置源引用，并可持续监控变更

use anyhow::{Context, Result};
use clap::Parser;
use config_resolver::cli::args::{Args, Commands};
use config_resolver::cli::commands::{
    Command, ResolveCommand, SourcesCommand, ValidateCommand, VersionCommand, WatchCommand,
};
use config_resolver::logging::{LogConfig, LoggingSystem};
use tracing::{debug, error};

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let args = Args::parse();

    // 初始化日志系统
    let log_config = LogConfig {
        level: args.log_level.into(),
        console: true,
        json_format: args.json_logs,
        ..Default::default()
    };

    let _logging_system = LoggingSystem::setup_logging(log_config).context("初始化日志系统失败")?;

    debug!("Config Resolver v{} 启动", config_resolver::VERSION);

    // 执行命令
    if let Err(e) = execute_command(&args).await {
        error!("命令执行失败: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// 执行CLI命令
async fn execute_command(args: &Args) -> Result<()> {
    let command: &dyn Command = match &args.command {
        Commands::Resolve { .. } => &ResolveCommand,
        Commands::Watch { .. } => &WatchCommand,
        Commands::Validate { .. } => &ValidateCommand,
        Commands::Sources { .. } => &SourcesCommand,
        Commands::Version { .. } => &VersionCommand,
    };
    command.execute(args).await
}
