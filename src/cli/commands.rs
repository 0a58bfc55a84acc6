//! 命令处理逻辑
//!
//! 实现各种CLI命令的处理逻辑。文档输出到标准输出，日志输出到标准错误。

use crate::cli::args::{Args, Commands, ListFormat, OutputFormat};
use crate::debug_server;
use crate::document::{
    parse_document, DocumentFormat, DocumentSource, FileDocumentSource, StaticDocumentSource,
};
use crate::manager::{ConfigManager, ManagerOptions};
use crate::signal::spawn_signal_handler;
use crate::source::{build_config_sources, settings_from_document, shutdown_config_sources};
use crate::sources::builtin_factories;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_yaml::Mapping;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 命令处理器trait
#[async_trait]
pub trait Command: Send + Sync {
    /// 执行命令
    async fn execute(&self, args: &Args) -> Result<()>;
}

/// 按命令行参数创建原始文档来源
///
/// # 参数
/// * `args` - 命令行参数
/// * `watch` - 是否监控配置文件本身，标准输入时忽略
/// * `cancel` - 文件监控使用的取消令牌
pub async fn open_document_source(
    args: &Args,
    watch: bool,
    cancel: &CancellationToken,
) -> Result<Arc<dyn DocumentSource>> {
    if args.reads_stdin() {
        let mut content = String::new();
        tokio::io::stdin()
            .read_to_string(&mut content)
            .await
            .context("读取标准输入失败")?;
        let document =
            parse_document(&content, DocumentFormat::Yaml).context("解析标准输入中的配置失败")?;
        return Ok(Arc::new(StaticDocumentSource::new(document)));
    }

    let path = args.get_config_path();
    if !path.exists() {
        return Err(anyhow::anyhow!("配置文件不存在: {}", path.display()));
    }
    Ok(Arc::new(FileDocumentSource::new(path, watch, cancel)))
}

/// 按指定格式把文档写到标准输出
pub fn print_document(document: &Mapping, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Yaml => {
            let rendered = serde_yaml::to_string(document)?;
            print!("{rendered}");
            if !rendered.ends_with('\n') {
                println!();
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(document)?);
        }
    }
    Ok(())
}

async fn new_manager(args: &Args, watch: bool) -> Result<Arc<ConfigManager>> {
    let factories = builtin_factories().context("注册内置配置源失败")?;
    let cancel = CancellationToken::new();
    let source = open_document_source(args, watch, &cancel).await?;
    Ok(Arc::new(ConfigManager::new(
        factories,
        source,
        ManagerOptions::default(),
    )))
}

/// 解析命令：解析一次，输出结果后关闭所有配置源
pub struct ResolveCommand;

#[async_trait]
impl Command for ResolveCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        let Commands::Resolve { format } = &args.command else {
            return Ok(());
        };

        let manager = new_manager(args, false).await?;
        let result = manager.resolve().await;
        let shutdown = manager.shutdown().await;

        let document = result.context("解析配置失败")?;
        print_document(&document, *format)?;
        shutdown.context("关闭配置源失败")?;
        Ok(())
    }
}

/// 监控命令：持续运行，每次重新加载成功后输出新的文档
pub struct WatchCommand;

impl WatchCommand {
    async fn start_debug_server(
        addr: SocketAddr,
        manager: Arc<ConfigManager>,
        shutdown: CancellationToken,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("调试服务绑定地址失败: {addr}"))?;
        Ok(tokio::spawn(async move {
            if let Err(e) = debug_server::serve_on(listener, manager, shutdown).await {
                error!("调试服务运行失败: {}", e);
            }
        }))
    }
}

#[async_trait]
impl Command for WatchCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        let Commands::Watch {
            format,
            debug_server,
            no_watch_document,
        } = &args.command
        else {
            return Ok(());
        };
        let format = *format;

        let manager = new_manager(args, !*no_watch_document).await?;
        let document = match manager.resolve().await {
            Ok(document) => document,
            Err(e) => {
                if let Err(close_err) = manager.shutdown().await {
                    warn!("关闭配置源失败: {}", close_err);
                }
                return Err(anyhow::Error::new(e).context("初始解析失败"));
            }
        };
        print_document(&document, format)?;

        let shutdown = CancellationToken::new();
        let signals = spawn_signal_handler(Arc::clone(&manager), shutdown.clone())
            .context("注册信号处理失败")?;
        let server = match debug_server {
            Some(addr) => Some(
                Self::start_debug_server(*addr, Arc::clone(&manager), shutdown.clone()).await?,
            ),
            None => None,
        };

        let mut updates = manager.subscribe();
        let printer = tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(notification) => {
                        info!("配置已更新，版本: {}", notification.version);
                        if let Err(e) = print_document(&notification.document, format) {
                            error!("输出配置失败: {}", e);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => warn!("跳过了 {} 次配置更新", skipped),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        info!("开始监控配置变更，按 Ctrl+C 退出");
        let result = tokio::select! {
            result = manager.run() => result.map_err(|e| anyhow::Error::new(e).context("监控配置变更失败")),
            _ = shutdown.cancelled() => Ok(()),
        };

        shutdown.cancel();
        let closed = manager.shutdown().await;
        if let Err(e) = signals.await {
            warn!("信号处理任务异常退出: {}", e);
        }
        if let Some(server) = server {
            if let Err(e) = server.await {
                warn!("调试服务任务异常退出: {}", e);
            }
        }
        printer.abort();

        result?;
        closed.context("关闭配置源失败")?;
        info!("已停止监控");
        Ok(())
    }
}

/// 验证命令：检查 `config_sources` 节并构建所有配置源，不检索任何值
pub struct ValidateCommand;

#[async_trait]
impl Command for ValidateCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        let Commands::Validate { verbose } = &args.command else {
            return Ok(());
        };

        let factories = builtin_factories().context("注册内置配置源失败")?;
        let cancel = CancellationToken::new();
        let source = open_document_source(args, false, &cancel).await?;
        let raw = source.load(None).await.context("读取配置文档失败")?;

        let (settings, rest) =
            settings_from_document(&raw.document, &factories).context("配置源设置无效")?;
        let sources = build_config_sources(&settings, &factories, &cancel)
            .await
            .context("构建配置源失败")?;

        println!("✓ 配置验证通过: {}", source.describe());
        println!("  配置源数量: {}", sources.len());
        println!("  顶层键数量: {}", rest.len());
        if *verbose {
            for (name, loaded) in &settings {
                println!("  - {}: {:?}", name, loaded.settings);
            }
        }

        cancel.cancel();
        shutdown_config_sources(&sources)
            .await
            .context("关闭配置源失败")?;
        source.shutdown().await.context("关闭配置文档失败")?;
        Ok(())
    }
}

/// 配置源列表命令
pub struct SourcesCommand;

#[async_trait]
impl Command for SourcesCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        let Commands::Sources { format } = &args.command else {
            return Ok(());
        };

        let factories = builtin_factories()?;
        let mut types = factories.types();
        types.sort_unstable();
        match format {
            ListFormat::Json => println!("{}", serde_json::to_string_pretty(&types)?),
            ListFormat::Text => {
                for source_type in types {
                    println!("{source_type}");
                }
            }
        }
        Ok(())
    }
}

/// 版本命令
pub struct VersionCommand;

#[async_trait]
impl Command for VersionCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        if let Commands::Version { format } = &args.command {
            match format {
                ListFormat::Json => {
                    let version_info = serde_json::json!({
                        "name": crate::APP_NAME,
                        "version": crate::VERSION,
                        "description": crate::APP_DESCRIPTION
                    });
                    println!("{}", serde_json::to_string_pretty(&version_info)?);
                }
                ListFormat::Text => {
                    println!("{} v{}", crate::APP_NAME, crate::VERSION);
                    println!("{}", crate::APP_DESCRIPTION);
                }
            }
        }
        Ok(())
    }
}
