//! 信号处理模块
//!
//! SIGINT/SIGTERM 触发优雅关闭，SIGHUP 触发一次配置重新加载。
//! 非 Unix 系统只处理 Ctrl+C。

use crate::error::Result;
use crate::manager::ConfigManager;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(unix)]
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook_tokio::Signals;

/// 启动信号处理任务
///
/// # 参数
/// * `manager` - 收到 SIGHUP 时请求重新加载的管理器
/// * `shutdown` - 收到终止信号时取消的令牌；令牌被其他地方取消时任务也会退出
pub fn spawn_signal_handler(
    manager: Arc<ConfigManager>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>> {
    #[cfg(unix)]
    {
        spawn_unix_handler(manager, shutdown)
    }
    #[cfg(not(unix))]
    {
        let _ = manager;
        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::error!("监听 Ctrl+C 失败: {e}");
                    }
                    info!("接收到 Ctrl+C，开始优雅关闭...");
                    shutdown.cancel();
                }
            }
        }))
    }
}

#[cfg(unix)]
fn spawn_unix_handler(
    manager: Arc<ConfigManager>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>> {
    use futures::stream::StreamExt;
    use tracing::warn;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    let handle = signals.handle();

    Ok(tokio::spawn(async move {
        loop {
            let signal = tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = signals.next() => signal,
            };
            match signal {
                Some(SIGINT) | Some(SIGTERM) => {
                    info!("接收到终止信号，开始优雅关闭...");
                    shutdown.cancel();
                    break;
                }
                Some(SIGHUP) => {
                    info!("接收到 SIGHUP 信号，重新加载配置...");
                    manager.request_reload();
                }
                Some(other) => warn!("接收到未处理的信号: {other}"),
                None => break,
            }
        }
        handle.close();
    }))
}
