//! 监控注册模块
//!
//! 每个被监控的检索结果对应一个后台任务，任务在以下三种结果之一出现时终止：
//! 值已更新、会话已关闭、不可恢复的错误。三者互斥，并且每个注册只会产生一次。

use crate::error::{ConfigSourceError, Result};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// 单个监控注册的终止结果
#[derive(Debug)]
pub enum WatchOutcome {
    /// 被监控的值发生了变化，附带变更描述
    ValueUpdated(String),
    /// 注册或所属配置源已关闭
    SessionClosed,
    /// 监控本身失败
    Failed(ConfigSourceError),
}

impl WatchOutcome {
    /// 是否为值更新
    pub fn is_updated(&self) -> bool {
        matches!(self, WatchOutcome::ValueUpdated(_))
    }
}

/// 投递给监控回调的变更事件
///
/// `error` 为 `None` 表示普通的值变更，否则表示监控失败。
#[derive(Debug)]
pub struct ChangeEvent {
    /// 监控失败时的错误
    pub error: Option<ConfigSourceError>,
}

impl ChangeEvent {
    /// 值变更事件
    pub fn updated() -> Self {
        Self { error: None }
    }

    /// 监控失败事件
    pub fn failed(error: ConfigSourceError) -> Self {
        Self { error: Some(error) }
    }

    /// 是否为值变更
    pub fn is_update(&self) -> bool {
        self.error.is_none()
    }
}

/// 监控回调，每个注册最多调用一次
pub type WatcherFunc = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// 监控作用域
///
/// 每个配置源实例持有一个作用域，作用域内所有监控任务共享同一个取消令牌，
/// 关闭时等待所有任务退出。
#[derive(Clone)]
pub struct WatchScope {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl fmt::Debug for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchScope")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("tasks", &self.tracker.len())
            .finish()
    }
}

impl WatchScope {
    /// 以父令牌创建新的作用域，父令牌取消时作用域内所有任务随之结束
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            tracker: TaskTracker::new(),
        }
    }

    /// 作用域的取消令牌
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 当前仍在运行的监控任务数量
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// 启动一个监控任务
    ///
    /// # 参数
    /// * `watcher` - 变更回调
    /// * `watch_fn` - 以注册自身的取消令牌构造监控 future
    ///
    /// # 返回
    /// * `WatchRegistration` - 可单独关闭的注册句柄
    pub fn spawn<F, Fut>(&self, watcher: WatcherFunc, watch_fn: F) -> WatchRegistration
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = WatchOutcome> + Send + 'static,
    {
        let cancel = self.cancel.child_token();
        let watch_future = watch_fn(cancel.clone());
        let task_cancel = cancel.clone();

        let handle = self.tracker.spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = task_cancel.cancelled() => WatchOutcome::SessionClosed,
                outcome = watch_future => outcome,
            };
            deliver(outcome, &watcher);
        });

        WatchRegistration {
            cancel,
            handle: Some(handle),
        }
    }

    /// 关闭作用域并等待所有监控任务退出，可重复调用
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

fn deliver(outcome: WatchOutcome, watcher: &WatcherFunc) {
    match outcome {
        WatchOutcome::ValueUpdated(reason) => {
            debug!("监控到值更新: {}", reason);
            watcher(ChangeEvent::updated());
        }
        WatchOutcome::SessionClosed => {
            debug!("监控会话已关闭");
        }
        WatchOutcome::Failed(error) => {
            warn!("监控失败: {}", error);
            watcher(ChangeEvent::failed(error));
        }
    }
}

/// 单个检索结果上的监控注册
pub struct WatchRegistration {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for WatchRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchRegistration")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl WatchRegistration {
    /// 注册是否已经结束（任务已退出）
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// 关闭注册并等待后台任务退出
    pub async fn close(mut self) -> Result<()> {
        self.cancel.cancel();
        match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(()) => Ok(()),
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => Err(ConfigSourceError::Watch(format!("监控任务异常退出: {e}"))),
            },
            None => Ok(()),
        }
    }
}

impl Drop for WatchRegistration {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 指数退避参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    /// 首次重试间隔
    pub initial_interval: Duration,
    /// 间隔增长倍数
    pub multiplier: f64,
    /// 单次间隔上限
    pub max_interval: Duration,
    /// 一次故障内的总重试时间上限
    pub max_elapsed_time: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Duration::from_secs(60),
        }
    }
}

/// 指数退避计时器
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    current: Duration,
    started: Option<Instant>,
}

impl ExponentialBackoff {
    /// 创建新的退避计时器
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            current: settings.initial_interval,
            started: None,
        }
    }

    /// 下一次重试前的等待时间，预算耗尽时返回 `None`
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let started = *self.started.get_or_insert_with(Instant::now);
        let elapsed = started.elapsed();
        if elapsed >= self.settings.max_elapsed_time {
            return None;
        }

        let delay = self
            .current
            .min(self.settings.max_elapsed_time - elapsed)
            .min(self.settings.max_interval);
        let next = self.current.mul_f64(self.settings.multiplier.max(1.0));
        self.current = next.min(self.settings.max_interval);
        Some(delay)
    }

    /// 自上次重置以来的重试时间
    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    /// 故障恢复后重置
    pub fn reset(&mut self) {
        self.current = self.settings.initial_interval;
        self.started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    fn recording_watcher() -> (WatcherFunc, Arc<Mutex<Vec<ChangeEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let watcher: WatcherFunc = Arc::new(move |event| sink.lock().unwrap().push(event));
        (watcher, events)
    }

    #[tokio::test]
    async fn test_value_updated_invokes_watcher_once() {
        let scope = WatchScope::new(&CancellationToken::new());
        let (watcher, events) = recording_watcher();
        let (tx, rx) = oneshot::channel::<()>();

        let registration = scope.spawn(watcher, |_| async move {
            let _ = rx.await;
            WatchOutcome::ValueUpdated("test".to_string())
        });
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while !registration.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        registration.close().await.unwrap();
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_update());
    }

    #[tokio::test]
    async fn test_close_resolves_as_session_closed() {
        let scope = WatchScope::new(&CancellationToken::new());
        let (watcher, events) = recording_watcher();

        let registration = scope.spawn(watcher, |_| std::future::pending());
        registration.close().await.unwrap();

        assert!(events.lock().unwrap().is_empty());
        assert_eq!(scope.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_failed_outcome_reports_error() {
        let scope = WatchScope::new(&CancellationToken::new());
        let (watcher, events) = recording_watcher();

        let registration = scope.spawn(watcher, |_| async {
            WatchOutcome::Failed(ConfigSourceError::Watch("broken".to_string()))
        });
        tokio::time::timeout(Duration::from_secs(1), async {
            while !registration.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        registration.close().await.unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].is_update());
    }

    #[tokio::test]
    async fn test_scope_shutdown_is_idempotent() {
        let parent = CancellationToken::new();
        let scope = WatchScope::new(&parent);
        let (watcher, events) = recording_watcher();

        let _registration = scope.spawn(watcher, |_| std::future::pending());
        scope.shutdown().await;
        scope.shutdown().await;

        assert_eq!(scope.active_tasks(), 0);
        assert!(events.lock().unwrap().is_empty());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = ExponentialBackoff::new(BackoffSettings {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_millis(300),
            max_elapsed_time: Duration::from_secs(60),
        });

        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(300)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(300)));

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_backoff_exhausts_budget() {
        let mut backoff = ExponentialBackoff::new(BackoffSettings {
            max_elapsed_time: Duration::ZERO,
            ..BackoffSettings::default()
        });
        assert_eq!(backoff.next_backoff(), None);
    }
}
