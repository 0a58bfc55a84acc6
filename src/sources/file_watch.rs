//! 共享文件监控
//!
//! 同一个配置源实例内所有被监控的文件共用一个系统监控句柄，按路径计数引用。
//! 第一次引用某路径时开始监控，最后一个引用释放时停止监控；没有任何路径时
//! 关闭系统句柄。

use crate::error::{ConfigSourceError, Result};
use crate::source::{WatchOutcome, WatchRegistration, WatchScope, WatcherFunc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// 文件系统事件
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// 文件被写入或创建
    Written(PathBuf),
    /// 系统监控报告的错误
    Error(String),
}

#[derive(Default)]
struct HubState {
    watcher: Option<RecommendedWatcher>,
    paths: HashMap<PathBuf, usize>,
}

/// 共享文件监控器
pub struct FileWatchHub {
    state: Mutex<HubState>,
    events: broadcast::Sender<HubEvent>,
}

impl std::fmt::Debug for FileWatchHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatchHub")
            .field("watched_paths", &self.watched_paths())
            .finish()
    }
}

impl FileWatchHub {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 订阅文件事件
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// 系统监控句柄是否存在
    pub fn is_active(&self) -> bool {
        self.lock().watcher.is_some()
    }

    /// 正在监控的路径数
    pub fn watched_paths(&self) -> usize {
        self.lock().paths.len()
    }

    /// 某路径的引用数
    pub fn reference_count(&self, path: &Path) -> usize {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.lock().paths.get(&path).copied().unwrap_or(0)
    }

    /// 增加路径引用，首次引用时开始监控
    ///
    /// # 返回
    /// * `PathGuard` - 释放时减少引用
    pub fn add_path(self: &Arc<Self>, path: &Path) -> Result<PathGuard> {
        let path = std::fs::canonicalize(path).map_err(|e| ConfigSourceError::MissingFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut state = self.lock();
        let count = state.paths.get(&path).copied().unwrap_or(0);
        if count == 0 {
            if state.watcher.is_none() {
                state.watcher = Some(self.create_watcher()?);
                info!("文件监控器已启动");
            }
            if let Some(watcher) = state.watcher.as_mut() {
                watcher.watch(&path, RecursiveMode::NonRecursive)?;
            }
            debug!("开始监控文件: {}", path.display());
        }
        state.paths.insert(path.clone(), count + 1);

        Ok(PathGuard {
            hub: Arc::clone(self),
            path,
        })
    }

    fn release_path(&self, path: &Path) {
        let mut state = self.lock();
        let remaining = match state.paths.get_mut(path) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining > 0 {
            return;
        }

        state.paths.remove(path);
        if let Some(watcher) = state.watcher.as_mut() {
            if let Err(e) = watcher.unwatch(path) {
                debug!("取消监控文件 {} 失败: {}", path.display(), e);
            }
        }
        debug!("停止监控文件: {}", path.display());

        if state.paths.is_empty() && state.watcher.take().is_some() {
            info!("没有被监控的文件，文件监控器已关闭");
        }
    }

    fn create_watcher(&self) -> Result<RecommendedWatcher> {
        let sender = self.events.clone();
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if is_write_event(&event) {
                        for path in event.paths {
                            let _ = sender.send(HubEvent::Written(path));
                        }
                    }
                }
                Err(e) => {
                    let _ = sender.send(HubEvent::Error(e.to_string()));
                }
            },
            notify::Config::default(),
        )?;
        Ok(watcher)
    }

    /// 监控单个文件的下一次写入
    ///
    /// # 参数
    /// * `path` - 文件路径
    /// * `scope` - 所属配置源的监控作用域
    /// * `watcher` - 变更回调
    pub fn watch_file(
        self: &Arc<Self>,
        path: &Path,
        scope: &WatchScope,
        watcher: WatcherFunc,
    ) -> Result<WatchRegistration> {
        let mut events = self.subscribe();
        let guard = self.add_path(path)?;

        Ok(scope.spawn(watcher, move |_| async move {
            let outcome = wait_for_write(&mut events, guard.path()).await;
            drop(guard);
            outcome
        }))
    }

    /// 停止所有监控，可重复调用
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.paths.clear();
        if state.watcher.take().is_some() {
            info!("文件监控器已关闭");
        }
    }
}

fn is_write_event(event: &Event) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
}

async fn wait_for_write(events: &mut broadcast::Receiver<HubEvent>, target: &Path) -> WatchOutcome {
    loop {
        match events.recv().await {
            Ok(HubEvent::Written(path)) if path == target => {
                return WatchOutcome::ValueUpdated(format!("文件已修改: {}", target.display()));
            }
            Ok(HubEvent::Written(_)) => continue,
            Ok(HubEvent::Error(e)) => {
                return WatchOutcome::Failed(ConfigSourceError::Watch(e));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("文件事件积压，跳过 {} 个事件，按已修改处理", skipped);
                return WatchOutcome::ValueUpdated(format!(
                    "文件事件积压，可能已修改: {}",
                    target.display()
                ));
            }
            Err(broadcast::error::RecvError::Closed) => return WatchOutcome::SessionClosed,
        }
    }
}

/// 路径引用，释放时减少计数
pub struct PathGuard {
    hub: Arc<FileWatchHub>,
    path: PathBuf,
}

impl PathGuard {
    /// 规范化后的路径
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        self.hub.release_path(&self.path);
    }
}
