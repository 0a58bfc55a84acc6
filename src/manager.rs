//! 配置管理器模块
//!
//! 管理器拥有一代配置源和检索结果：每次解析构建新的一代，成功后替换旧的一代
//! 并关闭旧的检索和配置源；失败时保留旧的一代和旧的文档。
//! 监控回调带有代号，旧一代残留的事件会被忽略。

use crate::document::{merge_documents, DocumentSource};
use crate::error::{ConfigSourceError, Result};
use crate::resolver::{Resolution, Resolver, ResolverOptions};
use crate::source::{
    build_config_sources, settings_from_document, shutdown_config_sources, ChangeEvent,
    CloseHandle, ConfigSource, Factories, WatchOutcome, WatcherFunc,
};
use chrono::{DateTime, Utc};
use serde_yaml::Mapping;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 管理器选项
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    pub resolver: ResolverOptions,
    /// 更新通知通道容量
    pub update_channel_capacity: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            resolver: ResolverOptions::default(),
            update_channel_capacity: 32,
        }
    }
}

/// 配置变更通知
#[derive(Debug, Clone)]
pub struct ConfigUpdateNotification {
    /// 配置版本号
    pub version: u64,
    /// 合并后的完整文档
    pub document: Arc<Mapping>,
    /// 变更时间
    pub timestamp: DateTime<Utc>,
}

/// 一代配置源及其检索结果
struct Generation {
    id: u64,
    sources: BTreeMap<String, Arc<dyn ConfigSource>>,
    close: CloseHandle,
}

impl Generation {
    async fn close(self) -> Result<()> {
        debug!("关闭第 {} 代配置源", self.id);
        let mut errors = Vec::new();
        if let Err(e) = self.close.close().await {
            errors.push(e);
        }
        if let Err(e) = shutdown_config_sources(&self.sources).await {
            errors.push(e);
        }
        match ConfigSourceError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct State {
    accumulated: Mapping,
    generation: Option<Generation>,
    next_generation: u64,
    /// 失败的解析留下的文档监控，下次成功后关闭
    orphaned: CloseHandle,
}

type TaggedEvent = (u64, ChangeEvent);

/// 配置管理器
pub struct ConfigManager {
    factories: Factories,
    document_source: Arc<dyn DocumentSource>,
    options: ManagerOptions,
    state: Mutex<State>,
    effective: RwLock<Arc<Mapping>>,
    initial: RwLock<Arc<Mapping>>,
    version: AtomicU64,
    current_generation: AtomicU64,
    change_sender: mpsc::UnboundedSender<TaggedEvent>,
    change_receiver: Mutex<mpsc::UnboundedReceiver<TaggedEvent>>,
    update_sender: broadcast::Sender<ConfigUpdateNotification>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("document_source", &self.document_source.describe())
            .field("version", &self.version())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl ConfigManager {
    /// 创建配置管理器
    ///
    /// # 参数
    /// * `factories` - 配置源工厂注册表
    /// * `document_source` - 原始文档来源
    /// * `options` - 管理器选项
    pub fn new(
        factories: Factories,
        document_source: Arc<dyn DocumentSource>,
        options: ManagerOptions,
    ) -> Self {
        let (change_sender, change_receiver) = mpsc::unbounded_channel();
        let (update_sender, _) = broadcast::channel(options.update_channel_capacity.max(1));

        Self {
            factories,
            document_source,
            options,
            state: Mutex::new(State {
                next_generation: 1,
                ..State::default()
            }),
            effective: RwLock::new(Arc::new(Mapping::new())),
            initial: RwLock::new(Arc::new(Mapping::new())),
            version: AtomicU64::new(0),
            current_generation: AtomicU64::new(0),
            change_sender,
            change_receiver: Mutex::new(change_receiver),
            update_sender,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn watcher_for(&self, generation: u64) -> WatcherFunc {
        let sender = self.change_sender.clone();
        Arc::new(move |event| {
            let _ = sender.send((generation, event));
        })
    }

    /// 执行一次完整解析
    ///
    /// 同一时间只有一次解析在进行。成功时把结果合并进累积文档，替换当前一代并关闭旧一代；
    /// 失败时新构建的配置源会被关闭，当前一代保持不变。
    ///
    /// # 返回
    /// * `Result<Arc<Mapping>>` - 合并后的文档
    pub async fn resolve(&self) -> Result<Arc<Mapping>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConfigSourceError::Cancelled);
        }

        let mut state = self.state.lock().await;
        // 等锁期间可能已经关闭
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConfigSourceError::Cancelled);
        }
        let id = state.next_generation;
        state.next_generation += 1;
        let watcher = self.watcher_for(id);

        info!(
            "开始第 {} 代配置解析: {}",
            id,
            self.document_source.describe()
        );
        let raw = self.document_source.load(Some(watcher.clone())).await?;

        let (sources, resolution) = match self.run_pass(&raw.document, watcher).await {
            Ok(pass) => pass,
            Err(e) => {
                state.orphaned.extend(raw.close);
                return Err(e);
            }
        };

        let mut close = raw.close;
        close.extend(resolution.close);
        merge_documents(&mut state.accumulated, resolution.document);
        let previous = state.generation.replace(Generation { id, sources, close });
        let orphaned = std::mem::take(&mut state.orphaned);
        self.current_generation.store(id, Ordering::SeqCst);

        let document = Arc::new(state.accumulated.clone());
        *self.effective.write().await = Arc::clone(&document);
        *self.initial.write().await = Arc::new(raw.document);
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                warn!("关闭旧一代配置源出错: {}", e);
            }
        }
        if let Err(e) = orphaned.close().await {
            warn!("关闭失败解析遗留的文档监控出错: {}", e);
        }

        let notification = ConfigUpdateNotification {
            version,
            document: Arc::clone(&document),
            timestamp: Utc::now(),
        };
        if self.update_sender.send(notification).is_err() {
            debug!("没有配置更新订阅者");
        }

        info!("配置解析完成，版本: {}", version);
        Ok(document)
    }

    async fn run_pass(
        &self,
        document: &Mapping,
        watcher: WatcherFunc,
    ) -> Result<(BTreeMap<String, Arc<dyn ConfigSource>>, Resolution)> {
        let (settings, rest) = settings_from_document(document, &self.factories)?;
        let sources = build_config_sources(&settings, &self.factories, &self.cancel).await?;

        let resolver = Resolver::new(sources.clone(), self.options.resolver, self.cancel.clone());
        match resolver.resolve(&rest, Some(watcher)).await {
            Ok(resolution) => Ok((sources, resolution)),
            Err(e) => {
                if let Err(close_err) = shutdown_config_sources(&sources).await {
                    warn!("解析失败后关闭配置源出错: {}", close_err);
                }
                Err(e)
            }
        }
    }

    /// 重新解析，语义与 [`ConfigManager::resolve`] 相同
    pub async fn reload(&self) -> Result<Arc<Mapping>> {
        self.resolve().await
    }

    /// 等待当前一代的下一个变更事件
    ///
    /// # 返回
    /// * `WatchOutcome::ValueUpdated` - 某个被监控的值发生了变化
    /// * `WatchOutcome::SessionClosed` - 管理器已关闭
    /// * `WatchOutcome::Failed` - 某个监控失败
    pub async fn watch_for_update(&self) -> WatchOutcome {
        let mut receiver = self.change_receiver.lock().await;
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return WatchOutcome::SessionClosed,
                event = receiver.recv() => event,
            };

            let Some((generation, event)) = event else {
                return WatchOutcome::SessionClosed;
            };
            if generation < self.current_generation.load(Ordering::SeqCst) {
                debug!("忽略第 {} 代的过期变更事件", generation);
                continue;
            }
            return match event.error {
                None => WatchOutcome::ValueUpdated(format!("第 {generation} 代配置发生变化")),
                Some(error) => WatchOutcome::Failed(error),
            };
        }
    }

    /// 请求一次重新加载（例如收到 SIGHUP）
    pub fn request_reload(&self) {
        let generation = self.current_generation.load(Ordering::SeqCst);
        if self
            .change_sender
            .send((generation, ChangeEvent::updated()))
            .is_err()
        {
            warn!("重新加载请求发送失败");
        }
    }

    /// 重载循环
    ///
    /// 值更新时重新加载；重新加载失败时记录错误并保留旧配置；
    /// 管理器关闭时正常返回；监控失败时返回该错误。
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.watch_for_update().await {
                WatchOutcome::ValueUpdated(reason) => {
                    info!("检测到配置变更: {}", reason);
                    if let Err(e) = self.reload().await {
                        if self.closed.load(Ordering::SeqCst) {
                            return Ok(());
                        }
                        error!("重新加载配置失败，继续使用旧配置: {}", e);
                    }
                }
                WatchOutcome::SessionClosed => {
                    info!("配置监控会话已关闭");
                    return Ok(());
                }
                WatchOutcome::Failed(e) => {
                    error!("配置监控失败: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// 合并后的当前文档
    pub async fn effective(&self) -> Arc<Mapping> {
        Arc::clone(&*self.effective.read().await)
    }

    /// 最近一次成功解析时的原始文档
    pub async fn initial(&self) -> Arc<Mapping> {
        Arc::clone(&*self.initial.read().await)
    }

    /// 当前配置版本号，每次成功解析加一
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// 订阅配置更新通知
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigUpdateNotification> {
        self.update_sender.subscribe()
    }

    /// 管理器的根取消令牌
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 关闭管理器，可重复调用
    ///
    /// 先取消所有进行中的检索和监控，再关闭当前一代的检索结果和配置源。
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("关闭配置管理器");
        self.cancel.cancel();

        let mut state = self.state.lock().await;
        let mut errors = Vec::new();
        if let Some(generation) = state.generation.take() {
            if let Err(e) = generation.close().await {
                errors.push(e);
            }
        }
        if let Err(e) = std::mem::take(&mut state.orphaned).close().await {
            errors.push(e);
        }
        if let Err(e) = self.document_source.shutdown().await {
            errors.push(e);
        }

        match ConfigSourceError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
