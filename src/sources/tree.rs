//! 树形存储的通用读取与监控
//!
//! etcd 与 ZooKeeper 这类"读取并挂监控"的后端共用这里的监控循环：
//! 等待监控触发；遇到可重试错误按指数退避重新读取并重新挂监控；
//! 不可重试错误或退避预算耗尽时作为终止错误返回。

use crate::error::{ConfigSourceError, Result};
use crate::source::{
    BackoffSettings, ExponentialBackoff, Retrieved, WatchOutcome, WatchScope, WatcherFunc,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_yaml::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// 读取到的节点值
#[derive(Debug, Clone, PartialEq)]
pub struct TreeValue {
    /// 节点值（子节点列表时为映射）
    pub value: Value,
    /// 后端的修订号，用于判断值是否变化
    pub revision: u64,
}

/// 树形存储错误的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeErrorKind {
    /// 连接中断、超时等，可以重试
    Transient,
    /// 节点不存在
    NotFound,
    /// 其他不可恢复的错误
    Fatal,
}

/// 树形存储错误
#[derive(Debug)]
pub struct TreeError {
    pub kind: TreeErrorKind,
    pub error: ConfigSourceError,
}

impl TreeError {
    pub fn transient(error: ConfigSourceError) -> Self {
        Self {
            kind: TreeErrorKind::Transient,
            error,
        }
    }

    pub fn not_found(error: ConfigSourceError) -> Self {
        Self {
            kind: TreeErrorKind::NotFound,
            error,
        }
    }

    pub fn fatal(error: ConfigSourceError) -> Self {
        Self {
            kind: TreeErrorKind::Fatal,
            error,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == TreeErrorKind::Transient
    }
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

/// 已挂上的监控，完成即表示节点（或子节点列表）发生了变化
pub type TreeWatch = BoxFuture<'static, std::result::Result<(), TreeError>>;

/// 树形存储客户端
#[async_trait]
pub trait TreeClient: Send + Sync + 'static {
    /// 读取节点
    async fn get(&self, key: &str) -> std::result::Result<TreeValue, TreeError>;

    /// 相对于 `current` 挂上监控
    ///
    /// 如果节点已经不同于 `current`，返回的 future 应立即完成。
    async fn watch(
        &self,
        key: &str,
        current: &TreeValue,
    ) -> std::result::Result<TreeWatch, TreeError>;
}

/// 读取节点，需要时挂上监控
///
/// # 参数
/// * `client` - 树形存储客户端
/// * `scope` - 配置源的监控作用域
/// * `key` - 节点路径
/// * `watcher` - 变更回调
/// * `backoff` - 监控重试参数
pub async fn retrieve_tree_key<C: TreeClient>(
    client: &Arc<C>,
    scope: &WatchScope,
    key: &str,
    watcher: Option<WatcherFunc>,
    backoff: BackoffSettings,
) -> Result<Retrieved> {
    let current = client.get(key).await.map_err(|e| match e.kind {
        TreeErrorKind::NotFound => ConfigSourceError::NoValueAtPath {
            path: key.to_string(),
            key: key.to_string(),
        },
        _ => e.error,
    })?;

    let Some(watcher) = watcher else {
        return Ok(Retrieved::new(current.value));
    };

    let first = client.watch(key, &current).await.map_err(|e| e.error)?;
    let value = current.value.clone();
    let client = Arc::clone(client);
    let key = key.to_string();
    let registration = scope.spawn(watcher, move |_| {
        watch_tree_key(client, key, current, first, backoff)
    });
    Ok(Retrieved::new(value).with_watch(registration))
}

/// 监控循环
pub async fn watch_tree_key<C: TreeClient + ?Sized>(
    client: Arc<C>,
    key: String,
    initial: TreeValue,
    first: TreeWatch,
    settings: BackoffSettings,
) -> WatchOutcome {
    let mut pending = first;
    let mut backoff = ExponentialBackoff::new(settings);

    loop {
        let error = match pending.await {
            Ok(()) => return WatchOutcome::ValueUpdated(format!("节点已变更: {key}")),
            Err(e) if e.kind == TreeErrorKind::NotFound => {
                return WatchOutcome::ValueUpdated(format!("节点已删除: {key}"))
            }
            Err(e) if !e.is_retryable() => return WatchOutcome::Failed(e.error),
            Err(e) => e,
        };

        pending = match rearm(&*client, &key, &initial, &mut backoff, error).await {
            Ok(Rearm::Watch(watch)) => {
                backoff.reset();
                watch
            }
            Ok(Rearm::Changed) => {
                return WatchOutcome::ValueUpdated(format!("重新读取时发现节点已变更: {key}"))
            }
            Err(outcome) => return outcome,
        };
    }
}

enum Rearm {
    Watch(TreeWatch),
    Changed,
}

async fn rearm<C: TreeClient + ?Sized>(
    client: &C,
    key: &str,
    initial: &TreeValue,
    backoff: &mut ExponentialBackoff,
    mut last_error: TreeError,
) -> std::result::Result<Rearm, WatchOutcome> {
    loop {
        let Some(delay) = backoff.next_backoff() else {
            return Err(WatchOutcome::Failed(ConfigSourceError::BackoffExhausted {
                elapsed: backoff.elapsed(),
                last_error: last_error.to_string(),
            }));
        };
        warn!("监控节点 {} 出错，{:?} 后重试: {}", key, delay, last_error);
        tokio::time::sleep(delay).await;

        let latest = match client.get(key).await {
            Ok(latest) => latest,
            Err(e) if e.kind == TreeErrorKind::NotFound => return Ok(Rearm::Changed),
            Err(e) if e.is_retryable() => {
                last_error = e;
                continue;
            }
            Err(e) => return Err(WatchOutcome::Failed(e.error)),
        };
        if latest != *initial {
            return Ok(Rearm::Changed);
        }

        match client.watch(key, initial).await {
            Ok(watch) => {
                debug!("节点 {} 的监控已重新挂上", key);
                return Ok(Rearm::Watch(watch));
            }
            Err(e) if e.is_retryable() => last_error = e,
            Err(e) if e.kind == TreeErrorKind::NotFound => return Ok(Rearm::Changed),
            Err(e) => return Err(WatchOutcome::Failed(e.error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ChangeEvent;
    use futures::FutureExt;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// 按脚本返回结果的客户端
    #[derive(Default)]
    struct ScriptedClient {
        gets: Mutex<VecDeque<std::result::Result<TreeValue, TreeError>>>,
        watches: Mutex<VecDeque<std::result::Result<(), TreeError>>>,
    }

    impl ScriptedClient {
        fn push_get(&self, result: std::result::Result<TreeValue, TreeError>) {
            self.gets.lock().unwrap().push_back(result);
        }

        fn push_watch(&self, result: std::result::Result<(), TreeError>) {
            self.watches.lock().unwrap().push_back(result);
        }
    }

    #[async_trait]
    impl TreeClient for ScriptedClient {
        async fn get(&self, _key: &str) -> std::result::Result<TreeValue, TreeError> {
            self.gets
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TreeError::fatal(ConfigSourceError::Transport("没有更多脚本".into()))))
        }

        async fn watch(
            &self,
            _key: &str,
            _current: &TreeValue,
        ) -> std::result::Result<TreeWatch, TreeError> {
            match self.watches.lock().unwrap().pop_front() {
                Some(result) => Ok(async move { result }.boxed()),
                None => Ok(std::future::pending().boxed()),
            }
        }
    }

    fn value(v: &str, revision: u64) -> TreeValue {
        TreeValue {
            value: Value::from(v),
            revision,
        }
    }

    fn transient() -> TreeError {
        TreeError::transient(ConfigSourceError::Transport("连接断开".into()))
    }

    fn fast_backoff() -> BackoffSettings {
        BackoffSettings {
            initial_interval: Duration::from_millis(10),
            multiplier: 1.5,
            max_interval: Duration::from_millis(50),
            max_elapsed_time: Duration::from_secs(5),
        }
    }

    fn channel_watcher() -> (WatcherFunc, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher: WatcherFunc = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (watcher, rx)
    }

    #[tokio::test]
    async fn test_watch_event_resolves_as_updated() {
        let client = Arc::new(ScriptedClient::default());
        client.push_watch(Ok(()));
        let outcome = watch_tree_key(
            client.clone(),
            "/k".to_string(),
            value("a", 1),
            client.watch("/k", &value("a", 1)).await.unwrap(),
            fast_backoff(),
        )
        .await;
        assert!(outcome.is_updated());
    }

    #[tokio::test]
    async fn test_transient_error_rearms_and_keeps_watching() {
        let client = Arc::new(ScriptedClient::default());
        client.push_watch(Err(transient()));
        client.push_get(Err(transient()));
        client.push_get(Ok(value("a", 1)));
        client.push_watch(Ok(()));

        let first = client.watch("/k", &value("a", 1)).await.unwrap();
        let outcome =
            watch_tree_key(client.clone(), "/k".to_string(), value("a", 1), first, fast_backoff())
                .await;
        assert!(outcome.is_updated());
        assert!(client.gets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_change_detected_while_rearming() {
        let client = Arc::new(ScriptedClient::default());
        client.push_watch(Err(transient()));
        client.push_get(Ok(value("b", 2)));

        let first = client.watch("/k", &value("a", 1)).await.unwrap();
        let outcome =
            watch_tree_key(client.clone(), "/k".to_string(), value("a", 1), first, fast_backoff())
                .await;
        assert!(outcome.is_updated());
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_terminal() {
        let client = Arc::new(ScriptedClient::default());
        client.push_watch(Err(TreeError::fatal(ConfigSourceError::Transport(
            "权限不足".into(),
        ))));

        let first = client.watch("/k", &value("a", 1)).await.unwrap();
        let outcome =
            watch_tree_key(client.clone(), "/k".to_string(), value("a", 1), first, fast_backoff())
                .await;
        assert!(matches!(outcome, WatchOutcome::Failed(ConfigSourceError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_exhaustion_is_terminal() {
        let client = Arc::new(ScriptedClient::default());
        client.push_watch(Err(transient()));
        for _ in 0..1000 {
            client.push_get(Err(transient()));
        }

        let first = client.watch("/k", &value("a", 1)).await.unwrap();
        let outcome = watch_tree_key(
            client.clone(),
            "/k".to_string(),
            value("a", 1),
            first,
            BackoffSettings::default(),
        )
        .await;
        assert!(matches!(
            outcome,
            WatchOutcome::Failed(ConfigSourceError::BackoffExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_retrieve_with_watch_and_close() {
        let client = Arc::new(ScriptedClient::default());
        client.push_get(Ok(value("v", 1)));
        let scope = WatchScope::new(&CancellationToken::new());
        let (watcher, mut rx) = channel_watcher();

        let retrieved = retrieve_tree_key(&client, &scope, "/k", Some(watcher), fast_backoff())
            .await
            .unwrap();
        assert_eq!(retrieved.value(), &Value::from("v"));
        assert!(retrieved.is_watched());

        retrieved.close().await.unwrap();
        assert!(rx.recv().await.is_none());
        assert_eq!(scope.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_retrieve_missing_key() {
        let client = Arc::new(ScriptedClient::default());
        client.push_get(Err(TreeError::not_found(ConfigSourceError::Transport(
            "no node".into(),
        ))));
        let scope = WatchScope::new(&CancellationToken::new());
        let err = retrieve_tree_key(&client, &scope, "/missing", None, fast_backoff())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigSourceError::NoValueAtPath { .. }));
    }
}
