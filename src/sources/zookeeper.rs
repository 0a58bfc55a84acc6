//! ZooKeeper 配置源
//!
//! 选择器为节点路径。以 `/*` 结尾时读取该节点的所有子节点，
//! 返回 子节点名 -> 数据 的映射，并监控子节点列表。

use super::tree::{retrieve_tree_key, TreeClient, TreeError, TreeValue, TreeWatch};
use crate::error::{ConfigSourceError, Result};
use crate::source::{
    decode_params, downcast_settings, unmarshal_onto, BackoffSettings, ConfigSource, CreateParams,
    Factory, NoParams, Retrieved, SourceSettings, WatchScope, WatcherFunc,
};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zookeeper_client as zk;

/// 配置源类型名
pub const TYPE: &str = "zookeeper";

/// ZooKeeper 配置源设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ZookeeperSettings {
    /// 集群地址列表，例如 `127.0.0.1:2181`
    pub endpoints: Vec<String>,
    /// 连接超时（秒）
    pub timeout: u64,
}

impl Default for ZookeeperSettings {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            timeout: 10,
        }
    }
}

impl ZookeeperSettings {
    pub fn validate(&self) -> Result<String> {
        let invalid = |reason: &str| ConfigSourceError::InvalidSettings {
            source_type: TYPE.to_string(),
            reason: reason.to_string(),
        };
        if self.endpoints.is_empty() {
            return Err(invalid("至少需要配置一个 endpoint"));
        }
        if self.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(invalid("endpoint 不能为空"));
        }
        if self.timeout == 0 {
            return Err(invalid("timeout 必须大于 0"));
        }
        Ok(self.endpoints.join(","))
    }
}

/// 解析后的选择器
#[derive(Debug, Clone, PartialEq, Eq)]
enum ZkSelector {
    Node(String),
    Children(String),
}

impl ZkSelector {
    fn parse(selector: &str) -> Result<Self> {
        let invalid = |reason: &str| ConfigSourceError::InvalidReference {
            reference: selector.to_string(),
            reason: reason.to_string(),
        };
        if !selector.starts_with('/') {
            return Err(invalid("节点路径必须以 / 开头"));
        }

        match selector.strip_suffix("/*") {
            Some(prefix) if !prefix.contains('*') => {
                let prefix = if prefix.is_empty() { "/" } else { prefix };
                Ok(ZkSelector::Children(prefix.to_string()))
            }
            Some(_) => Err(invalid("通配符只能出现在路径末尾")),
            None if selector.contains('*') => Err(invalid("通配符只能以 /* 的形式出现在路径末尾")),
            None => Ok(ZkSelector::Node(selector.to_string())),
        }
    }
}

fn classify(error: zk::Error) -> TreeError {
    let retryable = matches!(
        error,
        zk::Error::ConnectionLoss | zk::Error::SessionExpired | zk::Error::Timeout
    );
    let not_found = matches!(error, zk::Error::NoNode);
    let error = ConfigSourceError::Transport(format!("ZooKeeper 错误: {error}"));
    if not_found {
        TreeError::not_found(error)
    } else if retryable {
        TreeError::transient(error)
    } else {
        TreeError::fatal(error)
    }
}

fn data_value(path: &str, data: Vec<u8>) -> std::result::Result<Value, TreeError> {
    String::from_utf8(data).map(Value::String).map_err(|e| {
        TreeError::fatal(ConfigSourceError::NonUtf8Value {
            location: format!("ZooKeeper 节点 {path}"),
            source: e,
        })
    })
}

/// ZooKeeper 客户端包装
pub struct ZkTreeClient {
    client: zk::Client,
}

impl std::fmt::Debug for ZkTreeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZkTreeClient").finish()
    }
}

impl ZkTreeClient {
    pub async fn connect(settings: &ZookeeperSettings) -> Result<Self> {
        let cluster = settings.validate()?;
        let timeout = Duration::from_secs(settings.timeout);
        let client = tokio::time::timeout(timeout, zk::Client::connect(&cluster))
            .await
            .map_err(|_| {
                ConfigSourceError::Transport(format!("连接 ZooKeeper {cluster} 超时"))
            })?
            .map_err(|e| ConfigSourceError::Transport(format!("连接 ZooKeeper {cluster} 失败: {e}")))?;
        Ok(Self { client })
    }

    async fn read_children(
        &self,
        prefix: &str,
        names: Vec<String>,
    ) -> std::result::Result<Mapping, TreeError> {
        let mut children = Mapping::new();
        for name in names {
            let path = format!("{}/{}", prefix.trim_end_matches('/'), name);
            match self.client.get_data(&path).await {
                Ok((data, _)) => {
                    let value = data_value(&path, data)?;
                    children.insert(Value::String(name), value);
                }
                // 子节点在读取列表后被删除，跳过
                Err(zk::Error::NoNode) => continue,
                Err(e) => return Err(classify(e)),
            }
        }
        Ok(children)
    }

    async fn read(
        &self,
        selector: &ZkSelector,
    ) -> std::result::Result<(TreeValue, zk::OneshotWatcher), TreeError> {
        match selector {
            ZkSelector::Node(path) => {
                let (data, stat, watcher) =
                    self.client.get_and_watch_data(path).await.map_err(classify)?;
                Ok((
                    TreeValue {
                        value: data_value(path, data)?,
                        revision: stat.mzxid as u64,
                    },
                    watcher,
                ))
            }
            ZkSelector::Children(prefix) => {
                let (names, stat, watcher) = self
                    .client
                    .get_and_watch_children(prefix)
                    .await
                    .map_err(classify)?;
                let children = self.read_children(prefix, names).await?;
                Ok((
                    TreeValue {
                        value: Value::Mapping(children),
                        revision: stat.pzxid as u64,
                    },
                    watcher,
                ))
            }
        }
    }
}

#[async_trait]
impl TreeClient for ZkTreeClient {
    async fn get(&self, key: &str) -> std::result::Result<TreeValue, TreeError> {
        let selector = ZkSelector::parse(key).map_err(TreeError::fatal)?;
        let (value, _) = self.read(&selector).await?;
        Ok(value)
    }

    async fn watch(
        &self,
        key: &str,
        current: &TreeValue,
    ) -> std::result::Result<TreeWatch, TreeError> {
        let selector = ZkSelector::parse(key).map_err(TreeError::fatal)?;
        let (latest, watcher) = self.read(&selector).await?;
        if latest.revision != current.revision {
            return Ok(futures::future::ready(Ok(())).boxed());
        }

        let key = key.to_string();
        Ok(async move {
            let event = watcher.changed().await;
            if event.event_type == zk::EventType::Session {
                return Err(TreeError::transient(ConfigSourceError::Transport(format!(
                    "ZooKeeper 会话状态变化: {:?}",
                    event.session_state
                ))));
            }
            debug!("ZooKeeper 节点 {} 事件: {:?}", key, event.event_type);
            Ok(())
        }
        .boxed())
    }
}

/// ZooKeeper 配置源
#[derive(Debug)]
pub struct ZookeeperConfigSource {
    client: Arc<ZkTreeClient>,
    scope: WatchScope,
}

#[async_trait]
impl ConfigSource for ZookeeperConfigSource {
    async fn retrieve(
        &self,
        selector: &str,
        params: Option<&Mapping>,
        watcher: Option<WatcherFunc>,
    ) -> Result<Retrieved> {
        decode_params::<NoParams>(params)?;
        ZkSelector::parse(selector)?;
        retrieve_tree_key(
            &self.client,
            &self.scope,
            selector,
            watcher,
            BackoffSettings::default(),
        )
        .await
    }

    async fn shutdown(&self) -> Result<()> {
        self.scope.shutdown().await;
        Ok(())
    }
}

/// ZooKeeper 配置源工厂
#[derive(Debug, Default)]
pub struct ZookeeperFactory;

#[async_trait]
impl Factory for ZookeeperFactory {
    fn source_type(&self) -> &'static str {
        TYPE
    }

    fn create_default_settings(&self) -> Box<dyn SourceSettings> {
        Box::new(ZookeeperSettings::default())
    }

    fn unmarshal_settings(
        &self,
        defaults: &dyn SourceSettings,
        body: &Value,
    ) -> Result<Box<dyn SourceSettings>> {
        unmarshal_onto::<ZookeeperSettings>(defaults, body)
    }

    async fn create_config_source(
        &self,
        params: &CreateParams,
        settings: &dyn SourceSettings,
    ) -> Result<Arc<dyn ConfigSource>> {
        let settings = downcast_settings::<ZookeeperSettings>(settings, TYPE)?;
        let client = ZkTreeClient::connect(settings).await?;
        info!(
            "创建 ZooKeeper 配置源 {}，集群: {}",
            params.name,
            settings.endpoints.join(",")
        );
        Ok(Arc::new(ZookeeperConfigSource {
            client: Arc::new(client),
            scope: WatchScope::new(&params.cancel),
        }))
    }
}
