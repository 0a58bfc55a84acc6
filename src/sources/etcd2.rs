//! etcd v2 配置源
//!
//! 通过 etcd v2 keys HTTP 接口读取键值，监控使用 `wait=true&waitIndex=N` 长轮询。
//! 多个端点按顺序尝试，连接失败时切换到下一个。

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
use tracing::{debug, info, warn};
use url::Url;

/// 配置源类型名
pub const TYPE: &str = "etcd2";

/// etcd v2 错误码：键不存在
const ERROR_KEY_NOT_FOUND: u64 = 100;
/// etcd v2 错误码：等待的索引已被清理
const ERROR_EVENT_INDEX_CLEARED: u64 = 401;

/// etcd v2 配置源设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Etcd2Settings {
    /// etcd 端点列表
    pub endpoints: Vec<String>,
    /// 读取请求超时（秒）
    pub timeout: u64,
    /// 基本认证用户名
    pub username: Option<String>,
    /// 基本认证密码
    pub password: Option<String>,
}

impl Default for Etcd2Settings {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            timeout: 5,
            username: None,
            password: None,
        }
    }
}

impl Etcd2Settings {
    /// 校验设置，不发起任何连接
    pub fn validate(&self) -> Result<Vec<Url>> {
        let invalid = |reason: String| ConfigSourceError::InvalidSettings {
            source_type: TYPE.to_string(),
            reason,
        };

        if self.endpoints.is_empty() {
            return Err(invalid("至少需要配置一个 endpoint".to_string()));
        }
        if self.timeout == 0 {
            return Err(invalid("timeout 必须大于 0".to_string()));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(invalid("username 与 password 必须同时设置".to_string()));
        }

        self.endpoints
            .iter()
            .map(|endpoint| {
                let url = Url::parse(endpoint)
                    .map_err(|e| invalid(format!("endpoint {endpoint:?} 无效: {e}")))?;
                match url.scheme() {
                    "http" | "https" => Ok(url),
                    scheme => Err(invalid(format!("endpoint {endpoint:?} 协议不支持: {scheme}"))),
                }
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    node: Node,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Node {
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    modified_index: u64,
}

impl Node {
    fn into_tree_value(self) -> TreeValue {
        if !self.dir {
            return TreeValue {
                value: Value::String(self.value.unwrap_or_default()),
                revision: self.modified_index,
            };
        }

        let mut revision = self.modified_index;
        let mut children = Mapping::new();
        for child in self.nodes {
            let name = child
                .key
                .as_deref()
                .and_then(|k| k.rsplit('/').next())
                .unwrap_or_default()
                .to_string();
            let child = child.into_tree_value();
            revision = revision.max(child.revision);
            children.insert(Value::String(name), child.value);
        }
        TreeValue {
            value: Value::Mapping(children),
            revision,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_code: u64,
    #[serde(default)]
    message: String,
}

enum Reply {
    Node(Node),
    IndexCleared,
}

/// etcd v2 HTTP 客户端
#[derive(Debug, Clone)]
pub struct Etcd2Client {
    http: reqwest::Client,
    endpoints: Vec<Url>,
    timeout: Duration,
    auth: Option<(String, String)>,
}

impl Etcd2Client {
    pub fn new(settings: &Etcd2Settings) -> Result<Self> {
        let endpoints = settings.validate()?;
        let http = reqwest::Client::builder().build()?;
        let auth = settings.username.clone().zip(settings.password.clone());
        Ok(Self {
            http,
            endpoints,
            timeout: Duration::from_secs(settings.timeout),
            auth,
        })
    }

    fn key_url(endpoint: &Url, key: &str) -> String {
        format!(
            "{}/v2/keys/{}",
            endpoint.as_str().trim_end_matches('/'),
            key.trim_start_matches('/')
        )
    }

    async fn request(
        &self,
        key: &str,
        query: &[(&str, String)],
        wait: bool,
    ) -> std::result::Result<Reply, TreeError> {
        let mut last_error = None;

        for endpoint in &self.endpoints {
            let mut request = self.http.get(Self::key_url(endpoint, key));
            if !query.is_empty() {
                request = request.query(query);
            }
            if !wait {
                request = request.timeout(self.timeout);
            }
            if let Some((username, password)) = &self.auth {
                request = request.basic_auth(username, Some(password));
            }

            match request.send().await {
                Ok(response) => return Self::decode(key, response).await,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    warn!("etcd 端点 {} 不可用: {}", endpoint, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(TreeError::transient(e.into())),
            }
        }

        Err(TreeError::transient(match last_error {
            Some(e) => e.into(),
            None => ConfigSourceError::Transport("没有可用的 etcd 端点".to_string()),
        }))
    }

    async fn decode(
        key: &str,
        response: reqwest::Response,
    ) -> std::result::Result<Reply, TreeError> {
        let status = response.status();
        if status.is_success() {
            let body: KeysResponse = response
                .json()
                .await
                .map_err(|e| TreeError::transient(e.into()))?;
            return Ok(Reply::Node(body.node));
        }

        let body = response.json::<ErrorBody>().await.ok();
        let message = match &body {
            Some(body) => format!("etcd 返回 {status}: {} (错误码 {})", body.message, body.error_code),
            None => format!("etcd 返回 {status}"),
        };
        let error = ConfigSourceError::Transport(message);

        match body.map(|b| b.error_code) {
            Some(ERROR_KEY_NOT_FOUND) => Err(TreeError::not_found(ConfigSourceError::NoValueAtPath {
                path: key.to_string(),
                key: key.to_string(),
            })),
            Some(ERROR_EVENT_INDEX_CLEARED) => Ok(Reply::IndexCleared),
            _ if status.is_server_error() => Err(TreeError::transient(error)),
            _ => Err(TreeError::fatal(error)),
        }
    }
}

#[async_trait]
impl TreeClient for Etcd2Client {
    async fn get(&self, key: &str) -> std::result::Result<TreeValue, TreeError> {
        match self.request(key, &[], false).await? {
            Reply::Node(node) => Ok(node.into_tree_value()),
            Reply::IndexCleared => Err(TreeError::transient(ConfigSourceError::Transport(
                "读取时收到意外的索引清理错误".to_string(),
            ))),
        }
    }

    async fn watch(
        &self,
        key: &str,
        current: &TreeValue,
    ) -> std::result::Result<TreeWatch, TreeError> {
        let client = self.clone();
        let key = key.to_string();
        let query = vec![
            ("wait", "true".to_string()),
            ("recursive", "true".to_string()),
            ("waitIndex", (current.revision + 1).to_string()),
        ];

        Ok(async move {
            match client.request(&key, &query, true).await? {
                Reply::Node(node) => {
                    debug!("etcd 键 {} 已变更，修订号 {}", key, node.modified_index);
                    Ok(())
                }
                // 等待的索引已被清理，无法确认是否错过变更，按已变更处理
                Reply::IndexCleared => Ok(()),
            }
        }
        .boxed())
    }
}

/// etcd v2 配置源
#[derive(Debug)]
pub struct Etcd2ConfigSource {
    client: Arc<Etcd2Client>,
    scope: WatchScope,
    backoff: BackoffSettings,
}

impl Etcd2ConfigSource {
    pub fn new(settings: &Etcd2Settings, cancel: &CancellationToken) -> Result<Self> {
        Ok(Self {
            client: Arc::new(Etcd2Client::new(settings)?),
            scope: WatchScope::new(cancel),
            backoff: BackoffSettings::default(),
        })
    }

    /// 替换监控重试参数
    pub fn with_backoff(mut self, backoff: BackoffSettings) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl ConfigSource for Etcd2ConfigSource {
    async fn retrieve(
        &self,
        selector: &str,
        params: Option<&Mapping>,
        watcher: Option<WatcherFunc>,
    ) -> Result<Retrieved> {
        decode_params::<NoParams>(params)?;
        retrieve_tree_key(&self.client, &self.scope, selector, watcher, self.backoff).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.scope.shutdown().await;
        Ok(())
    }
}

/// etcd v2 配置源工厂
#[derive(Debug, Default)]
pub struct Etcd2Factory;

#[async_trait]
impl Factory for Etcd2Factory {
    fn source_type(&self) -> &'static str {
        TYPE
    }

    fn create_default_settings(&self) -> Box<dyn SourceSettings> {
        Box::new(Etcd2Settings::default())
    }

    fn unmarshal_settings(
        &self,
        defaults: &dyn SourceSettings,
        body: &Value,
    ) -> Result<Box<dyn SourceSettings>> {
        unmarshal_onto::<Etcd2Settings>(defaults, body)
    }

    async fn create_config_source(
        &self,
        params: &CreateParams,
        settings: &dyn SourceSettings,
    ) -> Result<Arc<dyn ConfigSource>> {
        let settings = downcast_settings::<Etcd2Settings>(settings, TYPE)?;
        let source = Etcd2ConfigSource::new(settings, &params.cancel)?;
        info!(
            "创建 etcd v2 配置源 {}，端点: {}",
            params.name,
            settings.endpoints.join(", ")
        );
        Ok(Arc::new(source))
    }
}
