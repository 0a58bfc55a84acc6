//! Vault 配置源
//!
//! 每个配置源实例对应 Vault 中的一个路径。第一次检索时读取密钥并缓存，
//! 选择器是密钥 `data` 下以 `.` 分隔的键路径。
//!
//! 监控策略按密钥类型选择：
//! - 可续约：在租约过半时续约，续约失败或无法继续续约时视为值已更新
//! - 带租约：租约过半后视为值已更新
//! - KV v2：按 `poll_interval` 轮询 `metadata` 路径，版本变化视为值已更新
//! - 其他：不监控

use crate::error::{ConfigSourceError, Result};
use crate::source::{
    decode_params, downcast_settings, unmarshal_onto, ConfigSource, CreateParams, Factory,
    NoParams, Retrieved, SourceSettings, WatchOutcome, WatchRegistration, WatchScope, WatcherFunc,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_yaml::{Mapping, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// 配置源类型名
pub const TYPE: &str = "vault";

/// Vault 认证方式，`token` 与 `token_file` 必须且只能设置一个
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VaultAuth {
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
}

/// Vault 配置源设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VaultSettings {
    /// Vault 服务地址，例如 `https://vault:8200`
    pub endpoint: String,
    /// 密钥路径，例如 `secret/data/app`
    pub path: String,
    pub auth: Option<VaultAuth>,
    /// KV v2 轮询间隔（秒）
    pub poll_interval: u64,
    /// 请求超时（秒）
    pub timeout: u64,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            path: String::new(),
            auth: None,
            poll_interval: 60,
            timeout: 10,
        }
    }
}

fn invalid(reason: impl Into<String>) -> ConfigSourceError {
    ConfigSourceError::InvalidSettings {
        source_type: TYPE.to_string(),
        reason: reason.into(),
    }
}

impl VaultSettings {
    /// 校验设置，不发起任何请求
    pub fn validate(&self) -> Result<Url> {
        let endpoint = Url::parse(&self.endpoint)
            .map_err(|e| invalid(format!("endpoint {:?} 无效: {e}", self.endpoint)))?;
        if self.path.trim_matches('/').is_empty() {
            return Err(invalid("path 不能为空"));
        }
        if self.poll_interval == 0 {
            return Err(invalid("poll_interval 必须大于 0"));
        }
        if self.timeout == 0 {
            return Err(invalid("timeout 必须大于 0"));
        }
        match &self.auth {
            Some(VaultAuth {
                token: Some(_),
                token_file: None,
            })
            | Some(VaultAuth {
                token: None,
                token_file: Some(_),
            }) => Ok(endpoint),
            Some(_) => Err(invalid("auth 中 token 与 token_file 必须且只能设置一个")),
            None => Err(invalid("缺少 auth 设置")),
        }
    }

    async fn token(&self) -> Result<String> {
        match &self.auth {
            Some(VaultAuth {
                token: Some(token), ..
            }) => Ok(token.clone()),
            Some(VaultAuth {
                token_file: Some(path),
                ..
            }) => {
                let token = tokio::fs::read_to_string(path).await.map_err(|e| {
                    ConfigSourceError::MissingFile {
                        path: path.clone(),
                        source: e,
                    }
                })?;
                Ok(token.trim().to_string())
            }
            _ => Err(invalid("缺少 token")),
        }
    }
}

/// Vault 返回的密钥
#[derive(Debug, Clone, Default, Deserialize)]
struct Secret {
    #[serde(default)]
    lease_id: String,
    #[serde(default)]
    lease_duration: u64,
    #[serde(default)]
    renewable: bool,
    #[serde(default)]
    data: Option<serde_json::Map<String, JsonValue>>,
}

#[derive(Debug, Clone)]
struct VaultClient {
    http: reqwest::Client,
    endpoint: Url,
    token: String,
}

impl VaultClient {
    fn url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}",
            self.endpoint.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// 读取密钥，路径不存在时返回 `None`
    async fn read(&self, path: &str) -> Result<Option<Secret>> {
        let response = self
            .http
            .get(self.url(path))
            .header("X-Vault-Token", &self.token)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConfigSourceError::Transport(format!(
                "Vault 读取 {path} 返回 {status}: {body}"
            )));
        }
        Ok(Some(response.json().await?))
    }

    async fn renew(&self, lease_id: &str, increment: u64) -> Result<Secret> {
        let response = self
            .http
            .put(self.url("sys/leases/renew"))
            .header("X-Vault-Token", &self.token)
            .json(&serde_json::json!({
                "lease_id": lease_id,
                "increment": increment,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConfigSourceError::Transport(format!(
                "Vault 续约租约 {lease_id} 返回 {status}"
            )));
        }
        Ok(response.json().await?)
    }
}

/// 根据密钥形态选择的监控策略
#[derive(Debug, Clone, PartialEq)]
enum WatchStrategy {
    Renew { lease_id: String, lease_duration: u64 },
    Lease(Duration),
    Poll {
        metadata_path: String,
        version: i64,
        created_time: String,
    },
    Unwatched,
}

impl WatchStrategy {
    fn for_secret(path: &str, secret: &Secret) -> Self {
        if secret.renewable && secret.lease_duration > 0 {
            return WatchStrategy::Renew {
                lease_id: secret.lease_id.clone(),
                lease_duration: secret.lease_duration,
            };
        }
        if secret.lease_duration > 0 {
            return WatchStrategy::Lease(Duration::from_secs(secret.lease_duration));
        }

        let metadata = secret
            .data
            .as_ref()
            .and_then(|data| data.get("metadata"))
            .and_then(JsonValue::as_object);
        match metadata {
            Some(metadata) if path.contains("/data/") => WatchStrategy::Poll {
                metadata_path: path.replacen("/data/", "/metadata/", 1),
                version: metadata
                    .get("version")
                    .and_then(JsonValue::as_i64)
                    .unwrap_or_default(),
                created_time: metadata
                    .get("created_time")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => WatchStrategy::Unwatched,
        }
    }
}

/// 按 `.` 分隔的键路径在密钥数据中查找
fn traverse_to_key(data: &Value, selector: &str) -> Option<Value> {
    let mut current = data;
    for key in selector.split('.') {
        current = current.as_mapping()?.get(key)?;
    }
    match current {
        Value::Null => None,
        value => Some(value.clone()),
    }
}

/// Vault 配置源
#[derive(Debug)]
pub struct VaultConfigSource {
    client: VaultClient,
    path: String,
    poll_interval: Duration,
    scope: WatchScope,
    secret: Mutex<Option<Value>>,
}

impl VaultConfigSource {
    /// 创建 Vault 配置源
    ///
    /// 只校验设置并读取令牌，不访问 Vault。
    pub async fn new(settings: &VaultSettings, cancel: &CancellationToken) -> Result<Self> {
        let endpoint = settings.validate()?;
        let token = settings.token().await?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout))
            .build()?;

        Ok(Self {
            client: VaultClient {
                http,
                endpoint,
                token,
            },
            path: settings.path.trim_matches('/').to_string(),
            poll_interval: Duration::from_secs(settings.poll_interval),
            scope: WatchScope::new(cancel),
            secret: Mutex::new(None),
        })
    }

    fn spawn_watch(
        &self,
        strategy: WatchStrategy,
        watcher: WatcherFunc,
    ) -> Option<WatchRegistration> {
        let client = self.client.clone();
        let poll_interval = self.poll_interval;
        let path = self.path.clone();

        let registration = match strategy {
            WatchStrategy::Unwatched => {
                warn!("Vault 密钥 {} 既无租约也不是 KV v2，不进行监控", path);
                return None;
            }
            WatchStrategy::Renew {
                lease_id,
                lease_duration,
            } => self.scope.spawn(watcher, move |_| {
                renew_until_expired(client, lease_id, lease_duration)
            }),
            WatchStrategy::Lease(duration) => self.scope.spawn(watcher, move |_| async move {
                tokio::time::sleep(duration / 2).await;
                WatchOutcome::ValueUpdated(format!("Vault 密钥 {path} 的租约过半"))
            }),
            WatchStrategy::Poll {
                metadata_path,
                version,
                created_time,
            } => self.scope.spawn(watcher, move |_| {
                poll_metadata(client, metadata_path, version, created_time, poll_interval)
            }),
        };
        Some(registration)
    }
}

async fn renew_until_expired(client: VaultClient, lease_id: String, mut lease: u64) -> WatchOutcome {
    loop {
        tokio::time::sleep(Duration::from_secs(lease) / 2).await;
        match client.renew(&lease_id, lease).await {
            Ok(renewed) if renewed.renewable && renewed.lease_duration > 0 => {
                debug!("Vault 租约 {} 已续约 {} 秒", lease_id, renewed.lease_duration);
                lease = renewed.lease_duration;
            }
            Ok(_) => {
                return WatchOutcome::ValueUpdated(format!("Vault 租约 {lease_id} 无法继续续约"))
            }
            Err(e) => {
                return WatchOutcome::ValueUpdated(format!("Vault 租约 {lease_id} 续约失败: {e}"))
            }
        }
    }
}

async fn poll_metadata(
    client: VaultClient,
    metadata_path: String,
    version: i64,
    created_time: String,
    interval: Duration,
) -> WatchOutcome {
    let mut ticker = tokio::time::interval(interval);
    // 第一次 tick 立即完成，跳过
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let metadata = match client.read(&metadata_path).await {
            Ok(Some(secret)) => secret.data.unwrap_or_default(),
            Ok(None) => {
                return WatchOutcome::ValueUpdated(format!("Vault 元数据 {metadata_path} 已删除"))
            }
            Err(e) => return WatchOutcome::Failed(e),
        };

        let current_version = metadata
            .get("current_version")
            .and_then(JsonValue::as_i64)
            .unwrap_or_default();
        let updated_time = metadata
            .get("updated_time")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        if current_version != version || updated_time != created_time {
            return WatchOutcome::ValueUpdated(format!(
                "Vault 密钥版本从 {version} 变为 {current_version}"
            ));
        }
    }
}

#[async_trait]
impl ConfigSource for VaultConfigSource {
    async fn retrieve(
        &self,
        selector: &str,
        params: Option<&Mapping>,
        watcher: Option<WatcherFunc>,
    ) -> Result<Retrieved> {
        decode_params::<NoParams>(params)?;
        let mut cached = self.secret.lock().await;
        let mut watched = None;

        if cached.is_none() {
            let secret = self
                .client
                .read(&self.path)
                .await?
                .ok_or_else(|| ConfigSourceError::NoValueAtPath {
                    path: self.path.clone(),
                    key: selector.to_string(),
                })?;
            let data = secret
                .data
                .clone()
                .ok_or_else(|| ConfigSourceError::NoValueAtPath {
                    path: self.path.clone(),
                    key: selector.to_string(),
                })?;

            if let Some(watcher) = watcher {
                let strategy = WatchStrategy::for_secret(&self.path, &secret);
                debug!("Vault 密钥 {} 的监控策略: {:?}", self.path, strategy);
                watched = self.spawn_watch(strategy, watcher);
            }
            *cached = Some(serde_yaml::to_value(data)?);
        }

        let data = cached.as_ref().unwrap_or(&Value::Null);
        let value = traverse_to_key(data, selector).ok_or_else(|| {
            ConfigSourceError::NoValueAtPath {
                path: self.path.clone(),
                key: selector.to_string(),
            }
        })?;

        Ok(match watched {
            Some(registration) => Retrieved::new(value).with_watch(registration),
            None => Retrieved::new(value),
        })
    }

    async fn shutdown(&self) -> Result<()> {
        self.scope.shutdown().await;
        Ok(())
    }
}

/// Vault 配置源工厂
#[derive(Debug, Default)]
pub struct VaultFactory;

#[async_trait]
impl Factory for VaultFactory {
    fn source_type(&self) -> &'static str {
        TYPE
    }

    fn create_default_settings(&self) -> Box<dyn SourceSettings> {
        Box::new(VaultSettings::default())
    }

    fn unmarshal_settings(
        &self,
        defaults: &dyn SourceSettings,
        body: &Value,
    ) -> Result<Box<dyn SourceSettings>> {
        unmarshal_onto::<VaultSettings>(defaults, body)
    }

    async fn create_config_source(
        &self,
        params: &CreateParams,
        settings: &dyn SourceSettings,
    ) -> Result<Arc<dyn ConfigSource>> {
        let settings = downcast_settings::<VaultSettings>(settings, TYPE)?;
        let source = VaultConfigSource::new(settings, &params.cancel).await?;
        info!(
            "创建 Vault 配置源 {}，路径: {}",
            params.name, settings.path
        );
        Ok(Arc::new(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ChangeEvent;
    use mockito::Matcher;
    use tokio::sync::mpsc;

    const KV2_SECRET: &str = r#"{
        "request_id": "1",
        "lease_id": "",
        "renewable": false,
        "lease_duration": 0,
        "data": {
            "data": {"username": "app", "password": "hunter2", "nested": {"port": 5432}},
            "metadata": {"created_time": "2024-01-01T00:00:00Z", "version": 3}
        }
    }"#;

    fn settings(endpoint: String) -> VaultSettings {
        VaultSettings {
            endpoint,
            path: "secret/data/app".to_string(),
            auth: Some(VaultAuth {
                token: Some("root".to_string()),
                token_file: None,
            }),
            poll_interval: 1,
            ..VaultSettings::default()
        }
    }

    fn channel_watcher() -> (WatcherFunc, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher: WatcherFunc = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (watcher, rx)
    }

    #[test]
    fn test_validate_settings() {
        let valid = settings("http://127.0.0.1:8200".to_string());
        assert!(valid.validate().is_ok());

        let mut no_auth = valid.clone();
        no_auth.auth = None;
        assert!(no_auth.validate().is_err());

        let mut both = valid.clone();
        both.auth = Some(VaultAuth {
            token: Some("t".into()),
            token_file: Some(PathBuf::from("/tmp/token")),
        });
        assert!(both.validate().is_err());

        let mut zero_poll = valid.clone();
        zero_poll.poll_interval = 0;
        assert!(matches!(
            zero_poll.validate(),
            Err(ConfigSourceError::InvalidSettings { .. })
        ));

        let mut bad_endpoint = valid;
        bad_endpoint.endpoint = "::".into();
        assert!(bad_endpoint.validate().is_err());
    }

    #[tokio::test]
    async fn test_token_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let token_path = dir.path().join("token");
        std::fs::write(&token_path, "s.file-token\n").unwrap();

        let mut settings = settings("http://127.0.0.1:8200".to_string());
        settings.auth = Some(VaultAuth {
            token: None,
            token_file: Some(token_path),
        });
        assert_eq!(settings.token().await.unwrap(), "s.file-token");
    }

    #[test]
    fn test_watch_strategy_selection() {
        let kv2: Secret = serde_json::from_str(KV2_SECRET).unwrap();
        assert!(matches!(
            WatchStrategy::for_secret("secret/data/app", &kv2),
            WatchStrategy::Poll { version: 3, .. }
        ));
        assert_eq!(
            WatchStrategy::for_secret("secret/app", &kv2),
            WatchStrategy::Unwatched
        );

        let leased = Secret {
            lease_duration: 30,
            ..Secret::default()
        };
        assert_eq!(
            WatchStrategy::for_secret("database/creds/app", &leased),
            WatchStrategy::Lease(Duration::from_secs(30))
        );

        let renewable = Secret {
            lease_id: "database/creds/app/abc".into(),
            lease_duration: 30,
            renewable: true,
            data: None,
        };
        assert!(matches!(
            WatchStrategy::for_secret("database/creds/app", &renewable),
            WatchStrategy::Renew { lease_duration: 30, .. }
        ));
    }

    #[tokio::test]
    async fn test_retrieve_keys_reads_secret_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/secret/data/app")
            .match_header("x-vault-token", "root")
            .with_status(200)
            .with_body(KV2_SECRET)
            .expect(1)
            .create_async()
            .await;

        let source = VaultConfigSource::new(&settings(server.url()), &CancellationToken::new())
            .await
            .unwrap();
        let password = source.retrieve("data.password", None, None).await.unwrap();
        assert_eq!(password.value(), &Value::from("hunter2"));
        let port = source.retrieve("data.nested.port", None, None).await.unwrap();
        assert_eq!(port.value(), &Value::from(5432));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_key_and_missing_secret() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/secret/data/app")
            .with_status(200)
            .with_body(KV2_SECRET)
            .create_async()
            .await;

        let source = VaultConfigSource::new(&settings(server.url()), &CancellationToken::new())
            .await
            .unwrap();
        let err = source.retrieve("data.missing", None, None).await.unwrap_err();
        assert!(matches!(err, ConfigSourceError::NoValueAtPath { .. }));

        let mut absent = settings(server.url());
        absent.path = "secret/data/absent".into();
        server
            .mock("GET", "/v1/secret/data/absent")
            .with_status(404)
            .with_body(r#"{"errors":[]}"#)
            .create_async()
            .await;
        let source = VaultConfigSource::new(&absent, &CancellationToken::new())
            .await
            .unwrap();
        let err = source.retrieve("data.any", None, None).await.unwrap_err();
        assert!(matches!(err, ConfigSourceError::NoValueAtPath { .. }));
    }

    #[tokio::test]
    async fn test_unexpected_params_rejected() {
        let server = mockito::Server::new_async().await;
        let source = VaultConfigSource::new(&settings(server.url()), &CancellationToken::new())
            .await
            .unwrap();
        let mut params = Mapping::new();
        params.insert("version".into(), 2.into());
        let err = source
            .retrieve("data.password", Some(&params), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigSourceError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_transport() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/secret/data/app")
            .with_status(503)
            .create_async()
            .await;

        let source = VaultConfigSource::new(&settings(server.url()), &CancellationToken::new())
            .await
            .unwrap();
        let err = source.retrieve("data.password", None, None).await.unwrap_err();
        assert!(matches!(err, ConfigSourceError::Transport(_)));
    }

    #[tokio::test]
    async fn test_poll_detects_new_version() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/secret/data/app")
            .with_status(200)
            .with_body(KV2_SECRET)
            .create_async()
            .await;
        server
            .mock("GET", "/v1/secret/metadata/app")
            .with_status(200)
            .with_body(
                r#"{"data": {"current_version": 4, "updated_time": "2024-02-01T00:00:00Z"}}"#,
            )
            .create_async()
            .await;

        let source = VaultConfigSource::new(&settings(server.url()), &CancellationToken::new())
            .await
            .unwrap();
        let (watcher, mut rx) = channel_watcher();
        let first = source
            .retrieve("data.username", None, Some(watcher.clone()))
            .await
            .unwrap();
        // 只有第一次检索挂监控
        let (_, second_close) = source
            .retrieve("data.password", None, Some(watcher))
            .await
            .unwrap()
            .into_parts();
        assert!(second_close.is_empty());

        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("3 秒内应检测到新版本")
            .unwrap();
        assert!(event.is_update());

        first.close().await.unwrap();
        source.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_renewal_resolves_as_updated() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/database/creds/app")
            .with_status(200)
            .with_body(
                r#"{"lease_id": "database/creds/app/abc", "renewable": true, "lease_duration": 1,
                    "data": {"username": "u", "password": "p"}}"#,
            )
            .create_async()
            .await;
        let renew = server
            .mock("PUT", "/v1/sys/leases/renew")
            .match_body(Matcher::PartialJsonString(
                r#"{"lease_id": "database/creds/app/abc"}"#.to_string(),
            ))
            .with_status(500)
            .create_async()
            .await;

        let mut settings = settings(server.url());
        settings.path = "database/creds/app".into();
        let source = VaultConfigSource::new(&settings, &CancellationToken::new())
            .await
            .unwrap();
        let (watcher, mut rx) = channel_watcher();
        let retrieved = source
            .retrieve("username", None, Some(watcher))
            .await
            .unwrap();
        assert_eq!(retrieved.value(), &Value::from("u"));

        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("续约失败后应收到更新")
            .unwrap();
        assert!(event.is_update());
        renew.assert_async().await;
        source.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_watch_without_event() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/secret/data/app")
            .with_status(200)
            .with_body(KV2_SECRET)
            .create_async()
            .await;

        let mut settings = settings(server.url());
        settings.poll_interval = 3600;
        let source = VaultConfigSource::new(&settings, &CancellationToken::new())
            .await
            .unwrap();
        let (watcher, mut rx) = channel_watcher();
        let _retrieved = source
            .retrieve("data.username", None, Some(watcher))
            .await
            .unwrap();

        source.shutdown().await.unwrap();
        source.shutdown().await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
