//! 配置快照调试服务
//!
//! 提供两个只读接口，以 YAML 返回：
//! - `GET /debug/configz/initial`：最近一次成功解析时的原始文档
//! - `GET /debug/configz/effective`：合并后的文档，敏感字段已脱敏

use crate::manager::ConfigManager;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde_yaml::{Mapping, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// 脱敏后的占位值
pub const REDACTED: &str = "<redacted>";

const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "password",
    "api_key",
    "apikey",
    "token",
    "secret",
    "access_key",
    "private_key",
    "credential",
];

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| key.contains(fragment))
}

/// 把键名看起来敏感的字符串值替换为占位值
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Mapping(mapping) => Value::Mapping(
            mapping
                .iter()
                .map(|(key, value)| {
                    let sensitive = key.as_str().is_some_and(is_sensitive_key);
                    let value = match value {
                        Value::String(_) if sensitive => Value::String(REDACTED.to_string()),
                        other => redact(other),
                    };
                    (key.clone(), value)
                })
                .collect(),
        ),
        Value::Sequence(items) => Value::Sequence(items.iter().map(redact).collect()),
        Value::Tagged(tagged) => redact(&tagged.value),
        other => other.clone(),
    }
}

fn yaml_response(document: &Mapping) -> Response {
    match serde_yaml::to_string(document) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/yaml")], body).into_response(),
        Err(e) => {
            error!("序列化配置快照失败: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn initial(State(manager): State<Arc<ConfigManager>>) -> Response {
    yaml_response(&*manager.initial().await)
}

async fn effective(State(manager): State<Arc<ConfigManager>>) -> Response {
    let document = manager.effective().await;
    match redact(&Value::Mapping((*document).clone())) {
        Value::Mapping(redacted) => yaml_response(&redacted),
        _ => yaml_response(&Mapping::new()),
    }
}

/// 构建调试路由
pub fn router(manager: Arc<ConfigManager>) -> Router {
    Router::new()
        .route("/debug/configz/initial", get(initial))
        .route("/debug/configz/effective", get(effective))
        .with_state(manager)
        .layer(TraceLayer::new_for_http())
}

/// 在给定监听器上运行调试服务，直到 `cancel` 被取消
pub async fn serve_on(
    listener: TcpListener,
    manager: Arc<ConfigManager>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!("调试服务已启动: http://{}/debug/configz/effective", addr);

    axum::serve(listener, router(manager))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("调试服务已关闭");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::StaticDocumentSource;
    use crate::manager::ManagerOptions;
    use crate::sources::builtin_factories;

    #[test]
    fn test_redact_nested_keys() {
        let value: Value = serde_yaml::from_str(
            r#"
db:
  user: app
  Password: hunter2
  port: 5432
clients:
  - name: a
    API_KEY: k1
auth_token: 123
"#,
        )
        .unwrap();
        let redacted = redact(&value);
        assert_eq!(redacted["db"]["user"], Value::from("app"));
        assert_eq!(redacted["db"]["Password"], Value::from(REDACTED));
        assert_eq!(redacted["db"]["port"], Value::from(5432));
        assert_eq!(redacted["clients"][0]["API_KEY"], Value::from(REDACTED));
        // 只替换字符串值
        assert_eq!(redacted["auth_token"], Value::from(123));
    }

    #[tokio::test]
    async fn test_serves_snapshots() {
        let source = Arc::new(
            StaticDocumentSource::from_yaml("service:\n  name: api\n  secret: s3cr3t").unwrap(),
        );
        let manager = Arc::new(ConfigManager::new(
            builtin_factories().unwrap(),
            source,
            ManagerOptions::default(),
        ));
        manager.resolve().await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve_on(listener, Arc::clone(&manager), cancel.clone()));

        let client = reqwest::Client::new();
        let effective = client
            .get(format!("http://{addr}/debug/configz/effective"))
            .send()
            .await
            .unwrap();
        assert_eq!(
            effective.headers()[reqwest::header::CONTENT_TYPE],
            "application/yaml"
        );
        let body: Value = serde_yaml::from_str(&effective.text().await.unwrap()).unwrap();
        assert_eq!(body["service"]["name"], Value::from("api"));
        assert_eq!(body["service"]["secret"], Value::from(REDACTED));

        let initial = client
            .get(format!("http://{addr}/debug/configz/initial"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(initial.contains("s3cr3t"));

        cancel.cancel();
        server.await.unwrap().unwrap();
        manager.shutdown().await.unwrap();
    }
}
