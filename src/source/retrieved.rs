//! 检索结果与关闭函数

use super::watch::WatchRegistration;
use crate::error::{ConfigSourceError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_yaml::Value;
use std::fmt;

/// 异步关闭函数
pub type CloseFunc = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// 一次检索的结果
///
/// 值本身加上可选的监控注册和附加的关闭动作。关闭时先结束监控，再执行附加动作。
pub struct Retrieved {
    value: Value,
    watch: Option<WatchRegistration>,
    on_close: Option<CloseFunc>,
}

impl fmt::Debug for Retrieved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrieved")
            .field("value", &self.value)
            .field("watched", &self.watch.is_some())
            .finish()
    }
}

impl Retrieved {
    /// 创建不带监控的检索结果
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            watch: None,
            on_close: None,
        }
    }

    /// 附加监控注册
    pub fn with_watch(mut self, registration: WatchRegistration) -> Self {
        self.watch = Some(registration);
        self
    }

    /// 附加关闭动作
    pub fn with_close(mut self, close: CloseFunc) -> Self {
        self.on_close = Some(close);
        self
    }

    /// 检索到的值
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// 是否带有监控
    pub fn is_watched(&self) -> bool {
        self.watch.is_some()
    }

    /// 拆分为值和关闭句柄
    pub fn into_parts(self) -> (Value, CloseHandle) {
        let mut handle = CloseHandle::new();
        if let Some(registration) = self.watch {
            handle.push(Box::new(move || registration.close().boxed()));
        }
        if let Some(close) = self.on_close {
            handle.push(close);
        }
        (self.value, handle)
    }

    /// 关闭监控与附加资源
    pub async fn close(self) -> Result<()> {
        let (_, handle) = self.into_parts();
        handle.close().await
    }
}

/// 按顺序执行的关闭函数集合
#[derive(Default)]
pub struct CloseHandle {
    funcs: Vec<CloseFunc>,
}

impl fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseHandle")
            .field("pending", &self.funcs.len())
            .finish()
    }
}

impl CloseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, close: CloseFunc) {
        self.funcs.push(close);
    }

    /// 追加另一个句柄的全部关闭函数，保持其原有顺序
    pub fn extend(&mut self, other: CloseHandle) {
        self.funcs.extend(other.funcs);
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    /// 依次执行所有关闭函数
    ///
    /// 某个函数失败不会跳过后续函数，所有错误合并后返回。
    pub async fn close(self) -> Result<()> {
        let mut errors = Vec::new();
        for close in self.funcs {
            if let Err(e) = close().await {
                errors.push(e);
            }
        }
        match ConfigSourceError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 合并为单个关闭函数，没有任何函数时返回 `None`
    pub fn into_close_func(self) -> Option<CloseFunc> {
        merge_close_funcs(self.funcs)
    }
}

/// 把多个关闭函数合并为一个，按给定顺序执行并聚合错误
///
/// # 参数
/// * `funcs` - 待合并的关闭函数
///
/// # 返回
/// * `Option<CloseFunc>` - 列表为空时为 `None`
pub fn merge_close_funcs(mut funcs: Vec<CloseFunc>) -> Option<CloseFunc> {
    match funcs.len() {
        0 => None,
        1 => funcs.pop(),
        _ => Some(Box::new(move || CloseHandle { funcs }.close().boxed())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording_close(log: &Arc<Mutex<Vec<usize>>>, id: usize, fail: bool) -> CloseFunc {
        let log = Arc::clone(log);
        Box::new(move || {
            async move {
                log.lock().unwrap().push(id);
                if fail {
                    Err(ConfigSourceError::Watch(format!("close {id} failed")))
                } else {
                    Ok(())
                }
            }
            .boxed()
        })
    }

    #[test]
    fn test_merge_empty_and_single() {
        assert!(merge_close_funcs(Vec::new()).is_none());
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(merge_close_funcs(vec![recording_close(&log, 1, false)]).is_some());
    }

    #[tokio::test]
    async fn test_merged_close_runs_in_order_and_aggregates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let merged = merge_close_funcs(vec![
            recording_close(&log, 1, false),
            recording_close(&log, 2, true),
            recording_close(&log, 3, true),
        ])
        .unwrap();

        let err = merged().await.unwrap_err();
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert!(matches!(err, ConfigSourceError::Multiple(ref v) if v.len() == 2));
    }

    #[tokio::test]
    async fn test_retrieved_close_runs_attached_close() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let retrieved = Retrieved::new("value").with_close(recording_close(&log, 7, false));

        assert_eq!(retrieved.value(), &Value::from("value"));
        assert!(!retrieved.is_watched());
        retrieved.close().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![7]);
    }
}
