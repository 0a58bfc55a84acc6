//! 引用解析模块
//!
//! 遍历文档树，把字符串中的配置源引用替换为检索到的值，并对检索结果中
//! 指向已声明配置源的引用继续解析。一次解析内的检索按文档顺序依次进行。

mod expand;
mod invocation;

use crate::error::{ConfigSourceError, Result};
use crate::source::{CloseHandle, ConfigSource, WatcherFunc};
use expand::Segment;
use futures::future::BoxFuture;
use futures::FutureExt;
use invocation::parse_invocation;
use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, warn, Instrument};

/// 默认的最大引用嵌套深度
pub const DEFAULT_MAX_DEPTH: usize = 16;

/// 解析选项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverOptions {
    /// 检索结果再解析的最大嵌套深度
    pub max_depth: usize,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// 一次解析的结果
#[derive(Debug)]
pub struct Resolution {
    /// 解析后的文档
    pub document: Mapping,
    /// 本次解析中所有检索结果的关闭函数，按检索顺序
    pub close: CloseHandle,
}

/// 引用解析器
pub struct Resolver {
    sources: BTreeMap<String, Arc<dyn ConfigSource>>,
    options: ResolverOptions,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanMode {
    /// 原始文档：环境变量、转义和所有配置源引用都处理
    Full,
    /// 检索结果：只处理指向已声明配置源的引用，其余原样保留
    SourcesOnly,
}

impl Resolver {
    /// 创建解析器
    ///
    /// # 参数
    /// * `sources` - 以全名为键的配置源
    /// * `options` - 解析选项
    /// * `cancel` - 取消令牌，取消后进行中的检索立即失败
    pub fn new(
        sources: BTreeMap<String, Arc<dyn ConfigSource>>,
        options: ResolverOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sources,
            options,
            cancel,
        }
    }

    /// 已声明的配置源名称
    pub fn source_names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    /// 解析文档
    ///
    /// 任一检索失败时整个解析失败，已经完成的检索会被关闭，不返回部分结果。
    ///
    /// # 参数
    /// * `document` - 去掉 `config_sources` 之后的文档
    /// * `watcher` - 监控回调，传给每一次检索
    pub async fn resolve(
        &self,
        document: &Mapping,
        watcher: Option<WatcherFunc>,
    ) -> Result<Resolution> {
        let mut pass = Pass {
            resolver: self,
            watcher,
            closers: CloseHandle::new(),
            retrievals: 0,
        };

        match pass.resolve_mapping(document, ScanMode::Full, 0).await {
            Ok(document) => {
                debug!("解析完成，共检索 {} 次", pass.retrievals);
                Ok(Resolution {
                    document,
                    close: pass.closers,
                })
            }
            Err(e) => {
                if let Err(close_err) = pass.closers.close().await {
                    warn!("解析失败后关闭检索结果出错: {}", close_err);
                }
                Err(e)
            }
        }
    }
}

/// 单次解析的状态
struct Pass<'r> {
    resolver: &'r Resolver,
    watcher: Option<WatcherFunc>,
    closers: CloseHandle,
    retrievals: usize,
}

impl Pass<'_> {
    fn resolve_value<'a>(
        &'a mut self,
        value: &'a Value,
        mode: ScanMode,
        depth: usize,
    ) -> BoxFuture<'a, Result<Value>> {
        async move {
            match value {
                Value::String(s) => self.resolve_string(s, mode, depth).await,
                Value::Sequence(items) => {
                    let mut resolved = Vec::with_capacity(items.len());
                    for item in items {
                        resolved.push(self.resolve_value(item, mode, depth).await?);
                    }
                    Ok(Value::Sequence(resolved))
                }
                Value::Mapping(mapping) => Ok(Value::Mapping(
                    self.resolve_mapping(mapping, mode, depth).await?,
                )),
                Value::Tagged(tagged) => {
                    let inner = self.resolve_value(&tagged.value, mode, depth).await?;
                    Ok(Value::Tagged(Box::new(TaggedValue {
                        tag: tagged.tag.clone(),
                        value: inner,
                    })))
                }
                other => Ok(other.clone()),
            }
        }
        .boxed()
    }

    async fn resolve_mapping(
        &mut self,
        mapping: &Mapping,
        mode: ScanMode,
        depth: usize,
    ) -> Result<Mapping> {
        let mut resolved = Mapping::with_capacity(mapping.len());
        for (key, value) in mapping {
            let value = self.resolve_value(value, mode, depth).await?;
            resolved.insert(key.clone(), value);
        }
        Ok(resolved)
    }

    fn is_active(&self, segment: &Segment<'_>, mode: ScanMode) -> bool {
        match segment {
            Segment::Literal(_) => false,
            Segment::Escape | Segment::EnvVar { .. } => mode == ScanMode::Full,
            Segment::Reference { source, .. } => {
                mode == ScanMode::Full || self.resolver.sources.contains_key(*source)
            }
        }
    }

    async fn resolve_string(&mut self, s: &str, mode: ScanMode, depth: usize) -> Result<Value> {
        let segments = expand::scan(s);
        if !segments.iter().any(|segment| self.is_active(segment, mode)) {
            return Ok(Value::String(s.to_string()));
        }

        // 整个字符串只有一个引用时，结果按结构化值嵌入
        if let [Segment::Reference {
            source, invocation, ..
        }] = segments.as_slice()
        {
            return self.retrieve(source, invocation, true, depth).await;
        }

        let mut out = String::with_capacity(s.len());
        for segment in &segments {
            if !self.is_active(segment, mode) {
                out.push_str(segment.raw());
                continue;
            }
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Escape => out.push('$'),
                Segment::EnvVar { name, .. } => out.push_str(&env::var(name).unwrap_or_default()),
                Segment::Reference {
                    source, invocation, ..
                } => {
                    let value = self.retrieve(source, invocation, false, depth).await?;
                    out.push_str(&stringify(&value)?);
                }
            }
        }
        Ok(Value::String(out))
    }

    async fn retrieve(
        &mut self,
        source_name: &str,
        invocation: &str,
        whole: bool,
        depth: usize,
    ) -> Result<Value> {
        let resolver = self.resolver;
        if depth > resolver.options.max_depth {
            return Err(ConfigSourceError::ReferenceDepthExceeded {
                max_depth: resolver.options.max_depth,
            });
        }
        if resolver.cancel.is_cancelled() {
            return Err(ConfigSourceError::Cancelled);
        }

        let source = resolver.sources.get(source_name).cloned().ok_or_else(|| {
            ConfigSourceError::UnknownConfigSource {
                name: source_name.to_string(),
            }
        })?;
        let parsed = parse_invocation(invocation)?;

        let wrap = |selector: &str, e: ConfigSourceError| ConfigSourceError::Retrieve {
            source_name: source_name.to_string(),
            selector: selector.to_string(),
            source: Box::new(e),
        };

        let selector_value = Value::String(parsed.selector.clone());
        let selector = match self
            .resolve_value(&selector_value, ScanMode::Full, depth + 1)
            .await
            .map_err(|e| wrap(&parsed.selector, e))?
        {
            Value::String(selector) => selector,
            other => {
                return Err(ConfigSourceError::InvalidReference {
                    reference: invocation.to_string(),
                    reason: format!("选择器必须解析为字符串，实际为 {other:?}"),
                })
            }
        };

        let params = match parsed.params {
            Some(params) => {
                let params_value = Value::Mapping(params);
                match self
                    .resolve_value(&params_value, ScanMode::Full, depth + 1)
                    .await
                    .map_err(|e| wrap(&selector, e))?
                {
                    Value::Mapping(params) => Some(params),
                    _ => None,
                }
            }
            None => None,
        };

        let span = debug_span!("retrieve", config_source = %source_name, selector = %selector);
        let retrieval = source
            .retrieve(&selector, params.as_ref(), self.watcher.clone())
            .instrument(span);
        let retrieved = tokio::select! {
            biased;
            _ = resolver.cancel.cancelled() => Err(ConfigSourceError::Cancelled),
            result = retrieval => result,
        }
        .map_err(|e| wrap(&selector, e))?;

        self.retrievals += 1;
        debug!(
            "已从配置源 {} 检索 {}（监控: {}）",
            source_name,
            selector,
            retrieved.is_watched()
        );

        let (value, close) = retrieved.into_parts();
        self.closers.extend(close);

        let value = if whole { parse_whole(value) } else { value };
        self.resolve_value(&value, ScanMode::SourcesOnly, depth + 1)
            .await
            .map_err(|e| wrap(&selector, e))
    }
}

/// 整串引用的字符串结果按 YAML 解析，解析失败保留原字符串
fn parse_whole(value: Value) -> Value {
    match value {
        Value::String(s) if !s.trim().is_empty() => match serde_yaml::from_str::<Value>(&s) {
            Ok(parsed) => parsed,
            Err(_) => Value::String(s),
        },
        other => other,
    }
}

/// 嵌入到更长字符串中的值
fn stringify(value: &Value) -> Result<String> {
    Ok(match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Sequence(_) | Value::Mapping(_) => match serde_json::to_string(value) {
            Ok(json) => json,
            Err(_) => serde_yaml::to_string(value)?.trim_end().to_string(),
        },
        Value::Tagged(_) => serde_yaml::to_string(value)?.trim_end().to_string(),
    })
}

/// 只做环境变量展开的遍历，遇到任何配置源引用都失败
///
/// 用于 `config_sources` 节，保证配置源的设置不依赖其他配置源。
pub fn expand_env_only(value: &Value) -> Result<Value> {
    Ok(match value {
        Value::String(s) => {
            let expanded = expand::expand_env(s, |name| {
                Err(ConfigSourceError::UnknownConfigSource {
                    name: name.to_string(),
                })
            })?;
            Value::String(expanded.into_owned())
        }
        Value::Sequence(items) => Value::Sequence(
            items
                .iter()
                .map(expand_env_only)
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Mapping(mapping) => {
            let mut expanded = Mapping::with_capacity(mapping.len());
            for (key, value) in mapping {
                expanded.insert(key.clone(), expand_env_only(value)?);
            }
            Value::Mapping(expanded)
        }
        Value::Tagged(tagged) => Value::Tagged(Box::new(TaggedValue {
            tag: tagged.tag.clone(),
            value: expand_env_only(&tagged.value)?,
        })),
        other => other.clone(),
    })
}
