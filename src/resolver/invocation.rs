//! 配置源调用解析
//!
//! 单行形式 `name:selector?k=v&k=v`，参数按 URL 查询串解码；
//! 多行形式首行为 `name: selector`，其余行为 YAML 参数。

use crate::error::{ConfigSourceError, Result};
use serde_yaml::{Mapping, Value};

/// 解析后的调用
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Invocation {
    pub source: String,
    pub selector: String,
    pub params: Option<Mapping>,
}

pub(crate) fn parse_invocation(invocation: &str) -> Result<Invocation> {
    let invalid = |reason: String| ConfigSourceError::InvalidReference {
        reference: invocation.to_string(),
        reason,
    };

    let Some((source, after)) = invocation.split_once(':') else {
        return Err(invalid("至少需要配置源名称和选择器".to_string()));
    };
    let source = source.trim_matches(' ').to_string();

    let (selector, params) = match after.split_once('\n') {
        Some((first_line, body)) => {
            let params = if body.trim().is_empty() {
                None
            } else {
                match serde_yaml::from_str::<Value>(body).map_err(|e| invalid(e.to_string()))? {
                    Value::Null => None,
                    Value::Mapping(mapping) => Some(mapping),
                    _ => return Err(invalid("多行参数必须是 YAML 映射".to_string())),
                }
            };
            (first_line.trim_matches(' ').to_string(), params)
        }
        None => match after.split_once('?') {
            Some((selector, query)) => (
                selector.trim_matches(' ').to_string(),
                Some(parse_query(query).map_err(invalid)?),
            ),
            None => (after.trim_matches(' ').to_string(), None),
        },
    };

    Ok(Invocation {
        source,
        selector,
        params,
    })
}

/// 解析查询串参数，值按 YAML 解析，重复的键合并为序列
fn parse_query(query: &str) -> std::result::Result<Mapping, String> {
    let mut grouped: Vec<(String, Vec<Value>)> = Vec::new();

    for (key, raw) in url::form_urlencoded::parse(query.as_bytes()) {
        let value = serde_yaml::from_str::<Value>(&raw)
            .map_err(|e| format!("参数 {key:?} 的值 {raw:?} 无法解析: {e}"))?;
        match grouped.iter_mut().find(|entry| entry.0 == key.as_ref()) {
            Some((_, values)) => values.push(value),
            None => grouped.push((key.into_owned(), vec![value])),
        }
    }

    let mut params = Mapping::new();
    for (key, mut values) in grouped {
        let value = if values.len() == 1 {
            values.pop().unwrap_or(Value::Null)
        } else {
            Value::Sequence(values)
        };
        params.insert(Value::String(key), value);
    }
    Ok(params)
}
