//! 引用扫描
//!
//! 把一个字符串拆成字面文本、`$$` 转义、环境变量和配置源引用几类片段。
//! 规则与 shell 的 `$VAR` / `${VAR}` 展开保持一致，只是名称后紧跟 `:` 时
//! 视为配置源引用。

use std::borrow::Cow;
use std::env;

/// 扫描得到的片段
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment<'a> {
    /// 原样保留的文本
    Literal(&'a str),
    /// `$$`
    Escape,
    /// 环境变量
    EnvVar { name: &'a str, raw: &'a str },
    /// 配置源引用，`invocation` 为 `name:selector...` 整体
    Reference {
        source: &'a str,
        invocation: &'a str,
        raw: &'a str,
    },
}

impl<'a> Segment<'a> {
    /// 片段在原字符串中的文本
    pub(crate) fn raw(&self) -> &'a str {
        match self {
            Segment::Literal(text) => text,
            Segment::Escape => "$$",
            Segment::EnvVar { raw, .. } | Segment::Reference { raw, .. } => raw,
        }
    }
}

/// 扫描字符串
pub(crate) fn scan(s: &str) -> Vec<Segment<'_>> {
    let bytes = s.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut j = 0;

    while j < bytes.len() {
        if bytes[j] != b'$' || j + 1 >= bytes.len() {
            j += 1;
            continue;
        }

        if start < j {
            segments.push(Segment::Literal(&s[start..j]));
        }

        let rest = &s[j + 1..];
        let consumed = match bytes[j + 1] {
            b'$' => {
                segments.push(Segment::Escape);
                1
            }
            b'{' => {
                let (content, consumed, source) = bracketed_content(rest);
                push_expansion(&mut segments, content, source, &s[j..j + 1 + consumed], consumed);
                consumed
            }
            _ => {
                let (content, consumed, source) = bare_content(rest);
                push_expansion(&mut segments, content, source, &s[j..j + 1 + consumed], consumed);
                consumed
            }
        };

        j += consumed + 1;
        start = j;
    }

    if start < bytes.len() {
        segments.push(Segment::Literal(&s[start..]));
    }
    segments
}

fn push_expansion<'a>(
    segments: &mut Vec<Segment<'a>>,
    content: &'a str,
    source: Option<&'a str>,
    raw: &'a str,
    consumed: usize,
) {
    match source {
        Some(source) => segments.push(Segment::Reference {
            source,
            invocation: content,
            raw,
        }),
        // `${}` 或未闭合的 `${`，吞掉
        None if content.is_empty() && consumed > 0 => {}
        None if content.is_empty() => segments.push(Segment::Literal("$")),
        None => segments.push(Segment::EnvVar { name: content, raw }),
    }
}

/// `${...}` 形式，`s` 以 `{` 开头
fn bracketed_content(s: &str) -> (&str, usize, Option<&str>) {
    let Some(close) = s.find('}') else {
        return ("", 1, None);
    };
    if close == 1 {
        return ("", 2, None);
    }

    let content = s[1..close].trim_matches(' ');
    let source = match content.find(':') {
        Some(idx) if content.len() > 1 => Some(content[..idx].trim_matches(' ')).filter(|n| !n.is_empty()),
        _ => None,
    };
    (content, close + 1, source)
}

/// 裸 `$name` 形式，名称后紧跟 `:` 时吞掉剩余全部文本
fn bare_content(s: &str) -> (&str, usize, Option<&str>) {
    let (name, consumed) = token_name(s);
    if consumed > 0 && s.as_bytes().get(consumed) == Some(&b':') {
        return (s, s.len(), Some(name));
    }
    (name, consumed, None)
}

/// 读取名称：字母数字下划线，可带一个 `/`，但只有名称后紧跟 `:` 时 `/` 才算在内
fn token_name(s: &str) -> (&str, usize) {
    let bytes = s.as_bytes();
    if let Some(&first) = bytes.first() {
        if is_shell_special(first) {
            return (&s[..1], 1);
        }
    }

    let mut separator = None;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if is_alpha_num(c) {
            i += 1;
            continue;
        }
        if c == b'/' && separator.is_none() {
            separator = Some(i);
            i += 1;
            continue;
        }
        break;
    }

    if let Some(sep) = separator {
        if bytes.get(i) != Some(&b':') {
            return (&s[..sep], sep);
        }
    }
    (&s[..i], i)
}

fn is_shell_special(c: u8) -> bool {
    matches!(
        c,
        b'*' | b'#' | b'$' | b'@' | b'!' | b'?' | b'-' | b'0'..=b'9'
    )
}

fn is_alpha_num(c: u8) -> bool {
    c == b'_' || c.is_ascii_alphanumeric()
}

/// 按扫描结果展开环境变量，遇到配置源引用时调用 `on_reference`
///
/// 用于不允许检索的场景（例如 `config_sources` 节的设置）。
pub(crate) fn expand_env<'a, E>(
    s: &'a str,
    mut on_reference: impl FnMut(&'a str) -> Result<(), E>,
) -> Result<Cow<'a, str>, E> {
    let segments = scan(s);
    if matches!(segments.as_slice(), [] | [Segment::Literal(_)]) {
        return Ok(Cow::Borrowed(s));
    }

    let mut out = String::with_capacity(s.len());
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Escape => out.push('$'),
            Segment::EnvVar { name, .. } => out.push_str(&env::var(name).unwrap_or_default()),
            Segment::Reference { source, raw, .. } => {
                on_reference(source)?;
                out.push_str(raw);
            }
        }
    }
    Ok(Cow::Owned(out))
}
