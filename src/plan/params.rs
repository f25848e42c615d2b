//! 参数引用解析
//!
//! 字符串参数中的 `${call_id}` / `${call_id.path.to.field}` 在执行时替换为上游步骤的 payload（或其字段）。
//! 整个字符串恰好是一个引用时替换为原始 JSON 值；嵌在文本中时按字符串插值。

use std::collections::HashMap;

use serde_json::Value;

use crate::core::OrchestratorError;

/// 一个参数引用：上游步骤 ID + 字段路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub call_id: String,
    pub path: Vec<String>,
}

impl Reference {
    fn parse(inner: &str) -> Option<Self> {
        let mut parts = inner.trim().split('.');
        let call_id = parts.next()?.trim();
        if call_id.is_empty() {
            return None;
        }
        Some(Self {
            call_id: call_id.to_string(),
            path: parts.map(|p| p.trim().to_string()).collect(),
        })
    }

    fn lookup<'a>(&self, payload: &'a Value) -> Option<&'a Value> {
        self.path.iter().try_fold(payload, |cur, seg| match cur {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

/// 扫描字符串中的 `${...}` 片段，返回 (起始, 结束, 内容)
fn scan(s: &str) -> Vec<(usize, usize, &str)> {
    let mut found = Vec::new();
    let mut from = 0;
    while let Some(rel) = s[from..].find("${") {
        let start = from + rel;
        match s[start + 2..].find('}') {
            Some(len) => {
                let end = start + 2 + len + 1;
                found.push((start, end, &s[start + 2..end - 1]));
                from = end;
            }
            None => break,
        }
    }
    found
}

/// 收集参数中所有引用
pub fn find_references(params: &Value) -> Vec<Reference> {
    let mut refs = Vec::new();
    collect(params, &mut refs);
    refs
}

fn collect(value: &Value, out: &mut Vec<Reference>) {
    match value {
        Value::String(s) => out.extend(scan(s).into_iter().filter_map(|(_, _, inner)| Reference::parse(inner))),
        Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect(v, out)),
        _ => {}
    }
}

pub fn has_references(params: &Value) -> bool {
    !find_references(params).is_empty()
}

/// 用上游结果替换参数中的引用
pub fn resolve(params: &Value, upstream: &HashMap<String, Value>) -> Result<Value, OrchestratorError> {
    match params {
        Value::String(s) => resolve_str(s, upstream),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve(v, upstream))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve(v, upstream)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_str(s: &str, upstream: &HashMap<String, Value>) -> Result<Value, OrchestratorError> {
    let spans = scan(s);
    if spans.is_empty() {
        return Ok(Value::String(s.to_string()));
    }

    let fetch = |inner: &str| -> Result<Value, OrchestratorError> {
        let reference = Reference::parse(inner).ok_or_else(|| {
            OrchestratorError::Validation(format!("malformed reference '${{{}}}'", inner))
        })?;
        let payload = upstream.get(&reference.call_id).ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "reference to '{}' has no upstream result",
                reference.call_id
            ))
        })?;
        reference.lookup(payload).cloned().ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "field '{}' not found in result of '{}'",
                reference.path.join("."),
                reference.call_id
            ))
        })
    };

    if spans.len() == 1 && spans[0].0 == 0 && spans[0].1 == s.len() {
        return fetch(spans[0].2);
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for (start, end, inner) in spans {
        out.push_str(&s[last..start]);
        match fetch(inner)? {
            Value::String(v) => out.push_str(&v),
            v => out.push_str(&v.to_string()),
        }
        last = end;
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}
