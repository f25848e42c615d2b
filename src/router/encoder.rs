//! 上下文编码：把查询文本与 JSON 上下文编码成固定维度的特征向量
//!
//! 特征哈希（feature hashing）：词与 `key=value` 对哈希到桶并按符号累加，数值字段直接带入数值，最后做 L2 归一化。

use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct ContextEncoder {
    dim: usize,
}

impl ContextEncoder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn encode(&self, query: &str, context: &Value) -> Vec<f64> {
        let mut v = vec![0.0; self.dim];
        for token in query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            self.add(&mut v, &format!("q:{}", token.to_lowercase()), 1.0);
        }
        self.add_value(&mut v, "ctx", context);

        let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }

    fn add_value(&self, v: &mut [f64], prefix: &str, value: &Value) {
        match value {
            Value::Object(map) => {
                for (k, child) in map {
                    self.add_value(v, &format!("{}.{}", prefix, k), child);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.add_value(v, prefix, item);
                }
            }
            Value::Number(n) => {
                if let Some(x) = n.as_f64().filter(|x| x.is_finite()) {
                    self.add(v, prefix, x);
                }
            }
            Value::String(s) => self.add(v, &format!("{}={}", prefix, s.to_lowercase()), 1.0),
            Value::Bool(b) => self.add(v, &format!("{}={}", prefix, b), 1.0),
            Value::Null => {}
        }
    }

    fn add(&self, v: &mut [f64], feature: &str, weight: f64) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let h = u64::from_le_bytes(bytes);
        let idx = (h % self.dim as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[idx] += sign * weight;
    }
}
