//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预设响应；预设用完后，生成一个调用 echo 回显意图的单步计划，便于本地跑通规划与执行流程。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

/// Mock 客户端：预设响应队列 + echo 计划兜底
#[derive(Debug, Default)]
pub struct MockLlmClient {
    scripted: Mutex<VecDeque<Result<String, String>>>,
    calls: AtomicUsize,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 依次返回给定响应
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::default();
        for r in responses {
            client.push(Ok(r.into()));
        }
        client
    }

    pub fn push(&self, response: Result<String, String>) {
        self.scripted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
    }

    /// 已被调用的次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let next = self
            .scripted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(response) = next {
            return response;
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let intent = last_user
            .lines()
            .find_map(|l| l.strip_prefix("Intent:"))
            .map(str::trim)
            .unwrap_or(last_user);

        Ok(serde_json::json!({
            "tool_calls": [{
                "call_id": "c1",
                "tool_name": "echo",
                "parameters": { "text": format!("Echo from Mock: {}", intent) },
                "dependencies": [],
                "priority": 1
            }],
            "reasoning": "mock plan"
        })
        .to_string())
    }
}
