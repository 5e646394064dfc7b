// LLM 适配：OpenAI 兼容的 Chat Completions 调用。
use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::LlmConfig;
use crate::schemas::ToolSpec;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// 助手消息回传原生 tool_calls 时需要原样带回。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
}

impl ChatMessage {
    fn plain(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content.into())
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content.into())
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Value) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: Some(tool_calls),
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: Option<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: content.into(),
            tool_call_id,
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    /// 原样保留响应里的 tool_calls 字段，调用方自行解析。
    pub tool_calls: Option<Value>,
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs.max(5));
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, config })
    }

    pub fn is_configured(&self) -> bool {
        !self.config.base_url.trim().is_empty()
    }

    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
    ) -> Result<LlmResponse> {
        let response = self
            .http
            .post(self.endpoint())
            .headers(self.headers())
            .json(&self.build_payload(messages, tools))
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(anyhow!("模型请求失败: {status} {body}"));
        }
        let message = body
            .get("choices")
            .and_then(|value| value.get(0))
            .and_then(|value| value.get("message"))
            .cloned()
            .unwrap_or(Value::Null);
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let tool_calls = message
            .get("tool_calls")
            .filter(|value| !value.is_null())
            .cloned();
        Ok(LlmResponse {
            content,
            tool_calls,
        })
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.trim().trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    fn headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        let api_key = self.config.api_key.trim();
        if !api_key.is_empty() {
            let value = format!("Bearer {api_key}");
            if let Ok(header_value) = value.parse() {
                headers.insert(reqwest::header::AUTHORIZATION, header_value);
            }
        }
        headers
    }

    fn build_payload(&self, messages: &[ChatMessage], tools: Option<&[ToolSpec]>) -> Value {
        let mut payload = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "stream": false,
        });
        if let Some(specs) = tools {
            if !specs.is_empty() {
                let entries: Vec<Value> = specs
                    .iter()
                    .map(|spec| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": spec.name,
                                "description": spec.description,
                                "parameters": spec.input_schema,
                            }
                        })
                    })
                    .collect();
                payload["tools"] = Value::Array(entries);
            }
        }
        payload
    }
}
