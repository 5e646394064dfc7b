// API 请求与响应数据结构，保持与前端接口字段一致。
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub selected_images: Vec<String>,
    #[serde(default = "default_user_id")]
    pub user_id: String,
}

fn default_user_id() -> String {
    "default_user".to_string()
}

impl ChatRequest {
    /// 空白 user_id 回退到默认用户，保持会话线程稳定。
    pub fn effective_user_id(&self) -> String {
        let trimmed = self.user_id.trim();
        if trimmed.is_empty() {
            default_user_id()
        } else {
            trimmed.to_string()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<GeneratedImage>,
}

impl ChatResponse {
    pub fn success(response: String, image: Option<GeneratedImage>) -> Self {
        Self {
            response,
            status: "success".to_string(),
            image,
        }
    }
}

/// 返回给前端的生成图元数据，url 为限时下载链接。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub image_id: String,
    pub title: String,
    pub prompt: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseHealth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseHealth {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_defaults() {
        let request: ChatRequest =
            serde_json::from_str(r#"{"message": "hello"}"#).expect("parse");
        assert_eq!(request.message, "hello");
        assert!(request.selected_images.is_empty());
        assert_eq!(request.user_id, "default_user");
    }

    #[test]
    fn blank_user_id_falls_back() {
        let request: ChatRequest =
            serde_json::from_str(r#"{"message": "hi", "user_id": "   "}"#).expect("parse");
        assert_eq!(request.effective_user_id(), "default_user");
    }

    #[test]
    fn response_omits_missing_image() {
        let body = serde_json::to_string(&ChatResponse::success("ok".to_string(), None))
            .expect("serialize");
        assert!(!body.contains("\"image\""));
        assert!(body.contains("\"status\":\"success\""));
    }
}
