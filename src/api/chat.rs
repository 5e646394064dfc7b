// 聊天入口：/chat 编排代理调用并组装生成图元数据。
use crate::api::errors::error_response;
use crate::object_store::ObjectStore;
use crate::schemas::{
    ChatRequest, ChatResponse, DatabaseHealth, GeneratedImage, HealthResponse,
};
use crate::state::AppState;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::{routing::get, routing::post, Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

const SERVICE_NAME: &str = "easel-server";

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/chat", post(chat_entry))
}

async fn root() -> Json<Value> {
    Json(json!({ "message": "AI Image Editor API is running!" }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let status = state.storage.connection_status().await;
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: SERVICE_NAME.to_string(),
        database: Some(DatabaseHealth {
            connected: status.is_some(),
            age_secs: status.map(|status| status.age_secs as u64),
        }),
    })
}

async fn chat_entry(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, Response> {
    if request.message.trim().is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "message is required",
        ));
    }
    let user_id = request.effective_user_id();
    let client_id = resolve_client_id(&headers, remote_addr);
    info!(user_id, client_id, "处理聊天请求");

    let reply = state
        .agent
        .chat(
            &request.message,
            &client_id,
            &user_id,
            &request.selected_images,
        )
        .await;
    let image = reply
        .artifact
        .as_ref()
        .and_then(|meta| build_image_payload(&state, &user_id, meta));
    Ok(Json(ChatResponse::success(reply.text, image)))
}

/// 反向代理后取 x-forwarded-for 首项，否则落回对端地址。
fn resolve_client_id(headers: &HeaderMap, remote_addr: SocketAddr) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    remote_addr.ip().to_string()
}

fn build_image_payload(state: &AppState, user_id: &str, meta: &Value) -> Option<GeneratedImage> {
    let image_id = meta.get("imageId").and_then(Value::as_str)?.to_string();
    let title = meta
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("Generated Image")
        .to_string();
    let prompt = meta
        .get("prompt")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let key = ObjectStore::image_key(user_id, &image_id);
    match state.object_store.presign_get(&key) {
        Ok(url) => Some(GeneratedImage {
            image_id,
            title,
            prompt,
            url,
        }),
        Err(err) => {
            // 链接签不出来时只丢图片元数据，文本回复照常返回。
            warn!(user_id, image_id = %image_id, "生成下载链接失败: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn addr() -> SocketAddr {
        "10.1.2.3:52100".parse().expect("socket addr")
    }

    #[test]
    fn client_id_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 70.41.3.18"),
        );
        assert_eq!(resolve_client_id(&headers, addr()), "203.0.113.9");
    }

    #[test]
    fn client_id_falls_back_to_peer_address() {
        assert_eq!(resolve_client_id(&HeaderMap::new(), addr()), "10.1.2.3");
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("  ,  "));
        assert_eq!(resolve_client_id(&headers, addr()), "10.1.2.3");
    }
}
