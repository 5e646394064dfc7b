use anyhow::{anyhow, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::ImageConfig;

/// 图像生成服务客户端：同步等待模式提交预测请求，
/// 拿到输出链接后把成品字节拉回本地。
#[derive(Clone)]
pub struct ImageApiClient {
    http: Client,
    config: ImageConfig,
}

impl ImageApiClient {
    pub fn new(config: ImageConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs.max(5));
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, config })
    }

    pub fn is_configured(&self) -> bool {
        !self.config.api_token.trim().is_empty()
    }

    pub async fn generate(&self, prompt: &str, input_image: Option<&str>) -> Result<Vec<u8>> {
        let endpoint = format!(
            "{}/v1/models/{}/predictions",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        );
        let mut input = json!({
            "prompt": prompt,
            "output_format": "png",
        });
        if let Some(url) = input_image {
            if !url.trim().is_empty() {
                input["input_image"] = json!(url);
            }
        }
        let response = self
            .http
            .post(endpoint)
            .headers(self.headers())
            .json(&json!({ "input": input }))
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(anyhow!("生成请求失败: {status} {body}"));
        }
        if let Some(error) = body.get("error").and_then(Value::as_str) {
            if !error.trim().is_empty() {
                return Err(anyhow!("生成失败: {error}"));
            }
        }
        let output_url = extract_output_url(&body)
            .ok_or_else(|| anyhow!("生成结果缺少输出链接: {}", body))?;
        self.fetch_bytes(&output_url).await
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    fn headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        let token = self.config.api_token.trim();
        if !token.is_empty() {
            let value = format!("Bearer {token}");
            if let Ok(header_value) = value.parse() {
                headers.insert(reqwest::header::AUTHORIZATION, header_value);
            }
        }
        headers.insert(
            reqwest::header::HeaderName::from_static("prefer"),
            reqwest::header::HeaderValue::from_static("wait"),
        );
        headers
    }
}

/// output 字段既可能是单个链接也可能是链接列表，取第一个。
fn extract_output_url(body: &Value) -> Option<String> {
    match body.get("output") {
        Some(Value::String(url)) if !url.trim().is_empty() => Some(url.clone()),
        Some(Value::Array(items)) => items
            .iter()
            .find_map(Value::as_str)
            .map(|url| url.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::extract_output_url;
    use serde_json::json;

    #[test]
    fn output_url_from_string_or_list() {
        assert_eq!(
            extract_output_url(&json!({"output": "https://cdn/img.png"})),
            Some("https://cdn/img.png".to_string())
        );
        assert_eq!(
            extract_output_url(&json!({"output": ["https://cdn/a.png", "https://cdn/b.png"]})),
            Some("https://cdn/a.png".to_string())
        );
        assert_eq!(extract_output_url(&json!({"output": null})), None);
        assert_eq!(extract_output_url(&json!({})), None);
        assert_eq!(extract_output_url(&json!({"output": ""})), None);
    }
}
