// 内置工具定义与执行入口，保持工具名称与协议一致。
use anyhow::Result;
use serde_json::{json, Value};
use tracing::{error, warn};
use uuid::Uuid;

use crate::image_api::ImageApiClient;
use crate::mailbox::{self, ToolResultStore};
use crate::object_store::ObjectStore;
use crate::rate_limit::RateLimiter;
use crate::schemas::ToolSpec;

pub const GENERATE_IMAGE_TOOL: &str = "generate_image";

const DEFAULT_IMAGE_TITLE: &str = "Generated Image";

const LIMIT_REACHED_MESSAGE: &str =
    "Weekly image generation limit reached. The limit resets on Monday. \
     Let the user know and offer to help plan the next image instead.";

const GENERATE_IMAGE_DESCRIPTION: &str = "\
Generate a high-quality image based on a detailed prompt. \
This tool creates stunning images using advanced AI generation techniques. \
IMPORTANT: Use this tool only ONCE per user request. If the tool returns an \
error or has issues, just say so. Don't use this tool multiple times for the \
same user request or message.";

pub struct ToolContext<'a> {
    pub client_id: &'a str,
    pub user_id: &'a str,
    pub image_api: &'a ImageApiClient,
    pub object_store: &'a ObjectStore,
    pub mailbox: &'a ToolResultStore,
    pub rate: &'a RateLimiter,
}

pub fn tool_specs() -> Vec<ToolSpec> {
    vec![ToolSpec {
        name: GENERATE_IMAGE_TOOL.to_string(),
        description: GENERATE_IMAGE_DESCRIPTION.to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "Detailed description of what to generate. Include style, mood, lighting, composition and specific details for best results."
                },
                "user_id": {
                    "type": "string",
                    "description": "The unique identifier for the user requesting the image."
                },
                "image_url": {
                    "type": "string",
                    "description": "URL of the source/reference image to base the generation on."
                },
                "title": {
                    "type": "string",
                    "description": "A concise, accurate title for the generated image."
                }
            },
            "required": ["prompt", "user_id"]
        }),
    }]
}

pub async fn execute_tool(context: &ToolContext<'_>, name: &str, args: &Value) -> Result<Value> {
    match name {
        GENERATE_IMAGE_TOOL => generate_image(context, args).await,
        other => {
            warn!("模型请求了未知工具: {other}");
            Ok(json!({ "error": format!("Unknown tool: {other}") }))
        }
    }
}

struct GenerateArgs {
    prompt: String,
    image_url: Option<String>,
    title: String,
}

fn parse_generate_args(args: &Value) -> Result<GenerateArgs, String> {
    let prompt = args
        .get("prompt")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if prompt.is_empty() {
        return Err("prompt is required".to_string());
    }
    let image_url = args
        .get("image_url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string);
    let title = args
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .unwrap_or(DEFAULT_IMAGE_TITLE)
        .to_string();
    Ok(GenerateArgs {
        prompt: prompt.to_string(),
        image_url,
        title,
    })
}

/// 生图工具：限流前置检查，生成后上传对象存储并把元数据投入信箱。
/// 会话身份一律取服务端解析的 user_id，不信任模型填写的参数。
async fn generate_image(context: &ToolContext<'_>, args: &Value) -> Result<Value> {
    let parsed = match parse_generate_args(args) {
        Ok(parsed) => parsed,
        Err(message) => return Ok(json!({ "error": message })),
    };

    if context.rate.is_exhausted(context.client_id).await {
        return Ok(json!({ "error": LIMIT_REACHED_MESSAGE }));
    }

    let bytes = match context
        .image_api
        .generate(&parsed.prompt, parsed.image_url.as_deref())
        .await
    {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(user_id = context.user_id, "图像生成失败: {err}");
            return Ok(json!({ "error": format!("Image generation failed: {err}") }));
        }
    };

    let image_id = Uuid::new_v4().to_string();
    if let Err(err) = context
        .object_store
        .upload_generated_image(
            context.user_id,
            &image_id,
            bytes,
            &parsed.prompt,
            &parsed.title,
        )
        .await
    {
        warn!(user_id = context.user_id, image_id = %image_id, "生成图上传失败: {err}");
        return Ok(json!({ "error": format!("Image upload failed: {err}") }));
    }

    context.mailbox.store(
        context.user_id,
        GENERATE_IMAGE_TOOL,
        json!({
            "imageId": image_id,
            "title": parsed.title,
            "prompt": parsed.prompt,
        }),
        mailbox::now_ts(),
    );

    // 计数失败只记日志：图已生成并落库，不再向用户报错。
    if let Err(err) = context.rate.increment(context.client_id).await {
        error!(client_id = context.client_id, "限流计数自增失败: {err}");
    }

    Ok(json!({
        "success": true,
        "image_id": image_id,
        "title": parsed.title,
        "message": "Image generated successfully and saved to the user's gallery.",
    }))
}
