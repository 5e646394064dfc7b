// 代理执行循环：带工具调用的多轮模型对话，检查点尽力持久化。
use regex::Regex;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use tracing::{error, warn};

use crate::image_api::ImageApiClient;
use crate::llm::{ChatMessage, LlmClient, LlmResponse};
use crate::mailbox::{self, ToolResultStore};
use crate::object_store::ObjectStore;
use crate::rate_limit::RateLimiter;
use crate::schemas::ToolSpec;
use crate::storage::Storage;
use crate::tools::{self, ToolContext};

pub const FALLBACK_REPLY: &str =
    "I'm sorry, I couldn't process your request. Please try again.";

const HISTORY_LIMIT: i64 = 20;
const OBSERVATION_PREFIX: &str = "Tool result: ";

const SYSTEM_PROMPT_TEMPLATE: &str = "\
You are Picasso, a creative, artistic and intelligent AI image editing assistant \
with a playful personality and a deep understanding of visual arts. You are funny, \
witty and a master image prompt engineer who knows how to improve prompts to get \
stunning and accurate results. You help users transform their ideas into beautiful \
images through intelligent editing and generation.

YOUR PERSONALITY:
- Enthusiastic about art and creativity, with a great sense of humor.
- Warm, with artistic flair, detail oriented, always striving for the best results.
- Concise and not too verbose; ask clarifying questions when requests are vague.

CRITICAL RULES:
1. ONE IMAGE PER REQUEST: you can only generate ONE image per user request, \
regardless of what they ask for. If they request multiple images, explain this \
limitation and ask which one they'd like most.
2. ALWAYS USE THE TOOL: when generating or modifying images you MUST use the \
generate_image tool. Never try to create images directly. Only use the tool when \
it is clear the user wants you to edit or generate an image. If there is an error, \
or the tool is not working, just say so to the user.
3. PROMPT IMPROVEMENT: always enhance user prompts unless they explicitly say \
\"use my exact prompt\" or similar. Add artistic details, style, lighting, \
composition and mood, and orient the prompt to get the best results for \
{model_name}, which is the model behind the generate_image tool.
4. MULTIPLE IMAGE HANDLING: when users provide multiple images, use the image \
titles to identify them and confirm which image is the base for generation \
unless it is obvious.

AVAILABLE TOOLS:
{tools}
TOOL PROTOCOL:
To call a tool, reply with a single block in exactly this form and nothing else:
<tool_call>{\"name\": \"generate_image\", \"arguments\": {\"prompt\": \"...\", \"user_id\": \"...\", \"image_url\": \"...\", \"title\": \"...\"}}</tool_call>
After a tool result arrives, answer the user in plain text. Never wrap your final \
answer in tags.";

struct ToolCall {
    id: Option<String>,
    name: String,
    arguments: Value,
}

pub struct AgentReply {
    pub text: String,
    /// 工具在本次请求内投递的产物元数据，可能为空。
    pub artifact: Option<Value>,
}

pub struct Agent {
    llm: LlmClient,
    image_api: ImageApiClient,
    object_store: ObjectStore,
    storage: Arc<Storage>,
    mailbox: Arc<ToolResultStore>,
    rate: RateLimiter,
    system_prompt: String,
    specs: Vec<ToolSpec>,
    max_rounds: u32,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: LlmClient,
        image_api: ImageApiClient,
        object_store: ObjectStore,
        storage: Arc<Storage>,
        mailbox: Arc<ToolResultStore>,
        rate: RateLimiter,
        image_model: &str,
        max_rounds: u32,
    ) -> Self {
        let specs = tools::tool_specs();
        let system_prompt = build_system_prompt(image_model, &specs);
        Self {
            llm,
            image_api,
            object_store,
            storage,
            mailbox,
            rate,
            system_prompt,
            specs,
            max_rounds: max_rounds.max(1),
        }
    }

    /// 跑一轮完整对话：取历史、多轮模型调用与工具执行、落检查点，
    /// 最后领取本次请求产生的图片元数据。
    pub async fn chat(
        &self,
        message: &str,
        client_id: &str,
        user_id: &str,
        selected_images: &[String],
    ) -> AgentReply {
        let full_message = compose_user_message(message, selected_images);
        let mut messages = vec![ChatMessage::system(self.system_prompt.clone())];
        match self.storage.recent_turns(user_id, HISTORY_LIMIT).await {
            Ok(turns) => {
                for turn in turns {
                    match turn.role.as_str() {
                        "user" => messages.push(ChatMessage::user(turn.content)),
                        "assistant" => messages.push(ChatMessage::assistant(turn.content)),
                        _ => {}
                    }
                }
            }
            Err(err) => warn!(user_id, "读取会话检查点失败，按空历史继续: {err}"),
        }
        messages.push(ChatMessage::user(full_message.clone()));
        if let Err(err) = self.storage.append_turn(user_id, "user", &full_message).await {
            warn!(user_id, "写入用户检查点失败: {err}");
        }

        let mut answer = String::new();
        let mut last_content = String::new();
        for _round in 0..self.max_rounds {
            let response = match self.llm.complete(&messages, Some(&self.specs)).await {
                Ok(response) => response,
                Err(err) => {
                    error!(user_id, "模型调用失败: {err}");
                    break;
                }
            };
            last_content = response.content.clone();
            let calls = collect_tool_calls(&response);
            if calls.is_empty() {
                answer = strip_tool_calls(&response.content);
                break;
            }
            match response.tool_calls.clone() {
                Some(raw) => messages.push(ChatMessage::assistant_with_tools(
                    response.content.clone(),
                    raw,
                )),
                None => messages.push(ChatMessage::assistant(response.content.clone())),
            }
            let context = ToolContext {
                client_id,
                user_id,
                image_api: &self.image_api,
                object_store: &self.object_store,
                mailbox: &self.mailbox,
                rate: &self.rate,
            };
            for call in calls {
                let result = match tools::execute_tool(&context, &call.name, &call.arguments).await
                {
                    Ok(value) => value,
                    Err(err) => json!({ "error": err.to_string() }),
                };
                let observation = result.to_string();
                match call.id {
                    Some(id) => messages.push(ChatMessage::tool(observation, Some(id))),
                    None => messages.push(ChatMessage::user(format!(
                        "{OBSERVATION_PREFIX}{observation}"
                    ))),
                }
            }
        }

        if answer.is_empty() {
            answer = strip_tool_calls(&last_content);
        }
        if answer.is_empty() {
            answer = FALLBACK_REPLY.to_string();
        }
        if let Err(err) = self.storage.append_turn(user_id, "assistant", &answer).await {
            warn!(user_id, "写入助手检查点失败: {err}");
        }

        let artifact = self
            .mailbox
            .take(user_id, tools::GENERATE_IMAGE_TOOL, mailbox::now_ts());
        AgentReply {
            text: answer,
            artifact,
        }
    }
}

fn build_system_prompt(image_model: &str, specs: &[ToolSpec]) -> String {
    let mut tool_lines = String::new();
    for spec in specs {
        let schema = serde_json::to_string(&spec.input_schema).unwrap_or_default();
        tool_lines.push_str(&format!(
            "- {}: {}\n  parameters: {schema}\n",
            spec.name, spec.description
        ));
    }
    SYSTEM_PROMPT_TEMPLATE
        .replace("{model_name}", image_model)
        .replace("{tools}", &tool_lines)
}

fn compose_user_message(message: &str, selected_images: &[String]) -> String {
    let names: Vec<&str> = selected_images
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .collect();
    if names.is_empty() {
        message.to_string()
    } else {
        format!("{message} Selected images: {}.", names.join(", "))
    }
}

fn collect_tool_calls(response: &LlmResponse) -> Vec<ToolCall> {
    if let Some(payload) = response.tool_calls.as_ref() {
        let calls = native_tool_calls(payload);
        if !calls.is_empty() {
            return calls;
        }
    }
    parse_tool_calls_from_text(&response.content)
}

fn native_tool_calls(payload: &Value) -> Vec<ToolCall> {
    let Some(items) = payload.as_array() else {
        return Vec::new();
    };
    let mut calls = Vec::new();
    for item in items {
        let Some(function) = item.get("function").and_then(Value::as_object) else {
            continue;
        };
        let name = function
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if name.is_empty() {
            continue;
        }
        let arguments = match function.get("arguments") {
            Some(Value::String(text)) => serde_json::from_str::<Value>(text)
                .unwrap_or_else(|_| json!({ "raw": text })),
            Some(other) => other.clone(),
            None => json!({}),
        };
        let id = item
            .get("id")
            .and_then(Value::as_str)
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        calls.push(ToolCall {
            id,
            name,
            arguments,
        });
    }
    calls
}

fn tool_call_block_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        compile_regex(
            r"(?is)<tool_call\b[^>]*>(?P<payload>.*?)</tool_call\s*>",
            "tool_call_block",
        )
    })
    .as_ref()
}

fn tool_open_tag_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| compile_regex(r"(?is)<tool_call\b[^>]*>", "tool_open_tag")).as_ref()
}

fn compile_regex(pattern: &str, label: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(err) => {
            error!("invalid agent regex {label}: {err}");
            None
        }
    }
}

fn parse_tool_calls_from_text(content: &str) -> Vec<ToolCall> {
    if content.trim().is_empty() {
        return Vec::new();
    }
    let mut calls = Vec::new();
    if let Some(regex) = tool_call_block_regex() {
        for captures in regex.captures_iter(content) {
            let payload = captures.name("payload").map(|m| m.as_str()).unwrap_or("");
            if let Some(call) = parse_tool_call_payload(payload) {
                calls.push(call);
            }
        }
    }
    if calls.is_empty() {
        // 标签未闭合时取其后残余文本解析。
        if let Some(regex) = tool_open_tag_regex() {
            if let Some(mat) = regex.find(content) {
                if let Some(remainder) = content.get(mat.end()..) {
                    if let Some(call) = parse_tool_call_payload(remainder) {
                        calls.push(call);
                    }
                }
            }
        }
    }
    calls
}

fn parse_tool_call_payload(payload: &str) -> Option<ToolCall> {
    let candidate = first_json_object(payload)?;
    let value = serde_json::from_str::<Value>(candidate).ok()?;
    let map = value.as_object()?;
    let name = map
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    if name.is_empty() {
        return None;
    }
    let arguments = match map.get("arguments").cloned().unwrap_or_else(|| json!({})) {
        Value::String(text) => serde_json::from_str::<Value>(&text)
            .unwrap_or_else(|_| json!({ "raw": text })),
        Value::Null => json!({}),
        other => other,
    };
    Some(ToolCall {
        id: None,
        name,
        arguments,
    })
}

/// 在文本中找到第一段括号配平的 JSON 对象，容忍前后缀杂讯。
fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;
    for (index, &byte) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escape {
                escape = false;
                continue;
            }
            if byte == b'\\' {
                escape = true;
                continue;
            }
            if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return text.get(start..=index);
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_tool_calls(content: &str) -> String {
    if content.is_empty() {
        return String::new();
    }
    let mut stripped = content.to_string();
    if let Some(regex) = tool_call_block_regex() {
        stripped = regex.replace_all(&stripped, "").to_string();
    }
    let cut = tool_open_tag_regex().and_then(|regex| regex.find(&stripped).map(|mat| mat.start()));
    if let Some(position) = cut {
        stripped.truncate(position);
    }
    stripped.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_closed_tool_call_block() {
        let content = r#"Let me paint that. <tool_call>{"name":"generate_image","arguments":{"prompt":"a cat","user_id":"u1"}}</tool_call>"#;
        let calls = parse_tool_calls_from_text(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "generate_image");
        assert_eq!(
            calls[0].arguments.get("prompt").and_then(Value::as_str),
            Some("a cat")
        );
    }

    #[test]
    fn parse_string_arguments() {
        let content = r#"<tool_call>{"name":"generate_image","arguments":"{\"prompt\":\"a dog\"}"}</tool_call>"#;
        let calls = parse_tool_calls_from_text(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].arguments.get("prompt").and_then(Value::as_str),
            Some("a dog")
        );
    }

    #[test]
    fn parse_unclosed_tag_with_trailing_junk() {
        let content = r#"<tool_call>{"name":"generate_image","arguments":{"prompt":"sunset"}}</think>"#;
        let calls = parse_tool_calls_from_text(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].arguments.get("prompt").and_then(Value::as_str),
            Some("sunset")
        );
    }

    #[test]
    fn native_calls_take_precedence() {
        let response = LlmResponse {
            content: "calling".to_string(),
            tool_calls: Some(json!([{
                "id": "call_1",
                "type": "function",
                "function": {
                    "name": "generate_image",
                    "arguments": "{\"prompt\":\"a fox\"}"
                }
            }])),
        };
        let calls = collect_tool_calls(&response);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id.as_deref(), Some("call_1"));
        assert_eq!(
            calls[0].arguments.get("prompt").and_then(Value::as_str),
            Some("a fox")
        );
    }

    #[test]
    fn plain_reply_yields_no_calls() {
        let response = LlmResponse {
            content: "Here is an idea for your painting.".to_string(),
            tool_calls: None,
        };
        assert!(collect_tool_calls(&response).is_empty());
    }

    #[test]
    fn strip_removes_blocks_and_unclosed_tail() {
        let content = "before <tool_call>{\"name\":\"x\",\"arguments\":{}}</tool_call> after";
        assert_eq!(strip_tool_calls(content), "before  after");
        let unclosed = "answer text <tool_call>{\"name\":\"x\"";
        assert_eq!(strip_tool_calls(unclosed), "answer text");
    }

    #[test]
    fn user_message_appends_selected_images() {
        assert_eq!(compose_user_message("make it blue", &[]), "make it blue");
        let selected = vec!["Sunset".to_string(), " Portrait ".to_string()];
        assert_eq!(
            compose_user_message("make it blue", &selected),
            "make it blue Selected images: Sunset, Portrait."
        );
    }

    #[test]
    fn system_prompt_mentions_model_and_tool() {
        let prompt = build_system_prompt("black-forest-labs/flux-kontext-pro", &tools::tool_specs());
        assert!(prompt.contains("black-forest-labs/flux-kontext-pro"));
        assert!(prompt.contains("generate_image"));
        assert!(!prompt.contains("{model_name}"));
        assert!(!prompt.contains("{tools}"));
    }
}
