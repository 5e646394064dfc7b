// 配置读取：YAML 加载、环境变量占位符展开与默认值。
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::env;
use std::fs;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub staleness_secs: u64,
    pub refresh_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub keepalive_idle_secs: u64,
    pub keepalive_interval_secs: u64,
    pub keepalive_retries: u32,
    pub application_name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            // 托管库空闲 5 分钟即断连，保持刷新间隔低于过期阈值。
            staleness_secs: 300,
            refresh_interval_secs: 240,
            connect_timeout_secs: 10,
            keepalive_idle_secs: 10,
            keepalive_interval_secs: 5,
            keepalive_retries: 5,
            application_name: "easel-server".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_rounds: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            model: "gemini-2.5-flash".to_string(),
            temperature: 0.7,
            timeout_secs: 120,
            max_rounds: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub base_url: String,
    pub api_token: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.replicate.com".to_string(),
            api_token: String::new(),
            model: "black-forest-labs/flux-kontext-pro".to_string(),
            timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint: String,
    pub url_ttl_secs: u64,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            endpoint: String::new(),
            url_ttl_secs: 7200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub weekly_limit: i64,
    pub mailbox_retention_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            weekly_limit: 10,
            mailbox_retention_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

pub fn load_config() -> Config {
    load_config_from(None)
}

/// 命令行显式给出的路径优先于 EASEL_CONFIG 与默认路径。
pub fn load_config_from(path: Option<&str>) -> Config {
    let path = path
        .map(str::to_string)
        .or_else(|| env::var("EASEL_CONFIG").ok())
        .unwrap_or_else(|| "config/easel.yaml".to_string());
    let mut value = read_yaml(&path);
    expand_yaml_env(&mut value);

    let mut config = if value.is_null() {
        Config::default()
    } else {
        serde_yaml::from_value::<Config>(value).unwrap_or_else(|err| {
            warn!("配置解析失败，使用默认配置: {err}");
            Config::default()
        })
    };

    // DATABASE_URL 始终优先于配置文件，与托管部署约定保持一致。
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            config.database.url = url.trim().to_string();
        }
    }
    config
}

fn read_yaml(path: &str) -> Value {
    // 配置文件允许不存在，避免首次启动失败。
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!("读取配置失败: {path}, {err}");
            return Value::Null;
        }
    };
    serde_yaml::from_str(&content).unwrap_or_else(|err| {
        warn!("解析 YAML 失败: {path}, {err}");
        Value::Null
    })
}

fn expand_yaml_env(value: &mut Value) {
    match value {
        Value::String(text) => {
            *text = expand_env_placeholders(text);
        }
        Value::Sequence(items) => {
            for item in items {
                expand_yaml_env(item);
            }
        }
        Value::Mapping(map) => {
            for (_, value) in map.iter_mut() {
                expand_yaml_env(value);
            }
        }
        _ => {}
    }
}

fn expand_env_placeholders(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        let Some(end) = rest.find('}') else {
            output.push_str("${");
            output.push_str(rest);
            return output;
        };
        let inner = &rest[..end];
        rest = &rest[end + 1..];
        let (name, default_value) = match inner.split_once(":-") {
            Some((name, default_value)) => (name.trim(), Some(default_value)),
            None => (inner.trim(), None),
        };
        if name.is_empty() {
            output.push_str("${");
            output.push_str(inner);
            output.push('}');
            continue;
        }
        let resolved = env::var(name).ok().filter(|value| !value.is_empty());
        match (resolved, default_value) {
            (Some(value), _) => output.push_str(&value),
            (None, Some(default_value)) => output.push_str(default_value),
            (None, None) => {}
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_placeholders() {
        std::env::remove_var("EASEL_TEST_PLACEHOLDER");
        assert_eq!(
            expand_env_placeholders("${EASEL_TEST_PLACEHOLDER:-fallback}"),
            "fallback"
        );
        assert_eq!(
            expand_env_placeholders("pre-${EASEL_TEST_PLACEHOLDER:-x}-post"),
            "pre-x-post"
        );

        std::env::set_var("EASEL_TEST_PLACEHOLDER", "value");
        assert_eq!(
            expand_env_placeholders("${EASEL_TEST_PLACEHOLDER:-fallback}"),
            "value"
        );
        assert_eq!(
            expand_env_placeholders("pre-${EASEL_TEST_PLACEHOLDER}-post"),
            "pre-value-post"
        );

        std::env::remove_var("EASEL_TEST_PLACEHOLDER");
        assert_eq!(expand_env_placeholders("${EASEL_TEST_PLACEHOLDER}"), "");
    }

    #[test]
    fn test_defaults_follow_managed_tier_windows() {
        let config = Config::default();
        assert_eq!(config.database.staleness_secs, 300);
        assert!(config.database.refresh_interval_secs < config.database.staleness_secs);
        assert_eq!(config.limits.weekly_limit, 10);
        assert_eq!(config.limits.mailbox_retention_secs, 86_400);
        assert_eq!(config.object_store.url_ttl_secs, 7200);
    }

    #[test]
    fn test_load_config_reads_yaml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("easel.yaml");
        std::fs::write(
            &path,
            "server:\n  port: 9100\ndatabase:\n  staleness_secs: 120\n",
        )
        .expect("write config");
        std::env::set_var("EASEL_CONFIG", &path);
        std::env::remove_var("DATABASE_URL");
        let config = load_config();
        std::env::remove_var("EASEL_CONFIG");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.database.staleness_secs, 120);
        // 未覆盖的段沿用默认值。
        assert_eq!(config.database.refresh_interval_secs, 240);
    }
}
