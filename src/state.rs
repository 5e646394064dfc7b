// 全局状态：存储门面、对象存储与代理实例。

use crate::agent::Agent;
use crate::config::Config;
use crate::image_api::ImageApiClient;
use crate::llm::LlmClient;
use crate::mailbox::ToolResultStore;
use crate::object_store::ObjectStore;
use crate::rate_limit::RateLimiter;
use crate::storage::Storage;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::warn;

pub struct AppState {
    pub config: Config,
    pub storage: Arc<Storage>,
    pub object_store: ObjectStore,
    pub agent: Agent,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::new(&config.database).context("存储初始化失败")?);
        let mailbox = Arc::new(ToolResultStore::with_retention(
            config.limits.mailbox_retention_secs as f64,
        ));
        let rate = RateLimiter::new(Arc::clone(&storage), config.limits.weekly_limit);
        let llm = LlmClient::new(config.llm.clone()).context("模型客户端初始化失败")?;
        let image_api =
            ImageApiClient::new(config.image.clone()).context("图像接口客户端初始化失败")?;
        let object_store =
            ObjectStore::new(config.object_store.clone()).context("对象存储客户端初始化失败")?;

        if !llm.is_configured() {
            warn!("未配置模型地址，聊天将始终返回兜底回复");
        }
        if !image_api.is_configured() {
            warn!("未配置图像生成令牌，生成工具将不可用");
        }
        if !object_store.is_configured() {
            warn!("未配置对象存储凭据，生成图片无法落库");
        }

        let agent = Agent::new(
            llm,
            image_api,
            object_store.clone(),
            Arc::clone(&storage),
            mailbox,
            rate,
            &config.image.model,
            config.llm.max_rounds,
        );
        Ok(Self {
            config,
            storage,
            object_store,
            agent,
        })
    }
}
