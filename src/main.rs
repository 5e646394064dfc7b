// Rust 入口：装配状态并挂载 API 路由。
mod agent;
mod api;
mod config;
mod image_api;
mod llm;
mod mailbox;
mod object_store;
mod rate_limit;
mod schemas;
mod shutdown;
mod state;
mod storage;
mod tools;

use clap::Parser;
use config::Config;
use shutdown::shutdown_signal;
use state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    bin_name = "easel-server",
    about = "Conversational image editing backend"
)]
struct ServerArgs {
    /// Config file path. Defaults to EASEL_CONFIG or config/easel.yaml.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();
    let config = config::load_config_from(args.config.as_deref());
    init_tracing(&config);
    let state = Arc::new(AppState::new(config)?);

    let app = api::build_router(state.clone())
        .layer(build_cors())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = bind_address(&state.config);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!("图像编辑 API 服务已启动: http://{addr}");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        warn!("服务退出异常: {err}");
    }

    // 先停掉后台刷新任务再退出，避免孤儿任务拖住进程。
    state.storage.shutdown().await;
    Ok(())
}

fn init_tracing(config: &Config) {
    let default_level = config.observability.log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn bind_address(config: &Config) -> String {
    // 保留环境变量覆盖，便于容器化部署。
    let host = std::env::var("EASEL_HOST").unwrap_or_else(|_| config.server.host.clone());
    let port = std::env::var("EASEL_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.server.port);
    format!("{host}:{port}")
}

fn build_cors() -> CorsLayer {
    // 前端域名不固定，跨域全放开，与原部署行为一致。
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
