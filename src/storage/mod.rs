// 存储模块：单条共享 Postgres 连接上的检查点与限流计数读写。

mod manager;
mod postgres;
mod refresh;

pub use manager::{ConnectionFactory, ConnectionManager, ConnectionStatus};
pub use postgres::{PgConn, PgFactory};
pub use refresh::RefreshWorker;

use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DatabaseConfig;

#[derive(Debug)]
pub enum StorageError {
    /// 缺少数据库地址等启动期配置问题，不可重试。
    Configuration(String),
    /// 探活或重建失败，调用方可重试。
    Connection(String),
    /// 限流计数写入失败，必须暴露给调用方。
    RateWrite(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Configuration(message) => write!(f, "configuration error: {message}"),
            StorageError::Connection(message) => write!(f, "connection error: {message}"),
            StorageError::RateWrite(message) => write!(f, "rate write error: {message}"),
        }
    }
}

impl std::error::Error for StorageError {}

#[derive(Debug, Clone)]
pub struct CheckpointTurn {
    pub role: String,
    pub content: String,
    pub created_time: f64,
}

/// 存储门面：对外只暴露业务操作，内部统一经由连接管理器拿连接，
/// 调用方不得缓存裸连接句柄。
pub struct Storage {
    manager: Arc<ConnectionManager<PgFactory>>,
    worker: Arc<RefreshWorker<PgFactory>>,
}

impl Storage {
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        let factory = PgFactory::new(config.clone())
            .map_err(|err| StorageError::Configuration(format!("数据库配置无效: {err}")))?;
        let manager = Arc::new(ConnectionManager::new(
            factory,
            Duration::from_secs(config.staleness_secs.max(1)),
        ));
        let worker = Arc::new(RefreshWorker::new(
            Arc::clone(&manager),
            Duration::from_secs(config.refresh_interval_secs.max(1)),
        ));
        Ok(Self { manager, worker })
    }

    /// 懒启动后台刷新任务后取连接，首个请求即让连接进入保活节奏。
    async fn conn(&self) -> Result<Arc<PgConn>> {
        self.worker.start();
        self.manager.get().await
    }

    pub async fn append_turn(&self, thread_id: &str, role: &str, content: &str) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO agent_checkpoints (thread_id, role, content, created_time) \
             VALUES ($1, $2, $3, $4)",
            &[&thread_id, &role, &content, &postgres::now_ts()],
        )
        .await?;
        Ok(())
    }

    /// 取最近 limit 条对话轮次，按时间先后排列。
    pub async fn recent_turns(&self, thread_id: &str, limit: i64) -> Result<Vec<CheckpointTurn>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT role, content, created_time FROM agent_checkpoints \
                 WHERE thread_id = $1 ORDER BY id DESC LIMIT $2",
                &[&thread_id, &limit],
            )
            .await?;
        let mut turns = rows
            .iter()
            .map(|row| CheckpointTurn {
                role: row.get(0),
                content: row.get(1),
                created_time: row.get(2),
            })
            .collect::<Vec<_>>();
        turns.reverse();
        Ok(turns)
    }

    pub async fn week_count(&self, client_id: &str, week_start: &str) -> Result<i64> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT count FROM rate_limits WHERE client_id = $1 AND week_start = $2",
                &[&client_id, &week_start],
            )
            .await?;
        Ok(row.map(|row| row.get(0)).unwrap_or(0))
    }

    /// 单条条件写完成自增：不存在则插入 count=1，存在则原子加一，
    /// 不做读改写，并发自增不会丢计数。
    pub async fn bump_week_count(&self, client_id: &str, week_start: &str) -> Result<i64> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "INSERT INTO rate_limits (client_id, week_start, count, last_updated) \
                 VALUES ($1, $2, 1, $3) \
                 ON CONFLICT (client_id, week_start) \
                 DO UPDATE SET count = rate_limits.count + 1, last_updated = EXCLUDED.last_updated \
                 RETURNING count",
                &[&client_id, &week_start, &postgres::now_ts()],
            )
            .await?;
        Ok(row.map(|row| row.get(0)).unwrap_or(1))
    }

    pub async fn connection_status(&self) -> Option<ConnectionStatus> {
        self.manager.status().await
    }

    pub async fn shutdown(&self) {
        self.worker.stop().await;
    }
}
