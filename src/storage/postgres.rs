use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;
use tracing::warn;

use super::manager::ConnectionFactory;
use crate::config::DatabaseConfig;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS agent_checkpoints (
    id BIGSERIAL PRIMARY KEY,
    thread_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_time DOUBLE PRECISION NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agent_checkpoints_thread ON agent_checkpoints(thread_id, id);
CREATE TABLE IF NOT EXISTS rate_limits (
    client_id TEXT NOT NULL,
    week_start TEXT NOT NULL,
    count BIGINT NOT NULL DEFAULT 0,
    last_updated DOUBLE PRECISION NOT NULL,
    PRIMARY KEY (client_id, week_start)
);
";

pub struct PgConn {
    client: tokio_postgres::Client,
}

impl PgConn {
    pub async fn ping(&self) -> Result<()> {
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }

    pub async fn execute(&self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        Ok(self.client.execute(query, params).await?)
    }

    pub async fn query(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<tokio_postgres::Row>> {
        Ok(self.client.query(query, params).await?)
    }

    pub async fn query_opt(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<tokio_postgres::Row>> {
        Ok(self.client.query_opt(query, params).await?)
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.client.batch_execute(SCHEMA_SQL).await?;
        Ok(())
    }
}

/// 按托管库的约束建连：keepalive 压低到秒级，附带连接超时与应用名。
/// 每次建连都执行幂等建表，保证新连接可直接使用。
pub struct PgFactory {
    config: DatabaseConfig,
}

impl PgFactory {
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        let cleaned = config.url.trim();
        if cleaned.is_empty() {
            return Err(anyhow!("postgres dsn is empty"));
        }
        // 提前解析一次，配置错误在启动期暴露而不是首个请求。
        cleaned.parse::<tokio_postgres::Config>()?;
        Ok(Self { config })
    }

    fn pg_config(&self) -> Result<tokio_postgres::Config> {
        let mut pg = self.config.url.trim().parse::<tokio_postgres::Config>()?;
        pg.keepalives(true);
        pg.keepalives_idle(Duration::from_secs(self.config.keepalive_idle_secs.max(1)));
        pg.keepalives_interval(Duration::from_secs(self.config.keepalive_interval_secs.max(1)));
        pg.keepalives_retries(self.config.keepalive_retries);
        pg.connect_timeout(Duration::from_secs(self.config.connect_timeout_secs.max(1)));
        pg.application_name(&self.config.application_name);
        Ok(pg)
    }
}

#[async_trait]
impl ConnectionFactory for PgFactory {
    type Conn = PgConn;

    async fn connect(&self) -> Result<PgConn> {
        let (client, connection) = self.pg_config()?.connect(NoTls).await?;
        // 驱动任务随连接存活，连接被替换后随之结束。
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!("数据库连接驱动任务退出: {err}");
            }
        });
        let conn = PgConn { client };
        conn.ensure_schema().await?;
        Ok(conn)
    }

    async fn probe(&self, conn: &PgConn) -> Result<()> {
        conn.ping().await
    }
}

pub(crate) fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}
