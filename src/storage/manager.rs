use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::StorageError;

/// 连接工厂：负责建连与探活，便于测试替换真实数据库。
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Conn: Send + Sync + 'static;

    async fn connect(&self) -> Result<Self::Conn>;

    /// 对连接执行一次轻量探活查询，失败即视为连接已死。
    async fn probe(&self, conn: &Self::Conn) -> Result<()>;
}

struct ManagedConnection<C> {
    conn: Arc<C>,
    created_at: Instant,
    last_validated_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionStatus {
    pub age_secs: f64,
    pub validated_age_secs: f64,
}

/// 单一共享连接的持有者：get() 要么返回可用连接，要么在锁内重建。
/// 重建由互斥锁串行化，并发调用方等待而不是各自建连。
pub struct ConnectionManager<F: ConnectionFactory> {
    factory: F,
    max_age: Duration,
    current: Mutex<Option<ManagedConnection<F::Conn>>>,
}

impl<F: ConnectionFactory> ConnectionManager<F> {
    pub fn new(factory: F, max_age: Duration) -> Self {
        Self {
            factory,
            max_age,
            current: Mutex::new(None),
        }
    }

    /// 返回保证可用的连接。顺序：无连接则新建；超过保鲜期则重建；
    /// 探活失败则重建；否则刷新校验时间并复用。每次调用至多重建一次，
    /// 重建仍失败时向调用方返回可重试的连接错误。
    pub async fn get(&self) -> Result<Arc<F::Conn>> {
        let mut current = self.current.lock().await;
        if let Some(managed) = current.as_mut() {
            if managed.created_at.elapsed() >= self.max_age {
                info!(
                    age_secs = managed.created_at.elapsed().as_secs(),
                    "数据库连接超过保鲜期，主动重建"
                );
            } else {
                match self.factory.probe(&managed.conn).await {
                    Ok(()) => {
                        managed.last_validated_at = Instant::now();
                        return Ok(Arc::clone(&managed.conn));
                    }
                    Err(err) => {
                        warn!("数据库连接探活失败，重建连接: {err}");
                    }
                }
            }
            *current = None;
        }

        let built = self.open().await?;
        let conn = Arc::clone(&built.conn);
        *current = Some(built);
        Ok(conn)
    }

    /// /health 用的快照，只读不探活。
    pub async fn status(&self) -> Option<ConnectionStatus> {
        let current = self.current.lock().await;
        current.as_ref().map(|managed| ConnectionStatus {
            age_secs: managed.created_at.elapsed().as_secs_f64(),
            validated_age_secs: managed.last_validated_at.elapsed().as_secs_f64(),
        })
    }

    async fn open(&self) -> Result<ManagedConnection<F::Conn>> {
        let conn = match self.factory.connect().await {
            Ok(conn) => conn,
            Err(err) => {
                return Err(StorageError::Connection(format!("数据库建连失败: {err}")).into());
            }
        };
        let now = Instant::now();
        info!("数据库连接已建立");
        Ok(ManagedConnection {
            conn: Arc::new(conn),
            created_at: now,
            last_validated_at: now,
        })
    }
}
