use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::manager::{ConnectionFactory, ConnectionManager};

// 停机时等待后台任务退出的上限。
const STOP_WAIT: Duration = Duration::from_secs(5);

/// 周期性触发连接校验的后台任务。空闲期间也保持连接新鲜，
/// 避免托管库的空闲断连窗口悄悄淘汰连接。
pub struct RefreshWorker<F: ConnectionFactory> {
    manager: Arc<ConnectionManager<F>>,
    interval: Duration,
    stop_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<F: ConnectionFactory> RefreshWorker<F> {
    pub fn new(manager: Arc<ConnectionManager<F>>, interval: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            manager,
            interval,
            stop_tx,
            task: parking_lot::Mutex::new(None),
        }
    }

    /// 幂等启动：已有存活任务时直接返回。
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
        {
            return;
        }
        let worker = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            worker.run_loop().await;
        }));
        info!(
            interval_secs = self.interval.as_secs(),
            "连接刷新任务已启动"
        );
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// 发出取消信号并有界等待任务退出。
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(STOP_WAIT, handle).await {
                Ok(_) => info!("连接刷新任务已退出"),
                Err(_) => warn!("连接刷新任务未在限定时间内退出"),
            }
        }
    }

    async fn run_loop(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(self.interval) => {
                    // 单轮失败只记录，下一轮继续重试。
                    if let Err(err) = self.manager.get().await {
                        warn!("后台连接刷新失败，等待下轮重试: {err}");
                    }
                }
            }
        }
    }
}
