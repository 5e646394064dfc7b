use anyhow::Result;
use chrono::{Datelike, Local, NaiveDate};
use std::sync::Arc;
use tracing::{error, warn};

use crate::storage::{Storage, StorageError};

/// 每客户端按自然周（周一起算）计数的用量闸门。
/// 读失败按零用量放行，写失败必须上抛，两者的不对称是有意为之。
#[derive(Clone)]
pub struct RateLimiter {
    storage: Arc<Storage>,
    weekly_limit: i64,
}

impl RateLimiter {
    pub fn new(storage: Arc<Storage>, weekly_limit: i64) -> Self {
        Self {
            storage,
            weekly_limit: weekly_limit.max(1),
        }
    }

    pub fn weekly_limit(&self) -> i64 {
        self.weekly_limit
    }

    /// 当前周计数；桶不存在返回 0，读错误同样按 0 放行并记日志。
    pub async fn get_count(&self, client_id: &str) -> i64 {
        let week = current_week_start();
        match self.storage.week_count(client_id, &week).await {
            Ok(count) => count,
            Err(err) => {
                warn!(client_id, week_start = %week, "读取限流计数失败，按零用量放行: {err}");
                0
            }
        }
    }

    /// 生成尝试前的硬性闸门：达到上限即拒绝。
    pub async fn is_exhausted(&self, client_id: &str) -> bool {
        self.get_count(client_id).await >= self.weekly_limit
    }

    /// 自增本周计数，返回最新值。失败生成不计数，
    /// 调用方只在生成成功之后调用。
    pub async fn increment(&self, client_id: &str) -> Result<i64> {
        let week = current_week_start();
        match self.storage.bump_week_count(client_id, &week).await {
            Ok(count) => Ok(count),
            Err(err) => {
                error!(client_id, week_start = %week, "限流计数自增失败: {err}");
                Err(StorageError::RateWrite(format!("本周计数自增失败: {err}")).into())
            }
        }
    }
}

pub fn current_week_start() -> String {
    week_start(Local::now().date_naive())
}

fn week_start(today: NaiveDate) -> String {
    let monday = today - chrono::Duration::days(today.weekday().num_days_from_monday() as i64);
    monday.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::week_start;
    use chrono::NaiveDate;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
    }

    #[test]
    fn week_start_is_monday_aligned() {
        // 周日归入同一周的周一。
        assert_eq!(week_start(date(2026, 8, 23)), "2026-08-17");
        assert_eq!(week_start(date(2026, 8, 19)), "2026-08-17");
        assert_eq!(week_start(date(2026, 8, 17)), "2026-08-17");
    }

    #[test]
    fn week_start_rolls_over_on_monday() {
        assert_eq!(week_start(date(2026, 8, 24)), "2026-08-24");
        // 跨月与跨年边界。
        assert_eq!(week_start(date(2026, 1, 1)), "2025-12-29");
    }
}
