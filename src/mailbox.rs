use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_RETAIN_SECS: f64 = 24.0 * 60.0 * 60.0;
const GC_INTERVAL_SECS: f64 = 60.0;

/// 信箱键使用 (user_id, tool) 复合结构，不拼接字符串，
/// 不同用户与不同工具的结果互不可见。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MailboxKey {
    pub user_id: String,
    pub tool: String,
}

impl MailboxKey {
    fn new(user_id: &str, tool: &str) -> Option<Self> {
        let user_id = user_id.trim();
        let tool = tool.trim();
        if user_id.is_empty() || tool.is_empty() {
            return None;
        }
        Some(Self {
            user_id: user_id.to_string(),
            tool: tool.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
struct PendingEntry {
    payload: Value,
    stored_at: f64,
}

#[derive(Debug)]
struct MailboxState {
    entries: HashMap<MailboxKey, PendingEntry>,
    last_gc_at: f64,
}

/// 工具副作用与响应装配之间的会合点：工具写入，同一逻辑请求的
/// 响应装配立即读走。take 是热路径上唯一的删除途径，
/// 周期清扫只兜底从未被消费的遗留条目。
pub struct ToolResultStore {
    retain_secs: f64,
    state: Mutex<MailboxState>,
}

impl ToolResultStore {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAIN_SECS)
    }

    pub fn with_retention(retain_secs: f64) -> Self {
        Self {
            retain_secs: retain_secs.max(1.0),
            state: Mutex::new(MailboxState {
                entries: HashMap::new(),
                last_gc_at: 0.0,
            }),
        }
    }

    /// 写入条目，同键的未读条目被直接覆盖。
    pub fn store(&self, user_id: &str, tool: &str, payload: Value, now: f64) {
        let Some(key) = MailboxKey::new(user_id, tool) else {
            return;
        };
        let now = normalized_now(now);
        let Some(mut guard) = self.state.lock().ok() else {
            return;
        };
        self.gc_if_needed(&mut guard, now);
        guard.entries.insert(
            key,
            PendingEntry {
                payload,
                stored_at: now,
            },
        );
    }

    /// 原子读走条目；不存在返回 None 属正常结果而非错误。
    /// 成功 take 之后再次 take 同键返回 None（至多一次交付）。
    pub fn take(&self, user_id: &str, tool: &str, now: f64) -> Option<Value> {
        let key = MailboxKey::new(user_id, tool)?;
        let now = normalized_now(now);
        let mut guard = self.state.lock().ok()?;
        self.gc_if_needed(&mut guard, now);
        guard.entries.remove(&key).map(|entry| entry.payload)
    }

    /// 清除滞留超过 max_age 的条目，返回清除数量。
    pub fn sweep(&self, max_age_secs: f64, now: f64) -> usize {
        let now = normalized_now(now);
        let Some(mut guard) = self.state.lock().ok() else {
            return 0;
        };
        let before = guard.entries.len();
        guard
            .entries
            .retain(|_, entry| now - entry.stored_at <= max_age_secs);
        guard.last_gc_at = now;
        before - guard.entries.len()
    }

    fn gc_if_needed(&self, state: &mut MailboxState, now: f64) {
        if now - state.last_gc_at < GC_INTERVAL_SECS {
            return;
        }
        state.last_gc_at = now;
        let retain_secs = self.retain_secs;
        state
            .entries
            .retain(|_, entry| now - entry.stored_at <= retain_secs);
    }
}

impl Default for ToolResultStore {
    fn default() -> Self {
        Self::new()
    }
}

fn normalized_now(now: f64) -> f64 {
    if now.is_finite() && now > 0.0 {
        now
    } else {
        now_ts()
    }
}

pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::ToolResultStore;
    use serde_json::json;

    #[test]
    fn store_then_take_returns_payload_once() {
        let store = ToolResultStore::new();
        store.store("abc", "generate_image", json!({"imageId": "xyz"}), 10.0);
        let taken = store.take("abc", "generate_image", 11.0);
        assert_eq!(taken, Some(json!({"imageId": "xyz"})));
        assert_eq!(store.take("abc", "generate_image", 12.0), None);
    }

    #[test]
    fn store_overwrites_pending_entry() {
        let store = ToolResultStore::new();
        store.store("abc", "generate_image", json!({"imageId": "old"}), 10.0);
        store.store("abc", "generate_image", json!({"imageId": "new"}), 11.0);
        let taken = store.take("abc", "generate_image", 12.0);
        assert_eq!(taken, Some(json!({"imageId": "new"})));
    }

    #[test]
    fn take_never_observes_other_users_entries() {
        let store = ToolResultStore::new();
        store.store("abc", "generate_image", json!({"imageId": "xyz"}), 10.0);
        assert_eq!(store.take("other", "generate_image", 11.0), None);
        assert_eq!(
            store.take("abc", "generate_image", 11.0),
            Some(json!({"imageId": "xyz"}))
        );
    }

    #[test]
    fn sweep_removes_only_entries_over_max_age() {
        let store = ToolResultStore::new();
        store.store("old", "generate_image", json!({"imageId": "1"}), 10.0);
        // 恰好等于 max_age 的条目属于边界内，不应被清除。
        store.store("edge", "generate_image", json!({"imageId": "2"}), 70.0);
        store.store("young", "generate_image", json!({"imageId": "3"}), 100.0);
        let removed = store.sweep(50.0, 120.0);
        assert_eq!(removed, 1);
        assert_eq!(store.take("old", "generate_image", 121.0), None);
        assert_eq!(
            store.take("edge", "generate_image", 121.0),
            Some(json!({"imageId": "2"}))
        );
        assert_eq!(
            store.take("young", "generate_image", 121.0),
            Some(json!({"imageId": "3"}))
        );
    }

    #[test]
    fn retention_gc_evicts_abandoned_entries_on_access() {
        let store = ToolResultStore::with_retention(100.0);
        store.store("abandoned", "generate_image", json!({"imageId": "1"}), 10.0);
        // 另一把钥匙上的访问触发机会式回收。
        let later = 10.0 + 100.0 + 61.0;
        assert_eq!(store.take("other", "generate_image", later), None);
        assert_eq!(store.take("abandoned", "generate_image", later + 1.0), None);
    }

    #[test]
    fn blank_keys_are_rejected() {
        let store = ToolResultStore::new();
        store.store("  ", "generate_image", json!({"imageId": "1"}), 10.0);
        assert_eq!(store.take("  ", "generate_image", 11.0), None);
        assert_eq!(store.take("", "", 11.0), None);
    }
}
