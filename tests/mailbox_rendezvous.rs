use easel_server::mailbox::ToolResultStore;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const TOOL: &str = "generate_image";

#[test]
fn take_is_at_most_once_under_contention() {
    let store = Arc::new(ToolResultStore::new());
    let winners = AtomicUsize::new(0);

    for round in 0..50 {
        let now = 1_000_000.0 + round as f64;
        store.store("alice", TOOL, json!({ "round": round }), now);
        winners.store(0, Ordering::SeqCst);

        let barrier = Barrier::new(8);
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    barrier.wait();
                    if store.take("alice", TOOL, now).is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(winners.load(Ordering::SeqCst), 1, "round {round}");
        assert!(store.take("alice", TOOL, now).is_none());
    }
}

#[test]
fn mailboxes_are_isolated_per_user_and_tool() {
    let store = ToolResultStore::new();
    let now = 2_000_000.0;

    store.store("alice", TOOL, json!({ "owner": "alice" }), now);
    store.store("bob", TOOL, json!({ "owner": "bob" }), now);
    store.store("alice", "other_tool", json!({ "owner": "alice-other" }), now);

    let bob = store.take("bob", TOOL, now).unwrap();
    assert_eq!(bob["owner"], "bob");

    // 其他用户与其他工具的信箱不受影响。
    let alice = store.take("alice", TOOL, now).unwrap();
    assert_eq!(alice["owner"], "alice");
    let alice_other = store.take("alice", "other_tool", now).unwrap();
    assert_eq!(alice_other["owner"], "alice-other");

    assert!(store.take("bob", TOOL, now).is_none());
}

#[test]
fn overwrite_keeps_only_latest_payload() {
    let store = ToolResultStore::new();
    let now = 3_000_000.0;

    store.store("alice", TOOL, json!({ "version": 1 }), now);
    store.store("alice", TOOL, json!({ "version": 2 }), now + 1.0);

    let taken = store.take("alice", TOOL, now + 2.0).unwrap();
    assert_eq!(taken["version"], 2);
    assert!(store.take("alice", TOOL, now + 2.0).is_none());
}

#[test]
fn stale_entries_expire_before_take() {
    let store = ToolResultStore::with_retention(60.0);
    let now = 4_000_000.0;

    store.store("alice", TOOL, json!({ "stale": true }), now);
    // 超过保留窗口后写入触发回收，旧条目不可再领取。
    store.store("bob", TOOL, json!({ "fresh": true }), now + 120.0);

    assert!(store.take("alice", TOOL, now + 120.0).is_none());
    assert_eq!(
        store.take("bob", TOOL, now + 120.0).unwrap()["fresh"],
        json!(true)
    );
}
