//! Saturation recovery and hot bind value eviction

mod common;

use std::time::{Duration, Instant};

use common::{start_core, statement, wait_for, TestClient};
use dbmux::config::{BindEvictionConfig, Config};
use dbmux::pool::BindEvictionTable;
use dbmux::protocol::{sql_hash, BindPair};
use dbmux::worker::WorkerKind;

fn saturating_config(workers: usize) -> Config {
    let mut config = Config::default();
    config.pool.num_workers = workers;
    config.backlog.request_backlog_timeout_ms = 5000;
    config.saturation.recover_threshold_ms = 50;
    config.saturation.recover_throttle_rate = 100;
    config
}

#[tokio::test]
async fn test_saturation_kills_longest_request() {
    let (core, sink) = start_core(saturating_config(1)).await;
    let pool = core.broker.pool(WorkerKind::ReadWrite, 0, 0).unwrap();

    let mut slow = TestClient::connect(&core);
    slow.send(&statement("select sleep(5000) from big_table", &[]))
        .await;
    assert!(wait_for(Duration::from_secs(2), || pool.stats().checked_out == 1).await);

    let mut queued = TestClient::connect(&core);
    queued.send(&statement("select 1 from dual", &[])).await;

    slow.expect_error("HERA-101: saturation kill").await;
    assert_eq!(slow.recv().await, None);
    assert!(wait_for(Duration::from_secs(2), || sink.count("HARD_EVICTION") == 1).await);
    let event = sink.find("HARD_EVICTION").unwrap();
    assert_eq!(
        event.get("sqlhash"),
        Some(sql_hash("select sleep(5000) from big_table").to_string().as_str())
    );

    // the reclaimed worker serves the backlog
    queued.expect_rows().await;
    assert!(wait_for(Duration::from_secs(5), || sink.count("RECOVERED") == 1).await);

    core.shutdown().await;
}

#[tokio::test]
async fn test_hot_bind_value_is_evicted_then_throttled() {
    let (core, sink) = start_core(saturating_config(2)).await;
    let pool = core.broker.pool(WorkerKind::ReadWrite, 0, 0).unwrap();
    let sql = "select sleep(5000) from accounts where id = :id";
    let hot = [(":id", "12345678")];

    let mut first = TestClient::connect(&core);
    let mut second = TestClient::connect(&core);
    first.send(&statement(sql, &hot)).await;
    second.send(&statement(sql, &hot)).await;
    assert!(wait_for(Duration::from_secs(2), || pool.stats().checked_out == 2).await);

    let mut queued = TestClient::connect(&core);
    queued.send(&statement("select 1 from dual", &[])).await;

    first.expect_error("HERA-106: bind eviction").await;
    second.expect_error("HERA-106: bind eviction").await;
    assert!(wait_for(Duration::from_secs(2), || sink.count("BIND_EVICT") == 2).await);
    assert_eq!(sink.count("HARD_EVICTION"), 0);
    queued.expect_rows().await;

    let hash = sql_hash(sql);
    assert!(wait_for(Duration::from_secs(2), || core.bind_evict.is_throttled(hash)).await);
    let throttle = core.bind_evict.get(hash, ":id", "12345678").unwrap();
    assert_eq!(throttle.allow_every_x(), 7);

    // the same value is now turned away at the door
    let mut late = TestClient::connect(&core);
    late.send(&statement(sql, &hot)).await;
    late.expect_error("HERA-105: bind throttle").await;
    assert_eq!(sink.count("BIND_THROTTLE"), 1);

    // other values of the same statement still run
    let mut other = TestClient::connect(&core);
    other
        .send(&statement("select name from accounts where id = :id", &[(":id", "87654321")]))
        .await;
    other.expect_rows().await;

    core.shutdown().await;
}

fn bind(name: &str, value: &str) -> BindPair {
    BindPair {
        name: name.to_string(),
        value: value.to_string(),
    }
}

#[test]
fn test_throttle_decays_after_idle_gap() {
    let table = BindEvictionTable::new(BindEvictionConfig::default());
    let t0 = Instant::now();
    let binds = [bind(":id", "12345678")];

    table.install(7, ":id", "12345678", 3, t0);
    assert_eq!(table.get(7, ":id", "12345678").unwrap().allow_every_x(), 10);

    // light usage: blocked, allowance shrinks by two
    assert!(table.should_block_at(7, &binds, false, 0.0, t0).is_some());
    assert_eq!(table.get(7, ":id", "12345678").unwrap().allow_every_x(), 8);

    // thirty idle seconds decay the allowance to zero and drop the throttle
    let later = t0 + Duration::from_secs(30);
    assert!(table.should_block_at(7, &binds, false, 0.0, later).is_none());
    assert!(!table.is_throttled(7));
    assert_eq!(table.throttle_count(), 0);
}

#[test]
fn test_light_usage_admits_one_in_x() {
    let table = BindEvictionTable::new(BindEvictionConfig::default());
    let now = Instant::now();
    let binds = [bind(":id", "12345678")];
    table.install(9, ":id", "12345678", 3, now);

    let outcomes: Vec<bool> = (0..5)
        .map(|_| table.should_block_at(9, &binds, false, 0.0, now).is_some())
        .collect();
    assert_eq!(outcomes, vec![true, true, true, false, false]);
    assert!(!table.is_throttled(9));
}

#[test]
fn test_heavy_usage_grows_allowance() {
    let table = BindEvictionTable::new(BindEvictionConfig::default());
    let now = Instant::now();
    let binds = [bind(":id", "12345678")];
    table.install(5, ":id", "12345678", 3, now);

    assert!(table.should_block_at(5, &binds, true, 0.0, now).is_some());
    assert_eq!(table.get(5, ":id", "12345678").unwrap().allow_every_x(), 31);
}
