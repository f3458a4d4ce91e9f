//! # Engine Scenario Runner
//!
//! Drives real engines through the public API of `lib_dataengine` and asserts
//! the documented end-to-end behaviour: write coalescing, mixed event driven
//! and relayed consumers, the relay anti-starvation window, LRU eviction,
//! subscription cleanup, non-blocking queries and manager reference counts.
//!
//! Runs on a current-thread runtime so back-to-back publishes from this task
//! reach the engine within one scheduling quantum.

use std::sync::Arc;

use chrono::{Local, Timelike};

use lib_dataengine::{
    Consumer, DataUpdate, EngineConfig, EngineContext, EngineManager, IntervalAlignment, LoadedEngine,
    NoopProvider, ProviderCatalog, SourceProvider, SourceRegistry, Value,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout, Duration, Instant};

/// Provider that only creates empty sources and never produces data itself.
struct SilentProvider;

impl SourceProvider for SilentProvider {
    fn source_requested(&mut self, name: &str, ctx: &mut EngineContext<'_>) -> bool {
        ctx.create_source(name);
        true
    }
}

/// Next update within `wait`, `None` when nothing arrived.
async fn next_update(rx: &mut UnboundedReceiver<DataUpdate>, wait: Duration) -> Option<DataUpdate> {
    timeout(wait, rx.recv()).await.ok().flatten()
}

/// Counts every update already queued or arriving within `wait`.
async fn drain(rx: &mut UnboundedReceiver<DataUpdate>, wait: Duration) -> Vec<DataUpdate> {
    let mut updates = Vec::new();
    while let Some(update) = next_update(rx, wait).await {
        updates.push(update);
    }
    updates
}

fn catalog() -> Arc<ProviderCatalog> {
    let catalog = Arc::new(ProviderCatalog::new());
    catalog.register("clock", || {
        let config = EngineConfig {
            min_update_interval_ms: 100,
            ..EngineConfig::default()
        };
        LoadedEngine::new(config, Box::new(NoopProvider))
    });
    catalog.register("weather", || LoadedEngine::new(EngineConfig::default(), Box::new(NoopProvider)));
    catalog.register("bounded", || {
        let config = EngineConfig {
            max_source_count: 2,
            ..EngineConfig::default()
        };
        LoadedEngine::new(config, Box::new(NoopProvider))
    });
    catalog.register("remote", || LoadedEngine::new(EngineConfig::default(), Box::new(SilentProvider)));
    catalog
}

/// Two publishes in one quantum reach a consumer as a single update.
async fn scenario_coalescing(manager: &EngineManager) {
    let engine = manager.acquire("clock");
    engine.publish("clock", "time", "11:59");
    let (consumer, mut rx) = Consumer::new("clock-view");
    assert!(engine.connect("clock", &consumer, Duration::ZERO, IntervalAlignment::None).await);
    let first = next_update(&mut rx, Duration::from_millis(200)).await.expect("initial snapshot");
    assert_eq!(first.data.get("time"), Some(&Value::from("11:59")));

    engine.publish("clock", "time", "12:00");
    engine.publish("clock", "time", "12:01");

    let updates = drain(&mut rx, Duration::from_millis(300)).await;
    assert_eq!(updates.len(), 1, "expected one coalesced update, got {}", updates.len());
    assert_eq!(updates[0].data.get("time"), Some(&Value::from("12:01")));

    manager.release_and_wait("clock").await;
    println!("[PASS] coalescing");
}

/// An event driven consumer hears a publish at once; a minute-aligned relay waits for its tick.
async fn scenario_mixed_consumers(manager: &EngineManager) {
    let engine = manager.acquire("weather");
    engine.publish("weather", "temp", 18);

    let (consumer_a, mut rx_a) = Consumer::new("A");
    let (consumer_b, mut rx_b) = Consumer::new("B");
    assert!(engine.connect("weather", &consumer_a, Duration::ZERO, IntervalAlignment::None).await);
    assert!(
        engine
            .connect("weather", &consumer_b, Duration::from_millis(5000), IntervalAlignment::AlignToMinute)
            .await
    );
    drain(&mut rx_a, Duration::from_millis(100)).await;
    drain(&mut rx_b, Duration::from_millis(100)).await;

    let started = Instant::now();
    engine.publish("weather", "temp", 20);
    let to_a = next_update(&mut rx_a, Duration::from_millis(200)).await.expect("A is event driven");
    assert_eq!(to_a.data.get("temp"), Some(&Value::from(20)));

    // B hears nothing until the next minute boundary plus the skew.
    let relayed = next_update(&mut rx_b, Duration::from_secs(62)).await.expect("minute tick delivers");
    assert_eq!(relayed.data.get("temp"), Some(&Value::from(20)));
    let second = Local::now().second();
    assert!(second <= 2, "aligned tick landed {}s past the minute", second);
    assert!(started.elapsed() <= Duration::from_millis(60_700));

    engine.disconnect("weather", &consumer_a);
    engine.disconnect("weather", &consumer_b);
    let stats = engine.stats().await;
    let weather = stats.sources.iter().find(|s| s.name == "weather").expect("weather stays");
    assert_eq!(weather.direct_subscribers, 0);
    assert!(weather.relays.is_empty(), "no relay may outlive its last consumer");

    manager.release_and_wait("weather").await;
    println!("[PASS] mixed consumers and cleanup");
}

/// A publish just before a relay tick is delivered by that tick, not the next one.
async fn scenario_anti_starvation(manager: &EngineManager) {
    let engine = manager.acquire("weather");
    engine.publish("station", "wind", 3);
    let (consumer, mut rx) = Consumer::new("relay-view");
    let t0 = Instant::now();
    assert!(engine.connect("station", &consumer, Duration::from_millis(1000), IntervalAlignment::None).await);
    drain(&mut rx, Duration::from_millis(50)).await;

    sleep(Duration::from_millis(900).saturating_sub(t0.elapsed())).await;
    engine.publish("station", "wind", 7);

    let update = next_update(&mut rx, Duration::from_millis(1500)).await.expect("relay delivery");
    assert_eq!(update.data.get("wind"), Some(&Value::from(7)));
    assert!(
        t0.elapsed() < Duration::from_millis(1500),
        "delivered after {:?}, expected the first tick",
        t0.elapsed()
    );

    manager.release_and_wait("weather").await;
    println!("[PASS] anti-starvation");
}

/// With two slots, touching A before creating C evicts B.
async fn scenario_eviction(manager: &EngineManager) {
    let engine = manager.acquire("bounded");
    let mut events = engine.subscribe_events();
    engine.publish("A", "v", 1);
    engine.publish("B", "v", 2);
    assert_eq!(engine.query("A").await.get("v"), Some(&Value::from(1)));
    engine.publish("C", "v", 3);

    assert_eq!(engine.sources().await, vec!["A".to_string(), "C".to_string()]);
    let mut removed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let lib_dataengine::RegistryEvent::SourceRemoved(name) = event {
            removed.push(name);
        }
    }
    assert_eq!(removed, vec!["B".to_string()]);

    manager.release_and_wait("bounded").await;
    println!("[PASS] eviction");
}

/// Querying a source whose producer never answers returns at once.
async fn scenario_query_never_blocks(manager: &EngineManager) {
    let engine = manager.acquire("remote");
    let data = timeout(Duration::from_millis(200), engine.query("far-away"))
        .await
        .expect("query returned in time");
    assert!(data.is_empty());
    manager.release_and_wait("remote").await;
    println!("[PASS] query never blocks");
}

/// Acquire and release count references; unknown and empty names give the null engine.
async fn scenario_manager(manager: &EngineManager) {
    let first = manager.acquire("weather");
    let second = manager.acquire("weather");
    assert!(first.same_engine(&second));
    assert_eq!(manager.ref_count("weather"), 2);

    manager.release("weather");
    assert_eq!(manager.ref_count("weather"), 1);
    manager.release_and_wait("weather").await;
    assert!(manager.loaded().is_empty());

    let unknown: SourceRegistry = manager.acquire("no-such-engine");
    assert!(!unknown.is_valid());
    assert!(!manager.acquire("").is_valid());
    assert!(unknown.query("anything").await.is_empty());
    println!("[PASS] manager reference counting");
}

#[tokio::main(flavor = "current_thread")]
/// # Engine Scenarios
///
/// Runs every scenario against an isolated manager and stops at the first
/// failed assertion.
async fn main() {
    let manager = EngineManager::new(catalog());

    scenario_coalescing(&manager).await;
    scenario_mixed_consumers(&manager).await;
    scenario_anti_starvation(&manager).await;
    scenario_eviction(&manager).await;
    scenario_query_never_blocks(&manager).await;
    scenario_manager(&manager).await;

    println!("All engine scenarios passed");
}
