//! Integration tests for the traffic looper against a scripted engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use acl_router::traffic::{TAG_BYPASS, TAG_PROXY};
use acl_router::{
    AclError, Direction, EngineConfig, NoopStore, ProxyEngine, Result, RoutingTable, SpeedSnapshot,
    TagGroup, TrafficData, TrafficEntity, TrafficEvent, TrafficLooper, TrafficStore,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

#[derive(Default)]
struct FakeEngine {
    table: RoutingTable,
    /// Pending (uplink, downlink) bytes per tag, drained by queries
    pending: Mutex<HashMap<String, (u64, u64)>>,
    failing: Mutex<Vec<String>>,
    queried: Mutex<Vec<String>>,
    registered: Mutex<Vec<String>>,
    active: Mutex<Option<i64>>,
}

impl FakeEngine {
    fn new(groups: Vec<TagGroup>) -> Arc<Self> {
        Arc::new(Self {
            table: RoutingTable { groups },
            ..Self::default()
        })
    }

    fn push(&self, tag: &str, tx: u64, rx: u64) {
        let mut pending = self.pending.lock();
        let entry = pending.entry(tag.to_string()).or_default();
        entry.0 += tx;
        entry.1 += rx;
    }
}

impl ProxyEngine for FakeEngine {
    fn is_initialized(&self) -> bool {
        true
    }

    fn routing_table(&self) -> RoutingTable {
        self.table.clone()
    }

    fn query_stats(&self, tag: &str, direction: Direction) -> Result<u64> {
        self.queried.lock().push(tag.to_string());
        if self.failing.lock().iter().any(|t| t == tag) {
            return Err(AclError::EngineError("stats unavailable".to_string()));
        }
        let mut pending = self.pending.lock();
        let entry = pending.entry(tag.to_string()).or_default();
        let value = match direction {
            Direction::Uplink => std::mem::take(&mut entry.0),
            Direction::Downlink => std::mem::take(&mut entry.1),
        };
        Ok(value)
    }

    fn register_tags(&self, tags: &[String]) {
        self.registered.lock().extend(tags.iter().cloned());
    }

    fn set_active_outbound(&self, id: i64) {
        *self.active.lock() = Some(id);
    }
}

#[derive(Default)]
struct MemoryStore {
    counters: Mutex<HashMap<i64, (u64, u64)>>,
}

#[async_trait]
impl TrafficStore for MemoryStore {
    async fn update_counters(&self, entity_id: i64, rx: u64, tx: u64) -> Result<()> {
        self.counters.lock().insert(entity_id, (tx, rx));
        Ok(())
    }
}

fn engine_channel(
    engine: Arc<FakeEngine>,
) -> (
    watch::Sender<Option<Arc<dyn ProxyEngine>>>,
    watch::Receiver<Option<Arc<dyn ProxyEngine>>>,
) {
    let engine: Arc<dyn ProxyEngine> = engine;
    watch::channel(Some(engine))
}

fn speeds(rx: &mut broadcast::Receiver<TrafficEvent>) -> Vec<SpeedSnapshot> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let TrafficEvent::Speed(snapshot) = event {
            out.push(snapshot);
        }
    }
    out
}

fn total(totals: &[TrafficData], id: i64) -> (u64, u64) {
    totals
        .iter()
        .find(|d| d.id == id)
        .map(|d| (d.tx, d.rx))
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_no_traffic_keeps_baseline() {
    let engine = FakeEngine::new(vec![TagGroup::new(
        TAG_PROXY,
        vec![TrafficEntity::new(1, 500, 700)],
    )]);
    let (_tx, rx) = engine_channel(engine.clone());
    let looper = TrafficLooper::start(rx, Arc::new(NoopStore), &EngineConfig::default());
    let mut events = looper.subscribe();

    tokio::time::sleep(Duration::from_millis(5500)).await;

    let snapshots = speeds(&mut events);
    assert_eq!(snapshots.len(), 5);
    assert!(snapshots.iter().all(|s| *s == SpeedSnapshot::default()));

    let totals = looper.stop().await;
    assert_eq!(total(&totals, 1), (500, 700));
    assert!(engine.registered.lock().contains(&TAG_PROXY.to_string()));
    assert!(engine.registered.lock().contains(&TAG_BYPASS.to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_rates_and_session_totals() {
    let engine = FakeEngine::new(vec![TagGroup::new(
        TAG_PROXY,
        vec![TrafficEntity::new(1, 100, 100)],
    )]);
    let (_tx, rx) = engine_channel(engine.clone());
    let config = EngineConfig::default().with_show_direct_speed(false);
    let looper = TrafficLooper::start(rx, Arc::new(NoopStore), &config);
    let mut events = looper.subscribe();

    engine.push(TAG_PROXY, 2000, 4000);
    engine.push(TAG_BYPASS, 300, 600);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let snapshots = speeds(&mut events);
    assert_eq!(snapshots.len(), 1);
    let first = snapshots[0];
    assert_eq!(first.tx_rate_proxy, 2000);
    assert_eq!(first.rx_rate_proxy, 4000);
    assert_eq!(first.tx_rate_direct, 0);
    assert_eq!(first.rx_rate_direct, 0);
    assert_eq!(first.tx_total, 2000);
    assert_eq!(first.rx_total, 4000);

    let totals = looper.stop().await;
    assert_eq!(total(&totals, 1), (2100, 4100));
}

#[tokio::test(start_paused = true)]
async fn test_direct_speed_reported_when_enabled() {
    let engine = FakeEngine::new(vec![TagGroup::new(TAG_PROXY, vec![TrafficEntity::new(1, 0, 0)])]);
    let (_tx, rx) = engine_channel(engine.clone());
    let looper = TrafficLooper::start(rx, Arc::new(NoopStore), &EngineConfig::default());
    let mut events = looper.subscribe();

    engine.push(TAG_BYPASS, 300, 600);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let snapshots = speeds(&mut events);
    assert_eq!(snapshots[0].tx_rate_direct, 300);
    assert_eq!(snapshots[0].rx_rate_direct, 600);
    assert_eq!(snapshots[0].tx_total, 0);
    looper.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_ignored_entries_freeze() {
    let engine = FakeEngine::new(vec![
        TagGroup::new(TAG_PROXY, vec![TrafficEntity::new(1, 0, 0)]),
        TagGroup::standby("g-2", vec![TrafficEntity::new(2, 10, 20)]),
    ]);
    let (_tx, rx) = engine_channel(engine.clone());
    let looper = TrafficLooper::start(rx, Arc::new(NoopStore), &EngineConfig::default());

    engine.push("g-2", 500, 500);
    tokio::time::sleep(Duration::from_millis(3500)).await;

    let totals = looper.stop().await;
    assert_eq!(total(&totals, 2), (10, 20));
    assert!(!engine.queried.lock().iter().any(|t| t == "g-2"));
}

#[tokio::test(start_paused = true)]
async fn test_selector_hand_off_preserves_totals() {
    let engine = FakeEngine::new(vec![
        TagGroup::new(TAG_PROXY, vec![TrafficEntity::new(1, 1000, 2000)]),
        TagGroup::standby("g-2", vec![TrafficEntity::new(2, 0, 0)]),
    ]);
    let (_tx, rx) = engine_channel(engine.clone());
    let store = Arc::new(MemoryStore::default());
    let looper = TrafficLooper::start(rx, store.clone(), &EngineConfig::default());

    tokio::time::sleep(Duration::from_millis(100)).await;
    looper.select_main(2);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*engine.active.lock(), Some(2));
    assert_eq!(store.counters.lock().get(&1), Some(&(1000, 2000)));

    looper.select_main(1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*engine.active.lock(), Some(1));

    let totals = looper.stop().await;
    assert_eq!(total(&totals, 1), (1000, 2000));
    assert_eq!(total(&totals, 2), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn test_hand_off_routes_new_traffic_to_selected_entity() {
    let engine = FakeEngine::new(vec![
        TagGroup::new(TAG_PROXY, vec![TrafficEntity::new(1, 0, 0)]),
        TagGroup::standby("g-2", vec![TrafficEntity::new(2, 0, 0)]),
    ]);
    let (_tx, rx) = engine_channel(engine.clone());
    let looper = TrafficLooper::start(rx, Arc::new(NoopStore), &EngineConfig::default());

    engine.push(TAG_PROXY, 100, 100);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    looper.select_main(2);
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.push(TAG_PROXY, 50, 70);
    tokio::time::sleep(Duration::from_millis(1000)).await;

    let totals = looper.stop().await;
    assert_eq!(total(&totals, 1), (100, 100));
    assert_eq!(total(&totals, 2), (50, 70));
}

#[tokio::test(start_paused = true)]
async fn test_query_failure_is_zero_delta() {
    let engine = FakeEngine::new(vec![TagGroup::new(TAG_PROXY, vec![TrafficEntity::new(1, 0, 0)])]);
    engine.failing.lock().push(TAG_PROXY.to_string());
    let (_tx, rx) = engine_channel(engine.clone());
    let looper = TrafficLooper::start(rx, Arc::new(NoopStore), &EngineConfig::default());
    let mut events = looper.subscribe();

    engine.push(TAG_PROXY, 100, 100);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(speeds(&mut events).len(), 2);

    engine.failing.lock().clear();
    tokio::time::sleep(Duration::from_millis(1000)).await;

    let totals = looper.stop().await;
    assert_eq!(total(&totals, 1), (100, 100));
}

#[tokio::test(start_paused = true)]
async fn test_waits_for_engine() {
    let (tx, rx) = watch::channel::<Option<Arc<dyn ProxyEngine>>>(None);
    let looper = TrafficLooper::start(rx, Arc::new(NoopStore), &EngineConfig::default());
    let mut events = looper.subscribe();

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(speeds(&mut events).is_empty());

    let engine = FakeEngine::new(vec![TagGroup::new(TAG_PROXY, vec![TrafficEntity::new(7, 1, 2)])]);
    let engine: Arc<dyn ProxyEngine> = engine;
    tx.send(Some(engine)).unwrap();
    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert!(!speeds(&mut events).is_empty());

    let totals = looper.stop().await;
    assert_eq!(total(&totals, 7), (1, 2));
}

#[tokio::test(start_paused = true)]
async fn test_stop_persists_and_broadcasts_final_totals() {
    let engine = FakeEngine::new(vec![TagGroup::new(TAG_PROXY, vec![TrafficEntity::new(1, 0, 0)])]);
    let (_tx, rx) = engine_channel(engine.clone());
    let store = Arc::new(MemoryStore::default());
    let looper = TrafficLooper::start(rx, store.clone(), &EngineConfig::default());
    let mut events = looper.subscribe();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    engine.push(TAG_PROXY, 40, 80);

    let totals = looper.stop().await;
    assert_eq!(total(&totals, 1), (40, 80));
    assert_eq!(store.counters.lock().get(&1), Some(&(40, 80)));

    let mut last = None;
    while let Ok(event) = events.try_recv() {
        if let TrafficEvent::Traffic(data) = event {
            last = Some(data);
        }
    }
    assert_eq!(last, Some(TrafficData { id: 1, tx: 40, rx: 80 }));
}

#[tokio::test(start_paused = true)]
async fn test_statistics_disabled_skips_store() {
    let engine = FakeEngine::new(vec![TagGroup::new(TAG_PROXY, vec![TrafficEntity::new(1, 0, 0)])]);
    let (_tx, rx) = engine_channel(engine.clone());
    let store = Arc::new(MemoryStore::default());
    let config = EngineConfig::default().with_profile_traffic_statistics(false);
    let looper = TrafficLooper::start(rx, store.clone(), &config);

    engine.push(TAG_PROXY, 40, 80);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    looper.stop().await;

    assert!(store.counters.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_zero_interval_disables_loop() {
    let engine = FakeEngine::new(vec![TagGroup::new(TAG_PROXY, vec![TrafficEntity::new(1, 0, 0)])]);
    let (_tx, rx) = engine_channel(engine.clone());
    let config = EngineConfig::default().with_speed_interval_ms(0);
    let looper = TrafficLooper::start(rx, Arc::new(NoopStore), &config);

    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert!(looper.stop().await.is_empty());
    assert!(engine.registered.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shared_tag_counted_once_in_aggregate() {
    let engine = FakeEngine::new(vec![TagGroup::new(
        TAG_PROXY,
        vec![TrafficEntity::new(1, 0, 0), TrafficEntity::new(2, 0, 0)],
    )]);
    let (_tx, rx) = engine_channel(engine.clone());
    let looper = TrafficLooper::start(rx, Arc::new(NoopStore), &EngineConfig::default());
    let mut events = looper.subscribe();

    engine.push(TAG_PROXY, 1000, 1000);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let snapshots = speeds(&mut events);
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].tx_rate_proxy, 1000);
    assert_eq!(snapshots[0].rx_rate_proxy, 1000);
    assert_eq!(snapshots[0].tx_total, 1000);
    assert_eq!(snapshots[0].rx_total, 1000);

    // Each entity on the route still carries the tag's traffic
    let totals = looper.stop().await;
    assert_eq!(total(&totals, 1), (1000, 1000));
    assert_eq!(total(&totals, 2), (1000, 1000));
}
