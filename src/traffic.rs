//! Per-outbound traffic accounting.
//!
//! The looper polls the proxy engine for per-tag byte deltas every
//! `speed_interval_ms`, accumulates them per routing entity, publishes speed
//! snapshots and per-entity totals, and persists totals through a
//! [`TrafficStore`]. All state lives on the loop task; callers talk to it
//! through [`TrafficLooperHandle`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::Result;

/// Tag of the active outbound
pub const TAG_PROXY: &str = "proxy";

/// Tag of direct (bypassed) traffic
pub const TAG_BYPASS: &str = "bypass";

/// Entity id of the synthetic bypass entry
pub const BYPASS_ENTITY_ID: i64 = -1;

const EVENT_CAPACITY: usize = 64;

/// Traffic direction as understood by the engine's stats API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Uplink,
    Downlink,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Uplink => "uplink",
            Direction::Downlink => "downlink",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routing entity with its previously persisted totals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficEntity {
    pub id: i64,
    pub tx: u64,
    pub rx: u64,
}

impl TrafficEntity {
    pub fn new(id: i64, tx: u64, rx: u64) -> Self {
        Self { id, tx, rx }
    }
}

/// Entities routed through one engine tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagGroup {
    pub tag: String,
    pub entities: Vec<TrafficEntity>,
    /// Inactive selector alternative; its entities start ignored
    pub standby: bool,
}

impl TagGroup {
    pub fn new(tag: impl Into<String>, entities: Vec<TrafficEntity>) -> Self {
        Self {
            tag: tag.into(),
            entities,
            standby: false,
        }
    }

    pub fn standby(tag: impl Into<String>, entities: Vec<TrafficEntity>) -> Self {
        Self {
            standby: true,
            ..Self::new(tag, entities)
        }
    }
}

/// The engine's declared outbounds, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    pub groups: Vec<TagGroup>,
}

/// Proxy engine surface the looper consumes.
pub trait ProxyEngine: Send + Sync {
    fn is_initialized(&self) -> bool;

    fn routing_table(&self) -> RoutingTable;

    /// Bytes seen on `tag` in `direction` since the previous query.
    fn query_stats(&self, tag: &str, direction: Direction) -> Result<u64>;

    /// Start accounting for `tags`
    fn register_tags(&self, tags: &[String]);

    fn set_active_outbound(&self, id: i64);
}

/// Persistence for per-entity totals, best effort.
#[async_trait]
pub trait TrafficStore: Send + Sync {
    async fn update_counters(&self, entity_id: i64, rx: u64, tx: u64) -> Result<()>;
}

/// Store that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

#[async_trait]
impl TrafficStore for NoopStore {
    async fn update_counters(&self, _entity_id: i64, _rx: u64, _tx: u64) -> Result<()> {
        Ok(())
    }
}

/// Running counters of one routing entity.
#[derive(Debug, Clone)]
pub struct TrafficLooperData {
    pub tag: String,
    pub tx: u64,
    pub rx: u64,
    /// Counters at session start
    pub tx_base: u64,
    pub rx_base: u64,
    /// Bytes per second over the last interval
    pub tx_rate: u64,
    pub rx_rate: u64,
    pub last_update: Instant,
    /// Frozen and left out of the main aggregate
    pub ignore: bool,
}

impl TrafficLooperData {
    fn new(tag: impl Into<String>, tx: u64, rx: u64, ignore: bool, now: Instant) -> Self {
        Self {
            tag: tag.into(),
            tx,
            rx,
            tx_base: tx,
            rx_base: rx,
            tx_rate: 0,
            rx_rate: 0,
            last_update: now,
            ignore,
        }
    }
}

/// Aggregated speeds, bytes per second, and session totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeedSnapshot {
    pub tx_rate_proxy: u64,
    pub rx_rate_proxy: u64,
    /// Zero unless direct speed reporting is enabled
    pub tx_rate_direct: u64,
    pub rx_rate_direct: u64,
    pub tx_total: u64,
    pub rx_total: u64,
}

/// Cumulative totals of one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficData {
    pub id: i64,
    pub tx: u64,
    pub rx: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrafficEvent {
    Speed(SpeedSnapshot),
    Traffic(TrafficData),
}

enum Command {
    SelectMain(i64),
}

/// Entry point of the polling loop.
pub struct TrafficLooper;

impl TrafficLooper {
    /// Spawn the loop on the current tokio runtime.
    ///
    /// `engine` carries the engine of the current session; `None` while the
    /// session is starting.
    pub fn start(
        engine: watch::Receiver<Option<Arc<dyn ProxyEngine>>>,
        store: Arc<dyn TrafficStore>,
        config: &EngineConfig,
    ) -> TrafficLooperHandle {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let state = LooperState {
            engine_rx: engine,
            engine: None,
            entries: Vec::new(),
            session_tx: 0,
            session_rx: 0,
            store,
            events: events.clone(),
            show_direct_speed: config.show_direct_speed,
            statistics: config.profile_traffic_statistics,
        };
        let interval = config.speed_interval();
        let task = tokio::spawn(run_loop(state, interval, command_rx, cancel.clone()));

        TrafficLooperHandle {
            commands,
            events,
            cancel,
            task: Some(task),
        }
    }
}

/// Control handle of a running looper; dropping it stops the loop.
pub struct TrafficLooperHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<TrafficEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Vec<TrafficData>>>,
}

impl TrafficLooperHandle {
    /// Make entity `id` the active outbound.
    ///
    /// The previous one is parked under the new entity's former tag with its
    /// counters intact. Applied on the loop, between ticks.
    pub fn select_main(&self, id: i64) {
        if self.commands.send(Command::SelectMain(id)).is_err() {
            debug!(id, "traffic looper stopped, selection dropped");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrafficEvent> {
        self.events.subscribe()
    }

    /// Stop polling after a final read pass; returns the final totals.
    pub async fn stop(mut self) -> Vec<TrafficData> {
        self.cancel.cancel();
        match self.task.take() {
            Some(task) => match task.await {
                Ok(totals) => totals,
                Err(e) => {
                    warn!(error = %e, "traffic looper task failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        }
    }
}

impl Drop for TrafficLooperHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_loop(
    mut state: LooperState,
    interval: Option<std::time::Duration>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
) -> Vec<TrafficData> {
    let Some(interval) = interval else {
        debug!("speed interval is zero, traffic looper disabled");
        return Vec::new();
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(command) = commands.recv() => match command {
                Command::SelectMain(id) => state.select_main(id).await,
            },
            _ = ticker.tick() => state.tick().await,
        }
    }

    state.finish().await
}

struct LooperState {
    engine_rx: watch::Receiver<Option<Arc<dyn ProxyEngine>>>,
    engine: Option<Arc<dyn ProxyEngine>>,
    /// Keyed by entity id, in declaration order
    entries: Vec<(i64, TrafficLooperData)>,
    /// Bytes seen on non-bypass tags this session, each tag counted once
    session_tx: u64,
    session_rx: u64,
    store: Arc<dyn TrafficStore>,
    events: broadcast::Sender<TrafficEvent>,
    show_direct_speed: bool,
    statistics: bool,
}

impl LooperState {
    /// Current engine, initializing the entries when it changed.
    ///
    /// The flag is set when this call initialized.
    fn ready_engine(&mut self) -> Option<(Arc<dyn ProxyEngine>, bool)> {
        let current = self.engine_rx.borrow().clone();
        let Some(engine) = current.filter(|e| e.is_initialized()) else {
            debug!("proxy engine not ready");
            return None;
        };
        if self
            .engine
            .as_ref()
            .is_some_and(|known| Arc::ptr_eq(known, &engine))
        {
            return Some((engine, false));
        }
        self.init(&engine);
        self.engine = Some(Arc::clone(&engine));
        Some((engine, true))
    }

    fn init(&mut self, engine: &Arc<dyn ProxyEngine>) {
        let now = Instant::now();
        let table = engine.routing_table();
        let mut entries = Vec::new();
        let mut tags: Vec<String> = Vec::new();
        for group in &table.groups {
            if !tags.contains(&group.tag) {
                tags.push(group.tag.clone());
            }
            for entity in &group.entities {
                let data =
                    TrafficLooperData::new(&group.tag, entity.tx, entity.rx, group.standby, now);
                entries.push((entity.id, data));
            }
        }
        entries.push((
            BYPASS_ENTITY_ID,
            TrafficLooperData::new(TAG_BYPASS, 0, 0, false, now),
        ));
        if !tags.iter().any(|t| t == TAG_BYPASS) {
            tags.push(TAG_BYPASS.to_string());
        }

        engine.register_tags(&tags);
        info!(entities = entries.len() - 1, tags = tags.len(), "traffic looper initialized");
        self.entries = entries;
        self.session_tx = 0;
        self.session_rx = 0;
    }

    async fn tick(&mut self) {
        let Some((engine, initialized)) = self.ready_engine() else {
            return;
        };
        if initialized {
            return;
        }
        let updated = self.sample(engine.as_ref(), Instant::now());
        let snapshot = self.snapshot();
        let _ = self.events.send(TrafficEvent::Speed(snapshot));

        if self.statistics {
            for data in updated {
                let _ = self.events.send(TrafficEvent::Traffic(data));
                self.persist(data).await;
            }
        }
    }

    /// Query each live tag once and fold the deltas into the entries.
    ///
    /// Returns the totals of non-bypass entries that changed.
    fn sample(&mut self, engine: &dyn ProxyEngine, now: Instant) -> Vec<TrafficData> {
        let mut deltas: HashMap<String, (u64, u64)> = HashMap::new();
        for (_, data) in self.entries.iter().filter(|(_, d)| !d.ignore) {
            if deltas.contains_key(&data.tag) {
                continue;
            }
            let tx = query(engine, &data.tag, Direction::Uplink);
            let rx = query(engine, &data.tag, Direction::Downlink);
            deltas.insert(data.tag.clone(), (tx, rx));
        }
        for (tag, (tx, rx)) in &deltas {
            if tag != TAG_BYPASS {
                self.session_tx += tx;
                self.session_rx += rx;
            }
        }

        let mut updated = Vec::new();
        for (id, data) in self.entries.iter_mut().filter(|(_, d)| !d.ignore) {
            let (tx, rx) = deltas.get(&data.tag).copied().unwrap_or_default();
            let elapsed_ms = now.saturating_duration_since(data.last_update).as_millis() as u64;
            data.tx += tx;
            data.rx += rx;
            data.tx_rate = rate(tx, elapsed_ms);
            data.rx_rate = rate(rx, elapsed_ms);
            data.last_update = now;
            if *id != BYPASS_ENTITY_ID && (tx > 0 || rx > 0) {
                updated.push(TrafficData {
                    id: *id,
                    tx: data.tx,
                    rx: data.rx,
                });
            }
        }
        updated
    }

    /// Entities sharing a tag carry the same traffic, so each live tag
    /// contributes its rate once.
    fn snapshot(&self) -> SpeedSnapshot {
        let mut snapshot = SpeedSnapshot {
            tx_total: self.session_tx,
            rx_total: self.session_rx,
            ..SpeedSnapshot::default()
        };
        let mut seen = HashSet::new();
        for (id, data) in &self.entries {
            if *id == BYPASS_ENTITY_ID {
                if self.show_direct_speed {
                    snapshot.tx_rate_direct = data.tx_rate;
                    snapshot.rx_rate_direct = data.rx_rate;
                }
                continue;
            }
            if !data.ignore && seen.insert(data.tag.as_str()) {
                snapshot.tx_rate_proxy += data.tx_rate;
                snapshot.rx_rate_proxy += data.rx_rate;
            }
        }
        snapshot
    }

    async fn select_main(&mut self, id: i64) {
        let Some((engine, _)) = self.ready_engine() else {
            warn!(id, "cannot select outbound before the engine is ready");
            return;
        };
        let Some(new_index) = self.position(id) else {
            warn!(id, "unknown outbound entity");
            return;
        };
        let old_index = self.entries.iter().position(|(entry_id, d)| {
            *entry_id != BYPASS_ENTITY_ID && !d.ignore && d.tag == TAG_PROXY
        });

        if old_index != Some(new_index) {
            let parked_tag = self.entries[new_index].1.tag.clone();
            if let Some(old_index) = old_index {
                let (old_id, old) = &mut self.entries[old_index];
                old.tag = parked_tag;
                old.ignore = true;
                old.tx_rate = 0;
                old.rx_rate = 0;
                let flushed = TrafficData {
                    id: *old_id,
                    tx: old.tx,
                    rx: old.rx,
                };
                if self.statistics {
                    self.persist(flushed).await;
                }
            }
            let new = &mut self.entries[new_index].1;
            new.tag = TAG_PROXY.to_string();
            new.ignore = false;
            new.last_update = Instant::now();
        }

        engine.set_active_outbound(id);
        debug!(id, "main outbound selected");
    }

    /// Final read pass, then persist and publish every entity's totals.
    async fn finish(mut self) -> Vec<TrafficData> {
        if let Some(engine) = self.engine.clone() {
            self.sample(engine.as_ref(), Instant::now());
        }
        let totals: Vec<TrafficData> = self
            .entries
            .iter()
            .filter(|(id, _)| *id != BYPASS_ENTITY_ID)
            .map(|(id, d)| TrafficData {
                id: *id,
                tx: d.tx,
                rx: d.rx,
            })
            .collect();

        for data in &totals {
            if self.statistics {
                self.persist(*data).await;
            }
            let _ = self.events.send(TrafficEvent::Traffic(*data));
        }
        info!(entities = totals.len(), "traffic looper stopped");
        totals
    }

    fn position(&self, id: i64) -> Option<usize> {
        self.entries.iter().position(|(entry_id, _)| *entry_id == id)
    }

    async fn persist(&self, data: TrafficData) {
        if let Err(e) = self.store.update_counters(data.id, data.rx, data.tx).await {
            warn!(id = data.id, error = %e, "failed to persist traffic counters");
        }
    }
}

fn query(engine: &dyn ProxyEngine, tag: &str, direction: Direction) -> u64 {
    engine.query_stats(tag, direction).unwrap_or_else(|e| {
        warn!(tag, %direction, error = %e, "traffic query failed");
        0
    })
}

fn rate(delta: u64, elapsed_ms: u64) -> u64 {
    if elapsed_ms == 0 {
        return 0;
    }
    delta.saturating_mul(1000) / elapsed_ms
}
