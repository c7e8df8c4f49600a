//! Background refresh of published rule sets.
//!
//! A job per rule-set id waits an initial delay and for the device to be
//! charging on an unmetered network, then downloads `<base><id>.acl` into the
//! rule-set cache, retrying transient failures with exponential backoff.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{AclError, FetchErrorKind, Result};
use crate::fetch::Fetch;
use crate::store::{self, RuleSetStore};

/// Default delay before a scheduled sync starts
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Default number of download attempts per scheduled run
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default first backoff; doubled after each failed attempt
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(30);

/// Upper bound for the backoff between attempts
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60 * 60);

/// Device state a sync waits for.
pub trait DeviceConditions: Send + Sync {
    fn is_charging(&self) -> bool;
    fn is_unmetered(&self) -> bool;
}

/// Conditions that are always met
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReady;

impl DeviceConditions for AlwaysReady {
    fn is_charging(&self) -> bool {
        true
    }

    fn is_unmetered(&self) -> bool {
        true
    }
}

/// Syncer timing and source options.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// URL prefix, the rule set is fetched from `<base_url><id>.acl`
    pub base_url: String,
    pub initial_delay: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
    /// How often unmet device conditions are re-checked
    pub condition_poll: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            base_url: crate::config::DEFAULT_REMOTE_RULE_BASE.to_string(),
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            condition_poll: Duration::from_secs(60),
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            base_url: config.remote_rule_base.clone(),
            ..Self::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_condition_poll(mut self, poll: Duration) -> Self {
        self.condition_poll = poll;
        self
    }
}

/// Scheduler of rule-set downloads, at most one job per id.
pub struct AclSyncer {
    store: RuleSetStore,
    fetch: Arc<dyn Fetch>,
    conditions: Arc<dyn DeviceConditions>,
    options: SyncOptions,
    jobs: Mutex<HashMap<String, (u64, CancellationToken)>>,
    next_job: AtomicU64,
}

impl AclSyncer {
    pub fn new(
        store: RuleSetStore,
        fetch: Arc<dyn Fetch>,
        conditions: Arc<dyn DeviceConditions>,
        options: SyncOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            fetch,
            conditions,
            options,
            jobs: Mutex::new(HashMap::new()),
            next_job: AtomicU64::new(0),
        })
    }

    pub fn url_for(&self, id: &str) -> String {
        format!("{}{}.acl", self.options.base_url, id)
    }

    /// Schedule a sync for `id`, replacing a pending job for the same id.
    ///
    /// Returns `None` for rule sets that are not published remotely.
    pub fn schedule(self: &Arc<Self>, id: &str) -> Option<JoinHandle<Result<u64>>> {
        if !store::is_syncable(id) {
            return None;
        }
        let job = self.next_job.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        if let Some((_, previous)) = self
            .jobs
            .lock()
            .insert(id.to_string(), (job, cancel.clone()))
        {
            previous.cancel();
        }

        let this = Arc::clone(self);
        let id = id.to_string();
        Some(tokio::spawn(async move {
            let result = this.scheduled(&id, &cancel).await;
            let mut jobs = this.jobs.lock();
            if jobs.get(&id).is_some_and(|(j, _)| *j == job) {
                jobs.remove(&id);
            }
            result
        }))
    }

    /// Whether a job for `id` is pending or running
    pub fn is_scheduled(&self, id: &str) -> bool {
        self.jobs.lock().contains_key(id)
    }

    pub fn cancel(&self, id: &str) {
        if let Some((_, token)) = self.jobs.lock().remove(id) {
            token.cancel();
        }
    }

    pub fn cancel_all(&self) {
        for (_, (_, token)) in self.jobs.lock().drain() {
            token.cancel();
        }
    }

    async fn scheduled(&self, id: &str, cancel: &CancellationToken) -> Result<u64> {
        pause(self.options.initial_delay, cancel).await?;
        while !(self.conditions.is_charging() && self.conditions.is_unmetered()) {
            debug!(id, "waiting for charging and unmetered network");
            pause(self.options.condition_poll, cancel).await?;
        }
        self.run(id, cancel).await
    }

    /// Download with retries; gives up after `max_attempts`.
    pub async fn run(&self, id: &str, cancel: &CancellationToken) -> Result<u64> {
        let mut backoff = self.options.backoff;
        let mut attempt = 1;
        loop {
            match self.sync_once(id).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if is_transient(&e) && attempt < self.options.max_attempts => {
                    warn!(id, attempt, error = %e, "rule set sync failed, retrying");
                    pause(backoff, cancel).await?;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    attempt += 1;
                }
                Err(e) => {
                    warn!(id, attempt, error = %e, "rule set sync failed");
                    return Err(e);
                }
            }
        }
    }

    /// One download attempt, written atomically into the cache.
    pub async fn sync_once(&self, id: &str) -> Result<u64> {
        let url = self.url_for(id);
        let store = self.store.clone();
        let fetch = Arc::clone(&self.fetch);
        let id = id.to_string();
        let bytes = tokio::task::spawn_blocking(move || {
            let mut body = fetch.get(&url)?;
            store.replace_from_reader(&id, &mut body)
        })
        .await
        .map_err(|e| AclError::IoError(io::Error::other(e.to_string())))??;
        debug!(bytes, "rule set synced");
        Ok(bytes)
    }
}

fn is_transient(err: &AclError) -> bool {
    match err {
        AclError::Fetch { kind, .. } => !matches!(kind, FetchErrorKind::InvalidUrl),
        AclError::IoError(_) => true,
        _ => false,
    }
}

async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AclError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
