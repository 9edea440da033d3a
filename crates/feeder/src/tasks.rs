//! Periodic scheduler: which operation runs at which cadence.
//!
//! Every invocation is spawned as its own task. An operation that is still
//! running when its next tick fires turns that tick away through its busy
//! guard instead of queueing behind it.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::db::{Db, Slot};
use crate::device::Device;
use crate::gate::BusyGuard;
use crate::level::ProbeSource;

/// Outlet timer servicing and feed-pump mirroring.
pub const FAST_TICK: Duration = Duration::from_millis(50);
/// Control loops, level sampling and persistence.
pub const SLOW_TICK: Duration = Duration::from_secs(1);

pub const SAVE_EVERY: u64 = 59;
pub const LOG_FLUSH_EVERY: u64 = 307;
pub const BACKUP_EVERY: u64 = 601;
/// The persistence counter restarts at 1 once it passes this.
pub const WRAP_AFTER: u64 = LOG_FLUSH_EVERY * SAVE_EVERY - 10;

/// Run `f` every `period`, each call on a fresh task.
pub fn every<F, Fut>(period: Duration, name: &'static str, f: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(task = name, ?period, "periodic task started");
        loop {
            ticker.tick().await;
            tokio::spawn(f());
        }
    })
}

fn unix_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

// ---------------------------------------------------------------------------
// Persistence cadence
// ---------------------------------------------------------------------------

pub struct Persister {
    device: Arc<Device>,
    db: Db,
    count: Mutex<u64>,
    guard: BusyGuard,
}

impl Persister {
    pub fn new(device: Arc<Device>, db: Db) -> Self {
        Self {
            device,
            db,
            count: Mutex::new(1),
            guard: BusyGuard::new(),
        }
    }

    fn next_count(&self) -> u64 {
        let mut c = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if *c > WRAP_AFTER {
            *c = 1;
        }
        let current = *c;
        *c += 1;
        current
    }

    pub async fn tick(&self) {
        let Some(_busy) = self.guard.try_enter() else {
            return;
        };
        let count = self.next_count();

        if count % SAVE_EVERY == 0 {
            let snapshot = self.device.snapshot().await;
            match self.db.save_snapshot(Slot::Current, &snapshot).await {
                Ok(()) => debug!("snapshot saved"),
                Err(e) => warn!(error = %format!("{e:#}"), "snapshot save failed"),
            }
        }

        if count % LOG_FLUSH_EVERY == 0 {
            let batch = self.device.shared.write().await.take_unflushed();
            if let Some(entries) = batch {
                if let Err(e) = self.db.flush_log(&entries).await {
                    warn!(error = %format!("{e:#}"), "log flush failed");
                    self.device.shared.write().await.mark_unflushed();
                } else {
                    debug!(entries = entries.len(), "local log flushed");
                }
            }
        }

        if count % BACKUP_EVERY == 0 {
            match self.db.backup_snapshot().await {
                Ok(()) => info!("snapshot backed up"),
                Err(e) => warn!(error = %format!("{e:#}"), "snapshot backup failed"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn spawn_all(
    device: Arc<Device>,
    probes: Box<dyn ProbeSource>,
    persister: Arc<Persister>,
) -> Vec<JoinHandle<()>> {
    let probes = Arc::new(Mutex::new(probes));
    let mut handles = Vec::new();

    let d = device.clone();
    handles.push(every(FAST_TICK, "outlets", move || {
        let d = d.clone();
        async move {
            d.outlets.service(unix_ms());
            d.feed.sync_feed_pump();
        }
    }));

    let d = device.clone();
    handles.push(every(SLOW_TICK, "levels", move || {
        let levels = d.levels.clone();
        let probes = probes.clone();
        async move {
            let mut source = probes.lock().unwrap_or_else(PoisonError::into_inner);
            levels.sample(&mut **source);
        }
    }));

    let d = device.clone();
    handles.push(every(SLOW_TICK, "make", move || {
        let feed = d.feed.clone();
        async move { feed.make().await }
    }));

    let d = device.clone();
    handles.push(every(SLOW_TICK, "circular-feed", move || {
        let feed = d.feed.clone();
        async move { feed.circular_feed().await }
    }));

    let d = device.clone();
    handles.push(every(SLOW_TICK, "drip-feed", move || {
        let feed = d.feed.clone();
        async move { feed.drip_feed() }
    }));

    let d = device.clone();
    handles.push(every(SLOW_TICK, "seed", move || {
        let feed = d.feed.clone();
        async move { feed.seed() }
    }));

    let d = device;
    handles.push(every(SLOW_TICK, "measure", move || {
        let measurer = d.measurer.clone();
        async move { measurer.run().await }
    }));

    handles.push(every(SLOW_TICK, "persist", move || {
        let p = persister.clone();
        async move { p.tick().await }
    }));

    info!(tasks = handles.len(), "periodic tasks started");
    handles
}

// ===========================================================================
// Tests
// ===========================================================================
