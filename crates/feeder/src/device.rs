//! The assembled device: both controllers and their facades, plus the
//! operations that span them (twin documents, snapshots, status view).

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use sysinfo::System;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::feed::{keep_first, FeedController};
use crate::level::LevelBank;
use crate::measure::Measurer;
use crate::outlet::OutletBank;
use crate::state::{SharedState, DEFAULT_MAX_LOG};
use crate::twin::{TwinDocument, TwinSide};

pub struct Device {
    pub feed: Arc<FeedController>,
    pub measurer: Arc<Measurer>,
    pub outlets: Arc<OutletBank>,
    pub levels: Arc<LevelBank>,
    pub shared: SharedState,
    /// Include the local log in the status view.
    pub expose_logs: bool,
    /// Apply clock updates from the local API to the host.
    pub set_clock: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HostInfo {
    hostname: Option<String>,
    uptime_secs: u64,
    process_uptime_secs: u64,
    load_average: [f64; 3],
    memory_total: u64,
    memory_used: u64,
}

impl Device {
    /// Apply one twin document. Every section present is applied before the
    /// first error is returned.
    pub async fn apply_document(&self, doc: &TwinDocument, side: TwinSide) -> Result<()> {
        let mut err = None;

        if let Some(p) = &doc.feed_maker {
            match side {
                TwinSide::Desired => {
                    keep_first(&mut err, self.feed.apply_desired(p));
                    if let Some(allow) = p.supply_allow {
                        self.measurer.set_supply_allow(allow);
                    }
                }
                TwinSide::Reported => keep_first(&mut err, self.feed.apply_reported(p)),
            }
        }
        if let Some(p) = &doc.measurer {
            let r = match side {
                TwinSide::Desired => self.measurer.apply_desired(p),
                TwinSide::Reported => self.measurer.apply_reported(p),
            };
            keep_first(&mut err, r);
        }
        if let Some(patch) = &doc.outlet {
            self.outlets.apply_patch(patch);
        }

        if side == TwinSide::Desired {
            let mut st = self.shared.write().await;
            if let Some(n) = doc.max_log_num {
                st.set_max_log(n);
            }
            if doc.reset_log.is_some() {
                st.reset_log();
                info!("local log reset");
            }
        }

        err.map_or(Ok(()), Err)
    }

    /// Everything needed to restore the configuration after a restart.
    pub async fn snapshot(&self) -> Value {
        let max_log = self.shared.read().await.max_log();
        json!({
            "maxLogNum": max_log,
            "feedMaker": self.feed.status(),
            "measurer": self.measurer.status(),
            "outlet": self.outlets.snapshot(),
            "waterLevel": self.levels.snapshot(),
        })
    }

    /// Apply a saved snapshot as both desired and reported state.
    pub async fn restore(&self, snapshot: Value) -> Result<()> {
        let mut doc: TwinDocument =
            serde_json::from_value(snapshot).context("snapshot does not match the twin shape")?;
        doc.max_log_num = Some(doc.max_log_num.filter(|n| *n > 0).unwrap_or(DEFAULT_MAX_LOG));
        doc.reset_log = None;

        let desired = self.apply_document(&doc, TwinSide::Desired).await;
        let reported = self.apply_document(&doc, TwinSide::Reported).await;
        info!("configuration restored from snapshot");
        desired.and(reported)
    }

    /// The local status view served by `GET /`.
    pub async fn status(&self) -> Value {
        let (connected, logs, max_log) = {
            let st = self.shared.read().await;
            let logs = self.expose_logs.then(|| st.recent(st.max_log()));
            (st.mqtt_connected, logs, st.max_log())
        };

        let mut v = json!({
            "connection": connected,
            "maxLogNum": max_log,
            "feedMaker": self.feed.status(),
            "measurer": self.measurer.status(),
            "outlet": self.outlets.snapshot(),
            "waterLevel": self.levels.snapshot(),
            "host": self.host_info().await,
            "time": OffsetDateTime::now_utc().format(&Rfc3339).ok(),
        });
        if let (Some(logs), Some(obj)) = (logs, v.as_object_mut()) {
            obj.insert("logs".into(), json!(logs));
        }
        v
    }

    async fn host_info(&self) -> HostInfo {
        let process_uptime_secs = self.shared.read().await.uptime_secs();
        let mut sys = System::new();
        sys.refresh_memory();
        let load = System::load_average();
        HostInfo {
            hostname: System::host_name(),
            uptime_secs: System::uptime(),
            process_uptime_secs,
            load_average: [load.one, load.five, load.fifteen],
            memory_total: sys.total_memory(),
            memory_used: sys.used_memory(),
        }
    }
}

// ---------------------------------------------------------------------------
// Twin inbox
// ---------------------------------------------------------------------------

/// Decides which incoming twin documents are applied: the first desired
/// document after boot is skipped (the restored snapshot is newer), only the
/// first reported document is applied (later ones echo our own reports),
/// and documents flagged `isUpdate` belong to a module update.
#[derive(Debug, Default)]
pub struct TwinInbox {
    desired_seen: bool,
    reported_seen: bool,
}

impl TwinInbox {
    /// Whether the reported topic still has a document to deliver.
    pub fn wants_reported(&self) -> bool {
        !self.reported_seen
    }

    pub fn accept(&mut self, side: TwinSide, doc: &TwinDocument) -> bool {
        match side {
            TwinSide::Desired if !std::mem::replace(&mut self.desired_seen, true) => {
                debug!("first desired document after boot skipped");
                return false;
            }
            TwinSide::Reported if std::mem::replace(&mut self.reported_seen, true) => {
                debug!("reported document already restored, ignored");
                return false;
            }
            _ => {}
        }
        if doc.is_update == Some(true) {
            debug!("module update document skipped");
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Test fixture
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::bus::testing::ScriptedBus;
    use crate::feed::FeedOptions;
    use crate::gate::SharedFlag;
    use crate::outlet::RelayDriver;
    use crate::state::SystemState;
    use crate::twin::testing::RecordingEmitter;

    pub fn device(expose_logs: bool) -> (Device, Arc<RecordingEmitter>) {
        let outlets = Arc::new(OutletBank::new(2, RelayDriver::new(&[], true).unwrap()));
        let levels = Arc::new(LevelBank::new(1));
        let emitter = Arc::new(RecordingEmitter::default());
        let supply = SharedFlag::new(true);
        let feed = Arc::new(FeedController::new(
            outlets.clone(),
            levels.clone(),
            emitter.clone(),
            supply.reader(),
            FeedOptions::default(),
        ));
        let measurer = Arc::new(Measurer::new(
            feed.clone(),
            Arc::new(ScriptedBus::default()),
            emitter.clone(),
            supply,
        ));
        let device = Device {
            feed,
            measurer,
            outlets,
            levels,
            shared: SystemState::shared(DEFAULT_MAX_LOG),
            expose_logs,
            set_clock: false,
        };
        (device, emitter)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
