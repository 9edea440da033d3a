//! Feed Controller: tank filling and concentrate dosing, drip and circular
//! bed feeding, spare pump mirroring and the nursery refill cycle.
//!
//! Every periodic operation is entered through its own [`BusyGuard`]; a tick
//! that arrives while the previous invocation is still running (for example
//! suspended in a dosing hold) is dropped. Actuator writes go through
//! [`FeedController::control`], which only writes when the outlet differs
//! from the requested state, so re-running a tick with unchanged inputs
//! produces no further writes.

use anyhow::Result;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::concentrate::{ConcentrateRegistry, RegistryPatch};
use crate::gate::{BusyGuard, FlagReader, SharedFlag};
use crate::level::{LevelState, Tank, WaterLevels};
use crate::outlet::{Outlet, Outlets};
use crate::twin::{BedPatch, Emitter, FeedPatch, Outbound, SeedPatch, Source};

/// Anti-imbalance delay ceiling, in ticks (1 s each).
pub const MAX_MAKE_DELAY: u32 = 60;

/// Margin added to the slowest channel's on/off interval for the dosing hold.
const SUPPLY_WAIT_MARGIN: f64 = 30.0;

const DAY_SEC: f64 = 86_400.0;

/// Seconds to a sleepable duration; non-positive or non-finite is zero.
pub(crate) fn secs(v: f64) -> Duration {
    if v.is_finite() && v > 0.0 {
        Duration::try_from_secs_f64(v).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FeedType {
    #[default]
    Drip,
    Circular,
}

impl TryFrom<u8> for FeedType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Drip),
            1 => Ok(Self::Circular),
            other => Err(format!("unknown feed type {other}")),
        }
    }
}

impl From<FeedType> for u8 {
    fn from(t: FeedType) -> u8 {
        match t {
            FeedType::Drip => 0,
            FeedType::Circular => 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeedInfo {
    pub name: String,
    #[serde(rename = "use")]
    pub in_use: bool,
    pub power: bool,
    /// Nursery refill in progress.
    pub flag: bool,
}

impl SeedInfo {
    fn apply(&mut self, p: &SeedPatch) {
        if let Some(v) = &p.name {
            self.name = v.clone();
        }
        if let Some(v) = p.in_use {
            self.in_use = v;
        }
        if let Some(v) = p.power {
            self.power = v;
        }
        if let Some(v) = p.flag {
            self.flag = v;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BedEntry {
    pub name: String,
    pub is_feed: bool,
    /// Seconds the bed valve stays open per feed.
    pub feed_time: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BedConfig {
    pub beds: Vec<BedEntry>,
    /// Ticks between circular feeds.
    pub feed_period: f64,
    /// Seconds the circular feed rests after a pass.
    pub feed_wait_time: f64,
}

impl Default for BedConfig {
    fn default() -> Self {
        Self {
            beds: Vec::new(),
            feed_period: DAY_SEC,
            feed_wait_time: DAY_SEC * 365.0,
        }
    }
}

impl BedConfig {
    fn apply(&mut self, p: &BedPatch) {
        if let Some(v) = p.feed_period {
            self.feed_period = v;
        }
        if let Some(v) = p.feed_wait_time {
            self.feed_wait_time = v;
        }
        for (index, entry) in p.indexed() {
            let Some(bed) = self.beds.get_mut(index) else {
                warn!(index, beds = self.beds.len(), "bed entry beyond bed count ignored");
                continue;
            };
            if let Some(v) = &entry.name {
                bed.name = v.clone();
            }
            if let Some(v) = entry.is_feed {
                bed.is_feed = v;
            }
            if let Some(v) = entry.feed_time {
                bed.feed_time = v;
            }
        }
    }
}

impl Serialize for BedConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.beds.len() + 2))?;
        for (i, bed) in self.beds.iter().enumerate() {
            map.serialize_entry(&i.to_string(), bed)?;
        }
        map.serialize_entry("feedPeriod", &self.feed_period)?;
        map.serialize_entry("feedWaitTime", &self.feed_wait_time)?;
        map.end()
    }
}

#[derive(Debug, Clone)]
struct FeedSettings {
    power: bool,
    supply_num: u32,
    supply_wait_time: f64,
    concentrates: ConcentrateRegistry,
    feed_type: FeedType,
    always_full: bool,
    seed: SeedInfo,
    bed_num: usize,
    beds: BedConfig,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            power: false,
            supply_num: 1,
            supply_wait_time: 210.0,
            concentrates: ConcentrateRegistry::default(),
            feed_type: FeedType::Drip,
            always_full: false,
            seed: SeedInfo::default(),
            bed_num: 0,
            beds: BedConfig::default(),
        }
    }
}

/// Startup switches passed in from configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedOptions {
    /// Anti-imbalance delay: wait [`MAX_MAKE_DELAY`] ticks before filling.
    pub make_delay: bool,
}

/// Reported view of the controller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatus {
    pub flag: bool,
    pub power: bool,
    pub supply_allow: bool,
    pub supply_num: u32,
    pub supply_wait_time: f64,
    pub concentrate_setting_info: ConcentrateRegistry,
    pub feed_type: FeedType,
    pub always_full: bool,
    pub seed_info: SeedInfo,
    pub bed_num: usize,
    pub bed_info: BedConfig,
}

#[derive(Debug, Default)]
struct MakeCycle {
    started: Option<Instant>,
    delay_count: u32,
}

pub(crate) fn keep_first(slot: &mut Option<anyhow::Error>, r: Result<()>) {
    if let Err(e) = r {
        slot.get_or_insert(e);
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct FeedController {
    settings: Mutex<FeedSettings>,
    flag: SharedFlag,
    supply: FlagReader,
    outlets: Arc<dyn Outlets>,
    levels: Arc<dyn WaterLevels>,
    emitter: Arc<dyn Emitter>,
    options: FeedOptions,
    cycle: Mutex<MakeCycle>,
    feed_count: Mutex<f64>,
    make_guard: BusyGuard,
    drip_guard: BusyGuard,
    circular_guard: BusyGuard,
    seed_guard: BusyGuard,
}

impl FeedController {
    pub fn new(
        outlets: Arc<dyn Outlets>,
        levels: Arc<dyn WaterLevels>,
        emitter: Arc<dyn Emitter>,
        supply: FlagReader,
        options: FeedOptions,
    ) -> Self {
        Self {
            settings: Mutex::new(FeedSettings::default()),
            flag: SharedFlag::new(false),
            supply,
            outlets,
            levels,
            emitter,
            options,
            cycle: Mutex::new(MakeCycle::default()),
            feed_count: Mutex::new(0.0),
            make_guard: BusyGuard::new(),
            drip_guard: BusyGuard::new(),
            circular_guard: BusyGuard::new(),
            seed_guard: BusyGuard::new(),
        }
    }

    fn settings(&self) -> MutexGuard<'_, FeedSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, name: &'static str, value: impl Serialize) -> Result<()> {
        self.emitter.send(Outbound::value(Source::FeedMaker, name, value))
    }

    fn journal(&self, line: impl Into<String>) {
        let line = line.into();
        info!(target: "feed", "{line}");
        if let Err(e) = self.emitter.send(Outbound::Journal(line)) {
            warn!(error = %e, "journal entry dropped");
        }
    }

    fn warn_on(&self, what: &str, r: Result<()>) {
        if let Err(e) = r {
            warn!(error = %e, "{what} failed");
        }
    }

    /// Write `on` only when the outlet is not already in that state.
    fn control(&self, outlet: Outlet, on: bool) {
        if self.outlets.power(outlet) != on {
            self.outlets.set_power(outlet, on);
        }
    }

    // -- accessors ----------------------------------------------------------

    pub fn flag(&self) -> bool {
        self.flag.get()
    }

    pub fn flag_reader(&self) -> FlagReader {
        self.flag.reader()
    }

    pub fn power(&self) -> bool {
        self.settings().power
    }

    pub fn supply_allow(&self) -> bool {
        self.supply.get()
    }

    pub fn always_full(&self) -> bool {
        self.settings().always_full
    }

    pub fn concentrates(&self) -> ConcentrateRegistry {
        self.settings().concentrates.clone()
    }

    pub fn outlets(&self) -> &Arc<dyn Outlets> {
        &self.outlets
    }

    pub fn levels(&self) -> &Arc<dyn WaterLevels> {
        &self.levels
    }

    pub fn status(&self) -> FeedStatus {
        let s = self.settings().clone();
        FeedStatus {
            flag: self.flag(),
            power: s.power,
            supply_allow: self.supply_allow(),
            supply_num: s.supply_num,
            supply_wait_time: s.supply_wait_time,
            concentrate_setting_info: s.concentrates,
            feed_type: s.feed_type,
            always_full: s.always_full,
            seed_info: s.seed,
            bed_num: s.bed_num,
            bed_info: s.beds,
        }
    }

    // -- setters ------------------------------------------------------------

    pub fn set_flag(&self, flag: bool) -> Result<()> {
        self.flag.set(flag);
        info!(flag, "feed mixing flag");
        self.emit("flag", flag)
    }

    /// Set the flag and push it to the reported twin.
    fn raise_flag(&self, flag: bool) {
        self.warn_on("flag update", self.set_flag(flag));
        self.warn_on(
            "flag report",
            self.emitter
                .send(Outbound::Report(json!({ "feedMaker": { "flag": flag } }))),
        );
    }

    pub fn set_power(&self, power: bool) -> Result<()> {
        self.settings().power = power;
        self.journal(format!(
            "feed automation {}",
            if power { "on" } else { "off" }
        ));
        if !power {
            self.control(Outlet::WaterValve, false);
        }
        self.emit("power", power)
    }

    pub fn set_supply_num(&self, n: u32) -> Result<()> {
        self.settings().supply_num = n;
        info!(supply_num = n, "supply rounds set");
        self.emit("supplyNum", n)
    }

    pub fn set_supply_wait_time(&self, secs: f64) -> Result<()> {
        self.settings().supply_wait_time = secs;
        info!(supply_wait_time = secs, "supply hold set");
        self.emit("supplyWaitTime", secs)
    }

    pub fn set_concentrates(&self, patch: &RegistryPatch) -> Result<()> {
        let registry = {
            let mut s = self.settings();
            s.concentrates.apply(patch);
            s.concentrates.clone()
        };
        info!(channels = patch.len(), "concentrate settings updated");
        self.emit("concentrateSettingInfo", &registry)
    }

    pub fn set_feed_type(&self, feed_type: FeedType) -> Result<()> {
        self.settings().feed_type = feed_type;
        info!(?feed_type, "feed type set");
        self.emit("feedType", feed_type)
    }

    pub fn set_always_full(&self, always_full: bool) -> Result<()> {
        self.settings().always_full = always_full;
        self.emit("alwaysFull", always_full)
    }

    pub fn set_seed_info(&self, patch: &SeedPatch) -> Result<()> {
        let seed = {
            let mut s = self.settings();
            s.seed.apply(patch);
            s.seed.clone()
        };
        self.emit("seedInfo", &seed)
    }

    pub fn set_bed_num(&self, bed_num: usize) -> Result<()> {
        {
            let mut s = self.settings();
            s.bed_num = bed_num;
            s.beds.beds.resize(bed_num, BedEntry::default());
        }
        self.outlets.resize(bed_num);
        info!(bed_num, "bed count set");
        self.emit("bedNum", bed_num)
    }

    pub fn set_bed_info(&self, patch: &BedPatch) -> Result<()> {
        let beds = {
            let mut s = self.settings();
            s.beds.apply(patch);
            s.beds.clone()
        };
        self.emit("bedInfo", &beds)
    }

    /// Apply a desired document. Every present field is applied; the first
    /// emission failure is returned afterwards. `flag` is reported-only and
    /// `supplyAllow` belongs to the Measurement Controller.
    pub fn apply_desired(&self, p: &FeedPatch) -> Result<()> {
        let mut err = None;
        if let Some(v) = p.power {
            keep_first(&mut err, self.set_power(v));
        }
        if let Some(v) = p.supply_num {
            keep_first(&mut err, self.set_supply_num(v));
        }
        if let Some(v) = p.supply_wait_time {
            keep_first(&mut err, self.set_supply_wait_time(v));
        }
        if let Some(v) = &p.concentrate_setting_info {
            keep_first(&mut err, self.set_concentrates(v));
        }
        if let Some(v) = &p.seed_info {
            keep_first(&mut err, self.set_seed_info(v));
        }
        if let Some(v) = p.feed_type {
            keep_first(&mut err, self.set_feed_type(v));
        }
        if let Some(v) = p.always_full {
            keep_first(&mut err, self.set_always_full(v));
        }
        if let Some(v) = p.bed_num {
            keep_first(&mut err, self.set_bed_num(v));
        }
        if let Some(v) = &p.bed_info {
            keep_first(&mut err, self.set_bed_info(v));
        }
        err.map_or(Ok(()), Err)
    }

    pub fn apply_reported(&self, p: &FeedPatch) -> Result<()> {
        match p.flag {
            Some(flag) => self.set_flag(flag),
            None => Ok(()),
        }
    }

    // -- derived timing -----------------------------------------------------

    /// Keep every concentrate outlet timer-driven with `ratio × baseTime` as
    /// its on/off interval, and the dosing hold at the slowest channel + 30 s.
    pub fn check_ratio_and_time(&self) -> Result<()> {
        let (registry, wait) = {
            let s = self.settings();
            (s.concentrates.clone(), s.supply_wait_time)
        };

        let mut max_interval: f64 = 0.0;
        for (id, channel) in registry.iter() {
            let outlet = Outlet::Concentrate(id);
            if !self.outlets.timer(outlet) {
                self.outlets.set_timer(outlet, true);
            }
            if let Some(interval) = channel.on_off_interval() {
                if self.outlets.on_off_interval(outlet) != interval {
                    self.outlets.set_on_off_interval(outlet, interval);
                }
            }
            max_interval = max_interval.max(self.outlets.on_off_interval(outlet));
        }

        let target = max_interval + SUPPLY_WAIT_MARGIN;
        if wait != target {
            self.set_supply_wait_time(target)?;
        }
        Ok(())
    }

    // -- fill / dose --------------------------------------------------------

    /// One tick of the tank fill and dosing state machine.
    pub async fn make(&self) {
        let Some(_busy) = self.make_guard.try_enter() else {
            return;
        };

        self.warn_on("ratio check", self.check_ratio_and_time());

        let level = self.levels.state(Tank::Feed);
        let (power, always_full, supply_num, supply_wait) = {
            let s = self.settings();
            (s.power, s.always_full, s.supply_num, s.supply_wait_time)
        };

        if !power {
            // unattended: never leave the valve open into an overflow
            let hold = always_full && matches!(level, LevelState::Lack | LevelState::Good);
            if !hold {
                self.control(Outlet::WaterValve, false);
            }
            return;
        }

        if level == LevelState::Lack && !self.flag.get() {
            self.cycle().started = Some(Instant::now());
            self.raise_flag(true);
            if self.options.make_delay {
                return;
            }
            self.control(Outlet::WaterValve, true);
            self.journal("feed tank low, filling");
        }

        if self.flag.get() {
            if self.options.make_delay {
                let mut cycle = self.cycle();
                if cycle.delay_count < MAX_MAKE_DELAY {
                    cycle.delay_count += 1;
                    debug!(count = cycle.delay_count, max = MAX_MAKE_DELAY, "fill delayed");
                    if level != LevelState::Lack {
                        cycle.delay_count = 0;
                        drop(cycle);
                        info!(?level, "fill skipped, tank no longer low");
                        self.raise_flag(false);
                    }
                    return;
                }
            }

            if level != LevelState::Flood {
                self.control(Outlet::WaterValve, true);
                return;
            }

            self.control(Outlet::WaterValve, false);
            self.raise_flag(false);
            let started = {
                let mut cycle = self.cycle();
                cycle.delay_count = 0;
                cycle.started.take()
            };

            let ceiling = Duration::from_secs(MAX_MAKE_DELAY as u64);
            let fill_time = started.map(|t| {
                let elapsed = t.elapsed();
                if self.options.make_delay {
                    elapsed.saturating_sub(ceiling)
                } else {
                    elapsed
                }
            });
            info!(fill_time = ?fill_time, "feed tank full");

            // an unknown start (restored flag) counts as a long fill
            let long_fill = fill_time.map_or(true, |d| d > ceiling);
            if self.supply.get() && long_fill {
                self.dose(supply_num, supply_wait).await;
            }
        } else if always_full {
            if level == LevelState::Flood {
                self.control(Outlet::WaterValve, false);
            }
        } else {
            self.control(Outlet::WaterValve, false);
        }
    }

    fn cycle(&self) -> MutexGuard<'_, MakeCycle> {
        self.cycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn dose(&self, rounds: u32, hold: f64) {
        self.journal("dosing started");
        self.control(Outlet::StirPump, true);

        for round in 1..=rounds {
            let nutrients = self.settings().concentrates.enabled_nutrients();
            for id in &nutrients {
                self.outlets.pulse(Outlet::Concentrate(*id));
            }
            self.journal(format!("dosing round {round}/{rounds}: {} channels", nutrients.len()));
            tokio::time::sleep(secs(hold)).await;
        }

        self.journal("dosing finished");
    }

    // -- feeding ------------------------------------------------------------

    fn set_feed_pump(&self, on: bool) {
        self.control(Outlet::FeedPump, on);
        self.control(Outlet::SpareFeedPump, on);
    }

    fn set_feed_pump_timer(&self, on: bool) {
        for outlet in [Outlet::FeedPump, Outlet::SpareFeedPump] {
            if self.outlets.timer(outlet) != on {
                self.outlets.set_timer(outlet, on);
            }
        }
    }

    fn off_all_bed_valves(&self) {
        let beds = self.settings().bed_num;
        for i in 0..beds {
            self.control(Outlet::BedValve(i), false);
        }
    }

    pub fn drip_feed(&self) {
        if self.settings().feed_type != FeedType::Drip {
            return;
        }
        let Some(_busy) = self.drip_guard.try_enter() else {
            return;
        };

        if self.power() && !self.flag.get() {
            self.set_feed_pump_timer(true);
        } else {
            self.set_feed_pump_timer(false);
            self.set_feed_pump(false);
        }
    }

    fn add_feed_count(&self, v: f64) -> f64 {
        let mut count = self.feed_count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += v;
        *count
    }

    /// One tick of circular feeding. On a feed tick this runs the whole bed
    /// pass and the rest period before returning.
    pub async fn circular_feed(&self) {
        if self.settings().feed_type != FeedType::Circular {
            return;
        }
        let Some(_busy) = self.circular_guard.try_enter() else {
            return;
        };

        let count = self.add_feed_count(1.0);
        let (bed_num, period, wait) = {
            let s = self.settings();
            (s.bed_num, s.beds.feed_period, s.beds.feed_wait_time)
        };

        self.set_feed_pump_timer(false);

        let due = period > 0.0 && count % period == 0.0;
        if !due {
            self.set_feed_pump(false);
            self.off_all_bed_valves();
            return;
        }

        info!(beds = bed_num, "circular feed started");
        self.set_feed_pump(true);

        for i in 0..bed_num {
            if self.flag.get() {
                self.set_feed_pump(false);
                self.off_all_bed_valves();
                self.journal("circular feed interrupted by tank mixing");
                break;
            }

            self.off_all_bed_valves();

            let bed = self.settings().beds.beds.get(i).cloned();
            if let Some(bed) = bed.filter(|b| b.is_feed) {
                let valve = Outlet::BedValve(i);
                self.outlets.set_power(valve, true);
                self.add_feed_count(bed.feed_time);
                debug!(bed = i, feed_time = bed.feed_time, "bed feeding");
                tokio::time::sleep(secs(bed.feed_time)).await;
                self.outlets.set_power(valve, false);
            }
        }

        self.set_feed_pump(false);
        self.add_feed_count(wait);
        tokio::time::sleep(secs(wait)).await;
    }

    /// Copy the primary feed pump's schedule and state onto the spare.
    pub fn sync_feed_pump(&self) {
        let o = &self.outlets;
        let (main, spare) = (Outlet::FeedPump, Outlet::SpareFeedPump);

        let timer = o.timer(main);
        if timer != o.timer(spare) {
            o.set_timer(spare, timer);
        }
        let on_off = o.on_off_interval(main);
        if on_off != o.on_off_interval(spare) {
            o.set_on_off_interval(spare, on_off);
        }
        let interval = o.timer_interval(main);
        if interval != o.timer_interval(spare) {
            o.set_timer_interval(spare, interval);
        }
        // power first: a rising edge restamps the turn-on time
        let power = o.power(main);
        if power != o.power(spare) {
            o.set_power(spare, power);
        }
        let last_on = o.last_time_turn_on(main);
        if last_on != o.last_time_turn_on(spare) {
            o.set_last_time_turn_on(spare, last_on);
        }
    }

    // -- nursery ------------------------------------------------------------

    fn set_seed_flag(&self, flag: bool) {
        let patch = SeedPatch {
            flag: Some(flag),
            ..SeedPatch::default()
        };
        self.warn_on("seed flag update", self.set_seed_info(&patch));
    }

    fn seed_pump_off(&self) {
        let pump = Outlet::SeedFeedPump;
        if self.outlets.power(pump) {
            self.outlets.set_power(pump, false);
        }
        if self.outlets.timer(pump) {
            self.outlets.set_timer(pump, false);
        }
    }

    fn seed_valves(&self, water: bool, nutrient: bool) {
        self.control(Outlet::SeedWaterValve, water);
        self.control(Outlet::SeedNutrientValve, nutrient);
    }

    /// One tick of the nursery refill cycle.
    pub fn seed(&self) {
        let level = self.levels.level(Tank::Seed);

        // empty nursery tank: the pump must never run dry
        if level == Some(0) {
            self.seed_pump_off();
        }

        let Some(_busy) = self.seed_guard.try_enter() else {
            return;
        };

        let seed = self.settings().seed.clone();
        if !seed.power || !seed.in_use {
            self.seed_valves(false, false);
            return;
        }

        if seed.flag {
            self.seed_pump_off();
            match level {
                Some(0) | Some(1) => self.seed_valves(true, false),
                Some(2) => self.seed_valves(false, true),
                _ => {
                    self.seed_valves(false, false);
                    self.set_seed_flag(false);
                    self.journal("nursery refill finished");
                }
            }
        } else if level == Some(0) {
            self.set_seed_flag(true);
            self.journal("nursery refill started");
        } else if !self.outlets.timer(Outlet::SeedFeedPump) {
            self.outlets.set_timer(Outlet::SeedFeedPump, true);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concentrate::{ChannelId, ChannelPatch};
    use crate::level::testing::StubLevels;
    use crate::outlet::testing::Journal;
    use crate::twin::testing::RecordingEmitter;
    use std::sync::atomic::Ordering;

    struct Rig {
        ctrl: Arc<FeedController>,
        outlets: Arc<Journal>,
        levels: Arc<StubLevels>,
        emitter: Arc<RecordingEmitter>,
        supply: SharedFlag,
    }

    fn rig_with(options: FeedOptions) -> Rig {
        let outlets = Arc::new(Journal::new(0));
        let levels = Arc::new(StubLevels::default());
        let emitter = Arc::new(RecordingEmitter::default());
        let supply = SharedFlag::new(true);
        let ctrl = Arc::new(FeedController::new(
            outlets.clone(),
            levels.clone(),
            emitter.clone(),
            supply.reader(),
            options,
        ));
        Rig {
            ctrl,
            outlets,
            levels,
            emitter,
            supply,
        }
    }

    fn rig() -> Rig {
        rig_with(FeedOptions::default())
    }

    fn enable(ctrl: &FeedController, ids: &[ChannelId]) {
        let patch: RegistryPatch = ids
            .iter()
            .map(|id| {
                (
                    *id,
                    ChannelPatch {
                        power: Some(true),
                        ..Default::default()
                    },
                )
            })
            .collect();
        ctrl.set_concentrates(&patch).unwrap();
    }

    // -- power off ----------------------------------------------------------

    #[tokio::test]
    async fn power_off_closes_valve_at_every_level() {
        let r = rig();
        for state in [
            LevelState::Lack,
            LevelState::Good,
            LevelState::Flood,
            LevelState::None,
            LevelState::Error,
        ] {
            r.outlets.set_power(Outlet::WaterValve, true);
            r.levels.set(Tank::Feed, state);
            r.ctrl.make().await;
            assert!(!r.outlets.power(Outlet::WaterValve), "level {state:?}");
        }
    }

    #[tokio::test]
    async fn power_off_always_full_leaves_manual_fill_alone() {
        let r = rig();
        r.ctrl.set_always_full(true).unwrap();
        r.outlets.set_power(Outlet::WaterValve, true);

        r.levels.set(Tank::Feed, LevelState::Lack);
        r.ctrl.make().await;
        assert!(r.outlets.power(Outlet::WaterValve));

        r.levels.set(Tank::Feed, LevelState::Good);
        r.ctrl.make().await;
        assert!(r.outlets.power(Outlet::WaterValve));

        r.levels.set(Tank::Feed, LevelState::Flood);
        r.ctrl.make().await;
        assert!(!r.outlets.power(Outlet::WaterValve));
    }

    #[tokio::test]
    async fn switching_power_off_closes_valve_immediately() {
        let r = rig();
        r.outlets.set_power(Outlet::WaterValve, true);
        r.ctrl.set_power(false).unwrap();
        assert!(!r.outlets.power(Outlet::WaterValve));
        assert_eq!(r.emitter.values("power"), vec![json!(false)]);
    }

    // -- fill ---------------------------------------------------------------

    #[tokio::test]
    async fn low_tank_starts_fill_and_reports_flag() {
        let r = rig();
        r.ctrl.set_power(true).unwrap();
        r.levels.set(Tank::Feed, LevelState::Lack);

        r.ctrl.make().await;

        assert!(r.ctrl.flag());
        assert!(r.outlets.power(Outlet::WaterValve));
        assert_eq!(r.emitter.reports(), vec![json!({"feedMaker": {"flag": true}})]);
    }

    #[tokio::test]
    async fn good_level_without_flag_keeps_valve_closed() {
        let r = rig();
        r.ctrl.set_power(true).unwrap();
        r.outlets.set_power(Outlet::WaterValve, true);
        r.levels.set(Tank::Feed, LevelState::Good);
        r.ctrl.make().await;
        assert!(!r.outlets.power(Outlet::WaterValve));
    }

    #[tokio::test]
    async fn restored_flag_resumes_fill() {
        let r = rig();
        r.ctrl.set_power(true).unwrap();
        r.ctrl.set_flag(true).unwrap();
        r.levels.set(Tank::Feed, LevelState::Good);
        r.ctrl.make().await;
        assert!(r.outlets.power(Outlet::WaterValve));
        assert!(!r.outlets.power(Outlet::StirPump));
    }

    #[tokio::test]
    async fn repeated_ticks_do_not_flap() {
        let r = rig();
        r.ctrl.set_power(true).unwrap();
        r.levels.set(Tank::Feed, LevelState::Lack);
        r.ctrl.make().await;
        let writes = r.outlets.bank.write_count();

        for _ in 0..5 {
            r.ctrl.make().await;
        }
        assert_eq!(r.outlets.bank.write_count(), writes);

        r.levels.set(Tank::Feed, LevelState::Good);
        r.ctrl.make().await;
        r.ctrl.make().await;
        assert_eq!(r.outlets.bank.write_count(), writes);
    }

    // -- dosing -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn full_tank_after_long_fill_runs_dosing_rounds() {
        let r = rig();
        r.ctrl.set_power(true).unwrap();
        r.ctrl.set_supply_num(2).unwrap();
        enable(&r.ctrl, &[ChannelId::A, ChannelId::C, ChannelId::I]);

        r.levels.set(Tank::Feed, LevelState::Lack);
        r.ctrl.make().await;
        tokio::time::advance(Duration::from_secs(61)).await;

        r.levels.set(Tank::Feed, LevelState::Flood);
        let t0 = Instant::now();
        r.ctrl.make().await;

        assert!(!r.outlets.power(Outlet::WaterValve));
        assert!(!r.ctrl.flag());
        assert_eq!(r.outlets.history(Outlet::StirPump), vec![(t0, true)]);

        let hold = Duration::from_secs(210);
        for id in [ChannelId::A, ChannelId::C] {
            assert_eq!(
                r.outlets.history(Outlet::Concentrate(id)),
                vec![(t0, true), (t0 + hold, true)]
            );
        }
        assert!(r.outlets.history(Outlet::Concentrate(ChannelId::B)).is_empty());
        // acid line is never part of tank dosing
        assert!(r.outlets.history(Outlet::Concentrate(ChannelId::I)).is_empty());
        assert_eq!(t0.elapsed(), hold * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn short_fill_skips_dosing() {
        let r = rig();
        r.ctrl.set_power(true).unwrap();
        enable(&r.ctrl, &[ChannelId::A]);

        r.levels.set(Tank::Feed, LevelState::Lack);
        r.ctrl.make().await;
        tokio::time::advance(Duration::from_secs(30)).await;
        r.levels.set(Tank::Feed, LevelState::Flood);
        r.ctrl.make().await;

        assert!(!r.ctrl.flag());
        assert!(r.outlets.history(Outlet::StirPump).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dosing_needs_supply_permission() {
        let r = rig();
        r.ctrl.set_power(true).unwrap();
        enable(&r.ctrl, &[ChannelId::A]);
        r.supply.set(false);

        r.levels.set(Tank::Feed, LevelState::Lack);
        r.ctrl.make().await;
        tokio::time::advance(Duration::from_secs(120)).await;
        r.levels.set(Tank::Feed, LevelState::Flood);
        r.ctrl.make().await;

        assert!(r.outlets.history(Outlet::StirPump).is_empty());
        assert!(r.outlets.history(Outlet::Concentrate(ChannelId::A)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dosing_never_starts_below_flood() {
        let r = rig();
        r.ctrl.set_power(true).unwrap();
        enable(&r.ctrl, &[ChannelId::A]);

        r.levels.set(Tank::Feed, LevelState::Lack);
        r.ctrl.make().await;
        tokio::time::advance(Duration::from_secs(600)).await;
        for state in [LevelState::Good, LevelState::Error, LevelState::None] {
            r.levels.set(Tank::Feed, state);
            r.ctrl.make().await;
        }
        assert!(r.ctrl.flag());
        assert!(r.outlets.history(Outlet::StirPump).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn make_tick_dropped_while_dosing() {
        let r = rig();
        r.ctrl.set_power(true).unwrap();
        enable(&r.ctrl, &[ChannelId::A]);
        r.levels.set(Tank::Feed, LevelState::Lack);
        r.ctrl.make().await;
        tokio::time::advance(Duration::from_secs(61)).await;
        r.levels.set(Tank::Feed, LevelState::Flood);

        let c = r.ctrl.clone();
        let dosing = tokio::spawn(async move { c.make().await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let t = Instant::now();
        r.ctrl.make().await;
        assert_eq!(t.elapsed(), Duration::ZERO);
        dosing.await.unwrap();
        assert_eq!(r.outlets.history(Outlet::Concentrate(ChannelId::A)).len(), 1);
    }

    // -- anti-imbalance delay -----------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn delay_mode_waits_before_opening_valve() {
        let r = rig_with(FeedOptions { make_delay: true });
        r.ctrl.set_power(true).unwrap();
        r.levels.set(Tank::Feed, LevelState::Lack);

        r.ctrl.make().await;
        assert!(r.ctrl.flag());
        assert!(!r.outlets.power(Outlet::WaterValve));

        for _ in 0..MAX_MAKE_DELAY {
            r.ctrl.make().await;
            assert!(!r.outlets.power(Outlet::WaterValve));
        }
        r.ctrl.make().await;
        assert!(r.outlets.power(Outlet::WaterValve));
    }

    #[tokio::test]
    async fn delay_mode_aborts_when_tank_recovers() {
        let r = rig_with(FeedOptions { make_delay: true });
        r.ctrl.set_power(true).unwrap();
        r.levels.set(Tank::Feed, LevelState::Lack);
        r.ctrl.make().await;
        r.ctrl.make().await;

        r.levels.set(Tank::Feed, LevelState::Good);
        r.ctrl.make().await;

        assert!(!r.ctrl.flag());
        assert!(!r.outlets.power(Outlet::WaterValve));
        assert_eq!(
            r.emitter.reports().last(),
            Some(&json!({"feedMaker": {"flag": false}}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delay_mode_subtracts_ceiling_from_fill_time() {
        let r = rig_with(FeedOptions { make_delay: true });
        r.ctrl.set_power(true).unwrap();
        enable(&r.ctrl, &[ChannelId::B]);
        r.levels.set(Tank::Feed, LevelState::Lack);

        r.ctrl.make().await;
        for _ in 0..=MAX_MAKE_DELAY {
            tokio::time::advance(Duration::from_secs(1)).await;
            r.ctrl.make().await;
        }
        // 61 s elapsed, 1 s of it filling
        r.levels.set(Tank::Feed, LevelState::Flood);
        r.ctrl.make().await;
        assert!(r.outlets.history(Outlet::StirPump).is_empty());
    }

    // -- derived timing -----------------------------------------------------

    #[tokio::test]
    async fn supply_wait_tracks_slowest_channel() {
        let r = rig();
        let patch: RegistryPatch =
            serde_json::from_str(r#"{"A":{"ratio":2},"J":{"ratio":1.5,"baseTime":400}}"#).unwrap();
        r.ctrl.set_concentrates(&patch).unwrap();

        r.ctrl.check_ratio_and_time().unwrap();

        assert_eq!(r.outlets.on_off_interval(Outlet::Concentrate(ChannelId::A)), 360.0);
        assert_eq!(r.outlets.on_off_interval(Outlet::Concentrate(ChannelId::J)), 600.0);
        assert_eq!(r.ctrl.status().supply_wait_time, 630.0);
        for id in ChannelId::ALL {
            assert!(r.outlets.timer(Outlet::Concentrate(id)));
        }
    }

    #[tokio::test]
    async fn invalid_product_keeps_previous_interval() {
        let r = rig();
        r.ctrl.check_ratio_and_time().unwrap();
        let patch: RegistryPatch = [(
            ChannelId::D,
            ChannelPatch {
                ratio: Some(f64::NAN),
                ..Default::default()
            },
        )]
        .into_iter()
        .collect();
        r.ctrl.set_concentrates(&patch).unwrap();

        r.ctrl.check_ratio_and_time().unwrap();
        assert_eq!(r.outlets.on_off_interval(Outlet::Concentrate(ChannelId::D)), 180.0);
        assert_eq!(r.ctrl.status().supply_wait_time, 210.0);
    }

    #[tokio::test]
    async fn supply_wait_emitted_only_on_drift() {
        let r = rig();
        r.ctrl.set_supply_wait_time(5.0).unwrap();
        r.ctrl.check_ratio_and_time().unwrap();
        r.ctrl.check_ratio_and_time().unwrap();
        assert_eq!(
            r.emitter.values("supplyWaitTime"),
            vec![json!(5.0), json!(210.0)]
        );
    }

    // -- drip feed ----------------------------------------------------------

    #[tokio::test]
    async fn drip_feed_enables_both_pump_timers() {
        let r = rig();
        r.ctrl.set_power(true).unwrap();
        r.ctrl.drip_feed();
        assert!(r.outlets.timer(Outlet::FeedPump));
        assert!(r.outlets.timer(Outlet::SpareFeedPump));
    }

    #[tokio::test]
    async fn drip_feed_stops_while_mixing() {
        let r = rig();
        r.ctrl.set_power(true).unwrap();
        r.ctrl.drip_feed();
        r.outlets.set_power(Outlet::FeedPump, true);
        r.outlets.set_power(Outlet::SpareFeedPump, true);

        r.ctrl.set_flag(true).unwrap();
        r.ctrl.drip_feed();
        assert!(!r.outlets.timer(Outlet::FeedPump));
        assert!(!r.outlets.power(Outlet::FeedPump));
        assert!(!r.outlets.power(Outlet::SpareFeedPump));
    }

    #[tokio::test]
    async fn drip_feed_ignored_in_circular_mode() {
        let r = rig();
        r.ctrl.set_feed_type(FeedType::Circular).unwrap();
        r.outlets.set_power(Outlet::FeedPump, true);
        r.ctrl.drip_feed();
        assert!(r.outlets.power(Outlet::FeedPump));
    }

    // -- circular feed ------------------------------------------------------

    fn circular_rig(wait: f64) -> Rig {
        let r = rig();
        r.ctrl.set_feed_type(FeedType::Circular).unwrap();
        r.ctrl.set_bed_num(2).unwrap();
        let patch: BedPatch = serde_json::from_value(json!({
            "0": {"isFeed": true, "feedTime": 3},
            "1": {"isFeed": false, "feedTime": 5},
            "feedPeriod": 10,
            "feedWaitTime": wait,
        }))
        .unwrap();
        r.ctrl.set_bed_info(&patch).unwrap();
        r
    }

    #[tokio::test(start_paused = true)]
    async fn circular_feed_runs_on_period_tick() {
        let r = circular_rig(20.0);

        for _ in 0..9 {
            r.ctrl.circular_feed().await;
            assert!(!r.outlets.power(Outlet::FeedPump));
        }
        assert!(r.outlets.history(Outlet::FeedPump).is_empty());

        let t0 = Instant::now();
        r.ctrl.circular_feed().await;

        let three = Duration::from_secs(3);
        assert_eq!(
            r.outlets.history(Outlet::FeedPump),
            vec![(t0, true), (t0 + three, false)]
        );
        assert_eq!(
            r.outlets.history(Outlet::BedValve(0)),
            vec![(t0, true), (t0 + three, false)]
        );
        assert!(r.outlets.history(Outlet::BedValve(1)).is_empty());
        assert_eq!(t0.elapsed(), Duration::from_secs(23));
    }

    #[tokio::test(start_paused = true)]
    async fn circular_feed_ticks_dropped_while_resting() {
        let r = circular_rig(17.0);
        for _ in 0..9 {
            r.ctrl.circular_feed().await;
        }
        let c = r.ctrl.clone();
        let pass = tokio::spawn(async move { c.circular_feed().await });
        tokio::time::sleep(Duration::from_secs(5)).await;

        let t = Instant::now();
        r.ctrl.circular_feed().await;
        assert_eq!(t.elapsed(), Duration::ZERO);
        pass.await.unwrap();

        // counter is 10 + 3 + 17; the dropped tick must not have advanced it
        for _ in 0..9 {
            r.ctrl.circular_feed().await;
        }
        assert_eq!(r.outlets.history(Outlet::BedValve(0)).len(), 2);
        r.ctrl.circular_feed().await;
        assert_eq!(r.outlets.history(Outlet::BedValve(0)).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn circular_feed_aborts_when_mixing_starts() {
        let r = circular_rig(20.0);
        let both: BedPatch =
            serde_json::from_value(json!({"1": {"isFeed": true}})).unwrap();
        r.ctrl.set_bed_info(&both).unwrap();
        for _ in 0..9 {
            r.ctrl.circular_feed().await;
        }

        let c = r.ctrl.clone();
        let pass = tokio::spawn(async move { c.circular_feed().await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(r.outlets.power(Outlet::BedValve(0)));

        r.ctrl.set_flag(true).unwrap();
        pass.await.unwrap();

        assert!(r.outlets.history(Outlet::BedValve(1)).is_empty());
        assert!(!r.outlets.power(Outlet::FeedPump));
        assert!(!r.outlets.power(Outlet::BedValve(0)));
        assert!(r
            .emitter
            .journal()
            .iter()
            .any(|l| l.contains("interrupted")));
    }

    #[tokio::test]
    async fn circular_feed_zero_period_never_feeds() {
        let r = circular_rig(20.0);
        let patch: BedPatch = serde_json::from_value(json!({"feedPeriod": 0})).unwrap();
        r.ctrl.set_bed_info(&patch).unwrap();
        for _ in 0..20 {
            r.ctrl.circular_feed().await;
        }
        assert!(r.outlets.history(Outlet::FeedPump).is_empty());
    }

    #[tokio::test]
    async fn circular_feed_disables_drip_timer() {
        let r = circular_rig(20.0);
        r.outlets.set_timer(Outlet::FeedPump, true);
        r.ctrl.circular_feed().await;
        assert!(!r.outlets.timer(Outlet::FeedPump));
    }

    // -- pump mirroring -----------------------------------------------------

    #[test]
    fn spare_pump_mirrors_primary() {
        let r = rig();
        let o = &r.outlets;
        o.set_timer(Outlet::FeedPump, true);
        o.set_timer_interval(Outlet::FeedPump, 900.0);
        o.set_on_off_interval(Outlet::FeedPump, 45.0);
        o.set_power(Outlet::FeedPump, true);
        o.set_last_time_turn_on(Outlet::FeedPump, 1_700_000_000_000);

        r.ctrl.sync_feed_pump();

        assert!(o.timer(Outlet::SpareFeedPump));
        assert_eq!(o.timer_interval(Outlet::SpareFeedPump), 900.0);
        assert_eq!(o.on_off_interval(Outlet::SpareFeedPump), 45.0);
        assert_eq!(o.last_time_turn_on(Outlet::SpareFeedPump), 1_700_000_000_000);
        assert!(o.power(Outlet::SpareFeedPump));

        let writes = o.bank.write_count();
        r.ctrl.sync_feed_pump();
        assert_eq!(o.bank.write_count(), writes);
    }

    // -- nursery ------------------------------------------------------------

    fn seed_on(r: &Rig, flag: bool) {
        r.ctrl
            .set_seed_info(&SeedPatch {
                name: Some("tray".into()),
                in_use: Some(true),
                power: Some(true),
                flag: Some(flag),
            })
            .unwrap();
    }

    fn seed_valves(r: &Rig) -> (bool, bool) {
        (
            r.outlets.power(Outlet::SeedWaterValve),
            r.outlets.power(Outlet::SeedNutrientValve),
        )
    }

    #[test]
    fn nursery_refill_sequence() {
        let r = rig();
        seed_on(&r, true);

        let expected = [(true, false), (true, false), (false, true), (false, false)];
        for (level, want) in (0u8..=3).zip(expected) {
            r.levels.set_level(Tank::Seed, Some(level));
            r.ctrl.seed();
            assert_eq!(seed_valves(&r), want, "level {level}");
        }
        assert!(!r.ctrl.status().seed_info.flag);
    }

    #[test]
    fn nursery_empty_tank_starts_refill() {
        let r = rig();
        seed_on(&r, false);
        r.levels.set_level(Tank::Seed, Some(0));
        r.ctrl.seed();
        assert!(r.ctrl.status().seed_info.flag);
        assert_eq!(seed_valves(&r), (false, false));
    }

    #[test]
    fn nursery_empty_tank_stops_pump_even_when_unused() {
        let r = rig();
        r.outlets.set_power(Outlet::SeedFeedPump, true);
        r.outlets.set_timer(Outlet::SeedFeedPump, true);
        r.outlets.set_power(Outlet::SeedWaterValve, true);
        r.levels.set_level(Tank::Seed, Some(0));

        r.ctrl.seed();

        assert!(!r.outlets.power(Outlet::SeedFeedPump));
        assert!(!r.outlets.timer(Outlet::SeedFeedPump));
        assert_eq!(seed_valves(&r), (false, false));
    }

    #[test]
    fn nursery_idle_enables_feed_pump_timer() {
        let r = rig();
        seed_on(&r, false);
        r.levels.set_level(Tank::Seed, Some(2));
        r.ctrl.seed();
        assert!(r.outlets.timer(Outlet::SeedFeedPump));
    }

    #[test]
    fn nursery_refill_disables_feed_pump() {
        let r = rig();
        seed_on(&r, true);
        r.outlets.set_timer(Outlet::SeedFeedPump, true);
        r.outlets.set_power(Outlet::SeedFeedPump, true);
        r.levels.set_level(Tank::Seed, Some(1));
        r.ctrl.seed();
        assert!(!r.outlets.power(Outlet::SeedFeedPump));
        assert!(!r.outlets.timer(Outlet::SeedFeedPump));
    }

    // -- twin application ---------------------------------------------------

    #[test]
    fn bed_num_resizes_outlets_and_beds() {
        let r = rig();
        r.ctrl.set_bed_num(3).unwrap();
        assert_eq!(r.outlets.bank.len(), 21);
        assert_eq!(r.ctrl.status().bed_info.beds.len(), 3);
    }

    #[test]
    fn apply_desired_applies_all_then_reports_first_error() {
        let r = rig();
        r.emitter.fail.store(true, Ordering::SeqCst);
        let patch: FeedPatch = serde_json::from_value(json!({
            "power": true,
            "supplyNum": 3,
            "feedType": 1,
            "alwaysFull": true,
            "bedNum": 2,
            "bedInfo": {"1": {"isFeed": true, "feedTime": 7}},
        }))
        .unwrap();

        assert!(r.ctrl.apply_desired(&patch).is_err());

        let s = r.ctrl.status();
        assert!(s.power);
        assert_eq!(s.supply_num, 3);
        assert_eq!(s.feed_type, FeedType::Circular);
        assert!(s.always_full);
        assert_eq!(s.bed_num, 2);
        assert!(s.bed_info.beds[1].is_feed);
        assert_eq!(s.bed_info.beds[1].feed_time, 7.0);
    }

    #[test]
    fn desired_flag_is_ignored_reported_flag_applies() {
        let r = rig();
        let patch: FeedPatch = serde_json::from_value(json!({"flag": true})).unwrap();
        r.ctrl.apply_desired(&patch).unwrap();
        assert!(!r.ctrl.flag());
        r.ctrl.apply_reported(&patch).unwrap();
        assert!(r.ctrl.flag());
    }

    #[test]
    fn status_serializes_wire_names() {
        let r = rig();
        r.ctrl.set_bed_num(1).unwrap();
        let v = serde_json::to_value(r.ctrl.status()).unwrap();
        assert_eq!(v["supplyAllow"], true);
        assert_eq!(v["supplyNum"], 1);
        assert_eq!(v["feedType"], 0);
        assert_eq!(v["seedInfo"]["use"], false);
        assert_eq!(v["bedInfo"]["feedPeriod"], 86_400.0);
        assert_eq!(v["bedInfo"]["0"]["isFeed"], false);
        assert_eq!(v["concentrateSettingInfo"]["A"]["baseTime"], 180.0);
    }

    #[test]
    fn status_round_trips_as_desired_patch() {
        let r = rig();
        r.ctrl.set_bed_num(2).unwrap();
        r.ctrl.set_supply_num(4).unwrap();
        let snapshot = serde_json::to_string(&r.ctrl.status()).unwrap();

        let other = rig();
        let patch: FeedPatch = serde_json::from_str(&snapshot).unwrap();
        other.ctrl.apply_desired(&patch).unwrap();
        assert_eq!(other.ctrl.status().supply_num, 4);
        assert_eq!(other.ctrl.status().bed_num, 2);
    }
}
