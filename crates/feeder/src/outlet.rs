//! Relay outlets: the channel map, the `Outlets` facade the controllers
//! drive, and an in-memory outlet bank with per-channel timers.
//!
//! The `gpio` feature gates the real rppal relay driver; without it, a mock
//! driver records relay state and logs changes.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::concentrate::ChannelId;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Outlets that exist regardless of how many beds are configured.
pub const BASIC_OUTLETS: usize = 18;

const ONE_YEAR_SEC: f64 = 86_400.0 * 365.0;

// ---------------------------------------------------------------------------
// Channel map
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outlet {
    FeedPump,
    WaterValve,
    StirPump,
    Concentrate(ChannelId),
    SpareFeedPump,
    SeedFeedPump,
    SeedLed,
    SeedWaterValve,
    SeedNutrientValve,
    BedValve(usize),
}

impl Outlet {
    pub fn index(self) -> usize {
        match self {
            Self::FeedPump => 0,
            Self::WaterValve => 1,
            Self::StirPump => 2,
            Self::Concentrate(id) => 3 + id.index(),
            Self::SpareFeedPump => 13,
            Self::SeedFeedPump => 14,
            Self::SeedLed => 15,
            Self::SeedWaterValve => 16,
            Self::SeedNutrientValve => 17,
            Self::BedValve(i) => BASIC_OUTLETS + i,
        }
    }

    pub fn from_index(index: usize) -> Self {
        match index {
            0 => Self::FeedPump,
            1 => Self::WaterValve,
            2 => Self::StirPump,
            3..=12 => Self::Concentrate(ChannelId::ALL[index - 3]),
            13 => Self::SpareFeedPump,
            14 => Self::SeedFeedPump,
            15 => Self::SeedLed,
            16 => Self::SeedWaterValve,
            17 => Self::SeedNutrientValve,
            i => Self::BedValve(i - BASIC_OUTLETS),
        }
    }
}

impl fmt::Display for Outlet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FeedPump => write!(f, "feed-pump"),
            Self::WaterValve => write!(f, "water-valve"),
            Self::StirPump => write!(f, "stir-pump"),
            Self::Concentrate(id) => write!(f, "concentrate-{id}"),
            Self::SpareFeedPump => write!(f, "spare-feed-pump"),
            Self::SeedFeedPump => write!(f, "seed-feed-pump"),
            Self::SeedLed => write!(f, "seed-led"),
            Self::SeedWaterValve => write!(f, "seed-water-valve"),
            Self::SeedNutrientValve => write!(f, "seed-nutrient-valve"),
            Self::BedValve(i) => write!(f, "bed-valve-{i}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

/// Actuator facade consumed by the controllers. Every setter is an
/// idempotent set-state operation.
pub trait Outlets: Send + Sync {
    fn power(&self, outlet: Outlet) -> bool;
    fn set_power(&self, outlet: Outlet, on: bool);
    fn timer(&self, outlet: Outlet) -> bool;
    fn set_timer(&self, outlet: Outlet, enabled: bool);
    fn on_off_interval(&self, outlet: Outlet) -> f64;
    fn set_on_off_interval(&self, outlet: Outlet, secs: f64);
    fn timer_interval(&self, outlet: Outlet) -> f64;
    fn set_timer_interval(&self, outlet: Outlet, secs: f64);
    fn last_time_turn_on(&self, outlet: Outlet) -> i64;
    fn set_last_time_turn_on(&self, outlet: Outlet, unix_ms: i64);
    /// Re-allocate the bed valve range for `bed_count` beds.
    fn resize(&self, bed_count: usize);
    /// Clock of the last timer pass, in unix ms.
    fn now_ms(&self) -> i64;

    /// Switch on and restart the on-time, even if the outlet is already on.
    fn pulse(&self, outlet: Outlet) {
        self.set_power(outlet, true);
        self.set_last_time_turn_on(outlet, self.now_ms());
    }
}

// ---------------------------------------------------------------------------
// Outlet bank
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutletSlot {
    pub power: bool,
    pub timer: bool,
    /// Seconds between automatic turn-ons while the timer is enabled
    /// (0 disables the periodic turn-on).
    pub timer_interval: f64,
    /// Seconds an outlet stays on before the timer switches it off.
    pub on_off_interval: f64,
    /// Unix milliseconds of the last rising edge.
    pub last_time_turn_on: i64,
}

/// Remote partial update for one outlet.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutletPatch {
    #[serde(default)]
    pub power: Option<bool>,
    #[serde(default)]
    pub timer: Option<bool>,
    #[serde(default)]
    pub timer_interval: Option<f64>,
    #[serde(default)]
    pub on_off_interval: Option<f64>,
}

struct BankInner {
    slots: Vec<OutletSlot>,
    now_ms: i64,
    writes: u64,
    driver: RelayDriver,
}

pub struct OutletBank {
    inner: Mutex<BankInner>,
}

impl OutletBank {
    pub fn new(bed_count: usize, mut driver: RelayDriver) -> Self {
        let mut slots = vec![OutletSlot::default(); BASIC_OUTLETS + bed_count];

        let feed = &mut slots[Outlet::FeedPump.index()];
        feed.timer_interval = 600.0;
        feed.on_off_interval = 30.0;

        let led = &mut slots[Outlet::SeedLed.index()];
        led.timer_interval = ONE_YEAR_SEC;
        led.on_off_interval = ONE_YEAR_SEC;

        driver.all_off();

        Self {
            inner: Mutex::new(BankInner {
                slots,
                now_ms: 0,
                writes: 0,
                driver,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BankInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Number of setter calls made through the facade.
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    pub fn snapshot(&self) -> BTreeMap<usize, OutletSlot> {
        self.lock().slots.iter().cloned().enumerate().collect()
    }

    /// Run the per-outlet timers. Called from the 50 ms actuator tick.
    pub fn service(&self, now_ms: i64) {
        let mut inner = self.lock();
        inner.now_ms = now_ms;

        let mut changes = Vec::new();
        for (index, slot) in inner.slots.iter_mut().enumerate() {
            if !slot.timer {
                continue;
            }
            let since_on = now_ms - slot.last_time_turn_on;
            if slot.power {
                if since_on as f64 >= slot.on_off_interval * 1000.0 {
                    slot.power = false;
                    changes.push((index, false));
                }
            } else if slot.timer_interval > 0.0
                && since_on as f64 >= slot.timer_interval * 1000.0
            {
                slot.power = true;
                slot.last_time_turn_on = now_ms;
                changes.push((index, true));
            }
        }

        for (index, on) in changes {
            inner.driver.set(index, on);
        }
    }

    pub fn apply_patch(&self, patch: &BTreeMap<usize, OutletPatch>) {
        let len = self.len();
        for (&index, p) in patch {
            if index >= len {
                warn!(index, "outlet patch for unknown outlet ignored");
                continue;
            }
            let outlet = Outlet::from_index(index);
            if let Some(v) = p.timer_interval {
                self.set_timer_interval(outlet, v);
            }
            if let Some(v) = p.on_off_interval {
                self.set_on_off_interval(outlet, v);
            }
            if let Some(v) = p.timer {
                self.set_timer(outlet, v);
            }
            if let Some(v) = p.power {
                self.set_power(outlet, v);
            }
        }
    }

    fn read<T>(&self, outlet: Outlet, f: impl FnOnce(&OutletSlot) -> T) -> Option<T> {
        let inner = self.lock();
        let slot = inner.slots.get(outlet.index());
        if slot.is_none() {
            warn!(%outlet, "read from unknown outlet");
        }
        slot.map(f)
    }

    fn write(&self, outlet: Outlet, f: impl FnOnce(&mut OutletSlot, i64)) {
        let mut inner = self.lock();
        let now = inner.now_ms;
        match inner.slots.get_mut(outlet.index()) {
            Some(slot) => f(slot, now),
            None => {
                warn!(%outlet, "write to unknown outlet ignored");
                return;
            }
        }
        inner.writes += 1;
    }
}

impl Outlets for OutletBank {
    fn power(&self, outlet: Outlet) -> bool {
        self.read(outlet, |s| s.power).unwrap_or(false)
    }

    fn set_power(&self, outlet: Outlet, on: bool) {
        let mut changed = false;
        self.write(outlet, |slot, now| {
            if on && !slot.power {
                slot.last_time_turn_on = now;
            }
            changed = slot.power != on;
            slot.power = on;
        });
        if changed {
            self.lock().driver.set(outlet.index(), on);
            debug!(%outlet, on, "outlet power");
        }
    }

    fn timer(&self, outlet: Outlet) -> bool {
        self.read(outlet, |s| s.timer).unwrap_or(false)
    }

    fn set_timer(&self, outlet: Outlet, enabled: bool) {
        self.write(outlet, |slot, _| slot.timer = enabled);
    }

    fn on_off_interval(&self, outlet: Outlet) -> f64 {
        self.read(outlet, |s| s.on_off_interval).unwrap_or(0.0)
    }

    fn set_on_off_interval(&self, outlet: Outlet, secs: f64) {
        self.write(outlet, |slot, _| slot.on_off_interval = secs);
    }

    fn timer_interval(&self, outlet: Outlet) -> f64 {
        self.read(outlet, |s| s.timer_interval).unwrap_or(0.0)
    }

    fn set_timer_interval(&self, outlet: Outlet, secs: f64) {
        self.write(outlet, |slot, _| slot.timer_interval = secs);
    }

    fn last_time_turn_on(&self, outlet: Outlet) -> i64 {
        self.read(outlet, |s| s.last_time_turn_on).unwrap_or(0)
    }

    fn set_last_time_turn_on(&self, outlet: Outlet, unix_ms: i64) {
        self.write(outlet, |slot, _| slot.last_time_turn_on = unix_ms);
    }

    fn now_ms(&self) -> i64 {
        self.lock().now_ms
    }

    fn resize(&self, bed_count: usize) {
        let mut inner = self.lock();
        let len = BASIC_OUTLETS + bed_count;
        for index in len..inner.slots.len() {
            if inner.slots[index].power {
                inner.driver.set(index, false);
            }
        }
        inner.slots.resize(len, OutletSlot::default());
    }
}

// ---------------------------------------------------------------------------
// Relay driver, GPIO build (rppal)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct RelayDriver {
    /// Outlet index to output pin; outlets without a relay are absent.
    pins: HashMap<usize, OutputPin>,
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl RelayDriver {
    pub fn new(outlet_to_gpio: &[(usize, u8)], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for (outlet, pin_num) in outlet_to_gpio {
            let mut pin = gpio.get(*pin_num)?.into_output();

            // relays start released
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            pins.insert(*outlet, pin);
        }

        Ok(Self { pins, active_low })
    }

    pub fn set(&mut self, index: usize, on: bool) {
        if let Some(pin) = self.pins.get_mut(&index) {
            if on != self.active_low {
                pin.set_high()
            } else {
                pin.set_low()
            }
            debug!(outlet = %Outlet::from_index(index), on, "relay set");
        }
    }

    pub fn all_off(&mut self) {
        let keys: Vec<usize> = self.pins.keys().copied().collect();
        for k in keys {
            self.set(k, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Relay driver, mock build
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct RelayDriver {
    pub(crate) relays: HashMap<usize, bool>,
}

#[cfg(not(feature = "gpio"))]
impl RelayDriver {
    pub fn new(outlet_to_gpio: &[(usize, u8)], _active_low: bool) -> Result<Self> {
        let mut relays = HashMap::new();
        for (outlet, pin_num) in outlet_to_gpio {
            debug!(outlet, gpio = pin_num, "mock relay registered");
            relays.insert(*outlet, false);
        }
        Ok(Self { relays })
    }

    pub fn set(&mut self, index: usize, on: bool) {
        if let Some(state) = self.relays.get_mut(&index) {
            *state = on;
            debug!(
                outlet = %Outlet::from_index(index),
                on,
                "mock relay set"
            );
        }
    }

    pub fn all_off(&mut self) {
        let keys: Vec<usize> = self.relays.keys().copied().collect();
        for k in keys {
            self.set(k, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Test double: records every power write with its (tokio) timestamp
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
