//! Discrete water-level sensing: probe stacks per tank, level
//! classification and confirmation debounce.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

use crate::concentrate::ChannelId;

#[cfg(feature = "gpio")]
use anyhow::Result;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LevelState {
    /// No probes or no reading yet.
    #[default]
    None,
    Lack,
    Good,
    Flood,
    /// Inconsistent probe stack (wet probe above a dry one).
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tank {
    Feed,
    Concentrate(ChannelId),
    Seed,
}

impl Tank {
    pub const COUNT: usize = 12;

    pub fn index(self) -> usize {
        match self {
            Self::Feed => 0,
            Self::Concentrate(id) => 1 + id.index(),
            Self::Seed => 11,
        }
    }

    pub fn all() -> impl Iterator<Item = Tank> {
        std::iter::once(Self::Feed)
            .chain(ChannelId::ALL.into_iter().map(Self::Concentrate))
            .chain(std::iter::once(Self::Seed))
    }

    /// (probe count, lack threshold, flood threshold)
    fn geometry(self) -> (u8, u8, u8) {
        match self {
            Self::Feed => (2, 0, 2),
            Self::Concentrate(_) => (1, 0, 1),
            Self::Seed => (3, 0, 3),
        }
    }
}

impl fmt::Display for Tank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Feed => write!(f, "feed"),
            Self::Concentrate(id) => write!(f, "concentrate-{id}"),
            Self::Seed => write!(f, "seed"),
        }
    }
}

/// Water-level facade consumed by the controllers.
pub trait WaterLevels: Send + Sync {
    fn state(&self, tank: Tank) -> LevelState;
    /// Number of wet probes counted from the bottom, `None` when unknown.
    fn level(&self, tank: Tank) -> Option<u8>;
}

/// Anything that can produce raw probe readings once per sampling tick.
pub trait ProbeSource: Send {
    fn read(&mut self) -> Vec<(Tank, Vec<bool>)>;
}

/// Classify a bottom-up probe stack.
pub fn classify(wet: &[bool], lack: u8, flood: u8) -> (LevelState, Option<u8>) {
    if wet.is_empty() {
        return (LevelState::None, None);
    }
    let level = wet.iter().take_while(|w| **w).count();
    if wet[level..].iter().any(|w| *w) {
        return (LevelState::Error, None);
    }
    let level = level as u8;
    let state = if level <= lack {
        LevelState::Lack
    } else if level >= flood {
        LevelState::Flood
    } else {
        LevelState::Good
    };
    (state, Some(level))
}

// ---------------------------------------------------------------------------
// Level bank
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TankReading {
    pub state: LevelState,
    pub level: Option<u8>,
}

#[derive(Debug, Default)]
struct TankSlot {
    accepted: TankReading,
    candidate: Option<TankReading>,
    seen: u32,
}

pub struct LevelBank {
    slots: Mutex<Vec<TankSlot>>,
    confirm: u32,
}

impl LevelBank {
    /// `confirm`: consecutive identical samples needed to accept a change.
    pub fn new(confirm: u32) -> Self {
        let slots = (0..Tank::COUNT).map(|_| TankSlot::default()).collect();
        Self {
            slots: Mutex::new(slots),
            confirm: confirm.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TankSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn observe(&self, tank: Tank, wet: &[bool]) {
        let (probes, lack, flood) = tank.geometry();
        if !wet.is_empty() && wet.len() != probes as usize {
            warn!(%tank, got = wet.len(), expected = probes, "unexpected probe count");
        }
        let (state, level) = classify(wet, lack, flood);
        let reading = TankReading { state, level };

        let mut slots = self.lock();
        let slot = &mut slots[tank.index()];
        if slot.accepted == reading {
            slot.candidate = None;
            slot.seen = 0;
            return;
        }
        if slot.candidate == Some(reading) {
            slot.seen += 1;
        } else {
            slot.candidate = Some(reading);
            slot.seen = 1;
        }
        if slot.seen >= self.confirm {
            info!(%tank, from = ?slot.accepted.state, to = ?state, level = ?level, "water level changed");
            slot.accepted = reading;
            slot.candidate = None;
            slot.seen = 0;
        }
    }

    pub fn sample(&self, source: &mut dyn ProbeSource) {
        for (tank, wet) in source.read() {
            self.observe(tank, &wet);
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, TankReading> {
        let slots = self.lock();
        Tank::all()
            .map(|t| (t.to_string(), slots[t.index()].accepted))
            .collect()
    }
}

impl WaterLevels for LevelBank {
    fn state(&self, tank: Tank) -> LevelState {
        self.lock()[tank.index()].accepted.state
    }

    fn level(&self, tank: Tank) -> Option<u8> {
        self.lock()[tank.index()].accepted.level
    }
}

// ---------------------------------------------------------------------------
// GPIO probe reader (production)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct ProbeReader {
    feed: Vec<InputPin>,
    seed: Vec<InputPin>,
}

#[cfg(feature = "gpio")]
impl ProbeReader {
    /// Pins are listed bottom probe first. A probe reads wet when its pin is low.
    pub fn new(feed_pins: &[u8], seed_pins: &[u8]) -> Result<Self> {
        let gpio = Gpio::new()?;
        let open = |pins: &[u8]| -> Result<Vec<InputPin>> {
            pins.iter()
                .map(|p| Ok(gpio.get(*p)?.into_input_pullup()))
                .collect()
        };
        Ok(Self {
            feed: open(feed_pins)?,
            seed: open(seed_pins)?,
        })
    }
}

#[cfg(feature = "gpio")]
impl ProbeSource for ProbeReader {
    fn read(&mut self) -> Vec<(Tank, Vec<bool>)> {
        vec![
            (Tank::Feed, self.feed.iter().map(|p| p.is_low()).collect()),
            (Tank::Seed, self.seed.iter().map(|p| p.is_low()).collect()),
        ]
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Classification -----------------------------------------------------

    #[test]
    fn empty_stack_is_none() {
        assert_eq!(classify(&[], 0, 2), (LevelState::None, None));
    }

    #[test]
    fn feed_tank_levels() {
        assert_eq!(classify(&[false, false], 0, 2), (LevelState::Lack, Some(0)));
        assert_eq!(classify(&[true, false], 0, 2), (LevelState::Good, Some(1)));
        assert_eq!(classify(&[true, true], 0, 2), (LevelState::Flood, Some(2)));
    }

    #[test]
    fn wet_probe_above_dry_is_error() {
        assert_eq!(classify(&[false, true], 0, 2), (LevelState::Error, None));
        assert_eq!(classify(&[true, false, true], 0, 3), (LevelState::Error, None));
    }

    #[test]
    fn tank_indices_are_dense() {
        let idx: Vec<usize> = Tank::all().map(Tank::index).collect();
        assert_eq!(idx, (0..Tank::COUNT).collect::<Vec<_>>());
    }

    // -- Debounce -----------------------------------------------------------

    #[test]
    fn unread_tank_is_none() {
        let bank = LevelBank::new(1);
        assert_eq!(bank.state(Tank::Feed), LevelState::None);
        assert_eq!(bank.level(Tank::Seed), None);
    }

    #[test]
    fn single_confirm_accepts_immediately() {
        let bank = LevelBank::new(1);
        bank.observe(Tank::Seed, &[true, true, false]);
        assert_eq!(bank.state(Tank::Seed), LevelState::Good);
        assert_eq!(bank.level(Tank::Seed), Some(2));
    }

    #[test]
    fn change_needs_consecutive_confirmations() {
        let bank = LevelBank::new(3);
        bank.observe(Tank::Feed, &[true, true]);
        bank.observe(Tank::Feed, &[true, true]);
        assert_eq!(bank.state(Tank::Feed), LevelState::None);
        bank.observe(Tank::Feed, &[true, true]);
        assert_eq!(bank.state(Tank::Feed), LevelState::Flood);
    }

    #[test]
    fn flicker_resets_candidate() {
        let bank = LevelBank::new(2);
        bank.observe(Tank::Feed, &[false, false]);
        bank.observe(Tank::Feed, &[false, false]);
        assert_eq!(bank.state(Tank::Feed), LevelState::Lack);

        bank.observe(Tank::Feed, &[true, false]);
        bank.observe(Tank::Feed, &[false, false]);
        bank.observe(Tank::Feed, &[true, false]);
        assert_eq!(bank.state(Tank::Feed), LevelState::Lack);
        bank.observe(Tank::Feed, &[true, false]);
        assert_eq!(bank.state(Tank::Feed), LevelState::Good);
    }

    #[test]
    fn sample_routes_each_tank() {
        struct Fixed;
        impl ProbeSource for Fixed {
            fn read(&mut self) -> Vec<(Tank, Vec<bool>)> {
                vec![
                    (Tank::Feed, vec![true, false]),
                    (Tank::Concentrate(ChannelId::B), vec![true]),
                ]
            }
        }

        let bank = LevelBank::new(1);
        bank.sample(&mut Fixed);
        assert_eq!(bank.state(Tank::Feed), LevelState::Good);
        assert_eq!(bank.state(Tank::Concentrate(ChannelId::B)), LevelState::Flood);
        assert_eq!(bank.state(Tank::Seed), LevelState::None);

        let snap = bank.snapshot();
        assert_eq!(snap["feed"].level, Some(1));
    }
}
