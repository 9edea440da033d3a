//! Closed-loop tank and probe simulator for running without hardware.
//!
//! - Feed and nursery tank volumes follow the valves and pumps
//! - Concentrate tanks are always stocked
//! - EC rises while nutrient pumps run, pH falls while the acid pump runs,
//!   fresh water dilutes both back toward tap water
//! - Sensor reads carry electronic noise and are occasionally dropped

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::bus::{BusError, RegisterBus, EC_UNIT, PH_UNIT};
use crate::concentrate::ChannelId;
use crate::level::{ProbeSource, Tank};
use crate::outlet::{Outlet, Outlets};

// ---------------------------------------------------------------------------
// Noise
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Tanks
// ---------------------------------------------------------------------------

const FEED_CAPACITY_L: f64 = 200.0;
const SEED_CAPACITY_L: f64 = 40.0;

/// Probe heights as a fraction of capacity, bottom first.
const FEED_PROBES: [f64; 2] = [0.2, 0.9];
const SEED_PROBES: [f64; 3] = [0.15, 0.5, 0.9];

const WATER_VALVE_LPS: f64 = 1.5;
const FEED_PUMP_LPS: f64 = 0.4;
const SEED_VALVE_LPS: f64 = 0.3;
const SEED_PUMP_LPS: f64 = 0.1;

pub struct TankSim {
    outlets: Arc<dyn Outlets>,
    feed_l: f64,
    seed_l: f64,
    last: Option<Instant>,
}

impl TankSim {
    pub fn new(outlets: Arc<dyn Outlets>) -> Self {
        Self {
            outlets,
            feed_l: FEED_CAPACITY_L * 0.5,
            seed_l: SEED_CAPACITY_L * 0.6,
            last: None,
        }
    }

    /// Move volumes forward by `secs` of wall time.
    pub fn advance(&mut self, secs: f64) {
        let on = |o: Outlet| if self.outlets.power(o) { 1.0 } else { 0.0 };

        let feed_in = on(Outlet::WaterValve) * WATER_VALVE_LPS;
        let feed_out = (on(Outlet::FeedPump) + on(Outlet::SpareFeedPump)) * FEED_PUMP_LPS
            + (on(Outlet::SeedNutrientValve)) * SEED_VALVE_LPS;
        let seed_in = (on(Outlet::SeedWaterValve) + on(Outlet::SeedNutrientValve)) * SEED_VALVE_LPS;
        let seed_out = on(Outlet::SeedFeedPump) * SEED_PUMP_LPS;

        self.feed_l = (self.feed_l + (feed_in - feed_out) * secs).clamp(0.0, FEED_CAPACITY_L);
        self.seed_l = (self.seed_l + (seed_in - seed_out) * secs).clamp(0.0, SEED_CAPACITY_L);
    }

    fn probes(volume: f64, capacity: f64, heights: &[f64]) -> Vec<bool> {
        heights.iter().map(|h| volume >= h * capacity).collect()
    }
}

impl ProbeSource for TankSim {
    fn read(&mut self) -> Vec<(Tank, Vec<bool>)> {
        let now = Instant::now();
        if let Some(last) = self.last.replace(now) {
            self.advance(now.duration_since(last).as_secs_f64());
        }

        let mut out = vec![
            (Tank::Feed, Self::probes(self.feed_l, FEED_CAPACITY_L, &FEED_PROBES)),
            (Tank::Seed, Self::probes(self.seed_l, SEED_CAPACITY_L, &SEED_PROBES)),
        ];
        out.extend(ChannelId::ALL.map(|id| (Tank::Concentrate(id), vec![true])));
        out
    }
}

// ---------------------------------------------------------------------------
// EC / pH probes
// ---------------------------------------------------------------------------

const TAP_EC: f64 = 250.0;
const TAP_PH: f64 = 7.2;
/// uS/cm added per second per running nutrient pump.
const EC_PER_PUMP_SEC: f64 = 4.0;
const PH_PER_ACID_SEC: f64 = 0.05;
/// Fraction of the distance to tap water covered per second of fresh inflow.
const DILUTION_PER_SEC: f64 = 0.004;

#[derive(Debug, Clone, Copy)]
struct Chemistry {
    ec: f64,
    ph: f64,
    temperature: f64,
}

pub struct SimBus {
    outlets: Arc<dyn Outlets>,
    chem: Mutex<(Chemistry, Instant)>,
    drop_prob: f64,
}

impl SimBus {
    pub fn new(outlets: Arc<dyn Outlets>, drop_prob: f64) -> Self {
        Self {
            outlets,
            chem: Mutex::new((
                Chemistry {
                    ec: TAP_EC,
                    ph: TAP_PH,
                    temperature: 21.0,
                },
                Instant::now(),
            )),
            drop_prob,
        }
    }

    fn step(&self, chem: &mut Chemistry, secs: f64) {
        let pumps = ChannelId::NUTRIENTS
            .iter()
            .filter(|id| self.outlets.power(Outlet::Concentrate(**id)))
            .count() as f64;
        chem.ec += pumps * EC_PER_PUMP_SEC * secs;

        if self.outlets.power(Outlet::Concentrate(ChannelId::ACID)) {
            chem.ph -= PH_PER_ACID_SEC * secs;
        }
        if self.outlets.power(Outlet::WaterValve) {
            let k = (DILUTION_PER_SEC * secs).min(1.0);
            chem.ec += (TAP_EC - chem.ec) * k;
            chem.ph += (TAP_PH - chem.ph) * k;
        }
        chem.ph = chem.ph.clamp(3.0, 9.0);
        chem.temperature = (chem.temperature + gaussian(0.0, 0.01 * secs.sqrt())).clamp(10.0, 35.0);
    }

    #[cfg(test)]
    fn advance(&self, secs: f64) -> Chemistry {
        let mut guard = self.chem.lock().unwrap_or_else(PoisonError::into_inner);
        let (chem, _) = &mut *guard;
        self.step(chem, secs);
        *chem
    }

    fn observe(&self) -> Chemistry {
        let mut guard = self.chem.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let secs = now.duration_since(guard.1).as_secs_f64();
        guard.1 = now;
        let (chem, _) = &mut *guard;
        self.step(chem, secs);
        *chem
    }
}

#[async_trait]
impl RegisterBus for SimBus {
    async fn read_input_registers(
        &self,
        unit: u8,
        _start: u16,
        _count: u16,
    ) -> Result<Vec<u16>, BusError> {
        if fastrand::f64() < self.drop_prob {
            return Err(BusError::Frame("simulated dropped read"));
        }
        let chem = self.observe();
        let temp = (gaussian(chem.temperature, 0.05) * 100.0)
            .round()
            .clamp(i16::MIN as f64, i16::MAX as f64) as i16 as u16;
        match unit {
            EC_UNIT => {
                let ec = gaussian(chem.ec, chem.ec * 0.01).round().clamp(1.0, 65535.0) as u16;
                Ok(vec![temp, 0, ec])
            }
            PH_UNIT => {
                let ph = (gaussian(chem.ph, 0.02) * 100.0).round().clamp(1.0, 1400.0) as u16;
                Ok(vec![temp, ph])
            }
            _ => Err(BusError::Exception(0x0B)),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
