//! Measurement & Calibration Controller: EC/pH sampling over the register
//! bus, sensor connectivity, and threshold corrections through the
//! concentrate and acid pumps.
//!
//! This controller is the only writer of the supply permission the Feed
//! Controller consults before dosing.

use anyhow::Result;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::bus::{self, RegisterBus, EC_REGISTERS, EC_UNIT, PH_REGISTERS, PH_UNIT};
use crate::concentrate::ChannelId;
use crate::feed::{keep_first, FeedController};
use crate::gate::{BusyGuard, SharedFlag};
use crate::level::{LevelState, Tank};
use crate::outlet::Outlet;
use crate::twin::{Emitter, MeasurePatch, Outbound, Source};

/// Read attempts per sampling pass.
pub const SAMPLE_ATTEMPTS: usize = 5;

/// At or below this pH the tank is too acidic to dose into.
pub const ACID_FLOOR: f64 = 5.5;

const EC_CORRECTION_GAP: f64 = 200.0;
const PH_CORRECTION_GAP: f64 = 0.3;

#[derive(Debug, Clone)]
struct MeasureState {
    power: bool,
    ec: Option<f64>,
    ph: Option<f64>,
    target_ec: Option<f64>,
    target_ph: Option<f64>,
    watering_time: i64,
    measurement_time: i64,
    /// `<= 0` disables calibration.
    calibration_time: i64,
    ec_temperature: Option<f64>,
    ph_temperature: Option<f64>,
    water_temperature: Option<f64>,
    ec_status: bool,
    ph_status: bool,
}

impl Default for MeasureState {
    fn default() -> Self {
        Self {
            power: true,
            ec: None,
            ph: None,
            target_ec: None,
            target_ph: None,
            watering_time: 3600,
            measurement_time: 600,
            calibration_time: -1,
            ec_temperature: None,
            ph_temperature: None,
            water_temperature: None,
            ec_status: false,
            ph_status: false,
        }
    }
}

#[derive(Debug)]
struct Counters {
    first: bool,
    measure: i64,
    calibration: i64,
    ec_calibrated: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurerStatus {
    pub power: bool,
    pub ec: Option<f64>,
    pub ph: Option<f64>,
    #[serde(rename = "targetEC")]
    pub target_ec: Option<f64>,
    #[serde(rename = "targetPH")]
    pub target_ph: Option<f64>,
    pub watering_time: i64,
    pub measurement_time: i64,
    pub calibration_time: i64,
    pub water_temperature: Option<f64>,
    pub ec_status: bool,
    pub ph_status: bool,
}

/// Non-zero value or nothing.
fn present(v: Option<f64>) -> Option<f64> {
    v.filter(|x| *x != 0.0)
}

pub struct Measurer {
    state: Mutex<MeasureState>,
    counters: Mutex<Counters>,
    supply: SharedFlag,
    feed: Arc<FeedController>,
    bus: Arc<dyn RegisterBus>,
    emitter: Arc<dyn Emitter>,
    guard: BusyGuard,
}

impl Measurer {
    pub fn new(
        feed: Arc<FeedController>,
        bus: Arc<dyn RegisterBus>,
        emitter: Arc<dyn Emitter>,
        supply: SharedFlag,
    ) -> Self {
        Self {
            state: Mutex::new(MeasureState::default()),
            counters: Mutex::new(Counters {
                first: true,
                measure: 0,
                calibration: 0,
                ec_calibrated: false,
            }),
            supply,
            feed,
            bus,
            emitter,
            guard: BusyGuard::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, MeasureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, name: &'static str, value: impl Serialize) -> Result<()> {
        self.emitter.send(Outbound::value(Source::Measurer, name, value))
    }

    fn emit_or_warn(&self, name: &'static str, value: impl Serialize) {
        if let Err(e) = self.emit(name, value) {
            warn!(error = %e, name, "measurer event dropped");
        }
    }

    fn journal(&self, line: impl Into<String>) {
        let line = line.into();
        info!(target: "measure", "{line}");
        if let Err(e) = self.emitter.send(Outbound::Journal(line)) {
            warn!(error = %e, "journal entry dropped");
        }
    }

    pub fn status(&self) -> MeasurerStatus {
        let s = self.state().clone();
        MeasurerStatus {
            power: s.power,
            ec: s.ec,
            ph: s.ph,
            target_ec: s.target_ec,
            target_ph: s.target_ph,
            watering_time: s.watering_time,
            measurement_time: s.measurement_time,
            calibration_time: s.calibration_time,
            water_temperature: s.water_temperature,
            ec_status: s.ec_status,
            ph_status: s.ph_status,
        }
    }

    pub fn power(&self) -> bool {
        self.state().power
    }

    // -- setters ------------------------------------------------------------

    pub fn set_power(&self, power: bool) -> Result<()> {
        self.state().power = power;
        info!(power, "measurement power");
        self.emit("power", power)
    }

    pub fn set_target_ec(&self, v: f64) -> Result<()> {
        self.state().target_ec = Some(v);
        self.emit("targetEC", v)
    }

    pub fn set_target_ph(&self, v: f64) -> Result<()> {
        self.state().target_ph = Some(v);
        self.emit("targetPH", v)
    }

    pub fn set_watering_time(&self, v: i64) -> Result<()> {
        self.state().watering_time = v;
        self.emit("wateringTime", v)
    }

    pub fn set_measurement_time(&self, v: i64) -> Result<()> {
        self.state().measurement_time = v;
        self.emit("measurementTime", v)
    }

    pub fn set_calibration_time(&self, v: i64) -> Result<()> {
        self.state().calibration_time = v;
        self.emit("calibrationTime", v)
    }

    /// Grant or withdraw permission for the Feed Controller to dose.
    pub fn set_supply_allow(&self, allow: bool) {
        if self.supply.set(allow) {
            info!(allow, "supply permission changed");
        }
    }

    /// Desired and reported documents carry the same fields. Stored EC/pH
    /// values are restored silently.
    pub fn apply_desired(&self, p: &MeasurePatch) -> Result<()> {
        let mut err = None;
        if let Some(v) = p.power {
            keep_first(&mut err, self.set_power(v));
        }
        if let Some(v) = p.target_ec {
            keep_first(&mut err, self.set_target_ec(v));
        }
        if let Some(v) = p.target_ph {
            keep_first(&mut err, self.set_target_ph(v));
        }
        if let Some(v) = p.ec {
            self.state().ec = Some(v);
        }
        if let Some(v) = p.ph {
            self.state().ph = Some(v);
        }
        if let Some(v) = p.watering_time {
            keep_first(&mut err, self.set_watering_time(v));
        }
        if let Some(v) = p.measurement_time {
            keep_first(&mut err, self.set_measurement_time(v));
        }
        if let Some(v) = p.calibration_time {
            keep_first(&mut err, self.set_calibration_time(v));
        }
        err.map_or(Ok(()), Err)
    }

    pub fn apply_reported(&self, p: &MeasurePatch) -> Result<()> {
        self.apply_desired(p)
    }

    // -- sampling -----------------------------------------------------------

    async fn sample(&self, unit: u8, count: u16, value_reg: usize) -> Vec<(f64, f64)> {
        let mut readings = Vec::with_capacity(SAMPLE_ATTEMPTS);
        for attempt in 0..SAMPLE_ATTEMPTS {
            match bus::poll(&*self.bus, unit, 0, count).await {
                Ok(regs) if regs.len() > value_reg && regs[value_reg] != 0 => {
                    // temperature is signed hundredths of a degree
                    readings.push((regs[0] as i16 as f64 / 100.0, regs[value_reg] as f64));
                }
                Ok(_) => debug!(unit, attempt, "empty reading discarded"),
                Err(e) => debug!(unit, attempt, error = %e, "read failed"),
            }
        }
        readings
    }

    fn set_ec_status(&self, connected: bool) {
        let changed = {
            let mut s = self.state();
            std::mem::replace(&mut s.ec_status, connected) != connected
        };
        if changed {
            info!(connected, "EC sensor");
            self.emit_or_warn("ecStatus", connected);
        }
    }

    fn set_ph_status(&self, connected: bool) {
        let changed = {
            let mut s = self.state();
            std::mem::replace(&mut s.ph_status, connected) != connected
        };
        if changed {
            info!(connected, "pH sensor");
            self.emit_or_warn("phStatus", connected);
        }
    }

    /// Sample EC. Dosing is withheld while sampling and re-allowed only when
    /// the tank is at or below two thirds of the target.
    pub async fn measure_ec(&self) {
        self.set_supply_allow(false);

        let readings = self.sample(EC_UNIT, EC_REGISTERS, 2).await;
        self.set_ec_status(!readings.is_empty());

        let ec = readings.iter().map(|r| r.1).reduce(f64::max);
        let temperature = readings.iter().map(|r| r.0).reduce(f64::min);
        let target = {
            let mut s = self.state();
            if ec.is_some() {
                s.ec = ec;
            }
            s.ec_temperature = temperature;
            s.target_ec.unwrap_or(0.0)
        };
        if let Some(ec) = ec {
            debug!(ec, samples = readings.len(), "EC measured");
            self.emit_or_warn("ec", ec);
        }

        // an empty batch compares as below any target
        if ec.map_or(true, |v| v <= target * 2.0 / 3.0) {
            self.set_supply_allow(true);
        }
    }

    /// Sample pH. A reading at or below [`ACID_FLOOR`] withdraws supply.
    pub async fn measure_ph(&self) {
        let readings = self.sample(PH_UNIT, PH_REGISTERS, 1).await;
        self.set_ph_status(!readings.is_empty());

        let ph = readings.iter().map(|r| r.1 / 100.0).reduce(f64::min);
        let temperature = readings.iter().map(|r| r.0).reduce(f64::min);
        {
            let mut s = self.state();
            if ph.is_some() {
                s.ph = ph;
            }
            s.ph_temperature = temperature;
        }
        if let Some(ph) = ph {
            debug!(ph, samples = readings.len(), "pH measured");
            self.emit_or_warn("ph", ph);
            if ph <= ACID_FLOOR {
                self.set_supply_allow(false);
            }
        }
    }

    fn update_water_temperature(&self) -> Option<f64> {
        let (next, changed) = {
            let mut s = self.state();
            let next = match (s.ec_temperature, s.ph_temperature) {
                (Some(e), Some(p)) => Some((e + p) / 2.0),
                (Some(t), None) | (None, Some(t)) => Some(t),
                (None, None) => None,
            };
            let changed = next.is_some() && s.water_temperature != next;
            s.water_temperature = next;
            (next, changed)
        };
        if let (true, Some(t)) = (changed, next) {
            self.emit_or_warn("waterTemperature", t);
        }
        next
    }

    fn send_ec_ph(&self) {
        let s = self.status();
        if !s.ec_status && !s.ph_status {
            return;
        }
        let msg = Outbound::EcPh {
            time: OffsetDateTime::now_utc(),
            ec: s.ec,
            ph: s.ph,
            water_temperature: s.water_temperature,
        };
        if let Err(e) = self.emitter.send(msg) {
            warn!(error = %e, "ecPh telemetry dropped");
        }
    }

    /// Full measurement pass; only while the probes are submerged.
    pub async fn measure(&self) {
        let level = self.feed.levels().state(Tank::Feed);
        if !matches!(level, LevelState::Flood | LevelState::Good) {
            debug!(?level, "measurement skipped");
            return;
        }
        self.measure_ec().await;
        self.measure_ph().await;
        self.update_water_temperature();
        self.send_ec_ph();
    }

    // -- calibration --------------------------------------------------------

    fn calibrate_ec(&self) {
        let (target, ec) = {
            let s = self.state();
            (present(s.target_ec), present(s.ec))
        };
        let (Some(target), Some(ec)) = (target, ec) else {
            debug!("no EC data, correction skipped");
            return;
        };

        if target - ec >= EC_CORRECTION_GAP {
            self.counters().ec_calibrated = true;
            let nutrients = self.feed.concentrates().enabled_nutrients();
            for id in &nutrients {
                self.feed.outlets().pulse(Outlet::Concentrate(*id));
            }
            self.journal(format!(
                "EC correction: {ec} -> {target}, {} channels pulsed",
                nutrients.len()
            ));
        }
    }

    fn calibrate_ph(&self) {
        let (target, ph) = {
            let s = self.state();
            (present(s.target_ph), present(s.ph))
        };
        let (Some(target), Some(ph)) = (target, ph) else {
            debug!("no pH data, correction skipped");
            return;
        };

        {
            let mut c = self.counters();
            if c.ec_calibrated {
                c.ec_calibrated = false;
                debug!("EC corrected this pass, pH correction deferred");
                return;
            }
        }

        if ph - target >= PH_CORRECTION_GAP {
            // gated on channel A, not on the acid line itself
            if self.feed.concentrates().get(ChannelId::A).enabled {
                self.feed
                    .outlets()
                    .pulse(Outlet::Concentrate(ChannelId::ACID));
                self.journal(format!("pH correction: {ph} -> {target}, acid pulsed"));
            }
        }
    }

    /// One correction pass. Never runs while the Feed Controller is mixing,
    /// and never corrects both EC and pH in the same pass.
    pub fn calibration(&self) {
        if self.feed.flag() {
            debug!("tank mixing, calibration skipped");
            return;
        }
        self.counters().ec_calibrated = false;

        let ph = self.state().ph.unwrap_or(0.0);
        if ph > ACID_FLOOR {
            self.calibrate_ec();
        }
        self.calibrate_ph();
    }

    // -- master loop --------------------------------------------------------

    /// One tick of the measurement loop.
    pub async fn run(&self) {
        if !self.power() {
            return;
        }
        let Some(_busy) = self.guard.try_enter() else {
            return;
        };

        let first = std::mem::replace(&mut self.counters().first, false);
        if first {
            self.measure().await;
        }

        let (watering, measurement, calibration) = {
            let s = self.state();
            (s.watering_time, s.measurement_time, s.calibration_time)
        };
        let (measure_count, calibration_count) = {
            let c = self.counters();
            (c.measure, c.calibration)
        };
        let levels = self.feed.levels();
        let outlets = self.feed.outlets();

        if self.feed.always_full()
            && measure_count > watering
            && levels.state(Tank::Feed) != LevelState::Flood
            && !outlets.power(Outlet::WaterValve)
        {
            info!(waited = measure_count, "topping up feed tank for measurement");
            outlets.set_power(Outlet::WaterValve, true);
        }

        if measurement > 0
            && measure_count > measurement
            && levels.state(Tank::Feed) == LevelState::Flood
        {
            self.measure().await;
            self.counters().measure = 0;
        }

        if calibration > 0 && calibration_count > calibration {
            self.calibration();
            self.counters().calibration = 0;
        }

        let mut c = self.counters();
        c.measure += 1;
        c.calibration += 1;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
