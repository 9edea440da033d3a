//! Startup configuration: TOML file, environment overrides and validation.
//!
//! Everything the remote twin controls (concentrates, beds, targets...) lives
//! in the persisted snapshot instead; this file only wires the process to its
//! hardware and peers.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device_id: String,
    /// Anti-imbalance delay before refilling the feed tank.
    pub make_delay: bool,
    pub mqtt: MqttSection,
    pub web: WebSection,
    pub db: DbSection,
    pub serial: SerialSection,
    pub relays: RelaySection,
    pub levels: LevelSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub keep_alive_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub port: u16,
    /// Include the local log in `GET /`.
    pub expose_logs: bool,
    /// Let `PATCH /time` set the host clock.
    pub set_clock: bool,
    pub tls: Option<TlsSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsSection {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbSection {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialSection {
    pub path: String,
    pub baud: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub active_low: bool,
    pub pins: Vec<RelayPin>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayPin {
    /// Outlet channel index (0 = feed pump, 1 = water valve, ...).
    pub outlet: usize,
    pub gpio: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LevelSection {
    /// Bottom probe first.
    pub feed_pins: Vec<i64>,
    pub seed_pins: Vec<i64>,
    /// Consecutive identical samples before a level change is accepted.
    pub confirm: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: "hydro-feeder".into(),
            make_delay: false,
            mqtt: MqttSection::default(),
            web: WebSection::default(),
            db: DbSection::default(),
            serial: SerialSection::default(),
            relays: RelaySection::default(),
            levels: LevelSection::default(),
        }
    }
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            keep_alive_sec: 30,
        }
    }
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            port: 8080,
            expose_logs: false,
            set_clock: true,
            tls: None,
        }
    }
}

impl Default for DbSection {
    fn default() -> Self {
        Self {
            url: "sqlite:feeder.db?mode=rwc".into(),
        }
    }
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".into(),
            baud: 9600,
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        // Many common relay boards are active-low.
        Self {
            active_low: true,
            pins: Vec::new(),
        }
    }
}

impl Default for LevelSection {
    fn default() -> Self {
        Self {
            feed_pins: Vec::new(),
            seed_pins: Vec::new(),
            confirm: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

const FEED_PROBES: usize = 2;
const SEED_PROBES: usize = 3;

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

fn truthy(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true")
}

impl Config {
    /// Apply `MQTT_HOST`, `MQTT_PORT`, `DB_URL`, `WEB_PORT`, `DEVICE_ID`,
    /// `GET_LOG` and `FEED_MAKER_MAKE_DELAY` from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = lookup("MQTT_PORT") {
            self.mqtt.port = v
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {v}"))?;
        }
        if let Some(v) = lookup("DB_URL") {
            self.db.url = v;
        }
        if let Some(v) = lookup("WEB_PORT") {
            self.web.port = v
                .parse()
                .with_context(|| format!("WEB_PORT is not a port number: {v}"))?;
        }
        if let Some(v) = lookup("DEVICE_ID") {
            self.device_id = v;
        }
        if let Some(v) = lookup("GET_LOG") {
            self.web.expose_logs = truthy(&v);
        }
        if let Some(v) = lookup("FEED_MAKER_MAKE_DELAY") {
            self.make_delay = truthy(&v);
        }
        Ok(())
    }

    /// Relay wiring as (outlet index, BCM pin).
    pub fn relay_map(&self) -> Vec<(usize, u8)> {
        self.relays
            .pins
            .iter()
            .map(|p| (p.outlet, p.gpio as u8))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_identity(&mut errors);
        self.validate_endpoints(&mut errors);
        self.validate_pins(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_identity(&self, errors: &mut Vec<String>) {
        if self.device_id.trim().is_empty() {
            errors.push("device_id is empty".into());
        } else if self.device_id.contains(['/', '+', '#']) {
            errors.push(format!(
                "device_id '{}' must not contain MQTT topic characters (/ + #)",
                self.device_id
            ));
        }
    }

    fn validate_endpoints(&self, errors: &mut Vec<String>) {
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if self.mqtt.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if self.mqtt.keep_alive_sec < 5 {
            errors.push(format!(
                "mqtt.keep_alive_sec must be at least 5, got {}",
                self.mqtt.keep_alive_sec
            ));
        }
        if self.web.port == 0 {
            errors.push("web.port must be non-zero".into());
        }
        if let Some(tls) = &self.web.tls {
            if tls.cert.trim().is_empty() || tls.key.trim().is_empty() {
                errors.push("web.tls needs both cert and key".into());
            }
        }
        if !self.db.url.starts_with("sqlite:") {
            errors.push(format!("db.url '{}' is not a sqlite url", self.db.url));
        }
        if self.serial.path.trim().is_empty() {
            errors.push("serial.path is empty".into());
        }
        if self.serial.baud == 0 {
            errors.push("serial.baud must be positive".into());
        }
        if self.levels.confirm == 0 {
            errors.push("levels.confirm must be at least 1".into());
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let mut seen_pins: HashSet<i64> = HashSet::new();
        let mut seen_outlets: HashSet<usize> = HashSet::new();

        let mut check_pin = |what: String, pin: i64, errors: &mut Vec<String>| {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "{what}: gpio {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!("{what}: gpio {pin} is already in use"));
            }
        };

        for (i, p) in self.relays.pins.iter().enumerate() {
            if !seen_outlets.insert(p.outlet) {
                errors.push(format!("relays.pins[{i}]: outlet {} mapped twice", p.outlet));
            }
            check_pin(format!("relays.pins[{i}]"), p.gpio, errors);
        }
        for (i, pin) in self.levels.feed_pins.iter().enumerate() {
            check_pin(format!("levels.feed_pins[{i}]"), *pin, errors);
        }
        for (i, pin) in self.levels.seed_pins.iter().enumerate() {
            check_pin(format!("levels.seed_pins[{i}]"), *pin, errors);
        }

        let feed = self.levels.feed_pins.len();
        if feed != 0 && feed != FEED_PROBES {
            errors.push(format!(
                "levels.feed_pins: expected {FEED_PROBES} probes, got {feed}"
            ));
        }
        let seed = self.levels.seed_pins.len();
        if seed != 0 && seed != SEED_PROBES {
            errors.push(format!(
                "levels.seed_pins: expected {SEED_PROBES} probes, got {seed}"
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse `path` (a missing file means defaults), apply environment
/// overrides, then validate.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "no config file, using defaults");
        Config::default()
    };
    config
        .apply_env(|k| std::env::var(k).ok())
        .context("invalid environment override")?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
