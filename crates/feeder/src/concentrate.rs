//! Concentrate registry: the ten reagent dosing lines (A-J), their enable
//! flags, dose ratios and base dose times.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Channel identifiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChannelId {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
    /// Acid line used for pH correction.
    I,
    /// Cleaning solution line.
    J,
}

impl ChannelId {
    pub const ALL: [ChannelId; 10] = [
        Self::A,
        Self::B,
        Self::C,
        Self::D,
        Self::E,
        Self::F,
        Self::G,
        Self::H,
        Self::I,
        Self::J,
    ];

    /// Nutrient lines that take part in tank dosing and EC correction.
    pub const NUTRIENTS: [ChannelId; 8] = [
        Self::A,
        Self::B,
        Self::C,
        Self::D,
        Self::E,
        Self::F,
        Self::G,
        Self::H,
    ];

    pub const ACID: ChannelId = Self::I;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn letter(self) -> char {
        (b'A' + self as u8) as char
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

// ---------------------------------------------------------------------------
// Channel settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcentrateChannel {
    pub name: String,
    #[serde(rename = "power")]
    pub enabled: bool,
    pub ratio: f64,
    /// Base dose time in seconds.
    pub base_time: f64,
}

impl Default for ConcentrateChannel {
    fn default() -> Self {
        Self {
            name: "null".to_string(),
            enabled: false,
            ratio: 1.0,
            base_time: 180.0,
        }
    }
}

impl ConcentrateChannel {
    /// How long the channel's pump stays on per pulse: `ratio × base_time`.
    /// `None` when the product is not a usable number.
    pub fn on_off_interval(&self) -> Option<f64> {
        let v = self.ratio * self.base_time;
        v.is_finite().then_some(v)
    }

    fn apply(&mut self, patch: &ChannelPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(enabled) = patch.power {
            self.enabled = enabled;
        }
        if let Some(ratio) = patch.ratio {
            self.ratio = ratio;
        }
        if let Some(base_time) = patch.base_time {
            self.base_time = base_time;
        }
    }
}

/// Partial update for one channel; omitted fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_time: Option<f64>,
}

/// Wire form of a registry update: `{"A": {...}, "C": {...}}`.
pub type RegistryPatch = BTreeMap<ChannelId, ChannelPatch>;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConcentrateRegistry {
    channels: [ConcentrateChannel; 10],
}

impl ConcentrateRegistry {
    pub fn get(&self, id: ChannelId) -> &ConcentrateChannel {
        &self.channels[id.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelId, &ConcentrateChannel)> {
        ChannelId::ALL.into_iter().zip(self.channels.iter())
    }

    /// Enabled nutrient lines (A-H), in channel order.
    pub fn enabled_nutrients(&self) -> Vec<ChannelId> {
        ChannelId::NUTRIENTS
            .into_iter()
            .filter(|id| self.get(*id).enabled)
            .collect()
    }

    pub fn apply(&mut self, patch: &RegistryPatch) {
        for (id, p) in patch {
            self.channels[id.index()].apply(p);
        }
    }
}

impl Serialize for ConcentrateRegistry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.channels.len()))?;
        for (id, ch) in self.iter() {
            map.serialize_entry(&id, ch)?;
        }
        map.end()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_letters_follow_index() {
        assert_eq!(ChannelId::A.letter(), 'A');
        assert_eq!(ChannelId::J.letter(), 'J');
        assert_eq!(ChannelId::I.index(), 8);
        assert_eq!(ChannelId::ACID, ChannelId::I);
    }

    #[test]
    fn default_channel_is_disabled_three_minute_dose() {
        let ch = ConcentrateChannel::default();
        assert!(!ch.enabled);
        assert_eq!(ch.on_off_interval(), Some(180.0));
    }

    #[test]
    fn non_finite_interval_is_rejected() {
        let ch = ConcentrateChannel {
            ratio: f64::NAN,
            ..ConcentrateChannel::default()
        };
        assert_eq!(ch.on_off_interval(), None);

        let ch = ConcentrateChannel {
            ratio: f64::INFINITY,
            ..ConcentrateChannel::default()
        };
        assert_eq!(ch.on_off_interval(), None);
    }

    #[test]
    fn patch_only_touches_named_fields() {
        let mut reg = ConcentrateRegistry::default();
        let patch: RegistryPatch =
            serde_json::from_str(r#"{"B":{"power":true,"ratio":1.5}}"#).unwrap();
        reg.apply(&patch);

        let b = reg.get(ChannelId::B);
        assert!(b.enabled);
        assert_eq!(b.ratio, 1.5);
        assert_eq!(b.base_time, 180.0);
        assert_eq!(b.name, "null");
        assert_eq!(reg.get(ChannelId::A), &ConcentrateChannel::default());
    }

    #[test]
    fn enabled_nutrients_excludes_acid_and_cleaner() {
        let mut reg = ConcentrateRegistry::default();
        let patch: RegistryPatch = serde_json::from_str(
            r#"{"A":{"power":true},"H":{"power":true},"I":{"power":true},"J":{"power":true}}"#,
        )
        .unwrap();
        reg.apply(&patch);
        assert_eq!(reg.enabled_nutrients(), vec![ChannelId::A, ChannelId::H]);
    }

    #[test]
    fn unknown_channel_key_fails_to_parse() {
        assert!(serde_json::from_str::<RegistryPatch>(r#"{"K":{"power":true}}"#).is_err());
    }

    #[test]
    fn registry_serializes_as_lettered_map() {
        let reg = ConcentrateRegistry::default();
        let json = serde_json::to_value(&reg).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 10);
        assert_eq!(obj["C"]["power"], false);
        assert_eq!(obj["C"]["baseTime"], 180.0);
    }
}
