use crate::storage::{self, KEY_SETTINGS, Store};
use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

pub const MOVEMENT_SPEED_RANGE: RangeInclusive<u8> = 10..=100;
pub const SENSOR_SENSITIVITY_RANGE: RangeInclusive<u8> = 10..=100;
pub const LOW_BATTERY_RANGE: RangeInclusive<u8> = 5..=50;
pub const DEFAULT_EMERGENCY_NUMBER: &str = "+1 (555) 123-4567";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommunicationMode {
    LowPower,
    #[default]
    Standard,
    HighBandwidth,
    Emergency,
}

impl CommunicationMode {
    pub const ALL: [CommunicationMode; 4] = [
        CommunicationMode::LowPower,
        CommunicationMode::Standard,
        CommunicationMode::HighBandwidth,
        CommunicationMode::Emergency,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LowPower => "low-power",
            Self::Standard => "standard",
            Self::HighBandwidth => "high-bandwidth",
            Self::Emergency => "emergency",
        }
    }

    fn step(self, delta: i32) -> Self {
        let len = Self::ALL.len() as i32;
        let idx = Self::ALL.iter().position(|mode| *mode == self).unwrap_or(0) as i32;
        Self::ALL[(idx + delta).rem_euclid(len) as usize]
    }
}

impl fmt::Display for CommunicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommunicationMode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let wanted = raw.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == wanted)
            .ok_or_else(|| {
                anyhow!("unknown communication mode '{raw}' (low-power, standard, high-bandwidth, emergency)")
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorToggles {
    pub object_detection: bool,
    pub thermal_imaging: bool,
    pub lidar: bool,
    pub audio_detection: bool,
}

impl Default for SensorToggles {
    fn default() -> Self {
        Self {
            object_detection: true,
            thermal_imaging: true,
            lidar: true,
            audio_detection: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotSettings {
    /// Percent of top speed.
    pub movement_speed: u8,
    pub sensor_sensitivity: u8,
    pub auto_return: bool,
    /// Battery percent that triggers the low-battery behaviour.
    pub low_battery_threshold: u8,
    pub communication_mode: CommunicationMode,
    pub emergency_contact: String,
    pub auto_recording: bool,
    pub sensors: SensorToggles,
}

impl Default for RobotSettings {
    fn default() -> Self {
        Self {
            movement_speed: 50,
            sensor_sensitivity: 70,
            auto_return: true,
            low_battery_threshold: 20,
            communication_mode: CommunicationMode::Standard,
            emergency_contact: DEFAULT_EMERGENCY_NUMBER.to_owned(),
            auto_recording: true,
            sensors: SensorToggles::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    MovementSpeed,
    SensorSensitivity,
    AutoReturn,
    LowBatteryThreshold,
    CommunicationMode,
    EmergencyContact,
    AutoRecording,
    ObjectDetection,
    ThermalImaging,
    Lidar,
    AudioDetection,
}

impl SettingKey {
    pub const ALL: [SettingKey; 11] = [
        SettingKey::MovementSpeed,
        SettingKey::SensorSensitivity,
        SettingKey::AutoReturn,
        SettingKey::LowBatteryThreshold,
        SettingKey::CommunicationMode,
        SettingKey::EmergencyContact,
        SettingKey::AutoRecording,
        SettingKey::ObjectDetection,
        SettingKey::ThermalImaging,
        SettingKey::Lidar,
        SettingKey::AudioDetection,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MovementSpeed => "movement-speed",
            Self::SensorSensitivity => "sensor-sensitivity",
            Self::AutoReturn => "auto-return",
            Self::LowBatteryThreshold => "low-battery-threshold",
            Self::CommunicationMode => "communication-mode",
            Self::EmergencyContact => "emergency-contact",
            Self::AutoRecording => "auto-recording",
            Self::ObjectDetection => "object-detection",
            Self::ThermalImaging => "thermal-imaging",
            Self::Lidar => "lidar",
            Self::AudioDetection => "audio-detection",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::MovementSpeed => "Movement speed",
            Self::SensorSensitivity => "Sensor sensitivity",
            Self::AutoReturn => "Auto return on low battery",
            Self::LowBatteryThreshold => "Low battery threshold",
            Self::CommunicationMode => "Communication mode",
            Self::EmergencyContact => "Emergency number",
            Self::AutoRecording => "Automatic recording",
            Self::ObjectDetection => "Object detection sensor",
            Self::ThermalImaging => "Thermal imaging sensor",
            Self::Lidar => "LIDAR sensor",
            Self::AudioDetection => "Audio detection sensor",
        }
    }

    /// Text fields are edited as free text; everything else is stepped.
    pub fn is_text(self) -> bool {
        matches!(self, Self::EmergencyContact)
    }
}

impl FromStr for SettingKey {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let wanted = raw.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == wanted)
            .ok_or_else(|| {
                anyhow!(
                    "unknown setting '{raw}' (expected one of: {})",
                    Self::ALL.map(SettingKey::as_str).join(", ")
                )
            })
    }
}

impl RobotSettings {
    /// Missing or unreadable settings load as defaults; out-of-range numbers
    /// are clamped.
    pub fn load(store: &dyn Store) -> Self {
        let mut settings: Self = storage::load_or_default(store, KEY_SETTINGS);
        settings.clamp();
        settings
    }

    pub fn save(&self, store: &dyn Store) -> Result<()> {
        storage::save(store, KEY_SETTINGS, self)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn clamp(&mut self) {
        self.movement_speed = clamp_to(self.movement_speed, &MOVEMENT_SPEED_RANGE);
        self.sensor_sensitivity = clamp_to(self.sensor_sensitivity, &SENSOR_SENSITIVITY_RANGE);
        self.low_battery_threshold = clamp_to(self.low_battery_threshold, &LOW_BATTERY_RANGE);
    }

    pub fn value(&self, key: SettingKey) -> String {
        match key {
            SettingKey::MovementSpeed => format!("{}%", self.movement_speed),
            SettingKey::SensorSensitivity => format!("{}%", self.sensor_sensitivity),
            SettingKey::AutoReturn => on_off(self.auto_return),
            SettingKey::LowBatteryThreshold => format!("{}%", self.low_battery_threshold),
            SettingKey::CommunicationMode => self.communication_mode.to_string(),
            SettingKey::EmergencyContact => self.emergency_contact.clone(),
            SettingKey::AutoRecording => on_off(self.auto_recording),
            SettingKey::ObjectDetection => on_off(self.sensors.object_detection),
            SettingKey::ThermalImaging => on_off(self.sensors.thermal_imaging),
            SettingKey::Lidar => on_off(self.sensors.lidar),
            SettingKey::AudioDetection => on_off(self.sensors.audio_detection),
        }
    }

    /// Sets one field from user text. Numbers outside their range are rejected.
    pub fn apply(&mut self, key: SettingKey, raw: &str) -> Result<()> {
        match key {
            SettingKey::MovementSpeed => {
                self.movement_speed = parse_in_range(key, raw, &MOVEMENT_SPEED_RANGE)?;
            }
            SettingKey::SensorSensitivity => {
                self.sensor_sensitivity = parse_in_range(key, raw, &SENSOR_SENSITIVITY_RANGE)?;
            }
            SettingKey::LowBatteryThreshold => {
                self.low_battery_threshold = parse_in_range(key, raw, &LOW_BATTERY_RANGE)?;
            }
            SettingKey::CommunicationMode => self.communication_mode = raw.parse()?,
            SettingKey::EmergencyContact => {
                let number = raw.trim();
                if number.is_empty() {
                    bail!("emergency number cannot be empty");
                }
                self.emergency_contact = number.to_owned();
            }
            SettingKey::AutoReturn
            | SettingKey::AutoRecording
            | SettingKey::ObjectDetection
            | SettingKey::ThermalImaging
            | SettingKey::Lidar
            | SettingKey::AudioDetection => *self.flag_mut(key) = parse_bool(key, raw)?,
        }
        Ok(())
    }

    /// Nudges a field: numbers by `delta` within range, flags toggle, the
    /// communication mode cycles.
    pub fn adjust(&mut self, key: SettingKey, delta: i32) {
        match key {
            SettingKey::MovementSpeed => {
                self.movement_speed = step(self.movement_speed, delta, &MOVEMENT_SPEED_RANGE);
            }
            SettingKey::SensorSensitivity => {
                self.sensor_sensitivity =
                    step(self.sensor_sensitivity, delta, &SENSOR_SENSITIVITY_RANGE);
            }
            SettingKey::LowBatteryThreshold => {
                self.low_battery_threshold =
                    step(self.low_battery_threshold, delta, &LOW_BATTERY_RANGE);
            }
            SettingKey::CommunicationMode => {
                self.communication_mode = self.communication_mode.step(delta.signum());
            }
            SettingKey::EmergencyContact => {}
            flag => {
                let value = self.flag_mut(flag);
                *value = !*value;
            }
        }
    }

    fn flag_mut(&mut self, key: SettingKey) -> &mut bool {
        match key {
            SettingKey::AutoReturn => &mut self.auto_return,
            SettingKey::ObjectDetection => &mut self.sensors.object_detection,
            SettingKey::ThermalImaging => &mut self.sensors.thermal_imaging,
            SettingKey::Lidar => &mut self.sensors.lidar,
            SettingKey::AudioDetection => &mut self.sensors.audio_detection,
            _ => &mut self.auto_recording,
        }
    }
}

fn on_off(value: bool) -> String {
    let text = if value { "on" } else { "off" };
    text.to_owned()
}

fn clamp_to(value: u8, range: &RangeInclusive<u8>) -> u8 {
    value.clamp(*range.start(), *range.end())
}

fn step(value: u8, delta: i32, range: &RangeInclusive<u8>) -> u8 {
    let next = (i32::from(value) + delta).clamp(i32::from(*range.start()), i32::from(*range.end()));
    u8::try_from(next).unwrap_or(*range.start())
}

fn parse_in_range(key: SettingKey, raw: &str, range: &RangeInclusive<u8>) -> Result<u8> {
    let value = raw
        .trim()
        .trim_end_matches('%')
        .parse::<u8>()
        .with_context(|| format!("{} must be a whole number", key.as_str()))?;
    if !range.contains(&value) {
        bail!(
            "{} must be between {} and {}",
            key.as_str(),
            range.start(),
            range.end()
        );
    }
    Ok(value)
}

fn parse_bool(key: SettingKey, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        other => Err(anyhow!("{} expects on/off, got '{other}'", key.as_str())),
    }
}

#[cfg(test)]
mod tests {
    use super::{CommunicationMode, RobotSettings, SettingKey};
    use crate::storage::{KEY_SETTINGS, MemoryStore, Store};

    #[test]
    fn defaults_match_the_robot_profile() {
        let settings = RobotSettings::default();
        assert_eq!(settings.movement_speed, 50);
        assert_eq!(settings.sensor_sensitivity, 70);
        assert_eq!(settings.low_battery_threshold, 20);
        assert_eq!(settings.communication_mode, CommunicationMode::Standard);
        assert_eq!(settings.emergency_contact, "+1 (555) 123-4567");
        assert!(settings.auto_return && settings.auto_recording);
    }

    #[test]
    fn apply_validates_ranges_and_values() {
        let mut settings = RobotSettings::default();
        settings.apply(SettingKey::MovementSpeed, "85%").unwrap();
        assert_eq!(settings.movement_speed, 85);
        assert!(settings.apply(SettingKey::MovementSpeed, "5").is_err());
        assert!(settings.apply(SettingKey::LowBatteryThreshold, "51").is_err());
        settings
            .apply(SettingKey::CommunicationMode, "HIGH_BANDWIDTH")
            .unwrap();
        assert_eq!(settings.communication_mode, CommunicationMode::HighBandwidth);
        settings.apply(SettingKey::Lidar, "off").unwrap();
        assert!(!settings.sensors.lidar);
        assert!(settings.apply(SettingKey::AutoReturn, "maybe").is_err());
    }

    #[test]
    fn adjust_steps_within_bounds() {
        let mut settings = RobotSettings::default();
        settings.adjust(SettingKey::LowBatteryThreshold, 100);
        assert_eq!(settings.low_battery_threshold, 50);
        settings.adjust(SettingKey::CommunicationMode, -1);
        assert_eq!(settings.communication_mode, CommunicationMode::LowPower);
        settings.adjust(SettingKey::CommunicationMode, -1);
        assert_eq!(settings.communication_mode, CommunicationMode::Emergency);
        settings.adjust(SettingKey::AutoRecording, 1);
        assert!(!settings.auto_recording);
    }

    #[test]
    fn persisted_settings_are_clamped_on_load() {
        let store = MemoryStore::new();
        store
            .write(KEY_SETTINGS, r#"{"movement_speed": 250, "auto_return": false}"#)
            .unwrap();
        let settings = RobotSettings::load(&store);
        assert_eq!(settings.movement_speed, 100);
        assert!(!settings.auto_return);
        assert_eq!(settings.sensor_sensitivity, 70);
    }

    #[test]
    fn save_and_reset_round_trip() {
        let store = MemoryStore::new();
        let mut settings = RobotSettings::default();
        settings.apply(SettingKey::EmergencyContact, "+44 20 7946 0000").unwrap();
        settings.save(&store).unwrap();
        assert_eq!(RobotSettings::load(&store), settings);

        settings.reset();
        assert_eq!(settings, RobotSettings::default());
    }

    #[test]
    fn keys_parse_from_cli_names() {
        assert_eq!(
            "low_battery_threshold".parse::<SettingKey>().unwrap(),
            SettingKey::LowBatteryThreshold
        );
        assert!("warp-drive".parse::<SettingKey>().is_err());
    }
}
