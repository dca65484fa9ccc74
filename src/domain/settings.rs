use crate::domain::models::TrackerIdentity;
use crate::domain::tracker::TrackerSettings;
use crate::infrastructure::protocol::gatt::DEVICE_NAME_PREFIX;
use crate::infrastructure::protocol::BAUD_RATE;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "fbt_interpreter".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// A Bluetooth serial port, optionally pinned to one tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SppPort {
    pub path: String,
    #[serde(default)]
    pub identity: Option<TrackerIdentity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,

    // Transports
    #[serde(default)]
    pub serial_ports: Vec<String>,
    #[serde(default)]
    pub spp_ports: Vec<SppPort>,
    /// BLE address to the tracker worn there
    #[serde(default)]
    pub ble_trackers: BTreeMap<String, TrackerIdentity>,
    #[serde(default = "default_ble_name_prefix")]
    pub ble_name_prefix: String,
    #[serde(default = "default_ble_scan_duration_ms")]
    pub ble_scan_duration_ms: u64,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    // Timing
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_handshake_delay_ms")]
    pub handshake_delay_ms: u64,
    #[serde(default = "default_pairing_step_delay_ms")]
    pub pairing_step_delay_ms: u64,
    #[serde(default = "default_pairing_timeout_ms")]
    pub pairing_timeout_ms: u64,

    // Trackers
    #[serde(default = "default_required_trackers")]
    pub required_trackers: Vec<TrackerIdentity>,
    #[serde(default)]
    pub default_tracker_settings: TrackerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            serial_ports: Vec::new(),
            spp_ports: Vec::new(),
            ble_trackers: BTreeMap::new(),
            ble_name_prefix: default_ble_name_prefix(),
            ble_scan_duration_ms: default_ble_scan_duration_ms(),
            baud_rate: default_baud_rate(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            handshake_delay_ms: default_handshake_delay_ms(),
            pairing_step_delay_ms: default_pairing_step_delay_ms(),
            pairing_timeout_ms: default_pairing_timeout_ms(),
            required_trackers: default_required_trackers(),
            default_tracker_settings: TrackerSettings::default(),
        }
    }
}

impl Settings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn handshake_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_delay_ms)
    }

    pub fn pairing_step_delay(&self) -> Duration {
        Duration::from_millis(self.pairing_step_delay_ms)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_timeout_ms)
    }

    pub fn ble_scan_duration(&self) -> Duration {
        Duration::from_millis(self.ble_scan_duration_ms)
    }
}

fn default_ble_name_prefix() -> String {
    DEVICE_NAME_PREFIX.to_string()
}
fn default_ble_scan_duration_ms() -> u64 {
    5000
}
fn default_baud_rate() -> u32 {
    BAUD_RATE
}
fn default_heartbeat_interval_ms() -> u64 {
    5000
}
fn default_reconnect_backoff_ms() -> u64 {
    5000
}
fn default_handshake_delay_ms() -> u64 {
    500
}
fn default_pairing_step_delay_ms() -> u64 {
    1000
}
fn default_pairing_timeout_ms() -> u64 {
    60_000
}
fn default_required_trackers() -> Vec<TrackerIdentity> {
    TrackerIdentity::LOWER_BODY.to_vec()
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Settings from the per-user config directory, defaults if absent.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Self::with_path(settings_path)
    }

    /// Settings backed by an explicit file, defaults if it does not exist.
    pub fn with_path(settings_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let settings_path = settings_path.into();
        let settings = if settings_path.exists() {
            Self::load(&settings_path)?
        } else {
            Settings::default()
        };

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("FbtInterpreter");
        path.push("settings.json");
        Ok(path)
    }

    pub fn load(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let settings = serde_json::from_str(&contents)
            .with_context(|| format!("parsing settings in {}", path.display()))?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tracker::Fps;

    #[test]
    fn test_missing_fields_take_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"serial_ports": ["COM3"], "heartbeat_interval_ms": 1000}"#)
                .unwrap();
        assert_eq!(settings.serial_ports, vec!["COM3"]);
        assert_eq!(settings.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(settings.baud_rate, 500_000);
        assert_eq!(settings.reconnect_backoff_ms, 5000);
        assert_eq!(settings.required_trackers.len(), 6);
        assert_eq!(settings.ble_name_prefix, "HaritoraX");
    }

    #[test]
    fn test_identities_use_camel_case_names() {
        let settings: Settings = serde_json::from_str(
            r#"{"ble_trackers": {"AA:BB": "leftAnkle"}, "spp_ports": [{"path": "COM7", "identity": "hip"}]}"#,
        )
        .unwrap();
        assert_eq!(
            settings.ble_trackers.get("AA:BB"),
            Some(&TrackerIdentity::LeftAnkle)
        );
        assert_eq!(settings.spp_ports[0].identity, Some(TrackerIdentity::Hip));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut service = SettingsService::with_path(&path).unwrap();
        assert_eq!(service.get(), &Settings::default());
        service.get_mut().serial_ports.push("/dev/ttyACM0".into());
        service.get_mut().default_tracker_settings.fps = Fps::Fps100;
        service.save().unwrap();

        let reloaded = SettingsService::with_path(&path).unwrap();
        assert_eq!(reloaded.get().serial_ports, vec!["/dev/ttyACM0"]);
        assert_eq!(reloaded.get().default_tracker_settings.fps, Fps::Fps100);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(SettingsService::with_path(&path).is_err());
    }
}
