use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Log output. Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// A level name or a full filter directive; `RUST_LOG` overrides it
    pub level: String,
    pub console: bool,
    /// Rolling log files are written here when set
    pub file_dir: Option<PathBuf>,
    pub file_name_prefix: String,
    /// daily, hourly, minutely or never
    pub rotation: String,
    pub show_source: bool,
    pub show_target: bool,
    pub ansi_colors: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            file_dir: None,
            file_name_prefix: "wedo_hub".to_string(),
            rotation: "daily".to_string(),
            show_source: false,
            show_target: true,
            ansi_colors: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Advertisement filter used when looking for hubs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    #[serde(default = "default_scan_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_connect_scan_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Advertisements at or below this strength are ignored
    #[serde(default = "default_min_rssi")]
    pub min_rssi: i16,
    /// Case-insensitive substrings of the advertised name
    #[serde(default = "default_name_patterns")]
    pub name_patterns: Vec<String>,
    /// LEGO's OUI
    #[serde(default = "default_address_prefixes")]
    pub address_prefixes: Vec<String>,
    #[serde(default = "default_true")]
    pub stop_on_first: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_scan_timeout_ms(),
            connect_timeout_ms: default_connect_scan_timeout_ms(),
            min_rssi: default_min_rssi(),
            name_patterns: default_name_patterns(),
            address_prefixes: default_address_prefixes(),
            stop_on_first: default_true(),
        }
    }
}

impl ScanSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_scan_timeout_ms() -> u64 {
    10_000
}
fn default_connect_scan_timeout_ms() -> u64 {
    10_000
}
fn default_min_rssi() -> i16 {
    -80
}
fn default_name_patterns() -> Vec<String> {
    vec!["WEDO".to_string(), "LEGO".to_string(), "LPF2".to_string()]
}
fn default_address_prefixes() -> Vec<String> {
    vec!["24:71:89:".to_string()]
}

/// Pacing of the active probing pass. The hub firmware needs time to apply
/// a setup frame before it honours the next write or read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Wait for passive port notifications before probing
    #[serde(default = "default_passive_wait_ms")]
    pub passive_wait_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_actuation_ms")]
    pub actuation_ms: u64,
    #[serde(default = "default_sensor_read_ms")]
    pub sensor_read_ms: u64,
    #[serde(default = "default_candidate_gap_ms")]
    pub candidate_gap_ms: u64,
    #[serde(default = "default_port_gap_ms")]
    pub port_gap_ms: u64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            passive_wait_ms: default_passive_wait_ms(),
            settle_ms: default_settle_ms(),
            actuation_ms: default_actuation_ms(),
            sensor_read_ms: default_sensor_read_ms(),
            candidate_gap_ms: default_candidate_gap_ms(),
            port_gap_ms: default_port_gap_ms(),
        }
    }
}

fn default_passive_wait_ms() -> u64 {
    5000
}
fn default_settle_ms() -> u64 {
    500
}
fn default_actuation_ms() -> u64 {
    300
}
fn default_sensor_read_ms() -> u64 {
    300
}
fn default_candidate_gap_ms() -> u64 {
    300
}
fn default_port_gap_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub detector: DetectorSettings,
    pub last_connected_address: Option<String>,
    #[serde(default)]
    pub known_hub_addresses: Vec<String>,
    #[serde(default)]
    pub logging: LogSettings,
}

/// Settings plus the file they were loaded from.
pub struct SettingsService {
    settings: Settings,
    path: PathBuf,
}

impl SettingsService {
    /// Uses `settings.json` in the per-user config directory.
    pub fn new() -> anyhow::Result<Self> {
        let dir = dirs::config_dir()
            .context("no per-user config directory")?
            .join("WeDoHub");
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self::from_path(dir.join("settings.json")))
    }

    /// Loads from `path`, falling back to defaults when the file is missing
    /// or unreadable.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = match Self::load(&path) {
            Ok(settings) => settings,
            Err(e) => {
                debug!("Using default settings: {:#}", e);
                Settings::default()
            }
        };
        Self { settings, path }
    }

    fn load(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.path, json).with_context(|| format!("writing {}", self.path.display()))
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn remember_hub(&mut self, address: &str) -> anyhow::Result<()> {
        self.settings.last_connected_address = Some(address.to_string());
        if !self
            .settings
            .known_hub_addresses
            .iter()
            .any(|a| a.eq_ignore_ascii_case(address))
        {
            self.settings.known_hub_addresses.push(address.to_string());
        }
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "scan": { "min_rssi": -70 }, "last_connected_address": null }"#)
                .unwrap();
        assert_eq!(settings.scan.min_rssi, -70);
        assert_eq!(settings.scan.timeout_ms, 10_000);
        assert_eq!(settings.detector.settle_ms, 500);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("wedo_hub_missing_settings_test.json");
        let _ = fs::remove_file(&path);
        let service = SettingsService::from_path(path);
        assert!(service.get().detector.enabled);
        assert_eq!(service.get().scan.address_prefixes, vec!["24:71:89:"]);
    }

    #[test]
    fn test_remember_hub_round_trips_through_disk() {
        let path = std::env::temp_dir().join(format!(
            "wedo_hub_settings_test_{}.json",
            std::process::id()
        ));
        let mut service = SettingsService::from_path(path.clone());
        service.remember_hub("24:71:89:AA:BB:CC").unwrap();
        service.remember_hub("24:71:89:aa:bb:cc").unwrap();

        let reloaded = SettingsService::from_path(path.clone());
        assert_eq!(reloaded.get().known_hub_addresses.len(), 1);
        assert_eq!(
            reloaded.get().last_connected_address.as_deref(),
            Some("24:71:89:aa:bb:cc")
        );
        let _ = fs::remove_file(path);
    }
}
