use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            console_logging_enabled: default_true(),
            file_logging_enabled: default_false(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
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
    "quadlink".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Signal-strength poll period while connected
    #[serde(default = "default_rssi_interval_ms")]
    pub rssi_interval_ms: u64,

    // Advanced BLE Settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_write_char_uuid")]
    pub ble_write_char_uuid: String,
    #[serde(default = "default_notify_char_uuid")]
    pub ble_notify_char_uuid: String,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rssi_interval_ms: default_rssi_interval_ms(),
            ble_service_uuid: default_service_uuid(),
            ble_write_char_uuid: default_write_char_uuid(),
            ble_notify_char_uuid: default_notify_char_uuid(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_rssi_interval_ms() -> u64 {
    1000
}
fn default_service_uuid() -> String {
    "6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_write_char_uuid() -> String {
    "6e400002-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_notify_char_uuid() -> String {
    "6e400003-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("QuadLink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
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

    #[test]
    fn empty_document_fills_in_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.rssi_interval_ms, 1000);
        assert_eq!(settings.ble_service_uuid, default_service_uuid());
        assert!(settings.log_settings.console_logging_enabled);
    }

    #[test]
    fn settings_round_trip() {
        let mut settings = Settings::default();
        settings.rssi_interval_ms = 250;
        settings.log_settings.level = "debug".to_string();

        let json = serde_json::to_string(&settings).unwrap();
        let parsed: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.rssi_interval_ms, 250);
        assert_eq!(parsed.log_settings.level, "debug");
    }
}
