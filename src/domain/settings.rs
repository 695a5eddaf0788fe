use crate::domain::models::PeerIdentity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
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
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
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
            show_file_line: default_true(),
            show_thread_ids: default_true(),
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
    "ble_session".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Where event observers are invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// On whichever task or thread produced the event.
    #[default]
    Inline,
    /// On a single dedicated dispatcher task shared by all event buses of a device.
    Dedicated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Deadline for one queued read, write or subscribe
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    /// Pause between link-up and service discovery
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Debounce before the transport handle is released after a disconnect
    #[serde(default = "default_close_delay_ms")]
    pub close_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub dispatch_mode: DispatchMode,

    // Persisted peers
    #[serde(default)]
    pub known_peers: Vec<PeerIdentity>,
    #[serde(default)]
    pub last_connected: Option<PeerIdentity>,

    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            operation_timeout_ms: default_operation_timeout_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            close_delay_ms: default_close_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            dispatch_mode: DispatchMode::default(),
            known_peers: Vec::new(),
            last_connected: None,
            log_settings: LogSettings::default(),
        }
    }
}

impl SessionSettings {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn close_delay(&self) -> Duration {
        Duration::from_millis(self.close_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_operation_timeout_ms() -> u64 {
    3000
}
fn default_discovery_timeout_ms() -> u64 {
    10_000
}
fn default_settle_delay_ms() -> u64 {
    500
}
fn default_close_delay_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    30_000
}

pub struct SettingsService {
    settings: SessionSettings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from an explicit location, falling back to defaults when
    /// the file is missing or unreadable.
    pub fn with_path(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                SessionSettings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleSession");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<SessionSettings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
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

    pub fn get(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut SessionSettings {
        &mut self.settings
    }

    pub fn add_known_peer(&mut self, peer: PeerIdentity) -> anyhow::Result<()> {
        if !self.settings.known_peers.contains(&peer) {
            self.settings.known_peers.push(peer);
            self.save()?;
        }
        Ok(())
    }

    /// Remember the peer of the most recent successful connection.
    pub fn set_last_connected(&mut self, peer: PeerIdentity) -> anyhow::Result<()> {
        if !self.settings.known_peers.contains(&peer) {
            self.settings.known_peers.push(peer);
        }
        self.settings.last_connected = Some(peer);
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let s = SessionSettings::default();
        assert_eq!(s.operation_timeout(), Duration::from_secs(3));
        assert_eq!(s.discovery_timeout(), Duration::from_secs(10));
        assert_eq!(s.settle_delay(), Duration::from_millis(500));
        assert_eq!(s.close_delay(), Duration::from_secs(1));
        assert_eq!(s.dispatch_mode, DispatchMode::Inline);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let s: SessionSettings =
            serde_json::from_str(r#"{ "operation_timeout_ms": 50, "dispatch_mode": "dedicated" }"#)
                .unwrap();
        assert_eq!(s.operation_timeout_ms, 50);
        assert_eq!(s.dispatch_mode, DispatchMode::Dedicated);
        assert_eq!(s.close_delay_ms, 1000);
        assert!(s.known_peers.is_empty());
        assert_eq!(s.log_settings.rotation, "daily");
    }

    #[test]
    fn known_peers_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let peer: PeerIdentity = "00:11:22:33:44:55".parse().unwrap();

        let mut service = SettingsService::with_path(&path);
        service.add_known_peer(peer).unwrap();
        service.add_known_peer(peer).unwrap();
        service.set_last_connected(peer).unwrap();

        let reloaded = SettingsService::with_path(&path);
        assert_eq!(reloaded.get().known_peers, vec![peer]);
        assert_eq!(reloaded.get().last_connected, Some(peer));
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();

        let service = SettingsService::with_path(&path);
        assert_eq!(service.get().operation_timeout_ms, 3000);
    }
}
