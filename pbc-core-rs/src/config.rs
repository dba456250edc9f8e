//! Node configuration
//!
//! [`Config`] is read once at startup from a JSON file and validated before
//! anything else runs. User-adjustable settings (operating mode, setpoint,
//! control source) live in a separate [`ConfigStore`] that persists every
//! update by atomic replace.

use crate::error::{ConfigError, StoreError};
use crate::peer::LinkTiming;
use crate::transport::DEFAULT_PORT;
use crate::types::ZoneId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Lowest accepted setpoint
pub const SETPOINT_MIN: f64 = 60.0;

/// Highest accepted setpoint
pub const SETPOINT_MAX: f64 = 80.0;

fn default_dwell() -> u64 {
    600
}

fn default_deadband() -> f64 {
    0.1
}

fn default_stage2_range() -> f64 {
    2.0
}

fn default_fallback_stage2_offset() -> f64 {
    1.0
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

/// Periods and timeouts, all in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub heartbeat_secs: u64,
    pub heartbeat_stale_secs: u64,
    pub poll_secs: u64,
    pub poll_stale_secs: u64,
    pub schedule_secs: u64,
    pub control_secs: u64,
    pub backoff_secs: u64,
    pub connect_timeout_secs: u64,
    pub publish_timeout_secs: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            heartbeat_secs: 10,
            heartbeat_stale_secs: 60,
            poll_secs: 15,
            poll_stale_secs: 60,
            schedule_secs: 60,
            control_secs: 10,
            backoff_secs: 30,
            connect_timeout_secs: 5,
            publish_timeout_secs: 3,
        }
    }
}

impl Timing {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn heartbeat_stale(&self) -> Duration {
        Duration::from_secs(self.heartbeat_stale_secs)
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    pub fn poll_stale(&self) -> Duration {
        Duration::from_secs(self.poll_stale_secs)
    }

    pub fn schedule_period(&self) -> Duration {
        Duration::from_secs(self.schedule_secs)
    }

    pub fn control_period(&self) -> Duration {
        Duration::from_secs(self.control_secs)
    }

    pub fn link_timing(&self) -> LinkTiming {
        LinkTiming {
            backoff: Duration::from_secs(self.backoff_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            publish_timeout: Duration::from_secs(self.publish_timeout_secs),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("heartbeat_secs", self.heartbeat_secs),
            ("heartbeat_stale_secs", self.heartbeat_stale_secs),
            ("poll_secs", self.poll_secs),
            ("poll_stale_secs", self.poll_stale_secs),
            ("schedule_secs", self.schedule_secs),
            ("control_secs", self.control_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("publish_timeout_secs", self.publish_timeout_secs),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(ConfigError::ZeroPeriod(name));
            }
        }
        Ok(())
    }
}

/// Immutable per-node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub zone_id: ZoneId,
    pub num_zones: ZoneId,
    /// Fleet-wide limit on simultaneously active equipment
    pub concurrency_cap: usize,
    #[serde(default = "default_dwell")]
    pub min_switch_dwell_secs: u64,
    /// Initial setpoint, used when no settings file exists yet
    pub setpoint: f64,
    #[serde(default = "default_deadband")]
    pub deadband: f64,
    /// Temperature error beyond which stage 2 is used
    #[serde(default = "default_stage2_range")]
    pub stage2_range: f64,
    /// Error beyond which the local fallback uses stage 2
    #[serde(default = "default_fallback_stage2_offset")]
    pub fallback_stage2_offset: f64,
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub peers: HashMap<ZoneId, SocketAddr>,
    #[serde(default)]
    pub settings_path: Option<PathBuf>,
    #[serde(default)]
    pub timing: Timing,
}

impl Config {
    /// Read and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;

        info!(
            "Config: Loaded {} (zone {}/{}, cap {})",
            path.display(),
            config.zone_id,
            config.num_zones,
            config.concurrency_cap
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_zones == 0 {
            return Err(ConfigError::NoZones);
        }
        self.check_zone(self.zone_id)?;

        if self.concurrency_cap == 0 {
            return Err(ConfigError::InvalidCap(self.concurrency_cap));
        }
        if !self.setpoint.is_finite() || !(SETPOINT_MIN..=SETPOINT_MAX).contains(&self.setpoint) {
            return Err(ConfigError::InvalidSetpoint(self.setpoint));
        }
        if !self.deadband.is_finite() || self.deadband < 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "deadband",
                value: self.deadband,
            });
        }
        if !self.stage2_range.is_finite() || self.stage2_range <= 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "stage2_range",
                value: self.stage2_range,
            });
        }
        if !self.fallback_stage2_offset.is_finite() || self.fallback_stage2_offset < self.deadband {
            return Err(ConfigError::InvalidValue {
                name: "fallback_stage2_offset",
                value: self.fallback_stage2_offset,
            });
        }

        for &zone in self.peers.keys() {
            self.check_zone(zone)?;
        }
        for zone in (1..=self.num_zones).filter(|&z| z != self.zone_id) {
            if !self.peers.contains_key(&zone) {
                return Err(ConfigError::MissingPeer(zone));
            }
        }

        self.timing.validate()
    }

    fn check_zone(&self, zone: ZoneId) -> Result<(), ConfigError> {
        if zone == 0 || zone > self.num_zones {
            return Err(ConfigError::ZoneOutOfRange {
                zone,
                num_zones: self.num_zones,
            });
        }
        Ok(())
    }

    pub fn min_switch_dwell(&self) -> Duration {
        Duration::from_secs(self.min_switch_dwell_secs)
    }

    /// Settings used when nothing has been persisted yet
    pub fn default_settings(&self) -> UserSettings {
        UserSettings {
            setpoint: self.setpoint,
            ..UserSettings::default()
        }
    }
}

/// Operating mode selected by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserMode {
    #[default]
    Cool,
    Heat,
    Off,
}

impl fmt::Display for UserMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserMode::Cool => f.write_str("COOL"),
            UserMode::Heat => f.write_str("HEAT"),
            UserMode::Off => f.write_str("OFF"),
        }
    }
}

/// Whether the zone follows the leader or runs its own loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSource {
    #[default]
    Coordinated,
    Local,
}

/// User-adjustable settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    pub mode: UserMode,
    pub setpoint: f64,
    pub control: ControlSource,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            mode: UserMode::Cool,
            setpoint: 72.0,
            control: ControlSource::Coordinated,
        }
    }
}

/// One settings change
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Setting {
    Mode(UserMode),
    /// Clamped to the accepted range on apply
    Setpoint(f64),
    Control(ControlSource),
}

impl Setting {
    /// Parse a `field`/`value` pair as sent by an operator
    pub fn parse(field: &str, value: &str) -> Result<Self, StoreError> {
        let invalid = |field: &'static str, reason: String| StoreError::InvalidValue { field, reason };

        match field {
            "mode" => match value.to_ascii_uppercase().as_str() {
                "COOL" => Ok(Setting::Mode(UserMode::Cool)),
                "HEAT" => Ok(Setting::Mode(UserMode::Heat)),
                "OFF" => Ok(Setting::Mode(UserMode::Off)),
                other => Err(invalid("mode", format!("unknown mode {:?}", other))),
            },
            "setpoint" => {
                let setpoint: f64 = value
                    .trim()
                    .parse()
                    .map_err(|e| invalid("setpoint", format!("{}", e)))?;
                if !setpoint.is_finite() {
                    return Err(invalid("setpoint", "not a finite number".into()));
                }
                Ok(Setting::Setpoint(setpoint))
            }
            "control" => match value {
                "coordinated" => Ok(Setting::Control(ControlSource::Coordinated)),
                "local" => Ok(Setting::Control(ControlSource::Local)),
                other => Err(invalid("control", format!("unknown control source {:?}", other))),
            },
            _ => Err(invalid("field", format!("unknown setting {:?}", field))),
        }
    }
}

/// Persistent user settings
pub struct ConfigStore {
    path: Option<PathBuf>,
    settings: Mutex<UserSettings>,
}

impl ConfigStore {
    /// Load settings from `path`, writing `defaults` there if it does not
    /// exist yet.
    pub fn open(path: impl Into<PathBuf>, defaults: UserSettings) -> Result<Self, StoreError> {
        let path = path.into();

        let settings = match std::fs::read(&path) {
            Ok(bytes) => {
                let settings: UserSettings = serde_json::from_slice(&bytes)?;
                debug!("Settings: Loaded from {}", path.display());
                settings
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                write_atomic(&path, &defaults)?;
                info!("Settings: Created {}", path.display());
                defaults
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        Ok(Self {
            path: Some(path),
            settings: Mutex::new(settings),
        })
    }

    /// Settings held in memory only
    pub fn in_memory(settings: UserSettings) -> Self {
        Self {
            path: None,
            settings: Mutex::new(settings),
        }
    }

    pub fn current(&self) -> UserSettings {
        *self.settings.lock()
    }

    /// Apply one change and persist the result
    pub fn update(&self, setting: Setting) -> Result<UserSettings, StoreError> {
        let mut settings = self.settings.lock();
        let mut next = *settings;

        match setting {
            Setting::Mode(mode) => next.mode = mode,
            Setting::Setpoint(setpoint) => next.setpoint = setpoint.clamp(SETPOINT_MIN, SETPOINT_MAX),
            Setting::Control(control) => next.control = control,
        }

        if let Some(path) = &self.path {
            write_atomic(path, &next)?;
        }
        *settings = next;

        info!(
            "Settings: mode={} setpoint={:.1} control={:?}",
            next.mode, next.setpoint, next.control
        );
        Ok(next)
    }
}

/// Write to a sibling temp file, sync, then rename over the target
fn write_atomic(path: &Path, settings: &UserSettings) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    serde_json::to_writer_pretty(&mut tmp, settings)?;
    tmp.flush().map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_json() -> String {
        r#"{
            "zone_id": 2,
            "num_zones": 3,
            "concurrency_cap": 1,
            "setpoint": 72.0,
            "peers": {"1": "127.0.0.1:9991", "3": "127.0.0.1:9993"},
            "timing": {"schedule_secs": 30}
        }"#
        .to_string()
    }

    fn sample() -> Config {
        serde_json::from_str(&sample_json()).unwrap()
    }

    #[test]
    fn test_load_applies_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, sample_json()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.zone_id, 2);
        assert_eq!(config.min_switch_dwell(), Duration::from_secs(600));
        assert_eq!(config.deadband, 0.1);
        assert_eq!(config.stage2_range, 2.0);
        assert_eq!(config.timing.schedule_period(), Duration::from_secs(30));
        assert_eq!(config.timing.heartbeat_period(), Duration::from_secs(10));
        assert_eq!(config.timing.link_timing().backoff, Duration::from_secs(30));
        assert_eq!(config.listen.port(), DEFAULT_PORT);
        assert_eq!(config.peers[&3], "127.0.0.1:9993".parse().unwrap());
    }

    #[test]
    fn test_load_reports_unreadable_and_unparsable() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(Config::load(&missing), Err(ConfigError::Read { .. })));

        let garbled = dir.path().join("garbled.json");
        std::fs::write(&garbled, "{ zone_id: ").unwrap();
        assert!(matches!(Config::load(&garbled), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = sample();
        config.zone_id = 4;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZoneOutOfRange { zone: 4, num_zones: 3 })
        ));

        let mut config = sample();
        config.concurrency_cap = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidCap(0))));

        let mut config = sample();
        config.setpoint = f64::NAN;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSetpoint(_))));

        let mut config = sample();
        config.deadband = -1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { name: "deadband", .. })
        ));

        let mut config = sample();
        config.peers.remove(&3);
        assert!(matches!(config.validate(), Err(ConfigError::MissingPeer(3))));

        let mut config = sample();
        config.timing.poll_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroPeriod("poll_secs"))));

        let mut config = sample();
        config.num_zones = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NoZones)));
    }

    #[test]
    fn test_store_creates_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let defaults = sample().default_settings();

        let store = ConfigStore::open(&path, defaults).unwrap();
        assert!(path.exists());
        assert_eq!(store.current(), defaults);

        store.update(Setting::Mode(UserMode::Heat)).unwrap();
        store.update(Setting::Control(ControlSource::Local)).unwrap();
        store.update(Setting::parse("setpoint", "68.5").unwrap()).unwrap();

        let reopened = ConfigStore::open(&path, UserSettings::default()).unwrap();
        let settings = reopened.current();
        assert_eq!(settings.mode, UserMode::Heat);
        assert_eq!(settings.control, ControlSource::Local);
        assert_eq!(settings.setpoint, 68.5);

        // No temp files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_setpoint_clamped() {
        let store = ConfigStore::in_memory(UserSettings::default());
        assert_eq!(store.update(Setting::Setpoint(95.0)).unwrap().setpoint, SETPOINT_MAX);
        assert_eq!(store.update(Setting::Setpoint(40.0)).unwrap().setpoint, SETPOINT_MIN);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert_eq!(Setting::parse("mode", "cool").unwrap(), Setting::Mode(UserMode::Cool));
        assert!(matches!(
            Setting::parse("mode", "FAN"),
            Err(StoreError::InvalidValue { field: "mode", .. })
        ));
        assert!(Setting::parse("setpoint", "warm").is_err());
        assert!(Setting::parse("colour", "red").is_err());
    }

    #[test]
    fn test_corrupt_settings_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            ConfigStore::open(&path, UserSettings::default()),
            Err(StoreError::Json(_))
        ));
    }
}
