//! Error taxonomy for PBC
//!
//! Link failures, stale data and stale-leader decisions are operational and
//! recovered locally. [`InvariantViolation`] is a bug signal that aborts one
//! scheduling cycle. [`ConfigError`] is the only error that stops a node,
//! and only at startup.

use crate::types::{Mode, Priority, ZoneId};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Startup configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("num_zones must be at least 1")]
    NoZones,

    #[error("zone id {zone} out of range 1..={num_zones}")]
    ZoneOutOfRange { zone: ZoneId, num_zones: ZoneId },

    #[error("concurrency cap must be positive, got {0}")]
    InvalidCap(usize),

    #[error("malformed setpoint {0}")]
    InvalidSetpoint(f64),

    #[error("malformed {name}: {value}")]
    InvalidValue { name: &'static str, value: f64 },

    #[error("no address configured for zone {0}")]
    MissingPeer(ZoneId),

    #[error("timing parameter {0} must be non-zero")]
    ZeroPeriod(&'static str),

    #[error("settings store: {0}")]
    Store(#[from] StoreError),
}

/// Failures persisting user settings
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("settings encode/decode: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Message names a zone outside 1..=num_zones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("zone {zone} outside 1..={num_zones}")]
pub struct UnknownZone {
    pub zone: ZoneId,
    pub num_zones: ZoneId,
}

/// Poll report refused at ingest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error(transparent)]
    UnknownZone(#[from] UnknownZone),

    #[error("zone {zone} reported priority {priority} above the maximum")]
    PriorityOutOfRange { zone: ZoneId, priority: Priority },

    #[error("zone {zone} reported is_on={is_on} with mode {mode}")]
    InconsistentMode { zone: ZoneId, is_on: bool, mode: Mode },
}

/// Transient link failures, handled by backoff
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("zone {zone} in backoff, next attempt in {retry_in:?}")]
    Backoff { zone: ZoneId, retry_in: Duration },

    #[error("connect to zone {0} timed out")]
    ConnectTimeout(ZoneId),

    #[error("connect to zone {zone} failed: {source}")]
    Connect {
        zone: ZoneId,
        #[source]
        source: io::Error,
    },

    #[error("publish to zone {0} timed out")]
    PublishTimeout(ZoneId),

    #[error("publish to zone {zone} failed: {source}")]
    Publish {
        zone: ZoneId,
        #[source]
        source: io::Error,
    },

    #[error("local delivery channel closed")]
    LocalClosed,
}

impl LinkError {
    /// Skipped without touching the network
    pub fn is_backoff(&self) -> bool {
        matches!(self, LinkError::Backoff { .. })
    }
}

/// Sensor or actuator failure
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("temperature read failed: {0}")]
    Sensor(String),

    #[error("actuation failed: {0}")]
    Actuator(String),
}

/// Allocator postcondition or precondition broken. Always a defect, never
/// an environmental condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("zone {zone} with MAX priority selected for shutdown")]
    MaxPriorityShutdown { zone: ZoneId },

    #[error("zone {zone} with MIN priority selected for activation")]
    MinPriorityActivation { zone: ZoneId },

    #[error("zone {zone} priority {priority} outside the valid range")]
    PriorityOutOfRange { zone: ZoneId, priority: Priority },

    #[error("zone {zone} appears more than once in the equipment list")]
    DuplicateZone { zone: ZoneId },

    #[error("shutdown of zone {zone} with no active equipment counted")]
    ActiveCountUnderflow { zone: ZoneId },

    #[error("zone {zone} at rank {rank} left off with free slots ({active} of {cap} in use)")]
    SlotLeftIdle {
        zone: ZoneId,
        rank: usize,
        active: usize,
        cap: usize,
    },

    #[error("zone {zone} kept running at rank {rank} ahead of zone {blocker} in the first slots")]
    OutrankedRunning {
        zone: ZoneId,
        rank: usize,
        blocker: ZoneId,
    },
}
