//! PBC Core Library
//!
//! Priority-based coordination for a fleet of zone controllers sharing a
//! cap on simultaneously active equipment. The lowest live zone id leads
//! and allocates slots; every other zone follows its decisions or, with no
//! leader in sight, falls back to local hysteresis control.

pub mod allocator;
pub mod config;
pub mod device;
pub mod error;
pub mod follower;
pub mod heartbeat;
pub mod leader;
pub mod node;
pub mod peer;
pub mod tasks;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod zone;

pub use allocator::{Assignment, SlotAllocator};
pub use config::{Config, ConfigStore, ControlSource, Setting, UserMode, UserSettings};
pub use device::{Device, SimulatedDevice};
pub use error::{ConfigError, DeviceError, InvariantViolation, LinkError, ReportError, StoreError};
pub use follower::{DecisionOutcome, FollowerNode, LocalFallbackController};
pub use heartbeat::HeartbeatTracker;
pub use leader::LeaderRole;
pub use node::{Node, NodeHandle, NodeState};
pub use peer::{Connector, Link, LinkState, LinkTiming, PeerLinkManager};
pub use telemetry::TelemetryAggregator;
pub use transport::{Listener, TcpConnector};
pub use types::*;
pub use zone::ZoneController;
