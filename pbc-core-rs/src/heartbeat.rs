//! Liveness tracking and leader selection.
//!
//! Every node broadcasts its zone id on a fixed period. The tracker keeps
//! the last time each zone was heard from; entries older than the
//! staleness threshold count as unknown. The leader is the lowest live zone
//! id, or nobody when no zone is live.
//!
//! There is no voting and no quorum: each side of a partition converges on
//! the lowest id it can currently hear.

use crate::error::UnknownZone;
use crate::types::ZoneId;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default heartbeat broadcast period
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);

/// Missed periods before a zone is considered gone
pub const HEARTBEAT_STALE_PERIODS: u32 = 6;

/// Liveness record for one zone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub zone: ZoneId,
    /// `None` once the entry has gone stale or before the first heartbeat
    pub last_seen: Option<Instant>,
}

/// Leader transition reported by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderChange {
    pub previous: Option<ZoneId>,
    pub current: Option<ZoneId>,
}

/// Per-node liveness table
#[derive(Debug)]
pub struct HeartbeatTracker {
    own_zone: ZoneId,
    records: Vec<HeartbeatRecord>,
    stale_after: Duration,
    leader: Option<ZoneId>,
}

impl HeartbeatTracker {
    /// Create a tracker for zones `1..=num_zones`, all initially unknown
    pub fn new(own_zone: ZoneId, num_zones: ZoneId, stale_after: Duration) -> Self {
        let records = (1..=num_zones)
            .map(|zone| HeartbeatRecord {
                zone,
                last_seen: None,
            })
            .collect();

        Self {
            own_zone,
            records,
            stale_after,
            leader: None,
        }
    }

    /// Record a heartbeat from `sender` and re-evaluate the table
    pub fn received(
        &mut self,
        sender: ZoneId,
        now: Instant,
    ) -> Result<Option<LeaderChange>, UnknownZone> {
        let num_zones = self.records.len() as ZoneId;
        let record = self
            .records
            .iter_mut()
            .find(|r| r.zone == sender)
            .ok_or(UnknownZone {
                zone: sender,
                num_zones,
            })?;

        if record.last_seen.is_none() {
            debug!("Heartbeat: Zone {} is live", sender);
        }
        record.last_seen = Some(now);

        Ok(self.expire(now))
    }

    /// Mark entries older than the threshold as unknown and recompute the
    /// leader. Called on every receipt and on an independent timer.
    pub fn expire(&mut self, now: Instant) -> Option<LeaderChange> {
        for record in self.records.iter_mut() {
            if let Some(seen) = record.last_seen {
                if now.saturating_duration_since(seen) > self.stale_after {
                    warn!(
                        "Heartbeat: Zone {} silent for more than {:?}, marking unknown",
                        record.zone, self.stale_after
                    );
                    record.last_seen = None;
                }
            }
        }

        let current = self
            .records
            .iter()
            .filter(|r| r.last_seen.is_some())
            .map(|r| r.zone)
            .min();

        if current == self.leader {
            return None;
        }

        let change = LeaderChange {
            previous: self.leader,
            current,
        };
        self.leader = current;

        match current {
            Some(zone) if zone == self.own_zone => {
                info!("Heartbeat: Zone {} (self) is now leader", zone)
            }
            Some(zone) => info!("Heartbeat: Recognized zone {} as leader", zone),
            None => warn!("Heartbeat: No live leader, falling back to local control"),
        }

        Some(change)
    }

    /// Lowest live zone id, if any
    pub fn current_leader(&self) -> Option<ZoneId> {
        self.leader
    }

    /// Whether this node currently believes it is the leader
    pub fn is_leader(&self) -> bool {
        self.leader == Some(self.own_zone)
    }

    /// Zones heard from within the threshold, ascending
    pub fn live_zones(&self) -> Vec<ZoneId> {
        self.records
            .iter()
            .filter(|r| r.last_seen.is_some())
            .map(|r| r.zone)
            .collect()
    }

    /// Time since a zone was last heard from
    pub fn time_since(&self, zone: ZoneId, now: Instant) -> Option<Duration> {
        self.records
            .iter()
            .find(|r| r.zone == zone)
            .and_then(|r| r.last_seen)
            .map(|seen| now.saturating_duration_since(seen))
    }
}
