//! Decision acceptance and local fallback control.
//!
//! A follower only honours decisions published on the status topic of the
//! zone it currently believes to be the leader. Decisions from any other
//! issuer (a deposed leader, the far side of a partition) are discarded.
//! Without a live leader, or when the user selected local control, the zone
//! runs a simple hysteresis loop instead.

use crate::config::{ControlSource, UserMode};
use crate::types::{status_topic, Action, Mode, ScheduleDecision, ZoneId};
use tracing::debug;

/// What the follower did with a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOutcome {
    /// Activate or Shutdown to be applied by the zone controller
    Accepted(Action),
    /// Issued by someone other than the current leader
    StaleLeader {
        issued_by: ZoneId,
        leader: Option<ZoneId>,
    },
    /// Addressed to another zone
    NotAddressed { target: ZoneId },
    /// Zone is under local control
    LocalControl,
    /// NoChange
    Ignored,
}

/// Decision counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FollowerStats {
    pub accepted: u64,
    pub stale: u64,
    pub ignored: u64,
}

/// Per-zone decision filter
#[derive(Debug)]
pub struct FollowerNode {
    zone: ZoneId,
    last_accepted: Option<ScheduleDecision>,
    stats: FollowerStats,
}

impl FollowerNode {
    pub fn new(zone: ZoneId) -> Self {
        Self {
            zone,
            last_accepted: None,
            stats: FollowerStats::default(),
        }
    }

    /// Filter a decision received on `topic` against the leader believed
    /// at receipt time
    pub fn on_decision(
        &mut self,
        topic: &str,
        decision: &ScheduleDecision,
        leader: Option<ZoneId>,
        control: ControlSource,
    ) -> DecisionOutcome {
        let from_leader = match leader {
            Some(leader) => topic == status_topic(leader) && decision.issued_by == leader,
            None => false,
        };
        if !from_leader {
            debug!(
                "Follower: Zone {} discarding decision from zone {} (leader {:?})",
                self.zone, decision.issued_by, leader
            );
            self.stats.stale += 1;
            return DecisionOutcome::StaleLeader {
                issued_by: decision.issued_by,
                leader,
            };
        }

        if decision.target != self.zone {
            return DecisionOutcome::NotAddressed {
                target: decision.target,
            };
        }

        if control == ControlSource::Local {
            debug!("Follower: Zone {} under local control, ignoring {}", self.zone, decision.action);
            self.stats.ignored += 1;
            return DecisionOutcome::LocalControl;
        }

        if decision.action == Action::NoChange {
            self.stats.ignored += 1;
            return DecisionOutcome::Ignored;
        }

        self.stats.accepted += 1;
        self.last_accepted = Some(decision.clone());
        DecisionOutcome::Accepted(decision.action)
    }

    pub fn last_accepted(&self) -> Option<&ScheduleDecision> {
        self.last_accepted.as_ref()
    }

    pub fn stats(&self) -> FollowerStats {
        self.stats
    }
}

/// Hysteresis controller used when no leader is reachable
#[derive(Debug, Clone, Copy)]
pub struct LocalFallbackController {
    deadband: f64,
    stage2_offset: f64,
}

impl LocalFallbackController {
    pub fn new(deadband: f64, stage2_offset: f64) -> Self {
        Self {
            deadband,
            stage2_offset,
        }
    }

    /// Mode the zone should run in. The caller applies the dwell gate.
    pub fn decide(&self, temperature: f64, setpoint: f64, mode: UserMode) -> Mode {
        match mode {
            UserMode::Cool => {
                if temperature > setpoint + self.stage2_offset {
                    Mode::Cool2
                } else if temperature > setpoint + self.deadband {
                    Mode::Cool1
                } else {
                    Mode::Off
                }
            }
            UserMode::Heat => {
                if temperature < setpoint - self.stage2_offset {
                    Mode::Heat2
                } else if temperature < setpoint - self.deadband {
                    Mode::Heat1
                } else {
                    Mode::Off
                }
            }
            UserMode::Off => Mode::Off,
        }
    }
}
