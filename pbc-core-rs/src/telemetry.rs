//! Poll report aggregation for the scheduling cycle.
//!
//! One slot per zone, pre-filled with the conservative placeholder. Reports
//! overwrite their slot; a snapshot substitutes the placeholder for any slot
//! that has never reported or has gone stale, for that snapshot only. The
//! last good report is kept so a returning zone is picked up on its next
//! report.

use crate::error::{ReportError, UnknownZone};
use crate::types::{EquipmentState, ZoneId, MAX_PRIORITY};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default poll report period
pub const POLL_PERIOD: Duration = Duration::from_secs(15);

/// Default age beyond which a poll report is not trusted (4 missed polls)
pub const POLL_STALE_AFTER: Duration = Duration::from_secs(60);

/// Latest report from one zone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollRecord {
    pub zone: ZoneId,
    pub state: EquipmentState,
    pub received_at: Option<Instant>,
}

/// Allocator input for one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Exactly one entry per zone, ordered by zone id
    pub equipment: Vec<EquipmentState>,
    /// Zones represented by the placeholder this cycle
    pub substituted: Vec<ZoneId>,
}

/// Fixed-length poll table
#[derive(Debug)]
pub struct TelemetryAggregator {
    slots: Vec<PollRecord>,
    stale_after: Duration,
}

impl TelemetryAggregator {
    pub fn new(num_zones: ZoneId, stale_after: Duration) -> Self {
        let slots = (1..=num_zones)
            .map(|zone| PollRecord {
                zone,
                state: EquipmentState::placeholder(zone),
                received_at: None,
            })
            .collect();

        Self { slots, stale_after }
    }

    pub fn num_zones(&self) -> usize {
        self.slots.len()
    }

    /// Store a report, replacing the zone's previous one. Malformed reports
    /// are refused and the previous one is kept.
    pub fn ingest(&mut self, report: EquipmentState, now: Instant) -> Result<(), ReportError> {
        if report.priority > MAX_PRIORITY {
            return Err(ReportError::PriorityOutOfRange {
                zone: report.id,
                priority: report.priority,
            });
        }
        if report.is_on != report.mode.is_on() {
            return Err(ReportError::InconsistentMode {
                zone: report.id,
                is_on: report.is_on,
                mode: report.mode,
            });
        }

        let num_zones = self.slots.len() as ZoneId;
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.zone == report.id)
            .ok_or(UnknownZone {
                zone: report.id,
                num_zones,
            })?;

        slot.state = report;
        slot.received_at = Some(now);
        debug!(
            "Telemetry: Zone {} p={} on={} mode={} switchable={}",
            report.id, report.priority, report.is_on, report.mode, report.can_switch
        );
        Ok(())
    }

    /// Full-length allocator input with stale zones replaced
    pub fn snapshot(&self, now: Instant) -> Snapshot {
        let mut equipment = Vec::with_capacity(self.slots.len());
        let mut substituted = Vec::new();

        for slot in &self.slots {
            let fresh = slot
                .received_at
                .map(|at| now.saturating_duration_since(at) <= self.stale_after)
                .unwrap_or(false);

            if fresh {
                equipment.push(slot.state);
            } else {
                equipment.push(EquipmentState::placeholder(slot.zone));
                substituted.push(slot.zone);
            }
        }

        Snapshot {
            equipment,
            substituted,
        }
    }

    /// Last stored record for a zone, stale or not
    pub fn record(&self, zone: ZoneId) -> Option<&PollRecord> {
        self.slots.iter().find(|s| s.zone == zone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Mode;

    fn report(id: ZoneId, priority: u8) -> EquipmentState {
        EquipmentState {
            id,
            priority,
            is_on: true,
            mode: Mode::Cool1,
            can_switch: true,
        }
    }

    #[test]
    fn test_initial_snapshot_is_all_placeholders() {
        let agg = TelemetryAggregator::new(3, POLL_STALE_AFTER);
        let snap = agg.snapshot(Instant::now());

        assert_eq!(snap.equipment.len(), 3);
        assert!(snap.equipment.iter().all(|e| e.is_placeholder()));
        assert_eq!(snap.substituted, vec![1, 2, 3]);
        let ids: Vec<_> = snap.equipment.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_fresh_report_used() {
        let t0 = Instant::now();
        let mut agg = TelemetryAggregator::new(2, POLL_STALE_AFTER);
        agg.ingest(report(2, 6), t0).unwrap();

        let snap = agg.snapshot(t0 + POLL_PERIOD);
        assert_eq!(snap.equipment[1], report(2, 6));
        assert_eq!(snap.substituted, vec![1]);
    }

    #[test]
    fn test_stale_report_substituted_but_retained() {
        let t0 = Instant::now();
        let mut agg = TelemetryAggregator::new(2, POLL_STALE_AFTER);
        agg.ingest(report(1, 4), t0).unwrap();
        agg.ingest(report(2, 9), t0).unwrap();

        let at_limit = agg.snapshot(t0 + POLL_STALE_AFTER);
        assert!(at_limit.substituted.is_empty());

        let later = t0 + POLL_STALE_AFTER + Duration::from_secs(1);
        let snap = agg.snapshot(later);
        assert_eq!(snap.equipment[0], EquipmentState::placeholder(1));
        assert_eq!(snap.equipment[1], EquipmentState::placeholder(2));
        assert_eq!(snap.substituted, vec![1, 2]);

        // Last good report survives for when the zone returns
        assert_eq!(agg.record(2).unwrap().state, report(2, 9));

        agg.ingest(report(2, 3), later).unwrap();
        assert_eq!(agg.snapshot(later).equipment[1], report(2, 3));
    }

    #[test]
    fn test_out_of_range_report_rejected() {
        let mut agg = TelemetryAggregator::new(2, POLL_STALE_AFTER);
        let err = agg.ingest(report(5, 1), Instant::now()).unwrap_err();
        assert_eq!(
            err,
            ReportError::UnknownZone(UnknownZone { zone: 5, num_zones: 2 })
        );
        assert_eq!(agg.num_zones(), 2);
    }

    #[test]
    fn test_malformed_report_rejected_and_previous_kept() {
        let t0 = Instant::now();
        let mut agg = TelemetryAggregator::new(2, POLL_STALE_AFTER);
        agg.ingest(report(2, 4), t0).unwrap();

        let err = agg.ingest(report(2, MAX_PRIORITY + 1), t0).unwrap_err();
        assert_eq!(
            err,
            ReportError::PriorityOutOfRange {
                zone: 2,
                priority: MAX_PRIORITY + 1
            }
        );

        let mut off_but_running = report(2, 6);
        off_but_running.mode = Mode::Off;
        assert!(matches!(
            agg.ingest(off_but_running, t0),
            Err(ReportError::InconsistentMode { zone: 2, is_on: true, .. })
        ));

        assert_eq!(agg.snapshot(t0).equipment[1], report(2, 4));
    }
}
