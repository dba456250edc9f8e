//! Scheduling cycle run by the elected leader

use crate::allocator::SlotAllocator;
use crate::error::{InvariantViolation, LinkError};
use crate::peer::PeerLinkManager;
use crate::telemetry::{Snapshot, TelemetryAggregator};
use crate::types::{Action, Envelope, Message, ScheduleDecision, ZoneId};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Outcome of one published cycle
#[derive(Debug, Default)]
pub struct CycleReport {
    pub decisions: Vec<ScheduleDecision>,
    pub delivered: usize,
    pub failed: Vec<(ZoneId, LinkError)>,
}

impl CycleReport {
    pub fn count(&self, action: Action) -> usize {
        self.decisions.iter().filter(|d| d.action == action).count()
    }
}

/// Leader-side scheduler for one zone
#[derive(Debug, Clone, Copy)]
pub struct LeaderRole {
    zone: ZoneId,
    allocator: SlotAllocator,
}

impl LeaderRole {
    pub fn new(zone: ZoneId, cap: usize) -> Self {
        Self {
            zone,
            allocator: SlotAllocator::new(cap),
        }
    }

    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    /// Allocate over a snapshot and stamp the result as this zone's
    /// decisions
    pub fn plan(
        &self,
        snapshot: &Snapshot,
        issued_at: DateTime<Utc>,
    ) -> Result<Vec<ScheduleDecision>, InvariantViolation> {
        if !snapshot.substituted.is_empty() {
            info!(
                "Scheduler: No fresh report from zones {:?}, using placeholders",
                snapshot.substituted
            );
        }

        let assignments = self.allocator.allocate(&snapshot.equipment)?;
        Ok(assignments
            .into_iter()
            .map(|a| a.issue(self.zone, issued_at))
            .collect())
    }

    /// Snapshot the poll table and run one cycle over it
    pub async fn run_cycle(
        &self,
        telemetry: &Mutex<TelemetryAggregator>,
        peers: &PeerLinkManager,
    ) -> Result<CycleReport, InvariantViolation> {
        let snapshot = telemetry.lock().snapshot(Instant::now());
        self.execute(&snapshot, peers).await
    }

    /// Allocate and publish each decision to its target. An invariant
    /// violation aborts the cycle before anything is sent.
    pub async fn execute(
        &self,
        snapshot: &Snapshot,
        peers: &PeerLinkManager,
    ) -> Result<CycleReport, InvariantViolation> {
        let decisions = self.plan(snapshot, Utc::now()).map_err(|violation| {
            error!(
                target: "pbc::invariant",
                "Scheduler: Cycle aborted, allocation violated an invariant: {}",
                violation
            );
            violation
        })?;

        let sends = decisions.iter().map(|decision| async move {
            let envelope = Envelope::new(decision.target, Message::Decision(decision.clone()));
            (decision.target, peers.publish(decision.target, &envelope).await)
        });

        let mut report = CycleReport {
            decisions: decisions.clone(),
            ..CycleReport::default()
        };
        for (zone, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    if e.is_backoff() {
                        debug!("Scheduler: Decision for zone {} skipped: {}", zone, e);
                    } else {
                        warn!("Scheduler: Decision for zone {} not delivered: {}", zone, e);
                    }
                    report.failed.push((zone, e));
                }
            }
        }

        info!(
            "Scheduler: Cycle complete, {} activate, {} shutdown, {}/{} delivered",
            report.count(Action::Activate),
            report.count(Action::Shutdown),
            report.delivered,
            report.decisions.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{Connector, Link, LinkTiming};
    use crate::telemetry::POLL_STALE_AFTER;
    use crate::types::{EquipmentState, Mode, MAX_PRIORITY};
    use futures_util::future::BoxFuture;
    use std::collections::HashSet;
    use std::io;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Accepts connections to `reachable` zones and records what is sent
    struct RecordingConnector {
        reachable: HashSet<ZoneId>,
        sent: Arc<Mutex<Vec<Envelope>>>,
    }

    struct RecordingLink {
        sent: Arc<Mutex<Vec<Envelope>>>,
    }

    impl Link for RecordingLink {
        fn send<'a>(&'a mut self, envelope: &'a Envelope) -> BoxFuture<'a, io::Result<()>> {
            Box::pin(async move {
                self.sent.lock().push(envelope.clone());
                Ok(())
            })
        }
    }

    impl Connector for RecordingConnector {
        fn connect(&self, zone: ZoneId) -> BoxFuture<'_, io::Result<Box<dyn Link>>> {
            let reachable = self.reachable.contains(&zone);
            let sent = self.sent.clone();
            Box::pin(async move {
                if !reachable {
                    return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
                }
                Ok(Box::new(RecordingLink { sent }) as Box<dyn Link>)
            })
        }
    }

    fn peers(
        reachable: &[ZoneId],
        num_zones: ZoneId,
    ) -> (PeerLinkManager, Arc<Mutex<Vec<Envelope>>>, mpsc::Receiver<Envelope>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let connector = Arc::new(RecordingConnector {
            reachable: reachable.iter().copied().collect(),
            sent: sent.clone(),
        });
        let (tx, rx) = mpsc::channel(16);
        let manager = PeerLinkManager::new(1, num_zones, connector, tx, LinkTiming::default());
        (manager, sent, rx)
    }

    fn idle(id: ZoneId, priority: u8) -> EquipmentState {
        EquipmentState {
            id,
            priority,
            is_on: false,
            mode: Mode::Off,
            can_switch: true,
        }
    }

    #[test]
    fn test_plan_stamps_issuer() {
        let leader = LeaderRole::new(2, 1);
        let snapshot = Snapshot {
            equipment: vec![idle(1, 5), idle(2, 3), idle(3, 8)],
            substituted: vec![],
        };
        let at = Utc::now();

        let decisions = leader.plan(&snapshot, at).unwrap();
        assert_eq!(decisions.len(), 3);
        assert!(decisions.iter().all(|d| d.issued_by == 2 && d.issued_at == at));
        assert_eq!(decisions[2].action, Action::Activate);
        assert_eq!(decisions[0].action, Action::NoChange);
    }

    #[test]
    fn test_plan_rejects_malformed_snapshot() {
        let leader = LeaderRole::new(1, 1);
        let snapshot = Snapshot {
            equipment: vec![idle(1, 5), idle(1, 3)],
            substituted: vec![],
        };
        assert_eq!(
            leader.plan(&snapshot, Utc::now()),
            Err(InvariantViolation::DuplicateZone { zone: 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_violation_aborts_cycle_before_publishing() {
        let leader = LeaderRole::new(1, 1);
        let (peers, sent, mut local) = peers(&[2], 2);
        let snapshot = Snapshot {
            equipment: vec![idle(1, MAX_PRIORITY), idle(2, 5), idle(2, 3)],
            substituted: vec![],
        };

        let result = leader.execute(&snapshot, &peers).await;
        assert!(matches!(
            result,
            Err(InvariantViolation::DuplicateZone { zone: 2 })
        ));
        assert!(sent.lock().is_empty());
        assert!(local.try_recv().is_err());
        assert_eq!(peers.link_state(2).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_counts_delivered_and_failed() {
        let leader = LeaderRole::new(1, 2);
        let (peers, sent, mut local) = peers(&[2], 3);
        let telemetry = Mutex::new(TelemetryAggregator::new(3, POLL_STALE_AFTER));
        {
            let mut table = telemetry.lock();
            let now = Instant::now();
            table.ingest(idle(1, MAX_PRIORITY), now).unwrap();
            table.ingest(idle(2, 7), now).unwrap();
            table.ingest(idle(3, 4), now).unwrap();
        }

        let report = leader.run_cycle(&telemetry, &peers).await.unwrap();
        assert_eq!(report.decisions.len(), 3);
        assert_eq!(report.count(Action::Activate), 2);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 3);
        assert!(matches!(report.failed[0].1, LinkError::Connect { zone: 3, .. }));

        // Own decision goes to the local channel, zone 2's over its link
        let own = local.try_recv().unwrap();
        assert_eq!(own.zone, 1);
        let remote = sent.lock().clone();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].zone, 2);
        assert!(matches!(
            &remote[0].message,
            Message::Decision(d) if d.target == 2 && d.action == Action::Activate
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_survives_rejected_report() {
        let leader = LeaderRole::new(1, 1);
        let (peers, _sent, mut local) = peers(&[2], 2);
        let telemetry = Mutex::new(TelemetryAggregator::new(2, POLL_STALE_AFTER));
        {
            let mut table = telemetry.lock();
            let now = Instant::now();
            table.ingest(idle(1, MAX_PRIORITY), now).unwrap();
            assert!(table.ingest(idle(2, MAX_PRIORITY + 1), now).is_err());
        }

        for _ in 0..3 {
            let report = leader.run_cycle(&telemetry, &peers).await.unwrap();
            assert_eq!(report.count(Action::Activate), 1);
            assert!(local.try_recv().is_ok());
        }
    }
}
