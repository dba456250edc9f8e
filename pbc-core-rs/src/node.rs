//! Node runtime
//!
//! Wires one zone's tables and roles together and drives them from
//! independent periodic tasks plus one inbound dispatch task:
//!
//! | task              | period            | role                       |
//! |-------------------|-------------------|----------------------------|
//! | heartbeat         | heartbeat period  | broadcast liveness         |
//! | heartbeat-expiry  | heartbeat period  | age out silent zones       |
//! | poll              | poll period       | broadcast equipment state  |
//! | schedule          | schedule period   | allocate, if leader        |
//! | local-control     | control period    | fallback loop, if no leader|
//! | inbound           | on receipt        | dispatch by message type   |
//!
//! Each table sits behind its own lock, never held across an await.

use crate::config::{Config, ConfigStore, ControlSource, Setting, Timing, UserSettings};
use crate::device::Device;
use crate::error::{DeviceError, StoreError};
use crate::follower::{DecisionOutcome, FollowerNode, FollowerStats, LocalFallbackController};
use crate::heartbeat::{HeartbeatTracker, LeaderChange};
use crate::leader::LeaderRole;
use crate::peer::{Connector, PeerLinkManager};
use crate::tasks::{jitter, spawn_periodic};
use crate::telemetry::TelemetryAggregator;
use crate::types::{Action, Envelope, Message, Mode, ScheduleDecision, ZoneId};
use crate::zone::{SwitchOutcome, ZoneController, ZoneParams};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Inbound channel depth
const INBOUND_CAPACITY: usize = 256;

/// Default bound on the random start offset of each periodic task
pub const DEFAULT_STARTUP_JITTER: Duration = Duration::from_secs(1);

/// Shared per-node state
pub struct NodeState {
    zone: ZoneId,
    heartbeats: Mutex<HeartbeatTracker>,
    telemetry: Mutex<TelemetryAggregator>,
    follower: Mutex<FollowerNode>,
    controller: Mutex<ZoneController>,
    settings: Arc<ConfigStore>,
    peers: PeerLinkManager,
    leader: LeaderRole,
    fallback: LocalFallbackController,
}

impl NodeState {
    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    pub fn current_leader(&self) -> Option<ZoneId> {
        self.heartbeats.lock().current_leader()
    }

    pub fn is_leader(&self) -> bool {
        self.heartbeats.lock().is_leader()
    }

    pub fn live_zones(&self) -> Vec<ZoneId> {
        self.heartbeats.lock().live_zones()
    }

    pub fn current_mode(&self) -> Mode {
        self.controller.lock().current_mode()
    }

    pub fn settings(&self) -> UserSettings {
        self.settings.current()
    }

    /// Apply and persist a user settings change
    pub fn update_setting(&self, setting: Setting) -> Result<UserSettings, StoreError> {
        self.settings.update(setting)
    }

    pub fn follower_stats(&self) -> FollowerStats {
        self.follower.lock().stats()
    }

    pub fn last_accepted(&self) -> Option<ScheduleDecision> {
        self.follower.lock().last_accepted().cloned()
    }

    pub fn peers(&self) -> &PeerLinkManager {
        &self.peers
    }

    /// Broadcast this zone's liveness token
    pub async fn send_heartbeat(&self) {
        let envelope = Envelope::new(self.zone, Message::Heartbeat { sender: self.zone });
        for (zone, result) in self.peers.broadcast(&envelope).await {
            if let Err(e) = result {
                debug!("Heartbeat: Not delivered to zone {}: {}", zone, e);
            }
        }
    }

    /// Age out silent zones even when nothing is being received
    pub fn expire_heartbeats(&self) {
        let change = self.heartbeats.lock().expire(Instant::now());
        if let Some(change) = change {
            self.on_leader_change(change);
        }
    }

    /// Broadcast this zone's equipment state
    pub async fn send_poll(&self) {
        let report = self.controller.lock().poll_report(Instant::now());
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                warn!("Poll: Zone {} skipping report: {}", self.zone, e);
                return;
            }
        };

        let envelope = Envelope::new(self.zone, Message::Poll(report));
        for (zone, result) in self.peers.broadcast(&envelope).await {
            if let Err(e) = result {
                debug!("Poll: Not delivered to zone {}: {}", zone, e);
            }
        }
    }

    /// Run one scheduling cycle if this node is the leader
    pub async fn run_schedule(&self) {
        if !self.is_leader() {
            return;
        }
        // Violations are logged by the leader role; the next cycle retries.
        let _ = self.leader.run_cycle(&self.telemetry, &self.peers).await;
    }

    /// Drive the equipment locally when there is no leader to follow or
    /// the user asked for local control
    pub fn run_local_control(&self) {
        let settings = self.settings.current();
        if settings.control == ControlSource::Coordinated && self.current_leader().is_some() {
            return;
        }

        let mut controller = self.controller.lock();
        let temperature = match controller.read_temperature() {
            Ok(t) => t,
            Err(e) => {
                warn!("Local: Zone {} skipping control cycle: {}", self.zone, e);
                return;
            }
        };

        let target = self.fallback.decide(temperature, settings.setpoint, settings.mode);
        match controller.switch_to(target, Instant::now()) {
            Ok(SwitchOutcome::Switched { .. }) => {
                info!(
                    "Local: Zone {} at {:.1} (setpoint {:.1}) now {}",
                    self.zone, temperature, settings.setpoint, target
                )
            }
            Ok(_) => {}
            Err(e) => warn!("Local: Zone {} could not apply {}: {}", self.zone, target, e),
        }
    }

    /// Handle one inbound envelope
    pub fn dispatch(&self, envelope: Envelope) {
        let now = Instant::now();

        match envelope.message {
            Message::Heartbeat { sender } => {
                let received = self.heartbeats.lock().received(sender, now);
                match received {
                    Ok(Some(change)) => self.on_leader_change(change),
                    Ok(None) => {}
                    Err(e) => warn!("Heartbeat: Ignoring heartbeat: {}", e),
                }
            }
            Message::Poll(report) => {
                if let Err(e) = self.telemetry.lock().ingest(report, now) {
                    warn!("Telemetry: Ignoring report: {}", e);
                }
            }
            Message::Decision(decision) => self.on_decision(&envelope.topic, &decision, now),
        }
    }

    fn on_decision(&self, topic: &str, decision: &ScheduleDecision, now: Instant) {
        let leader = self.current_leader();
        let control = self.settings.current().control;
        let outcome = self
            .follower
            .lock()
            .on_decision(topic, decision, leader, control);

        let action = match outcome {
            DecisionOutcome::Accepted(action) => action,
            _ => return,
        };

        let mut controller = self.controller.lock();
        let applied = match action {
            Action::Activate => controller.activate(now),
            Action::Shutdown => controller.shutdown(now),
            Action::NoChange => return,
        };

        match applied {
            Ok(SwitchOutcome::Switched { from, to }) => info!(
                "Follower: Zone {} applied {} from zone {}: {} -> {}",
                self.zone, action, decision.issued_by, from, to
            ),
            Ok(SwitchOutcome::Dwelling) => debug!(
                "Follower: Zone {} deferred {} until dwell time elapses",
                self.zone, action
            ),
            Ok(SwitchOutcome::Unchanged) => {}
            Err(e) => warn!("Follower: Zone {} failed to apply {}: {}", self.zone, action, e),
        }
    }

    fn on_leader_change(&self, change: LeaderChange) {
        debug!(
            "Node: Zone {} leader {:?} -> {:?}",
            self.zone, change.previous, change.current
        );
    }
}

/// A configured node, not yet running
pub struct Node {
    state: Arc<NodeState>,
    inbound_tx: mpsc::Sender<Envelope>,
    inbound_rx: mpsc::Receiver<Envelope>,
    timing: Timing,
    startup_jitter: Duration,
}

impl Node {
    /// Build a node from validated config. Turns the equipment off.
    pub fn new(
        config: &Config,
        device: Arc<dyn Device>,
        settings: Arc<ConfigStore>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, DeviceError> {
        let timing = config.timing;
        let zone = config.zone_id;
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let controller = ZoneController::new(
            zone,
            device,
            settings.clone(),
            ZoneParams {
                deadband: config.deadband,
                stage2_range: config.stage2_range,
                min_dwell: config.min_switch_dwell(),
            },
        )?;

        let state = NodeState {
            zone,
            heartbeats: Mutex::new(HeartbeatTracker::new(
                zone,
                config.num_zones,
                timing.heartbeat_stale(),
            )),
            telemetry: Mutex::new(TelemetryAggregator::new(config.num_zones, timing.poll_stale())),
            follower: Mutex::new(FollowerNode::new(zone)),
            controller: Mutex::new(controller),
            settings,
            peers: PeerLinkManager::new(
                zone,
                config.num_zones,
                connector,
                inbound_tx.clone(),
                timing.link_timing(),
            ),
            leader: LeaderRole::new(zone, config.concurrency_cap),
            fallback: LocalFallbackController::new(config.deadband, config.fallback_stage2_offset),
        };

        Ok(Self {
            state: Arc::new(state),
            inbound_tx,
            inbound_rx,
            timing,
            startup_jitter: DEFAULT_STARTUP_JITTER,
        })
    }

    /// Bound the random start offset of each periodic task
    pub fn with_startup_jitter(mut self, max: Duration) -> Self {
        self.startup_jitter = max;
        self
    }

    /// Sender feeding the dispatch task, for the inbound transport
    pub fn inbound_sender(&self) -> mpsc::Sender<Envelope> {
        self.inbound_tx.clone()
    }

    pub fn state(&self) -> Arc<NodeState> {
        self.state.clone()
    }

    /// Spawn all tasks
    pub fn start(self) -> NodeHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timing = self.timing;
        let max_jitter = self.startup_jitter;
        let mut tasks = Vec::new();

        info!("Node: Zone {} starting", self.state.zone);

        let state = self.state.clone();
        tasks.push(spawn_periodic(
            "heartbeat",
            jitter(max_jitter),
            timing.heartbeat_period(),
            shutdown_rx.clone(),
            move || {
                let state = state.clone();
                async move { state.send_heartbeat().await }
            },
        ));

        let state = self.state.clone();
        tasks.push(spawn_periodic(
            "heartbeat-expiry",
            timing.heartbeat_period(),
            timing.heartbeat_period(),
            shutdown_rx.clone(),
            move || {
                let state = state.clone();
                async move { state.expire_heartbeats() }
            },
        ));

        let state = self.state.clone();
        tasks.push(spawn_periodic(
            "poll",
            jitter(max_jitter),
            timing.poll_period(),
            shutdown_rx.clone(),
            move || {
                let state = state.clone();
                async move { state.send_poll().await }
            },
        ));

        let state = self.state.clone();
        tasks.push(spawn_periodic(
            "schedule",
            timing.schedule_period() + jitter(max_jitter),
            timing.schedule_period(),
            shutdown_rx.clone(),
            move || {
                let state = state.clone();
                async move { state.run_schedule().await }
            },
        ));

        // Give heartbeats one period to arrive before deciding there is
        // no leader.
        let state = self.state.clone();
        tasks.push(spawn_periodic(
            "local-control",
            timing.heartbeat_period() + jitter(max_jitter),
            timing.control_period(),
            shutdown_rx.clone(),
            move || {
                let state = state.clone();
                async move { state.run_local_control() }
            },
        ));

        tasks.push(spawn_dispatch(self.state.clone(), self.inbound_rx, shutdown_rx.clone()));

        NodeHandle {
            state: self.state,
            inbound_tx: self.inbound_tx,
            shutdown_tx,
            shutdown_rx,
            tasks,
        }
    }
}

fn spawn_dispatch(
    state: Arc<NodeState>,
    mut inbound: mpsc::Receiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(envelope) = inbound.recv() => state.dispatch(envelope),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Tasks: inbound stopped");
    })
}

/// Running node
pub struct NodeHandle {
    state: Arc<NodeState>,
    inbound_tx: mpsc::Sender<Envelope>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    pub fn inbound_sender(&self) -> mpsc::Sender<Envelope> {
        self.inbound_tx.clone()
    }

    /// Receiver that turns true on shutdown, for tasks started alongside
    /// the node
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Stop all tasks and close peer links
    pub async fn shutdown(self) {
        info!("Node: Zone {} shutting down", self.state.zone);
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        self.state.peers.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserMode;
    use crate::device::SimulatedDevice;
    use crate::peer::Link;
    use crate::types::MAX_PRIORITY;
    use futures_util::future::BoxFuture;
    use std::collections::HashMap;
    use std::io;

    struct Unreachable;

    impl Connector for Unreachable {
        fn connect(&self, _zone: ZoneId) -> BoxFuture<'_, io::Result<Box<dyn Link>>> {
            Box::pin(async { Err(io::Error::new(io::ErrorKind::ConnectionRefused, "unreachable")) })
        }
    }

    fn config(zone: ZoneId, num_zones: ZoneId) -> Config {
        Config {
            zone_id: zone,
            num_zones,
            concurrency_cap: 1,
            min_switch_dwell_secs: 0,
            setpoint: 72.0,
            deadband: 0.1,
            stage2_range: 2.0,
            fallback_stage2_offset: 1.0,
            listen: "127.0.0.1:0".parse().unwrap(),
            peers: HashMap::new(),
            settings_path: None,
            timing: Timing::default(),
        }
    }

    fn node(temperature: f64) -> (Node, Arc<SimulatedDevice>) {
        let config = config(1, 2);
        let device = Arc::new(SimulatedDevice::new(temperature));
        let settings = Arc::new(ConfigStore::in_memory(config.default_settings()));
        let node = Node::new(&config, device.clone(), settings, Arc::new(Unreachable)).unwrap();
        (node.with_startup_jitter(Duration::ZERO), device)
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolated_node_leads_itself() {
        let (node, device) = node(75.0);
        let handle = node.start();

        tokio::time::sleep(Duration::from_secs(65)).await;
        let state = handle.state();
        assert_eq!(state.current_leader(), Some(1));
        assert!(state.is_leader());
        assert_eq!(state.live_zones(), vec![1]);

        // Own MAX-priority report scheduled by itself
        assert_eq!(device.current_mode(), Mode::Cool2);
        let accepted = state.last_accepted().unwrap();
        assert_eq!(accepted.issued_by, 1);
        assert_eq!(accepted.action, Action::Activate);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_ignores_unknown_zones() {
        let (node, _) = node(72.0);
        let state = node.state();

        state.dispatch(Envelope::new(9, Message::Heartbeat { sender: 9 }));
        assert_eq!(state.current_leader(), None);

        let mut report = crate::types::EquipmentState::placeholder(9);
        report.priority = MAX_PRIORITY;
        state.dispatch(Envelope::new(9, Message::Poll(report)));
        assert_eq!(state.telemetry.lock().num_zones(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_control_without_leader() {
        let (node, device) = node(74.0);
        let state = node.state();

        tokio::time::advance(Duration::from_secs(1)).await;
        state.run_local_control();
        assert_eq!(device.current_mode(), Mode::Cool2);

        device.set_temperature(72.0);
        tokio::time::advance(Duration::from_secs(1)).await;
        state.run_local_control();
        assert_eq!(device.current_mode(), Mode::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_control_selected_by_user() {
        let (node, device) = node(71.0);
        let state = node.state();
        state.dispatch(Envelope::new(1, Message::Heartbeat { sender: 1 }));
        tokio::time::advance(Duration::from_secs(1)).await;

        // Following a leader: local loop stays out of the way
        state.update_setting(Setting::Mode(UserMode::Heat)).unwrap();
        state.run_local_control();
        assert_eq!(device.current_mode(), Mode::Off);

        state.update_setting(Setting::Control(ControlSource::Local)).unwrap();
        state.run_local_control();
        assert_eq!(device.current_mode(), Mode::Heat1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_peer_report_does_not_stall_scheduling() {
        let (node, _) = node(72.0);
        let state = node.state();

        let mut own = crate::types::EquipmentState::placeholder(1);
        own.priority = MAX_PRIORITY;
        own.can_switch = true;
        state.dispatch(Envelope::new(1, Message::Poll(own)));

        let mut bad = crate::types::EquipmentState::placeholder(2);
        bad.priority = MAX_PRIORITY + 1;
        state.dispatch(Envelope::new(2, Message::Poll(bad)));

        for _ in 0..3 {
            let report = state
                .leader
                .run_cycle(&state.telemetry, &state.peers)
                .await
                .unwrap();
            assert_eq!(report.count(Action::Activate), 1);
            assert_eq!(report.decisions[0].target, 1);
        }
    }
}
