//! Zone controller: staged equipment state machine for one zone.
//!
//! Computes the zone's desire to run from the temperature error, reports it
//! to the leader, and applies activate/shutdown requests subject to the
//! minimum dwell time between mode changes and the user's operating mode.

use crate::config::{ConfigStore, UserMode, UserSettings};
use crate::device::Device;
use crate::error::DeviceError;
use crate::types::{EquipmentState, Mode, Priority, ZoneId, MAX_PRIORITY, MIN_PRIORITY};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Direction the zone would like to move the temperature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Cool,
    Heat,
    Idle,
}

/// Control parameters of a zone
#[derive(Debug, Clone, Copy)]
pub struct ZoneParams {
    pub deadband: f64,
    /// Error beyond which stage 2 is selected; also the error that maps to
    /// MAX priority
    pub stage2_range: f64,
    pub min_dwell: Duration,
}

/// Result of a requested mode change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    Switched { from: Mode, to: Mode },
    Unchanged,
    /// Dwell time since the last change has not elapsed
    Dwelling,
}

pub struct ZoneController {
    zone: ZoneId,
    device: Arc<dyn Device>,
    settings: Arc<ConfigStore>,
    params: ZoneParams,
    last_switch: Instant,
}

impl ZoneController {
    /// Turn the equipment off for a fresh start. The dwell clock starts now.
    pub fn new(
        zone: ZoneId,
        device: Arc<dyn Device>,
        settings: Arc<ConfigStore>,
        params: ZoneParams,
    ) -> Result<Self, DeviceError> {
        device.apply_mode(Mode::Off)?;

        Ok(Self {
            zone,
            device,
            settings,
            params,
            last_switch: Instant::now(),
        })
    }

    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    pub fn settings(&self) -> UserSettings {
        self.settings.current()
    }

    pub fn current_mode(&self) -> Mode {
        self.device.current_mode()
    }

    pub fn read_temperature(&self) -> Result<f64, DeviceError> {
        self.device.read_temperature()
    }

    /// Minimum dwell time since the last mode change has elapsed
    pub fn can_switch(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_switch) > self.params.min_dwell
    }

    pub fn requested_direction(&self, temperature: f64) -> Direction {
        let setpoint = self.settings.current().setpoint;
        if temperature > setpoint + self.params.deadband {
            Direction::Cool
        } else if temperature < setpoint - self.params.deadband {
            Direction::Heat
        } else {
            Direction::Idle
        }
    }

    /// Desire to run, MIN when idle or when the user mode forbids the
    /// requested direction
    pub fn priority(&self, temperature: f64) -> Priority {
        let settings = self.settings.current();
        let error = temperature - settings.setpoint;

        let permitted = match (self.requested_direction(temperature), settings.mode) {
            (Direction::Cool, UserMode::Cool) => error > 0.0,
            (Direction::Heat, UserMode::Heat) => error < 0.0,
            _ => false,
        };
        if !permitted {
            return MIN_PRIORITY;
        }

        let per_step = self.params.stage2_range / f64::from(MAX_PRIORITY - MIN_PRIORITY);
        let steps = (error.abs() / per_step).ceil();
        if steps >= f64::from(MAX_PRIORITY) {
            MAX_PRIORITY
        } else {
            MIN_PRIORITY + steps as Priority
        }
    }

    /// Current equipment state for the leader
    pub fn poll_report(&self, now: Instant) -> Result<EquipmentState, DeviceError> {
        let temperature = self.device.read_temperature()?;
        let mode = self.device.current_mode();

        Ok(EquipmentState {
            id: self.zone,
            priority: self.priority(temperature),
            is_on: mode.is_on(),
            mode,
            can_switch: self.can_switch(now),
        })
    }

    /// Stage the equipment would run at given the temperature, or Off when
    /// the user mode does not allow the requested direction
    pub fn target_stage(&self, temperature: f64) -> Mode {
        let settings = self.settings.current();
        let error = temperature - settings.setpoint;
        let high = error.abs() > self.params.stage2_range;

        match (self.requested_direction(temperature), settings.mode) {
            (Direction::Cool, UserMode::Cool) if high => Mode::Cool2,
            (Direction::Cool, UserMode::Cool) => Mode::Cool1,
            (Direction::Heat, UserMode::Heat) if high => Mode::Heat2,
            (Direction::Heat, UserMode::Heat) => Mode::Heat1,
            _ => Mode::Off,
        }
    }

    /// Apply a mode to the device if it differs from the current one.
    /// Not dwell-gated.
    pub fn set_mode(&mut self, mode: Mode, now: Instant) -> Result<SwitchOutcome, DeviceError> {
        let from = self.device.current_mode();
        if from == mode {
            return Ok(SwitchOutcome::Unchanged);
        }

        self.device.apply_mode(mode)?;
        self.last_switch = now;
        info!("Zone {}: {} -> {}", self.zone, from, mode);
        Ok(SwitchOutcome::Switched { from, to: mode })
    }

    /// Dwell-gated mode change
    pub fn switch_to(&mut self, mode: Mode, now: Instant) -> Result<SwitchOutcome, DeviceError> {
        if self.device.current_mode() == mode {
            return Ok(SwitchOutcome::Unchanged);
        }
        if !self.can_switch(now) {
            debug!("Zone {}: Holding {} until dwell time elapses", self.zone, self.device.current_mode());
            return Ok(SwitchOutcome::Dwelling);
        }
        self.set_mode(mode, now)
    }

    /// Run at the stage the temperature error calls for
    pub fn activate(&mut self, now: Instant) -> Result<SwitchOutcome, DeviceError> {
        if !self.can_switch(now) {
            return Ok(SwitchOutcome::Dwelling);
        }
        let temperature = self.device.read_temperature()?;
        let target = self.target_stage(temperature);
        self.set_mode(target, now)
    }

    pub fn shutdown(&mut self, now: Instant) -> Result<SwitchOutcome, DeviceError> {
        self.switch_to(Mode::Off, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Setting, UserSettings};
    use crate::device::SimulatedDevice;

    const DWELL: Duration = Duration::from_secs(600);

    fn controller(temperature: f64, mode: UserMode) -> (ZoneController, Arc<SimulatedDevice>) {
        let device = Arc::new(SimulatedDevice::new(temperature));
        let settings = Arc::new(ConfigStore::in_memory(UserSettings {
            mode,
            setpoint: 72.0,
            ..UserSettings::default()
        }));
        let params = ZoneParams {
            deadband: 0.1,
            stage2_range: 2.0,
            min_dwell: DWELL,
        };
        let zone = ZoneController::new(3, device.clone(), settings, params).unwrap();
        (zone, device)
    }

    #[test]
    fn test_priority_scales_with_error() {
        let (zone, _) = controller(72.0, UserMode::Cool);
        assert_eq!(zone.priority(72.0), MIN_PRIORITY);
        assert_eq!(zone.priority(72.05), MIN_PRIORITY, "inside deadband");
        assert_eq!(zone.priority(72.5), 3);
        assert_eq!(zone.priority(73.0), 5);
        assert_eq!(zone.priority(74.0), MAX_PRIORITY);
        assert_eq!(zone.priority(90.0), MAX_PRIORITY);
    }

    #[test]
    fn test_priority_respects_user_mode() {
        let (cool, _) = controller(72.0, UserMode::Cool);
        assert_eq!(cool.priority(70.0), MIN_PRIORITY);

        let (heat, _) = controller(72.0, UserMode::Heat);
        assert_eq!(heat.priority(70.0), MAX_PRIORITY);
        assert_eq!(heat.priority(75.0), MIN_PRIORITY);

        let (off, _) = controller(72.0, UserMode::Off);
        assert_eq!(off.priority(75.0), MIN_PRIORITY);
    }

    #[test]
    fn test_target_stage() {
        let (zone, _) = controller(72.0, UserMode::Cool);
        assert_eq!(zone.target_stage(73.0), Mode::Cool1);
        assert_eq!(zone.target_stage(74.5), Mode::Cool2);
        assert_eq!(zone.target_stage(72.0), Mode::Off);
        assert_eq!(zone.target_stage(65.0), Mode::Off);

        zone.settings.update(Setting::Mode(UserMode::Heat)).unwrap();
        assert_eq!(zone.target_stage(71.0), Mode::Heat1);
        assert_eq!(zone.target_stage(65.0), Mode::Heat2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dwell_gates_activation() {
        let (mut zone, device) = controller(73.0, UserMode::Cool);
        let start = Instant::now();
        assert!(!zone.can_switch(start));

        assert_eq!(zone.activate(start).unwrap(), SwitchOutcome::Dwelling);
        assert_eq!(device.current_mode(), Mode::Off);

        tokio::time::advance(DWELL + Duration::from_secs(1)).await;
        let now = Instant::now();
        assert_eq!(
            zone.activate(now).unwrap(),
            SwitchOutcome::Switched {
                from: Mode::Off,
                to: Mode::Cool1
            }
        );

        // Just switched, so shutdown has to wait
        assert_eq!(zone.shutdown(now).unwrap(), SwitchOutcome::Dwelling);
        assert_eq!(device.current_mode(), Mode::Cool1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_report() {
        let (mut zone, device) = controller(75.0, UserMode::Cool);
        tokio::time::advance(DWELL * 2).await;

        let report = zone.poll_report(Instant::now()).unwrap();
        assert_eq!(report.id, 3);
        assert_eq!(report.priority, MAX_PRIORITY);
        assert!(!report.is_on);
        assert!(report.can_switch);

        zone.activate(Instant::now()).unwrap();
        let report = zone.poll_report(Instant::now()).unwrap();
        assert!(report.is_on);
        assert_eq!(report.mode, Mode::Cool2);
        assert!(!report.can_switch);

        device.set_sensor_fault(true);
        assert!(zone.poll_report(Instant::now()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_mode_unchanged_keeps_dwell_clock() {
        let (mut zone, _) = controller(72.0, UserMode::Cool);
        tokio::time::advance(DWELL * 2).await;
        let now = Instant::now();

        assert_eq!(zone.set_mode(Mode::Off, now).unwrap(), SwitchOutcome::Unchanged);
        assert!(zone.can_switch(now));
    }
}
