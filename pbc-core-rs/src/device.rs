//! Sensor/actuator capability of a zone

use crate::error::DeviceError;
use crate::types::Mode;
use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

/// Temperature sensor plus staged equipment
pub trait Device: Send + Sync {
    fn read_temperature(&self) -> Result<f64, DeviceError>;

    fn apply_mode(&self, mode: Mode) -> Result<(), DeviceError>;

    fn current_mode(&self) -> Mode;
}

#[derive(Debug)]
struct SimulatedState {
    temperature: f64,
    mode: Mode,
    sensor_fault: bool,
}

/// Stand-in device: a settable temperature with optional uniform noise
#[derive(Debug)]
pub struct SimulatedDevice {
    state: Mutex<SimulatedState>,
    noise: f64,
}

impl SimulatedDevice {
    pub fn new(temperature: f64) -> Self {
        Self {
            state: Mutex::new(SimulatedState {
                temperature,
                mode: Mode::Off,
                sensor_fault: false,
            }),
            noise: 0.0,
        }
    }

    /// Add `±noise` degrees to every reading
    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise.abs();
        self
    }

    pub fn set_temperature(&self, temperature: f64) {
        self.state.lock().temperature = temperature;
    }

    /// Make subsequent reads fail until cleared
    pub fn set_sensor_fault(&self, fault: bool) {
        self.state.lock().sensor_fault = fault;
    }
}

impl Device for SimulatedDevice {
    fn read_temperature(&self) -> Result<f64, DeviceError> {
        let state = self.state.lock();
        if state.sensor_fault {
            return Err(DeviceError::Sensor("simulated sensor fault".into()));
        }

        let offset = if self.noise > 0.0 {
            rand::thread_rng().gen_range(-self.noise..=self.noise)
        } else {
            0.0
        };
        Ok(state.temperature + offset)
    }

    fn apply_mode(&self, mode: Mode) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        debug!("Device: {} -> {}", state.mode, mode);
        state.mode = mode;
        Ok(())
    }

    fn current_mode(&self) -> Mode {
        self.state.lock().mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_bounded() {
        let device = SimulatedDevice::new(72.0).with_noise(0.5);
        for _ in 0..100 {
            let t = device.read_temperature().unwrap();
            assert!((71.5..=72.5).contains(&t));
        }
    }

    #[test]
    fn test_sensor_fault() {
        let device = SimulatedDevice::new(72.0);
        device.set_sensor_fault(true);
        assert!(matches!(device.read_temperature(), Err(DeviceError::Sensor(_))));
        device.set_sensor_fault(false);
        assert_eq!(device.read_temperature().unwrap(), 72.0);
    }
}
