//! Sensor bridge: periodic probe sampling into the shared measurement cell.
//!
//! The loop is deliberately dumb: read, calibrate, store, sleep. Change
//! detection lives in [`SoilMoistureSensor`]; a failed read stores the 0
//! sentinel so controllers see "bone dry / fault" instead of a stale value.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use log::{debug, info, warn};

use super::soil_moisture::{SoilCalibration, SoilMoistureSensor};
use crate::config::SensorConfig;
use crate::error::Result;

/// Seam over the moisture probe's ADC channel.
pub trait MoistureProbe: Send + Sync {
    fn read_millivolts(&self) -> Result<i32>;
}

/// Drives one probe into one measurement cell.
pub struct SensorBridge {
    probe: Arc<dyn MoistureProbe>,
    sensor: Arc<SoilMoistureSensor>,
    calibration: SoilCalibration,
    period: Duration,
}

impl SensorBridge {
    pub fn new(
        probe: Arc<dyn MoistureProbe>,
        sensor: Arc<SoilMoistureSensor>,
        config: &SensorConfig,
    ) -> Self {
        Self {
            probe,
            sensor,
            calibration: SoilCalibration::from_config(config),
            period: config.sample_period(),
        }
    }

    /// One sample: read, map, store. Returns true when the stored value
    /// changed. A probe failure is not an error for the caller.
    pub fn tick(&self) -> bool {
        let centi = match self.probe.read_millivolts() {
            Ok(mv) => {
                let centi = self.calibration.centi_percent(mv);
                debug!("Soil probe read {mv} mV -> {centi} centi-percent");
                centi
            }
            Err(err) => {
                warn!("Soil probe read failed, reporting 0: {err}");
                0
            }
        };

        let changed = self.sensor.set_centi_percent(centi);
        if changed {
            info!("Soil moisture changed to {}.{:02}%", centi / 100, centi % 100);
        }
        changed
    }

    /// Sampling loop. Runs until the task is dropped; the interval re-arms
    /// after failed reads the same as after successful ones.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.tick();
        }
    }
}

/// Deterministic stand-in for the hardware probe: a slow sawtooth sweep
/// from the dry endpoint down to the wet one, then back to dry.
pub struct SimulatedProbe {
    millivolts: AtomicI32,
    low_mv: i32,
    high_mv: i32,
}

impl SimulatedProbe {
    const STEP_MV: i32 = 25;

    pub fn new(config: &SensorConfig) -> Self {
        let low = config.dry_millivolts.min(config.wet_millivolts);
        let high = config.dry_millivolts.max(config.wet_millivolts);
        Self {
            millivolts: AtomicI32::new(high),
            low_mv: low,
            high_mv: high,
        }
    }
}

impl MoistureProbe for SimulatedProbe {
    fn read_millivolts(&self) -> Result<i32> {
        let current = self.millivolts.load(Ordering::Relaxed);
        let next = if current - Self::STEP_MV < self.low_mv {
            self.high_mv
        } else {
            current - Self::STEP_MV
        };
        self.millivolts.store(next, Ordering::Relaxed);
        Ok(current)
    }
}
