//! Soil-moisture value model: calibration mapping and the shared cell the
//! Matter cluster reads from.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use crate::config::SensorConfig;

/// Linear calibration from probe millivolts to percent moisture.
///
/// Capacitive probes read *lower* voltage the wetter the soil, so the dry
/// point is the higher voltage. Readings outside the calibrated span clamp
/// to the nearest bound.
#[derive(Debug, Clone, Copy)]
pub struct SoilCalibration {
    dry_mv: i32,
    wet_mv: i32,
}

impl SoilCalibration {
    pub fn new(dry_mv: i32, wet_mv: i32) -> Self {
        Self { dry_mv, wet_mv }
    }

    pub fn from_config(config: &SensorConfig) -> Self {
        Self::new(config.dry_millivolts, config.wet_millivolts)
    }

    /// Map a raw reading to hundredths of a percent (0..=10000).
    pub fn centi_percent(&self, millivolts: i32) -> u16 {
        let span = self.dry_mv - self.wet_mv;
        if span <= 0 {
            return 0;
        }

        let clamped = millivolts.clamp(self.wet_mv, self.dry_mv);
        let wetness = self.dry_mv - clamped;
        ((wetness as i64 * 10000) / span as i64) as u16
    }
}

/// Latest moisture measurement, shared between the sampling task and the
/// cluster handler.
///
/// The version counter bumps only when the stored value actually changes,
/// which is what drives report-on-change: the cluster's dataver follows
/// this counter, and an unchanged reading produces no subscription traffic.
#[derive(Default)]
pub struct SoilMoistureSensor {
    centi_percent: AtomicU16,
    version: AtomicU32,
}

impl SoilMoistureSensor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hundredths of a percent, 0..=10000. 0 doubles as the probe-failure
    /// sentinel.
    pub fn centi_percent(&self) -> u16 {
        self.centi_percent.load(Ordering::Relaxed)
    }

    /// Whole percent for the measured-value attribute.
    pub fn percent(&self) -> u8 {
        (self.centi_percent() / 100) as u8
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    /// Store a new measurement. Returns true when the value changed (and
    /// the version was bumped).
    pub fn set_centi_percent(&self, value: u16) -> bool {
        let prev = self.centi_percent.swap(value, Ordering::Relaxed);
        if prev != value {
            self.version.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}
