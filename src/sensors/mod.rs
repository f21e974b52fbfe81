//! Soil probe sampling and the measurement model behind the Matter cluster.

pub mod bridge;
pub mod soil_moisture;

pub use bridge::{MoistureProbe, SensorBridge, SimulatedProbe};
pub use soil_moisture::{SoilCalibration, SoilMoistureSensor};
