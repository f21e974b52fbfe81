//! Cluster handlers bridging the sensor state to rs-matter's data model.

pub mod soil_measurement;

pub use soil_measurement::SoilMeasurementHandler;
