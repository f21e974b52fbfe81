//! Device type definitions for the soil sensor node.

use rs_matter::dm::DeviceType;

/// Matter Soil Sensor device type (Matter 1.4 spec)
///
/// Device Type ID: 0x0045 (69 decimal)
/// Device Type Revision: 1
///
/// Required clusters:
/// - SoilMeasurement (0x0430)
/// - IdentifyCluster (standard)
/// - Descriptor (standard)
pub const DEV_TYPE_SOIL_SENSOR: DeviceType = DeviceType {
    dtype: 0x0045,
    drev: 1,
};
