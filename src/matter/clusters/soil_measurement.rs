//! SoilMeasurement cluster handler.
//!
//! The SoilMeasurement cluster (0x0430) reports soil moisture as a percent
//! (0-100). The measurement limits attribute is a constant accuracy
//! descriptor; only the measured value changes at runtime.

use rs_matter::dm::{
    Access, Attribute, Cluster, Dataver, Handler, NonBlockingHandler, Quality, ReadContext,
    ReadReply, Reply, WriteContext,
};
use rs_matter::error::{Error, ErrorCode};
use rs_matter::tlv::{TLVTag, TLVWrite};
use rs_matter::{attribute_enum, attributes, with};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use strum::FromRepr;

use crate::sensors::SoilMoistureSensor;

/// Matter Cluster ID for SoilMeasurement
pub const CLUSTER_ID: u32 = 0x0430;

/// Cluster revision
pub const CLUSTER_REVISION: u16 = 1;

/// MeasurementTypeEnum value for soil moisture
const MEASUREMENT_TYPE_SOIL_MOISTURE: u16 = 0x0011;

/// Attribute IDs for the SoilMeasurement cluster
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromRepr)]
#[repr(u32)]
pub enum SoilMeasurementAttribute {
    /// Accuracy descriptor for the moisture measurement
    SoilMoistureMeasurementLimits = 0x0000,
    /// Measured soil moisture in percent
    SoilMoistureMeasuredValue = 0x0001,
}

attribute_enum!(SoilMeasurementAttribute);

/// Cluster metadata definition
pub const CLUSTER: Cluster<'static> = Cluster {
    id: CLUSTER_ID,
    revision: CLUSTER_REVISION,
    feature_map: 0,
    attributes: attributes!(
        Attribute::new(
            SoilMeasurementAttribute::SoilMoistureMeasurementLimits as _,
            Access::RV,
            Quality::F
        ),
        Attribute::new(
            SoilMeasurementAttribute::SoilMoistureMeasuredValue as _,
            Access::RV,
            Quality::NULLABLE
        ),
    ),
    commands: &[],
    with_attrs: with!(all),
    with_cmds: with!(all),
};

/// Handler that serves a SoilMeasurement cluster from a shared sensor cell.
pub struct SoilMeasurementHandler {
    dataver: Dataver,
    sensor: Arc<SoilMoistureSensor>,
    last_sensor_version: AtomicU32,
}

impl SoilMeasurementHandler {
    /// Cluster definition for use in the data model
    pub const CLUSTER: Cluster<'static> = CLUSTER;

    pub fn new(dataver: Dataver, sensor: Arc<SoilMoistureSensor>) -> Self {
        Self {
            dataver,
            sensor,
            last_sensor_version: AtomicU32::new(0),
        }
    }

    /// Sync dataver with sensor version for subscription updates.
    fn sync_dataver(&self) {
        let sensor_version = self.sensor.version();
        let last = self.last_sensor_version.load(Ordering::SeqCst);
        if sensor_version != last {
            self.last_sensor_version
                .store(sensor_version, Ordering::SeqCst);
            self.dataver.changed();
        }
    }

    fn read_impl(&self, ctx: impl ReadContext, reply: impl ReadReply) -> Result<(), Error> {
        self.sync_dataver();

        let attr = ctx.attr();

        let Some(mut writer) = reply.with_dataver(self.dataver.get())? else {
            return Ok(());
        };

        // Global attributes
        if attr.is_system() {
            return CLUSTER.read(attr, writer);
        }

        let tag = writer.tag();
        {
            let mut tw = writer.writer();

            match attr.attr_id.try_into()? {
                SoilMeasurementAttribute::SoilMoistureMeasurementLimits => {
                    // MeasurementAccuracyStruct, fixed for the device's
                    // lifetime: percent range 0-100, one accuracy range of
                    // +/- 5% over the whole span.
                    tw.start_struct(tag)?;
                    tw.u16(&TLVTag::Context(0), MEASUREMENT_TYPE_SOIL_MOISTURE)?;
                    tw.bool(&TLVTag::Context(1), true)?;
                    tw.i64(&TLVTag::Context(2), 0)?;
                    tw.i64(&TLVTag::Context(3), 100)?;
                    tw.start_array(&TLVTag::Context(4))?;
                    tw.start_struct(&TLVTag::Anonymous)?;
                    tw.i64(&TLVTag::Context(0), 0)?;
                    tw.i64(&TLVTag::Context(1), 100)?;
                    tw.u16(&TLVTag::Context(2), 500)?;
                    tw.end_container()?;
                    tw.end_container()?;
                    tw.end_container()?;
                }
                SoilMeasurementAttribute::SoilMoistureMeasuredValue => {
                    tw.u8(tag, self.sensor.percent())?;
                }
            }
        }

        writer.complete()
    }

    fn write_impl(&self, _ctx: impl WriteContext) -> Result<(), Error> {
        // Cluster is read-only
        Err(ErrorCode::UnsupportedAccess.into())
    }
}

impl Handler for SoilMeasurementHandler {
    fn read(&self, ctx: impl ReadContext, reply: impl ReadReply) -> Result<(), Error> {
        self.read_impl(ctx, reply)
    }

    fn write(&self, ctx: impl WriteContext) -> Result<(), Error> {
        self.write_impl(ctx)
    }
}

impl NonBlockingHandler for SoilMeasurementHandler {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measured_value_tracks_sensor_percent() {
        let sensor = SoilMoistureSensor::new();
        sensor.set_centi_percent(4150);
        assert_eq!(sensor.percent(), 41);
        sensor.set_centi_percent(0);
        assert_eq!(sensor.percent(), 0);
        sensor.set_centi_percent(10000);
        assert_eq!(sensor.percent(), 100);
    }
}
