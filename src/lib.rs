//! Matter soil-moisture sensor.
//!
//! A commissionable Matter node that samples a capacitive soil probe and
//! serves the measurement through the SoilMeasurement cluster, with a
//! fabric capacity guard, ACL bootstrap and full factory-wipe support.

#![recursion_limit = "256"]

pub mod app;
pub mod config;
pub mod error;
pub mod fabric;
pub mod matter;
pub mod sensors;
pub mod storage;
