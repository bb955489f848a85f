// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Payloads for the sensor types a device ships with.
//!
//! Each type maps to its own table in both tiers; see [`SensorPayload`].

use serde::{Deserialize, Serialize};

use crate::reading::SensorPayload;

/// Temperature / humidity / pressure (I2C environmental sensor)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub temperature_c: f64,
    pub humidity_pct: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure_hpa: Option<f64>,
}

impl SensorPayload for Environment {
    const TABLE: &'static str = "environment_readings";
}

/// Air quality (serial gas sensor)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasLevels {
    pub co2_ppm: f64,
    pub tvoc_ppb: f64,
}

impl SensorPayload for GasLevels {
    const TABLE: &'static str = "gas_readings";
}

/// Position fix (serial GNSS receiver)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude_m: Option<f64>,
    pub satellites: u8,
}

impl SensorPayload for GpsFix {
    const TABLE: &'static str = "gps_readings";
}

/// Soil moisture and pH (BLE probe)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoilProbe {
    pub moisture_pct: f64,
    pub ph: f64,
    pub probe_address: String,
}

impl SensorPayload for SoilProbe {
    const TABLE: &'static str = "soil_readings";
}

/// Metadata of a captured camera frame; the frame itself is stored elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraFrame {
    pub width: u32,
    pub height: u32,
    pub frame_ref: String,
}

impl SensorPayload for CameraFrame {
    const TABLE: &'static str = "camera_frames";
}
