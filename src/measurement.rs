use chrono::prelude::*;
use serde_derive::{Deserialize, Serialize};

/// One decoded sensor frame, before it is stamped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub pm2_5: f64,
    pub pm10: f64,
    pub device_id: [u8; 2],
}

impl Sample {
    /// Device id as printed on the sensor label, e.g. `a160`.
    pub fn device_hex(&self) -> String {
        format!("{:02x}{:02x}", self.device_id[0], self.device_id[1])
    }
}

/// The record uploaded for every cycle. Concentrations are in µg/m³.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub device: String,
    pub pm2_5: f64,
    pub pm10: f64,
}

impl Reading {
    pub fn new(sample: &Sample, device: String, timestamp: DateTime<Utc>) -> Self {
        Reading {
            timestamp,
            device,
            pm2_5: sample.pm2_5,
            pm10: sample.pm10,
        }
    }
}
