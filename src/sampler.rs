use std::time::Duration;

use chrono::prelude::*;
use log::{info, trace, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{ConfigError, Result};
use crate::measurement::Reading;
use crate::sensor::Sensor;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Reading,
    Uploading,
}

/// Reads the sensor and uploads the result once per period.
///
/// There is no retry: the first failing read or write ends [`Sampler::run`].
pub struct Sampler<S, T, C> {
    sensor: S,
    store: T,
    clock: C,
    period: Duration,
    cycles: Option<u64>,
    device_label: Option<String>,
    phase: Phase,
    last_timestamp: Option<DateTime<Utc>>,
}

impl<S: Sensor, T: Store, C: Clock> Sampler<S, T, C> {
    /// Fails when `period` is zero.
    pub fn new(period: Duration, sensor: S, store: T, clock: C) -> Result<Self> {
        if period.is_zero() {
            return Err(ConfigError("sampling period must be positive".into()).into());
        }
        Ok(Sampler {
            sensor,
            store,
            clock,
            period,
            cycles: None,
            device_label: None,
            phase: Phase::Idle,
            last_timestamp: None,
        })
    }

    pub fn from_config(config: &Config, sensor: S, store: T, clock: C) -> Result<Self> {
        let mut sampler = Sampler::new(config.sampling_period, sensor, store, clock)?;
        sampler.cycles = config.cycles;
        sampler.device_label = config.device_label.clone();
        Ok(sampler)
    }

    pub fn cycles(mut self, cycles: u64) -> Self {
        self.cycles = Some(cycles);
        self
    }

    pub fn device_label(mut self, label: &str) -> Self {
        self.device_label = Some(label.to_string());
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn into_parts(self) -> (S, T, C) {
        (self.sensor, self.store, self.clock)
    }

    fn enter(&mut self, phase: Phase) {
        trace!("{:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Capture time, bumped by a microsecond if the clock has not moved forward.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = self.clock.now();
        let timestamp = match self.last_timestamp {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(timestamp);
        timestamp
    }

    /// One read followed by one write.
    pub fn cycle(&mut self) -> Result<Reading> {
        self.enter(Phase::Reading);
        let sample = self.sensor.read()?;
        let timestamp = self.stamp();
        let device = match &self.device_label {
            Some(label) => label.clone(),
            None => sample.device_hex(),
        };
        let reading = Reading::new(&sample, device, timestamp);
        info!(
            "At {}  PM2.5: {} µg/m³, PM10: {} µg/m³",
            reading.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            reading.pm2_5,
            reading.pm10
        );

        self.enter(Phase::Uploading);
        self.store.write(&reading)?;
        self.enter(Phase::Idle);
        Ok(reading)
    }

    /// Loops until the cycle limit is reached or a read or write fails.
    ///
    /// Cycles start on `start + k * period`; boundaries already passed when a
    /// cycle ends are skipped rather than caught up.
    pub fn run(&mut self) -> Result<u64> {
        let start = self.clock.now();
        let period = self.period.as_nanos();
        let mut completed: u64 = 0;
        // index of the boundary the next cycle is scheduled on
        let mut next_boundary: u128 = 1;
        loop {
            self.cycle()?;
            completed += 1;
            if Some(completed) == self.cycles {
                return Ok(completed);
            }

            let elapsed = (self.clock.now() - start)
                .to_std()
                .unwrap_or_default()
                .as_nanos();
            let due = elapsed / period + 1;
            if due > next_boundary {
                warn!(
                    "cycle {} overran the {:?} period, skipping {} boundary(ies)",
                    completed,
                    self.period,
                    due - next_boundary
                );
                next_boundary = due;
            }
            let wait = (next_boundary * period).saturating_sub(elapsed);
            self.clock.sleep(Duration::from_nanos(wait.min(u128::from(u64::MAX)) as u64));
            next_boundary += 1;
        }
    }
}
