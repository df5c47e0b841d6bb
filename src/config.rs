use std::path::PathBuf;
use std::time::Duration;

use clap::{App, Arg, ArgMatches};

use crate::commands::{ReportMode, MAX_DUTY_CYCLE};
use crate::error::ConfigError;

pub const DEVICE_PATH: &str = "DEVICE_PATH";
pub const DEFAULT_DEVICE_PATH: &str = "/dev/ttyUSB0";
pub const DEFAULT_PERIOD_SECS: &str = "60";
pub const DEFAULT_COLLECTION: &str = "readings";
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";
pub const EMULATOR_ENV: &str = "FIRESTORE_EMULATOR_HOST";

const PERIOD: &str = "period";
const COLLECTION: &str = "collection";
const CREDENTIALS: &str = "credentials";
const PROJECT: &str = "project";
const DEVICE_LABEL: &str = "device-label";
const CYCLES: &str = "cycles";
const ACTIVE_MODE: &str = "active-mode";
const TIMEOUT: &str = "timeout";
const HTTP_TIMEOUT: &str = "http-timeout";
const CSV: &str = "csv";

/// Where readings are written.
#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    Firestore {
        credentials: PathBuf,
        project: Option<String>,
    },
    Emulator {
        host: String,
        project: String,
    },
    Csv(PathBuf),
}

/// Start-up configuration; built once and handed to the sampler.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub device_path: PathBuf,
    pub sampling_period: Duration,
    pub collection: String,
    pub backend: Backend,
    /// Value for the `device` field; the sensor's own id when unset.
    pub device_label: Option<String>,
    /// Stop after this many uploads; run forever when unset.
    pub cycles: Option<u64>,
    pub report_mode: ReportMode,
    pub serial_timeout: Duration,
    pub http_timeout: Duration,
}

pub fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("sds011-uploader")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Chris Ballinger <chris@ballinger.io>")
        .about("Samples an SDS011 particle sensor and uploads each reading to Firestore")
        .arg(Arg::with_name(DEVICE_PATH)
            .help("Path to device e.g. /dev/ttyUSB0 (env DEVICE_PATH takes precedence)")
            .index(1))
        .arg(Arg::with_name(PERIOD)
            .long(PERIOD)
            .takes_value(true)
            .value_name("SECONDS")
            .help("Seconds between readings [env SAMPLING_PERIOD, default 60]"))
        .arg(Arg::with_name(COLLECTION)
            .long(COLLECTION)
            .takes_value(true)
            .help("Firestore collection [env FIRESTORE_COLLECTION, default readings]"))
        .arg(Arg::with_name(CREDENTIALS)
            .long(CREDENTIALS)
            .takes_value(true)
            .value_name("FILE")
            .help("Service account key file [env GOOGLE_APPLICATION_CREDENTIALS]"))
        .arg(Arg::with_name(PROJECT)
            .long(PROJECT)
            .takes_value(true)
            .help("Firestore project id [env FIRESTORE_PROJECT, default from key file]"))
        .arg(Arg::with_name(DEVICE_LABEL)
            .long(DEVICE_LABEL)
            .takes_value(true)
            .help("Value stored in each reading's device field [env DEVICE_LABEL]"))
        .arg(Arg::with_name(CYCLES)
            .long(CYCLES)
            .takes_value(true)
            .value_name("N")
            .help("Exit after N readings"))
        .arg(Arg::with_name(ACTIVE_MODE)
            .long(ACTIVE_MODE)
            .help("Let the sensor push readings on its own duty cycle instead of querying it"))
        .arg(Arg::with_name(TIMEOUT)
            .long(TIMEOUT)
            .takes_value(true)
            .value_name("SECONDS")
            .help("Serial reply timeout [default 2]"))
        .arg(Arg::with_name(HTTP_TIMEOUT)
            .long(HTTP_TIMEOUT)
            .takes_value(true)
            .value_name("SECONDS")
            .help("Upload request timeout [default 30]"))
        .arg(Arg::with_name(CSV)
            .long(CSV)
            .takes_value(true)
            .value_name("FILE")
            .help("Append readings to a CSV file instead of uploading"))
}

impl Config {
    /// Resolves options from parsed arguments and an environment lookup.
    pub fn from_matches<F>(matches: &ArgMatches, env: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |name: &str, var: &str| -> Option<String> {
            matches.value_of(name).map(String::from).or_else(|| env(var))
        };

        let device_path = env(DEVICE_PATH)
            .or_else(|| matches.value_of(DEVICE_PATH).map(String::from))
            .unwrap_or_else(|| String::from(DEFAULT_DEVICE_PATH));

        let period = pick(PERIOD, "SAMPLING_PERIOD").unwrap_or_else(|| DEFAULT_PERIOD_SECS.into());
        let sampling_period = parse_seconds(PERIOD, &period)?;

        let report_mode = if matches.is_present(ACTIVE_MODE) {
            ReportMode::Active
        } else {
            ReportMode::Query
        };
        if report_mode == ReportMode::Active {
            let secs = sampling_period.as_secs();
            let whole_minutes = sampling_period.subsec_nanos() == 0 && secs % 60 == 0;
            if !whole_minutes || secs == 0 || secs / 60 > u64::from(MAX_DUTY_CYCLE) {
                return Err(ConfigError(format!(
                    "active mode needs a period of whole minutes up to {} (got {}s)",
                    MAX_DUTY_CYCLE, period
                )));
            }
        }

        let collection = pick(COLLECTION, "FIRESTORE_COLLECTION")
            .unwrap_or_else(|| DEFAULT_COLLECTION.into());
        if collection.is_empty() || collection.contains('/') {
            return Err(ConfigError(format!("bad collection name {:?}", collection)));
        }

        let project = pick(PROJECT, "FIRESTORE_PROJECT");
        let backend = if let Some(csv) = matches.value_of(CSV) {
            Backend::Csv(PathBuf::from(csv))
        } else if let Some(host) = env(EMULATOR_ENV) {
            let project = project.ok_or_else(|| {
                ConfigError(format!("{} is set but no project was given", EMULATOR_ENV))
            })?;
            Backend::Emulator { host, project }
        } else {
            let credentials = pick(CREDENTIALS, CREDENTIALS_ENV).ok_or_else(|| {
                ConfigError(format!(
                    "no credentials: pass --credentials or set {}",
                    CREDENTIALS_ENV
                ))
            })?;
            Backend::Firestore {
                credentials: PathBuf::from(credentials),
                project,
            }
        };

        let cycles = match matches.value_of(CYCLES) {
            None => None,
            Some(text) => match text.parse::<u64>() {
                Ok(0) | Err(_) => {
                    return Err(ConfigError(format!(
                        "cycles must be a positive integer, got {:?}",
                        text
                    )))
                }
                Ok(n) => Some(n),
            },
        };

        Ok(Config {
            device_path: PathBuf::from(device_path),
            sampling_period,
            collection,
            backend,
            device_label: pick(DEVICE_LABEL, "DEVICE_LABEL").filter(|label| !label.is_empty()),
            cycles,
            report_mode,
            serial_timeout: parse_seconds(TIMEOUT, matches.value_of(TIMEOUT).unwrap_or("2"))?,
            http_timeout: parse_seconds(
                HTTP_TIMEOUT,
                matches.value_of(HTTP_TIMEOUT).unwrap_or("30"),
            )?,
        })
    }

    /// How long a single sensor read may block.
    ///
    /// In active mode the next frame can be a whole period away.
    pub fn frame_timeout(&self) -> Duration {
        match self.report_mode {
            ReportMode::Active => self.sampling_period + self.serial_timeout,
            ReportMode::Query => self.serial_timeout,
        }
    }

    /// Sensor duty cycle in minutes for active mode; 0 (continuous) in query mode.
    pub fn duty_cycle(&self) -> u8 {
        match self.report_mode {
            ReportMode::Active => {
                (self.sampling_period.as_secs() / 60).min(u64::from(MAX_DUTY_CYCLE)) as u8
            }
            ReportMode::Query => 0,
        }
    }
}

/// Parses a positive, representable, non-zero number of seconds.
fn parse_seconds(name: &str, text: &str) -> Result<Duration, ConfigError> {
    let parsed = text
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .filter(|duration| !duration.is_zero());
    parsed.ok_or_else(|| {
        ConfigError(format!(
            "{} must be a positive number of seconds, got {:?}",
            name, text
        ))
    })
}
