use std::io;

use thiserror::Error;

use crate::commands::Command;

/// Failures while talking to the particle sensor.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("serial port error: {0}")]
    Serial(#[from] serial::Error),
    #[error("serial i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("no frame received from sensor within the read timeout")]
    Timeout,
    #[error("invalid checksum: computed {expected:#04x}, frame carried {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },
    #[error("malformed frame: {0}")]
    Frame(String),
    #[error("reply to {expected:?} carried command byte {actual:#04x}")]
    UnexpectedReply { expected: Command, actual: u8 },
}

/// Failures while writing a reading to the remote store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("http request failed: {0}")]
    Http(#[from] Box<ureq::Error>),
    #[error("store rejected write with status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("bad credentials: {0}")]
    Credentials(String),
    #[error("authorization failed: {0}")]
    Auth(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<ureq::Error> for StoreError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, response) => {
                let body = response.into_string().unwrap_or_default();
                StoreError::Status { code, body }
            }
            other => StoreError::Http(Box::new(other)),
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Everything that can stop the sampling loop.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("sensor read failed: {0}")]
    Sensor(#[from] SensorError),
    #[error("upload failed: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, Error>;
