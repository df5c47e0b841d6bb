//! Samples an SDS011 particulate sensor over serial and uploads every reading
//! to a Firestore collection.

#[macro_use]
extern crate enum_primitive;

pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod firestore;
pub mod measurement;
pub mod sampler;
pub mod sensor;
pub mod store;

pub use clock::{Clock, SystemClock};
pub use config::{Backend, Config};
pub use error::{ConfigError, Error, Result, SensorError, StoreError};
pub use firestore::FirestoreStore;
pub use measurement::{Reading, Sample};
pub use sampler::{Phase, Sampler};
pub use sensor::{Sds011, Sensor};
pub use store::{CsvStore, Store};
