use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use log::debug;

use crate::error::StoreError;
use crate::measurement::Reading;

/// Destination for uploaded readings.
pub trait Store {
    /// Durably stores one reading. Called exactly once per captured reading.
    fn write(&mut self, reading: &Reading) -> Result<(), StoreError>;
}

impl<S: Store + ?Sized> Store for Box<S> {
    fn write(&mut self, reading: &Reading) -> Result<(), StoreError> {
        (**self).write(reading)
    }
}

/// Appends readings as CSV rows, flushing after each one.
pub struct CsvStore<W: Write> {
    writer: csv::Writer<W>,
}

impl CsvStore<File> {
    /// Opens `path` for appending; the header row is written only to a new or empty file.
    pub fn append(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let has_rows = file.metadata()?.len() > 0;
        debug!("appending readings to {}", path.display());
        let writer = csv::WriterBuilder::new()
            .has_headers(!has_rows)
            .from_writer(file);
        Ok(CsvStore { writer })
    }
}

impl<W: Write> CsvStore<W> {
    pub fn from_writer(inner: W) -> Self {
        CsvStore {
            writer: csv::Writer::from_writer(inner),
        }
    }

    /// Flushes buffered rows and returns the underlying writer.
    pub fn into_inner(self) -> Result<W, StoreError> {
        self.writer
            .into_inner()
            .map_err(|err| StoreError::Io(err.into_error()))
    }
}

impl<W: Write> Store for CsvStore<W> {
    fn write(&mut self, reading: &Reading) -> Result<(), StoreError> {
        self.writer.serialize(reading)?;
        self.writer.flush()?;
        Ok(())
    }
}
