//! Append-only CSV writer owning one output file

use crate::error::MonitorError;
use csv::{Writer, WriterBuilder};
use serde::Serialize;
use std::{
    fs::{self, File, OpenOptions},
    marker::PhantomData,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// A flat row type with a fixed column list.
///
/// `HEADER` must list the struct's fields in declaration order; `None`
/// fields are written as empty cells.
pub trait CsvRecord: Serialize {
    const HEADER: &'static [&'static str];
}

/// Append-only sink for rows of type `R`.
///
/// The header is written if and only if the file is empty when opened, so a
/// restarted sampler keeps appending to its previous output.
pub struct CsvSink<R> {
    path: PathBuf,
    writer: Writer<File>,
    rows: u64,
    _record: PhantomData<fn(&R)>,
}

impl<R: CsvRecord> CsvSink<R> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MonitorError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let has_content = file.metadata()?.len() > 0;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);

        if has_content {
            warn!(
                "Appending to existing {}; rows with seq=0 mark the restart",
                path.display()
            );
        } else {
            writer.write_record(R::HEADER)?;
            writer.flush()?;
            debug!("Initialized CSV at: {}", path.display());
        }

        Ok(Self {
            path,
            writer,
            rows: 0,
            _record: PhantomData,
        })
    }

    /// Write one row and flush it to disk.
    pub fn write(&mut self, row: &R) -> Result<(), MonitorError> {
        self.writer.serialize(row)?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), MonitorError> {
        self.writer.flush()?;
        debug!("Closed {} after {} rows", self.path.display(), self.rows);
        Ok(())
    }
}

/// Header the csv crate derives from `row`'s serde field names.
#[cfg(test)]
pub(crate) fn serde_header<R: Serialize>(row: &R) -> Vec<String> {
    let mut writer = WriterBuilder::new().has_headers(true).from_writer(vec![]);
    writer.serialize(row).unwrap();
    let bytes = writer.into_inner().unwrap();
    let text = String::from_utf8(bytes).unwrap();
    let first = text.lines().next().unwrap_or_default().to_string();
    first.split(',').map(str::to_string).collect()
}
