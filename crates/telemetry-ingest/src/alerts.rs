//! Optional alerts file: one line per generic event, for site operators who
//! tail a file instead of the bus.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::records::EventRecord;

/// Append-only mirror of generic events in a fixed space-separated format:
///
/// ```text
/// <ts> <Location> <MessageId> <Severity> "<Message>" <OriginOfCondition>
/// ```
#[derive(Debug)]
pub struct AlertsFile {
    path: PathBuf,
    file: File,
}

impl AlertsFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, event: &EventRecord) -> io::Result<()> {
        writeln!(
            self.file,
            "{} {} {} {} \"{}\" {}",
            event.timestamp,
            event.location,
            event.message_id,
            event.severity,
            event.message,
            event.origin_of_condition,
        )
    }
}
