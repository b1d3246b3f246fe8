//! Append-only progress log shared by the train and eval phases

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;

/// Line-oriented log sink, flushed after every line
pub struct ProgressLog {
    writer: Box<dyn Write + Send>,
    path: Option<PathBuf>,
}

impl ProgressLog {
    /// Open (or create) `path` for appending; the file is held for the whole run
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file: File = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: Box::new(BufWriter::new(file)),
            path: Some(path),
        })
    }

    /// Log into an arbitrary writer
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self { writer, path: None }
    }

    /// Discard lines; they still reach `tracing`
    pub fn sink() -> Self {
        Self::new(Box::new(std::io::sink()))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn line(&mut self, line: &str) -> Result<()> {
        info!("{}", line);
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        Ok(())
    }
}
