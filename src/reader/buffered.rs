//! Buffered streaming record source.
//!
//! Reads through a `BufRead` instead of a mapping, which makes it usable for inputs
//! that cannot be mapped: compressed files (decompressed on the fly via
//! [`auto_detect_reader`]) and arbitrary streams handed to [`BufferedReader::from_reader`].

use crate::config::ConfigError;
use crate::error::{LoadError, LoadResult};
use crate::reader::compression::auto_detect_reader;
use crate::reader::{FieldScanner, RawRecord, RecordSource, Scan, first_line_arity};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

const READ_BUFFER_BYTES: usize = 1 << 20;

/// Line reader over a buffered (possibly decompressing) stream.
pub struct BufferedReader {
    path: PathBuf,
    input: BufReader<Box<dyn Read + Send>>,
    scanner: FieldScanner,
}

impl BufferedReader {
    /// Open `path`, detecting compression from its extension or magic bytes.
    ///
    /// The first line is read once through its own stream to fix the arity.
    ///
    /// # Errors
    /// Returns [`LoadError::Io`] if the file cannot be opened or decoded, and
    /// [`ConfigError::EmptyInput`] if its first line holds no field.
    pub fn open(path: impl AsRef<Path>, separator: u8) -> LoadResult<Self> {
        let path = path.as_ref().to_path_buf();
        let arity = first_line_arity(BufReader::new(open_decoded(&path)?), separator)
            .map_err(|e| LoadError::io(&path, e))?;
        if arity == 0 {
            return Err(ConfigError::EmptyInput(path).into());
        }
        let input = open_decoded(&path)?;
        Ok(Self {
            path,
            input: BufReader::with_capacity(READ_BUFFER_BYTES, input),
            scanner: FieldScanner::new(separator, arity),
        })
    }

    /// Wrap an already open stream with a known arity.
    pub fn from_reader(input: impl Read + Send + 'static, separator: u8, arity: usize) -> Self {
        Self {
            path: PathBuf::from("<stream>"),
            input: BufReader::with_capacity(READ_BUFFER_BYTES, Box::new(input)),
            scanner: FieldScanner::new(separator, arity),
        }
    }
}

fn open_decoded(path: &Path) -> LoadResult<Box<dyn Read + Send>> {
    let f = File::open(path).map_err(|e| LoadError::io(path, e))?;
    auto_detect_reader(f, path).map_err(|e| LoadError::io(path, std::io::Error::other(e)))
}

impl RecordSource for BufferedReader {
    fn arity(&self) -> usize {
        self.scanner.arity()
    }

    fn has_next(&mut self) -> LoadResult<bool> {
        loop {
            let buf = self
                .input
                .fill_buf()
                .map_err(|e| LoadError::io(&self.path, e))?;
            if buf.is_empty() {
                return Ok(false);
            }
            let len = buf.len();
            let skipped = self.scanner.skip_blank(buf);
            self.input.consume(skipped);
            if skipped < len {
                return Ok(true);
            }
        }
    }

    fn next_into(&mut self, record: &mut RawRecord) -> LoadResult<()> {
        if !self.has_next()? {
            return Err(LoadError::Exhausted);
        }
        record.resize(self.scanner.arity(), String::new());
        loop {
            let buf = self
                .input
                .fill_buf()
                .map_err(|e| LoadError::io(&self.path, e))?;
            if buf.is_empty() {
                break;
            }
            match self.scanner.scan(buf, record) {
                Scan::Complete(n) => {
                    self.input.consume(n);
                    return Ok(());
                }
                Scan::Rejected(n, e) => {
                    self.input.consume(n);
                    return Err(e);
                }
                Scan::NeedMore => {
                    let len = buf.len();
                    self.input.consume(len);
                }
            }
        }
        if self.scanner.finish(record)? {
            Ok(())
        } else {
            Err(LoadError::Exhausted)
        }
    }

    fn lines_read(&self) -> u64 {
        self.scanner.lines()
    }
}
