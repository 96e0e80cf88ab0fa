//! Memory-mapped record source with bounded windows.
//!
//! The file is mapped read-only one window at a time, `[position, position + size)`
//! with `size <= max_window_bytes`. When the scanner reaches the end of a window the
//! mapping is dropped and the next window is mapped; the scanner's pending token
//! carries over, so records and tokens that straddle a boundary come out whole.

use crate::error::{LoadError, LoadResult};
use crate::reader::{FieldScanner, RawRecord, RecordSource, Scan, first_line_arity};
use crate::config::ConfigError;
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Windowed memory-mapped line reader.
pub struct MappedReader {
    path: PathBuf,
    file: File,
    file_len: u64,
    max_window: u64,
    window: Option<Mmap>,
    /// File offset of the current window.
    window_start: u64,
    /// Cursor inside the current window.
    pos: usize,
    remaps: u64,
    scanner: FieldScanner,
}

impl MappedReader {
    /// Open `path` and map its first window.
    ///
    /// # Errors
    /// Returns [`LoadError::Io`] if the file cannot be opened or mapped, and
    /// [`ConfigError::EmptyInput`] if its first line holds no field.
    pub fn open(path: impl AsRef<Path>, separator: u8, max_window_bytes: u64) -> LoadResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| LoadError::io(&path, e))?;
        let file_len = file.metadata().map_err(|e| LoadError::io(&path, e))?.len();
        let arity = first_line_arity(BufReader::new(&file), separator)
            .map_err(|e| LoadError::io(&path, e))?;
        if arity == 0 {
            return Err(ConfigError::EmptyInput(path).into());
        }

        let mut reader = Self {
            path,
            file,
            file_len,
            max_window: max_window_bytes.max(1),
            window: None,
            window_start: 0,
            pos: 0,
            remaps: 0,
            scanner: FieldScanner::new(separator, arity),
        };
        reader.window = reader.map_window(0)?;
        Ok(reader)
    }

    /// Number of windows mapped after the first one.
    #[must_use]
    pub fn remaps(&self) -> u64 {
        self.remaps
    }

    fn map_window(&self, offset: u64) -> LoadResult<Option<Mmap>> {
        let size = self.max_window.min(self.file_len.saturating_sub(offset));
        if size == 0 {
            return Ok(None);
        }
        let len = usize::try_from(size).map_err(|_| {
            LoadError::io(
                &self.path,
                std::io::Error::other(format!("window of {size} bytes exceeds address space")),
            )
        })?;
        // SAFETY: the mapping is read-only and private to this reader. Truncating the
        // file while it is being loaded is unsupported, as with any mapped input.
        let mmap = unsafe { MmapOptions::new().offset(offset).len(len).map(&self.file) }
            .map_err(|e| LoadError::io(&self.path, e))?;
        Ok(Some(mmap))
    }

    /// Make sure the cursor points at an unread byte. Returns `false` at end of file.
    fn ensure_bytes(&mut self) -> LoadResult<bool> {
        loop {
            let Some(window) = &self.window else {
                return Ok(false);
            };
            if self.pos < window.len() {
                return Ok(true);
            }
            let next = self.window_start + window.len() as u64;
            // Drop the exhausted mapping before creating the next one.
            self.window = None;
            self.window_start = next;
            self.pos = 0;
            self.window = self.map_window(next)?;
            if let Some(w) = &self.window {
                self.remaps += 1;
                log::info!(
                    "remapped {} at position {} with size {}",
                    self.path.display(),
                    next,
                    w.len()
                );
            }
        }
    }
}

impl RecordSource for MappedReader {
    fn arity(&self) -> usize {
        self.scanner.arity()
    }

    fn has_next(&mut self) -> LoadResult<bool> {
        while self.ensure_bytes()? {
            let Some(window) = &self.window else {
                return Ok(false);
            };
            let rest = &window[self.pos..];
            let skipped = self.scanner.skip_blank(rest);
            self.pos += skipped;
            if skipped < rest.len() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn next_into(&mut self, record: &mut RawRecord) -> LoadResult<()> {
        if !self.has_next()? {
            return Err(LoadError::Exhausted);
        }
        record.resize(self.scanner.arity(), String::new());
        while self.ensure_bytes()? {
            let Some(window) = &self.window else {
                break;
            };
            match self.scanner.scan(&window[self.pos..], record) {
                Scan::Complete(n) => {
                    self.pos += n;
                    return Ok(());
                }
                Scan::Rejected(n, e) => {
                    self.pos += n;
                    return Err(e);
                }
                Scan::NeedMore => self.pos = window.len(),
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
