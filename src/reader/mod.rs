//! Record sources: tokenizers that turn a delimited text file into fixed-width records.
//!
//! Two implementations sit behind the [`RecordSource`] trait:
//! - [`MappedReader`] maps the file in bounded windows and scans the mapped bytes
//!   directly. It handles files larger than any single mapping.
//! - [`BufferedReader`] streams through a buffered reader and transparently
//!   decompresses gzip/zstd input (see [`compression`]).
//!
//! Both share [`FieldScanner`], so they agree byte for byte on what a record is:
//! - the separator byte and the newline end a token;
//! - consecutive separators never produce empty fields;
//! - blank lines are skipped;
//! - a final line without a trailing newline is still a record;
//! - a line whose token count differs from the arity is rejected, and the source
//!   stays usable from the next line on.
//!
//! The arity is fixed when the source is opened, from the token count of the first
//! line.

pub mod buffered;
pub mod compression;
pub mod mapped;

pub use buffered::BufferedReader;
pub use mapped::MappedReader;

use crate::config::{ConfigError, LoaderConfig, ReaderKind};
use crate::error::{LoadError, LoadResult};
use std::io::BufRead;
use std::path::Path;

/// One line of raw field text, reused across records.
pub type RawRecord = Vec<String>;

/// A source of fixed-width raw records.
pub trait RecordSource: Send {
    /// Number of fields in every record.
    fn arity(&self) -> usize;

    /// Whether another record can be read.
    ///
    /// # Errors
    /// Returns [`LoadError::Io`] if the underlying input cannot be read or remapped.
    fn has_next(&mut self) -> LoadResult<bool>;

    /// Read the next record into `record`, reusing its strings.
    ///
    /// `record` is resized to the arity first.
    ///
    /// # Errors
    /// Returns [`LoadError::Exhausted`] when no record is left,
    /// [`LoadError::MalformedRecord`] for a rejected line (the source then continues
    /// with the following line), or [`LoadError::Io`].
    fn next_into(&mut self, record: &mut RawRecord) -> LoadResult<()>;

    /// Number of newline-terminated lines consumed so far.
    fn lines_read(&self) -> u64;

    /// Read the next record into a fresh buffer.
    ///
    /// # Errors
    /// See [`RecordSource::next_into`].
    fn next(&mut self) -> LoadResult<RawRecord> {
        let mut record = vec![String::new(); self.arity()];
        self.next_into(&mut record)?;
        Ok(record)
    }
}

/// Open the record source selected by `config.reader`.
///
/// # Errors
/// Returns a configuration error for an unusable separator, for an empty input, or
/// when compressed input is given to the mapped reader; I/O errors otherwise.
pub fn open_source(config: &LoaderConfig, path: &Path) -> LoadResult<Box<dyn RecordSource>> {
    let separator = config.separator_byte()?;
    let source: Box<dyn RecordSource> = match config.reader {
        ReaderKind::Mapped => {
            if let Some(codec) = compression::detect_codec(path)? {
                return Err(ConfigError::InvalidOption {
                    option: "reader",
                    reason: format!(
                        "{} is {codec}-compressed; use the buffered reader",
                        path.display()
                    ),
                }
                .into());
            }
            Box::new(MappedReader::open(path, separator, config.max_window_bytes)?)
        }
        ReaderKind::Buffered => Box::new(BufferedReader::open(path, separator)?),
    };
    log::info!(
        "reading {} with {} fields per record ({:?} reader)",
        path.display(),
        source.arity(),
        config.reader
    );
    Ok(source)
}

/// Count the tokens of the first line of `input`.
pub(crate) fn first_line_arity(mut input: impl BufRead, separator: u8) -> std::io::Result<usize> {
    let mut line = Vec::new();
    input.read_until(b'\n', &mut line)?;
    Ok(line
        .split(|&b| b == separator || b == b'\n')
        .filter(|token| !token.is_empty())
        .count())
}

/// Outcome of scanning a slice of input.
#[derive(Debug)]
pub(crate) enum Scan {
    /// A record was completed; the slice's first `usize` bytes were consumed.
    Complete(usize),
    /// The line was rejected after consuming `usize` bytes.
    Rejected(usize, LoadError),
    /// The whole slice was consumed without finishing a line.
    NeedMore,
}

/// Two-state (in token / between tokens) scanner shared by the record sources.
///
/// The scanner keeps the bytes of an unfinished token, so a token cut by the end of a
/// slice (a mapping window, a read buffer) is reassembled on the next call.
#[derive(Debug)]
pub struct FieldScanner {
    separator: u8,
    arity: usize,
    token: Vec<u8>,
    in_token: bool,
    column: usize,
    extra_fields: usize,
    invalid: Option<String>,
    lines: u64,
}

impl FieldScanner {
    #[must_use]
    pub fn new(separator: u8, arity: usize) -> Self {
        Self {
            separator,
            arity,
            token: Vec::with_capacity(64),
            in_token: false,
            column: 0,
            extra_fields: 0,
            invalid: None,
            lines: 0,
        }
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.arity
    }

    #[must_use]
    pub fn lines(&self) -> u64 {
        self.lines
    }

    fn is_idle(&self) -> bool {
        !self.in_token && self.column == 0 && self.extra_fields == 0
    }

    fn is_delimiter(&self, b: u8) -> bool {
        b == self.separator || b == b'\n'
    }

    /// Consume leading separators and blank lines while no record is in progress.
    /// Returns the number of bytes consumed.
    pub(crate) fn skip_blank(&mut self, bytes: &[u8]) -> usize {
        if !self.is_idle() {
            return 0;
        }
        let mut n = 0;
        for &b in bytes {
            if !self.is_delimiter(b) {
                break;
            }
            if b == b'\n' {
                self.lines += 1;
            }
            n += 1;
        }
        n
    }

    /// Scan `bytes`, storing finished tokens into `record`.
    pub(crate) fn scan(&mut self, bytes: &[u8], record: &mut RawRecord) -> Scan {
        let mut start = 0;
        for (i, &b) in bytes.iter().enumerate() {
            if self.is_delimiter(b) {
                if self.in_token {
                    self.token.extend_from_slice(&bytes[start..i]);
                    self.end_token(record);
                }
                if b == b'\n' {
                    match self.end_line() {
                        Ok(true) => return Scan::Complete(i + 1),
                        Ok(false) => {}
                        Err(e) => return Scan::Rejected(i + 1, e),
                    }
                }
            } else if !self.in_token {
                self.in_token = true;
                start = i;
            }
        }
        if self.in_token {
            self.token.extend_from_slice(&bytes[start..]);
        }
        Scan::NeedMore
    }

    /// Close the record in progress at end of input.
    ///
    /// Returns `Ok(true)` if a record was completed, `Ok(false)` if nothing was pending.
    pub(crate) fn finish(&mut self, record: &mut RawRecord) -> LoadResult<bool> {
        if self.in_token {
            self.end_token(record);
        }
        if self.is_idle() && self.invalid.is_none() {
            return Ok(false);
        }
        let line = self.lines + 1;
        self.check_and_reset(line)?;
        Ok(true)
    }

    fn end_token(&mut self, record: &mut RawRecord) {
        self.in_token = false;
        if self.column >= self.arity {
            self.extra_fields += 1;
        } else {
            match std::str::from_utf8(&self.token) {
                Ok(text) => {
                    log::trace!("scanned {text:?}");
                    let field = &mut record[self.column];
                    field.clear();
                    field.push_str(text);
                }
                Err(e) => {
                    if self.invalid.is_none() {
                        self.invalid = Some(format!("field {} is not UTF-8: {e}", self.column));
                    }
                }
            }
            self.column += 1;
        }
        self.token.clear();
    }

    fn end_line(&mut self) -> LoadResult<bool> {
        self.lines += 1;
        if self.is_idle() && self.invalid.is_none() {
            return Ok(false);
        }
        self.check_and_reset(self.lines)?;
        Ok(true)
    }

    fn check_and_reset(&mut self, line: u64) -> LoadResult<()> {
        let found = self.column + self.extra_fields;
        let invalid = self.invalid.take();
        self.column = 0;
        self.extra_fields = 0;
        if found != self.arity {
            return Err(LoadError::MalformedRecord {
                line,
                reason: format!("expected {} fields, found {found}", self.arity),
            });
        }
        if let Some(reason) = invalid {
            return Err(LoadError::MalformedRecord { line, reason });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(input: &[u8], arity: usize) -> Vec<LoadResult<RawRecord>> {
        let mut scanner = FieldScanner::new(b',', arity);
        let mut out = Vec::new();
        let mut rest = input;
        loop {
            let skipped = scanner.skip_blank(rest);
            rest = &rest[skipped..];
            let mut record = vec![String::new(); arity];
            match scanner.scan(rest, &mut record) {
                Scan::Complete(n) => {
                    out.push(Ok(record));
                    rest = &rest[n..];
                }
                Scan::Rejected(n, e) => {
                    out.push(Err(e));
                    rest = &rest[n..];
                }
                Scan::NeedMore => {
                    match scanner.finish(&mut record) {
                        Ok(true) => out.push(Ok(record)),
                        Ok(false) => {}
                        Err(e) => out.push(Err(e)),
                    }
                    return out;
                }
            }
        }
    }

    #[test]
    fn repeated_separators_and_blank_lines_are_skipped() {
        let out = scan_all(b"a,,b\n\n,,c,d,\nx,y", 2);
        let rows: Vec<RawRecord> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(
            rows,
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string(), "d".to_string()],
                vec!["x".to_string(), "y".to_string()],
            ]
        );
    }

    #[test]
    fn wrong_width_rejects_the_line_and_resumes() {
        let out = scan_all(b"1,2\n3\n4,5,6\n7,8\n", 2);
        assert_eq!(out.len(), 4);
        assert!(out[0].is_ok());
        assert!(matches!(out[1], Err(LoadError::MalformedRecord { line: 2, .. })));
        assert!(matches!(out[2], Err(LoadError::MalformedRecord { line: 3, .. })));
        assert_eq!(out[3].as_ref().unwrap(), &vec!["7".to_string(), "8".to_string()]);
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let out = scan_all(b"ok,\xff\xfe\n", 2);
        assert!(matches!(out[0], Err(LoadError::MalformedRecord { line: 1, .. })));
    }

    #[test]
    fn first_line_arity_ignores_repeated_separators() {
        let arity = first_line_arity(&b"1,,2,3,\n4,5,6\n"[..], b',').unwrap();
        assert_eq!(arity, 3);
    }
}
