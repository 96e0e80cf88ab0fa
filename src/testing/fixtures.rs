//! Input files for tests.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Write `contents` to `dir/name` and return the path.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_input(dir: &Path, name: &str, contents: impl AsRef<[u8]>) -> Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Write `contents` to `input.csv` in a fresh temporary directory.
///
/// Keep the returned [`TempDir`] alive for as long as the file is needed.
///
/// # Errors
/// Returns an error if the directory or the file cannot be created.
pub fn temp_input(contents: impl AsRef<[u8]>) -> Result<(TempDir, PathBuf)> {
    let dir = tempfile::tempdir().context("create temp dir")?;
    let path = write_input(dir.path(), "input.csv", contents)?;
    Ok((dir, path))
}

/// `rows` lines of `cols` integers; the value at row `r`, column `c` is `r * cols + c`.
#[must_use]
pub fn numeric_rows(rows: usize, cols: usize, separator: char) -> String {
    let mut out = String::with_capacity(rows * cols * 8);
    for r in 0..rows {
        for c in 0..cols {
            if c > 0 {
                out.push(separator);
            }
            let _ = write!(out, "{}", r * cols + c);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_rows_layout() {
        assert_eq!(numeric_rows(2, 3, ';'), "0;1;2\n3;4;5\n");
    }
}
