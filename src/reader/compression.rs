//! Pluggable decompression for the buffered record source.
//!
//! Codecs are looked up in a global registry, by file extension first and by magic
//! bytes when the extension says nothing. Built-in codecs depend on feature flags:
//! - **Gzip** (`.gz`, `.gzip`) via `flate2` (feature `compression-gzip`)
//! - **Zstd** (`.zst`, `.zstd`) via `zstd` (feature `compression-zstd`)
//!
//! Only the buffered reader decompresses. The mapped reader scans raw file bytes, so
//! the loader refuses compressed input for it.
//!
//! ```
//! use ringload::reader::compression::{register_codec, CompressionCodec};
//! use std::io::Read;
//! use std::sync::Arc;
//!
//! struct Identity;
//! impl CompressionCodec for Identity {
//!     fn name(&self) -> &str { "identity" }
//!     fn extensions(&self) -> &[&str] { &[".id"] }
//!     fn magic_bytes(&self) -> Option<&[u8]> { None }
//!     fn wrap_reader_dyn(
//!         &self,
//!         r: Box<dyn Read + Send>,
//!     ) -> std::io::Result<Box<dyn Read + Send>> {
//!         Ok(r)
//!     }
//! }
//!
//! register_codec(Arc::new(Identity));
//! ```

use crate::error::{LoadError, LoadResult};
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::{Arc, RwLock};

static CODEC_REGISTRY: RwLock<Option<Vec<Arc<dyn CompressionCodec>>>> = RwLock::new(None);

fn init_registry() -> Vec<Arc<dyn CompressionCodec>> {
    vec![
        #[cfg(feature = "compression-gzip")]
        Arc::new(GzipCodec),
        #[cfg(feature = "compression-zstd")]
        Arc::new(ZstdCodec),
    ]
}

fn get_registry() -> Vec<Arc<dyn CompressionCodec>> {
    let mut lock = CODEC_REGISTRY
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    lock.get_or_insert_with(init_registry).clone()
}

/// Register a custom codec alongside the built-in ones.
pub fn register_codec(codec: Arc<dyn CompressionCodec>) {
    let mut lock = CODEC_REGISTRY
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    lock.get_or_insert_with(init_registry).push(codec);
}

/// A decompression algorithm the buffered reader can stream through.
pub trait CompressionCodec: Send + Sync {
    /// Human-readable codec name (e.g. "gzip").
    fn name(&self) -> &str;

    /// Lowercase file extensions including the leading dot.
    fn extensions(&self) -> &[&str];

    /// Signature at the start of the stream, if the format has one.
    fn magic_bytes(&self) -> Option<&[u8]>;

    /// Wrap `reader` so reads yield decompressed bytes.
    fn wrap_reader_dyn(&self, reader: Box<dyn Read + Send>) -> std::io::Result<Box<dyn Read + Send>>;
}

fn detect_from_extension(path: &Path) -> Option<Arc<dyn CompressionCodec>> {
    let name = path.to_string_lossy().to_lowercase();
    get_registry()
        .into_iter()
        .find(|codec| codec.extensions().iter().any(|ext| name.ends_with(ext)))
}

fn detect_from_magic(head: &[u8]) -> Option<Arc<dyn CompressionCodec>> {
    if head.is_empty() {
        return None;
    }
    get_registry().into_iter().find(|codec| {
        codec
            .magic_bytes()
            .is_some_and(|magic| head.starts_with(magic))
    })
}

/// Name of the codec `path` is compressed with, if any.
///
/// # Errors
/// Returns [`LoadError::Io`] if the file header cannot be read.
pub fn detect_codec(path: &Path) -> LoadResult<Option<String>> {
    if let Some(codec) = detect_from_extension(path) {
        return Ok(Some(codec.name().to_string()));
    }
    let f = File::open(path).map_err(|e| LoadError::io(path, e))?;
    let mut head = Vec::with_capacity(16);
    f.take(16)
        .read_to_end(&mut head)
        .map_err(|e| LoadError::io(path, e))?;
    Ok(detect_from_magic(&head).map(|codec| codec.name().to_string()))
}

/// Wrap `reader` with the decompressor matching `path_hint`, or return it as is.
///
/// # Errors
/// Returns an error if the stream header cannot be read or the codec rejects it.
pub fn auto_detect_reader<R: Read + Send + 'static>(
    reader: R,
    path_hint: impl AsRef<Path>,
) -> Result<Box<dyn Read + Send>> {
    if let Some(codec) = detect_from_extension(path_hint.as_ref()) {
        return codec
            .wrap_reader_dyn(Box::new(reader))
            .with_context(|| format!("wrap reader with {} codec", codec.name()));
    }

    let mut buf_reader = BufReader::new(reader);
    let head = buf_reader.fill_buf().context("peek stream header")?;
    if let Some(codec) = detect_from_magic(head) {
        return codec
            .wrap_reader_dyn(Box::new(buf_reader))
            .with_context(|| format!("wrap reader with {} codec", codec.name()));
    }
    Ok(Box::new(buf_reader))
}

#[cfg(feature = "compression-gzip")]
struct GzipCodec;

#[cfg(feature = "compression-gzip")]
impl CompressionCodec for GzipCodec {
    fn name(&self) -> &str {
        "gzip"
    }

    fn extensions(&self) -> &[&str] {
        &[".gz", ".gzip"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0x1f, 0x8b])
    }

    fn wrap_reader_dyn(&self, reader: Box<dyn Read + Send>) -> std::io::Result<Box<dyn Read + Send>> {
        use flate2::read::MultiGzDecoder;
        Ok(Box::new(MultiGzDecoder::new(reader)))
    }
}

#[cfg(feature = "compression-zstd")]
struct ZstdCodec;

#[cfg(feature = "compression-zstd")]
impl CompressionCodec for ZstdCodec {
    fn name(&self) -> &str {
        "zstd"
    }

    fn extensions(&self) -> &[&str] {
        &[".zst", ".zstd"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0x28, 0xb5, 0x2f, 0xfd])
    }

    fn wrap_reader_dyn(&self, reader: Box<dyn Read + Send>) -> std::io::Result<Box<dyn Read + Send>> {
        zstd::stream::read::Decoder::new(reader).map(|d| Box::new(d) as Box<dyn Read + Send>)
    }
}
