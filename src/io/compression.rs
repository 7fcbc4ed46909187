//! Compression detection for line-oriented inputs and gzip framing for shards.
//!
//! Readers are wrapped transparently: the codec is picked from the file
//! extension first and from the leading magic bytes when the extension says
//! nothing. Output shards are always gzip; [`gzip_writer`] builds the
//! streaming encoder with the run's compression level.
//!
//! ## Built-in Codecs
//! - **Gzip** (`.gz`, `.gzip`) via `flate2`. Multi-member streams (several
//!   gzip files concatenated, as the archive assembler produces) decode as
//!   one stream.
//! - **Zstd** (`.zst`, `.zstd`) via `zstd` (feature: `compression-zstd`).

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

/// Compression applied to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    #[cfg(feature = "compression-zstd")]
    Zstd,
}

impl Compression {
    const DETECTABLE: &'static [Compression] = &[
        Compression::Gzip,
        #[cfg(feature = "compression-zstd")]
        Compression::Zstd,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            #[cfg(feature = "compression-zstd")]
            Self::Zstd => "zstd",
        }
    }

    fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::None => &[],
            Self::Gzip => &[".gz", ".gzip"],
            #[cfg(feature = "compression-zstd")]
            Self::Zstd => &[".zst", ".zstd"],
        }
    }

    fn magic_bytes(self) -> &'static [u8] {
        match self {
            Self::None => &[],
            Self::Gzip => &[0x1f, 0x8b],
            #[cfg(feature = "compression-zstd")]
            Self::Zstd => &[0x28, 0xb5, 0x2f, 0xfd],
        }
    }

    /// Codec implied by the path's extension (case-insensitive).
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let lower = path.as_ref().to_string_lossy().to_lowercase();
        Self::DETECTABLE
            .iter()
            .copied()
            .find(|c| c.extensions().iter().any(|ext| lower.ends_with(ext)))
    }

    fn from_magic(head: &[u8]) -> Option<Self> {
        Self::DETECTABLE
            .iter()
            .copied()
            .find(|c| head.starts_with(c.magic_bytes()))
    }

    /// Wrap `reader` with the matching decompressor.
    ///
    /// # Errors
    /// Propagates decoder construction failures.
    pub fn wrap_reader(self, reader: Box<dyn Read>) -> std::io::Result<Box<dyn Read>> {
        match self {
            Self::None => Ok(reader),
            Self::Gzip => Ok(Box::new(MultiGzDecoder::new(reader))),
            #[cfg(feature = "compression-zstd")]
            Self::Zstd => {
                zstd::stream::read::Decoder::new(reader).map(|d| Box::new(d) as Box<dyn Read>)
            }
        }
    }
}

/// Detect compression and wrap a reader with the matching decompressor.
///
/// Detection strategy:
/// 1. file path extension
/// 2. magic bytes at the head of the stream
/// 3. otherwise the stream is returned as-is (buffered)
///
/// # Errors
/// Fails if the decompressor cannot be set up.
pub fn auto_detect_reader<R: Read + 'static>(
    reader: R,
    path_hint: impl AsRef<Path>,
) -> Result<Box<dyn Read>> {
    if let Some(codec) = Compression::from_path(&path_hint) {
        return codec
            .wrap_reader(Box::new(reader))
            .with_context(|| format!("wrap reader with {} codec", codec.name()));
    }

    let mut buffered = BufReader::new(reader);
    let detected = {
        let head = buffered.fill_buf().context("peek stream header")?;
        Compression::from_magic(head)
    };
    match detected {
        Some(codec) => codec
            .wrap_reader(Box::new(buffered))
            .with_context(|| format!("wrap reader with {} codec", codec.name())),
        None => Ok(Box::new(buffered)),
    }
}

/// Open a file for line reading, decompressing if needed.
///
/// # Errors
/// Fails if the file cannot be opened or its codec set up.
pub fn open_lines(path: impl AsRef<Path>) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let rdr = auto_detect_reader(f, path)
        .with_context(|| format!("setup decompression for {}", path.display()))?;
    Ok(Box::new(BufReader::new(rdr)))
}

/// Streaming gzip encoder at `level` (clamped to 0..=9).
///
/// The header carries no timestamp, so identical input yields identical bytes.
pub fn gzip_writer<W: Write>(inner: W, level: u32) -> GzEncoder<W> {
    flate2::GzBuilder::new()
        .mtime(0)
        .write(inner, flate2::Compression::new(level.min(9)))
}
