//! Deflate codec for segment blobs.

use flate2::Compression;
use flate2::write::{DeflateDecoder, DeflateEncoder};
use std::io::{self, Write};

/// Codec name stored in `CachedCompression` metadata.
pub const DEFLATE: &str = "deflate";

/// Extensions of index components worth compressing.
pub const COMPRESSIBLE_EXTENSIONS: &[&str] = &[
    "cfs", "fdt", "fdx", "frq", "tis", "tii", "nrm", "tvx", "tvd", "tvf", "prx",
];

/// Whether `name` carries an extension on the compression allow-list.
pub fn is_compressible(name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(_, ext)| COMPRESSIBLE_EXTENSIONS.contains(&ext))
}

/// Deflate a buffer into memory.
///
/// The remote put needs the content length up front, so the whole
/// compressed body is built before upload.
pub fn deflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Incremental inflater for streamed downloads.
///
/// Output is handed back per chunk and nothing is sized from remote
/// metadata, so callers can bound what they accept.
pub struct Inflater {
    decoder: DeflateDecoder<Vec<u8>>,
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            decoder: DeflateDecoder::new(Vec::new()),
        }
    }

    /// Feed compressed bytes. Returns what they inflated to.
    pub fn update(&mut self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        self.decoder.write_all(chunk)?;
        Ok(std::mem::take(self.decoder.get_mut()))
    }

    /// End of input. Returns any remaining output.
    pub fn finish(self) -> io::Result<Vec<u8>> {
        self.decoder.finish()
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}
