//! Error types for the snapshot engine.

use std::io;
use thiserror::Error;

use crate::format::FormatError;

/// Result type alias for snapshot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for save/restore operations.
///
/// Everything is surfaced at the `save`/`load` operation boundary; nothing
/// is retried. A failed save leaves the file flagged delete-on-close, a
/// failed load leaves the VM in an undefined memory state.
#[derive(Error, Debug)]
pub enum Error {
    /// Save-file open/seek/read/write failures.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or out-of-range record, marker, or version.
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// A consumed hypervisor or device-model primitive reported failure.
    #[error("hypervisor call error: {0}")]
    Hypercall(#[from] HypercallError),

    /// Allocation failure for a scratch or index buffer.
    #[error("resource error: {0}")]
    Resource(String),

    /// Compressed data inconsistent with its declared output size.
    #[error("decompress error: {0}")]
    Decompress(#[from] DecompressError),

    /// The save was aborted or interrupted between page batches; the file
    /// is incomplete and must be discarded.
    #[error("save aborted")]
    Aborted,
}

/// Failure of a consumed primitive, carrying the primitive's own code.
///
/// Covers both the hypervisor call layer and the device-model state
/// serializer; the engine treats them uniformly as opaque collaborators.
#[derive(Error, Debug, Clone)]
#[error("{call} failed: {code}")]
pub struct HypercallError {
    /// Name of the failed primitive.
    pub call: &'static str,

    /// The primitive's own error code.
    pub code: i32,
}

impl HypercallError {
    /// Create an error for the named primitive.
    pub fn new(call: &'static str, code: i32) -> Self {
        Self { call, code }
    }
}

/// Decompression failures during load.
#[derive(Error, Debug)]
pub enum DecompressError {
    /// A per-page size prefix exceeds the page size.
    #[error("invalid compressed size {size} for page {pfn:#x}")]
    InvalidPageSize {
        /// Declared compressed size.
        size: u16,
        /// Guest frame the page belongs to.
        pfn: u32,
    },

    /// The compressed stream ended before all declared pages were decoded.
    #[error("compressed batch truncated at page {pfn:#x}: {have} of {need} bytes")]
    Truncated {
        /// Guest frame being decoded when the stream ran out.
        pfn: u32,
        /// Bytes remaining in the stream.
        have: usize,
        /// Bytes the size prefix declared.
        need: usize,
    },

    /// The decompressor produced a different size than declared.
    #[error("decompression of pages {first_pfn:#x}..{last_pfn:#x} produced {produced} of {expected} bytes")]
    SizeMismatch {
        /// First frame of the batch.
        first_pfn: u32,
        /// Last frame of the batch.
        last_pfn: u32,
        /// Bytes the decompressor produced.
        produced: usize,
        /// Bytes the batch declared.
        expected: usize,
    },

    /// The LZ4 block stream itself was invalid.
    #[error("lz4 block error: {0}")]
    Lz4(#[from] lz4_flex::block::DecompressError),
}
