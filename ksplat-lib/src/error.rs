use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SplatError {
    #[error("Failed to parse PLY data: {0}")]
    ParsePly(String),

    #[error("Failed to parse .splat data: {0}")]
    ParseSplatFile(String),

    #[error("Unsupported scene format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid splat buffer header: {0}")]
    InvalidHeader(String),

    #[error("Splat attribute arrays have mismatched lengths: {0}")]
    MismatchedArrays(String),

    #[error("Invalid compression options: {0}")]
    InvalidCompressionOptions(String),

    #[error("{what} index {index} is out of range (len {len})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        len: usize,
    },

    #[error("Variable-length integer does not fit in 64 bits")]
    VarintOverflow,

    #[error("Fixed-point depth overflow: {0}")]
    DepthOverflow(String),

    #[error("Invalid sort request: {0}")]
    InvalidSortRequest(String),

    #[error("A sort is already in flight (generation {0})")]
    SortInFlight(u64),

    #[error("The sort worker is no longer running")]
    WorkerDisconnected,

    #[error("The sort worker queue is full")]
    WorkerQueueFull,

    #[error("Distance precompute pass failed: {0}")]
    DistancePass(String),

    #[error("Zstandard compression failed: {0}")]
    ZstdCompress(String),

    #[error("Zstandard decompression failed: {0}")]
    ZstdDecompress(String),

    #[error("Invalid scene bundle: {0}")]
    InvalidBundle(String),

    #[error("The scene contains no splats.")]
    EmptyScene,

    #[error("An I/O error occurred: {0}")]
    Io(#[from] io::Error),
}

pub(crate) fn check_index(what: &'static str, index: usize, len: usize) -> Result<(), SplatError> {
    if index < len {
        Ok(())
    } else {
        Err(SplatError::IndexOutOfRange { what, index, len })
    }
}
