//! Error types for seqcache

use thiserror::Error;

/// Result type alias for seqcache operations
pub type Result<T> = std::result::Result<T, SeqCacheError>;

/// Error types that can occur in seqcache
#[derive(Debug, Error)]
pub enum SeqCacheError {
    /// Input handle could not be opened or probed
    #[error("invalid stream handle for {path}: {source}")]
    InvalidStreamHandle {
        /// Path (or handle description) that failed to open
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// I/O or decode failure while refilling from the stream
    #[error("stream read error: {0}")]
    StreamRead(#[from] std::io::Error),

    /// Invalid FASTA format
    #[error("invalid FASTA format: {msg}")]
    InvalidFastaFormat {
        /// What was malformed
        msg: String,
    },

    /// Invalid FASTQ format
    #[error("invalid FASTQ format: {msg}")]
    InvalidFastqFormat {
        /// What was malformed
        msg: String,
    },

    /// The input begins with neither a FASTA nor a FASTQ record sigil
    #[error("unrecognized read format: first content byte {found:#04x}")]
    UnknownReadFormat {
        /// The first logical content byte observed
        found: u8,
    },

    /// A segment was consumed outside the access protocol
    ///
    /// Raised when bytes are requested from a segment that is not
    /// available; the caller should have observed `has_more_data` first.
    #[error("cache segment unavailable to thread {thread_id}")]
    CacheSegmentUnavailable {
        /// Worker id whose segment was not available
        thread_id: u32,
    },

    /// `split_at` was called with an offset outside the live segment
    #[error("cache segment boundary violation: split at {pos} but segment ends at {size}")]
    CacheSegmentBoundaryViolation {
        /// Requested split offset
        pos: u64,
        /// Current stitched segment size
        size: u64,
    },

    /// The requested cache geometry cannot hold even one record per thread
    #[error("invalid cache size requested: {requested} bytes for {threads} threads (minimum {minimum})")]
    InvalidCacheSizeRequested {
        /// Total cache size requested
        requested: u64,
        /// Number of worker threads requested
        threads: u32,
        /// Minimum acceptable total size
        minimum: u64,
    },

    /// Terminal signal: the stream is exhausted and every record was emitted
    #[error("no more reads available")]
    NoMoreReads,
}

impl SeqCacheError {
    /// True for the terminal exhaustion signal, which callers usually treat
    /// as end-of-iteration rather than a failure.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SeqCacheError::NoMoreReads)
    }
}
