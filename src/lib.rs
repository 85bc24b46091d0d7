//! seqcache: multi-threaded streaming FASTA/FASTQ parsing
//!
//! # Overview
//!
//! seqcache reads sequencing records from a raw, gzip-, or bzip2-compressed
//! byte stream and distributes them among worker threads with no record
//! ever split across threads and none lost or duplicated. A shared cache
//! manager refills one private byte segment per worker in strict rotation;
//! records straddling segment boundaries are stitched back together through
//! a copyaside store, so the set of emitted reads is identical for any
//! thread count.
//!
//! ## Quick start
//!
//! ```no_run
//! use seqcache::FastqParser;
//!
//! # fn main() -> seqcache::Result<()> {
//! let mut parser = FastqParser::from_path("reads.fq.gz", 4, 4 * 1024 * 1024)?;
//!
//! std::thread::scope(|scope| {
//!     for worker in parser.workers() {
//!         scope.spawn(move || {
//!             for read in worker {
//!                 let read = read.expect("malformed record");
//!                 // process one read at a time
//!                 let _ = read.sequence.len();
//!             }
//!         });
//!     }
//! });
//! # Ok(())
//! # }
//! ```
//!
//! ## Module organization
//!
//! - [`io::stream`]: transport sniffing and the blocking fill primitive
//! - [`io::cache`]: the per-thread segment cache and copyaside store
//! - [`io::parser`]: FASTA/FASTQ state machines and the format factory
//! - [`io::writer`]: round-trip record writers

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod io;
pub mod types;

// Re-export commonly used types
pub use error::{Result, SeqCacheError};
pub use io::{
    get_parser, AnyReadWorker, FastaParser, FastaWriter, FastqParser, FastqWriter, ReadParser,
    ReadWorker, StreamReader, DEFAULT_CACHE_SIZE,
};
pub use types::SequenceRead;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
