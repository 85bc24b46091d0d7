//! I/O module: stream readers, the segment cache, parsers, and writers

pub mod cache;
pub mod parser;
pub mod stream;
pub mod writer;

pub use cache::{CacheManager, CacheSegmentStats, SegmentHandle, MIN_SEGMENT_SIZE};
pub use parser::{
    get_parser, AnyReadWorker, Fasta, FastaParser, Fastq, FastqParser, Parser, ParserStats,
    ReadParser, ReadWorker, RecordFormat, DEFAULT_CACHE_SIZE,
};
pub use stream::{StreamReader, StreamReaderStats};
pub use writer::{FastaWriter, FastqWriter};
