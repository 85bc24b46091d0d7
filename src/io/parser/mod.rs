//! Record parsers: per-thread state machines over the segment cache
//!
//! Each worker thread drives a [`ReadWorker`], which pulls bytes from its
//! own cache segment and emits one [`SequenceRead`] per
//! [`get_next_read`] call. The FASTA and FASTQ variants share the line
//! primitive and the segment-entry policy defined here and differ only in
//! how a record is laid out.
//!
//! # Record boundary policy
//!
//! On the first call into a freshly filled segment, a worker may be
//! positioned mid-record. If the segment carries a copyaside prefix it
//! begins exactly at a record start and is parsed normally. Otherwise the
//! worker scans forward to the first record start (`>` or a structurally
//! verified `@` at a line boundary), cedes everything before it to the
//! predecessor's rendezvous, and parses from there. A worker whose own
//! final record overruns its segment calls `split_at` at the record start
//! and either hands the head to the next fill or reclaims the ceded tail
//! and finishes the record itself. Every record is parsed exactly once.
//!
//! [`get_next_read`]: ReadWorker::get_next_read

mod fasta;
mod fastq;

pub use fasta::Fasta;
pub use fastq::Fastq;

use crate::error::{Result, SeqCacheError};
use crate::io::cache::{CacheManager, CacheSegmentStats, SegmentHandle};
use crate::io::stream::StreamReader;
use crate::types::SequenceRead;
use std::fs::File;
use std::marker::PhantomData;
use std::path::Path;

/// Default total cache size handed to [`CacheManager`] by the factory
pub const DEFAULT_CACHE_SIZE: u64 = 4 * 1024 * 1024;

/// Size of the per-worker read-ahead buffer
const READAHEAD_SIZE: usize = 127;

/// Cumulative per-worker parse counters
#[derive(Debug, Clone, Copy, Default)]
pub struct ParserStats {
    /// Lines pulled through the line primitive, including scan lines
    pub numlines_copied: u64,
    /// Parse attempts that produced a read or a format error
    pub numreads_parsed_total: u64,
    /// Parse attempts that produced a read
    pub numreads_parsed_valid: u64,
}

impl ParserStats {
    /// Fold another worker's counters into this one
    pub fn accumulate(&mut self, other: &ParserStats) {
        self.numlines_copied += other.numlines_copied;
        self.numreads_parsed_total += other.numreads_parsed_total;
        self.numreads_parsed_valid += other.numreads_parsed_valid;
    }
}

/// What one `copy_line` call did
#[derive(Debug, Clone, Copy)]
pub(crate) struct LineOutcome {
    /// Bytes advanced past, terminator included
    pub consumed: u64,
    /// False when the segment ran out before a newline
    pub terminated: bool,
}

/// One line observed during a segment-entry scan
#[doc(hidden)]
pub struct ScanLine {
    /// Stitched position of the line's first byte
    pub pos: u64,
    /// Whether that position is known to begin a line
    pub at_line_start: bool,
    /// Line content, terminators stripped
    pub bytes: Vec<u8>,
}

/// Result of one record parse attempt
#[doc(hidden)]
pub enum ParseOutcome {
    /// A record was assembled
    Read(SequenceRead),
    /// The record starting at `record_start` overran the segment and the
    /// boundary protocol must run before anything else is parsed
    Overrun {
        /// Stitched position where the unfinished record begins
        record_start: u64,
    },
    /// Only trailing filler remained; the segment is spent
    Drained,
}

/// A record layout: FASTA or FASTQ
///
/// The two implementations share the worker core; this trait carries only
/// the layout-specific pieces, dispatched statically.
pub trait RecordFormat {
    /// Format name used in factory errors
    const NAME: &'static str;

    /// Parse one record at the worker's current position
    #[doc(hidden)]
    fn parse_record(core: &mut WorkerCore) -> Result<ParseOutcome>;

    /// Feed one line to the entry scan; returns a verified record start
    #[doc(hidden)]
    fn scan_push(window: &mut Vec<ScanLine>, line: ScanLine) -> Option<u64>;

    /// Best unverified candidate once the scan ran out of bytes
    #[doc(hidden)]
    fn scan_pending(window: &[ScanLine]) -> Option<u64>;
}

// Split header content (sigil already stripped) into name and annotations
// at the first whitespace; None on invalid UTF-8.
pub(crate) fn split_header(bytes: &[u8]) -> Option<(String, String)> {
    let text = std::str::from_utf8(bytes).ok()?;
    match text.find(char::is_whitespace) {
        Some(i) => {
            let (name, rest) = text.split_at(i);
            let mut chars = rest.chars();
            chars.next();
            Some((name.to_string(), chars.as_str().to_string()))
        }
        None => Some((text.to_string(), String::new())),
    }
}

// Short lossy rendering of raw bytes for error messages.
pub(crate) fn preview(bytes: &[u8]) -> String {
    const LIMIT: usize = 24;
    let text = String::from_utf8_lossy(&bytes[..bytes.len().min(LIMIT)]);
    if bytes.len() > LIMIT {
        format!("{}...", text)
    } else {
        text.into_owned()
    }
}

// ---------------------------------------------------------------------------
// Worker core: read-ahead, line primitive, entry policy
// ---------------------------------------------------------------------------

/// Per-worker scratch shared by both format variants
#[doc(hidden)]
pub struct WorkerCore {
    cache: SegmentHandle,
    buffer: [u8; READAHEAD_SIZE],
    buffer_pos: usize,
    buffer_rem: usize,
    /// Current line accumulator, terminators stripped
    line: Vec<u8>,
    /// Fill id this worker last entered, None before the first segment
    entered_fill: Option<u64>,
    stats: ParserStats,
}

impl WorkerCore {
    fn new(cache: SegmentHandle) -> Self {
        Self {
            cache,
            buffer: [0u8; READAHEAD_SIZE],
            buffer_pos: 0,
            buffer_rem: 0,
            line: Vec::with_capacity(256),
            entered_fill: None,
            stats: ParserStats::default(),
        }
    }

    /// Stitched position of the next unconsumed byte
    pub(crate) fn parser_pos(&self) -> u64 {
        self.cache.whereis_cursor() - self.buffer_rem as u64
    }

    pub(crate) fn reset_readahead(&mut self) {
        self.buffer_pos = 0;
        self.buffer_rem = 0;
        self.line.clear();
    }

    /// True when exhausting the current stitched bytes ends the record's
    /// byte supply for good
    pub(crate) fn at_terminus(&self) -> bool {
        self.cache.at_segment_terminus()
    }

    pub(crate) fn line_bytes(&self) -> &[u8] {
        &self.line
    }

    pub(crate) fn take_line(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.line)
    }

    /// Look at the next byte without consuming it; None when the segment
    /// has run out
    pub(crate) fn peek_byte(&mut self) -> Result<Option<u8>> {
        if self.buffer_rem == 0 {
            let n = self.cache.get_bytes(&mut self.buffer)?;
            self.buffer_pos = 0;
            self.buffer_rem = n;
            if n == 0 {
                return Ok(None);
            }
        }
        Ok(Some(self.buffer[self.buffer_pos]))
    }

    /// Fill the line accumulator up to and including the next newline
    ///
    /// Line terminators (`\r\n` or `\n`) are stripped from the content but
    /// counted into the returned byte tally.
    pub(crate) fn copy_line(&mut self) -> Result<LineOutcome> {
        self.line.clear();
        let mut consumed = 0u64;
        let terminated = loop {
            if self.buffer_rem == 0 {
                let n = self.cache.get_bytes(&mut self.buffer)?;
                self.buffer_pos = 0;
                self.buffer_rem = n;
                if n == 0 {
                    break false;
                }
            }
            let window = &self.buffer[self.buffer_pos..self.buffer_pos + self.buffer_rem];
            match window.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    self.line.extend_from_slice(&window[..i]);
                    self.buffer_pos += i + 1;
                    self.buffer_rem -= i + 1;
                    consumed += (i + 1) as u64;
                    break true;
                }
                None => {
                    self.line.extend_from_slice(window);
                    consumed += window.len() as u64;
                    self.buffer_pos += window.len();
                    self.buffer_rem = 0;
                }
            }
        };
        if terminated && self.line.last() == Some(&b'\r') {
            self.line.pop();
        }
        self.stats.numlines_copied += 1;
        Ok(LineOutcome {
            consumed,
            terminated,
        })
    }

    /// Run the fresh-segment entry policy if this call crossed a fill
    fn ensure_entry<F: RecordFormat>(&mut self) -> Result<()> {
        let fill = self.cache.fill_id();
        if self.entered_fill == Some(fill) {
            return Ok(());
        }
        self.entered_fill = Some(fill);

        // Fill 0 begins at stream byte 0; a copyaside prefix begins at a
        // record start. Both are clean entries.
        if fill == 0 || self.cache.is_cursor_in_ca_buffer() {
            return Ok(());
        }

        // Raw entry: everything before the first record start continues a
        // record owned by the previous fill's consumer.
        let mut window: Vec<ScanLine> = Vec::new();
        let mut at_line_start = self.cache.prev_fill_ended_with_newline();
        let found = loop {
            let pos = self.parser_pos();
            let outcome = self.copy_line()?;
            if outcome.consumed == 0 && !outcome.terminated {
                break F::scan_pending(&window);
            }
            let scan_line = ScanLine {
                pos,
                at_line_start,
                bytes: self.take_line(),
            };
            if let Some(rs) = F::scan_push(&mut window, scan_line) {
                break Some(rs);
            }
            if !outcome.terminated {
                break F::scan_pending(&window);
            }
            at_line_start = true;
        };

        let cut = found.unwrap_or_else(|| self.cache.whereis_cursor());
        self.cache.cede_prefix(cut)?;
        self.reset_readahead();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker and parser fronts
// ---------------------------------------------------------------------------

/// One worker thread's handle onto a parser
///
/// Workers are `Send`; move each one onto its thread and call
/// [`get_next_read`] in a loop, or use the [`Iterator`] impl, which maps
/// the terminal condition to `None` and passes format errors through as
/// `Err` items so the caller can skip past a bad record and keep going.
///
/// [`get_next_read`]: ReadWorker::get_next_read
pub struct ReadWorker<F: RecordFormat> {
    core: WorkerCore,
    _format: PhantomData<fn() -> F>,
}

impl<F: RecordFormat> ReadWorker<F> {
    fn new(cache: SegmentHandle) -> Self {
        Self {
            core: WorkerCore::new(cache),
            _format: PhantomData,
        }
    }

    /// Worker id in `[0, N)`
    pub fn thread_id(&self) -> u32 {
        self.core.cache.thread_id()
    }

    /// Parse and return the next record owned by this worker
    ///
    /// Blocks while this worker's segment awaits its refill turn and inside
    /// the termination barrier. Returns [`SeqCacheError::NoMoreReads`] once
    /// the stream is exhausted; format errors leave the worker positioned
    /// after the bad record so the call can be retried.
    pub fn get_next_read(&mut self) -> Result<SequenceRead> {
        loop {
            if self.core.buffer_rem == 0 && !self.core.cache.has_more_data()? {
                return Err(SeqCacheError::NoMoreReads);
            }
            self.core.ensure_entry::<F>()?;
            if self.core.peek_byte()?.is_none() {
                // Entry ceded the whole segment; refill and go again.
                continue;
            }
            match F::parse_record(&mut self.core) {
                Ok(ParseOutcome::Read(read)) => {
                    self.core.stats.numreads_parsed_total += 1;
                    self.core.stats.numreads_parsed_valid += 1;
                    return Ok(read);
                }
                Ok(ParseOutcome::Overrun { record_start }) => {
                    self.core.cache.split_at(record_start)?;
                    self.core.reset_readahead();
                }
                Ok(ParseOutcome::Drained) => continue,
                Err(e) => {
                    self.core.stats.numreads_parsed_total += 1;
                    return Err(e);
                }
            }
        }
    }

    /// True once the stream is exhausted and this worker's bytes are spent
    ///
    /// Blocks in the termination barrier like [`get_next_read`] does.
    ///
    /// [`get_next_read`]: ReadWorker::get_next_read
    pub fn is_complete(&mut self) -> Result<bool> {
        if self.core.buffer_rem > 0 {
            return Ok(false);
        }
        Ok(!self.core.cache.has_more_data()?)
    }

    /// Cumulative parse counters for this worker
    pub fn stats(&self) -> ParserStats {
        self.core.stats
    }

    /// Cumulative cache counters for this worker's segment
    pub fn cache_stats(&self) -> CacheSegmentStats {
        self.core.cache.stats()
    }
}

impl<F: RecordFormat> Iterator for ReadWorker<F> {
    type Item = Result<SequenceRead>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.get_next_read() {
            Ok(read) => Some(Ok(read)),
            Err(e) if e.is_terminal() => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// A multi-threaded parser over one input stream
///
/// Construction wires a [`StreamReader`] into a [`CacheManager`] and
/// pre-allocates one worker slot per thread id; [`workers`] hands the
/// slots out exactly once.
///
/// [`workers`]: Parser::workers
pub struct Parser<F: RecordFormat> {
    manager: CacheManager,
    workers: Option<Vec<ReadWorker<F>>>,
}

/// Parser over FASTA input
pub type FastaParser = Parser<Fasta>;
/// Parser over FASTQ input
pub type FastqParser = Parser<Fastq>;

impl<F: RecordFormat> Parser<F> {
    /// Build a parser over an already-sniffed stream
    pub fn new(stream: StreamReader, number_of_threads: u32, cache_size: u64) -> Result<Self> {
        let mut manager = CacheManager::new(stream, number_of_threads, cache_size)?;
        let workers = manager
            .segments()
            .into_iter()
            .map(ReadWorker::new)
            .collect();
        Ok(Self {
            manager,
            workers: Some(workers),
        })
    }

    /// Open a path, sniff the transport, and build a parser
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        number_of_threads: u32,
        cache_size: u64,
    ) -> Result<Self> {
        Self::new(StreamReader::open(path)?, number_of_threads, cache_size)
    }

    /// Sniff a pre-opened handle and build a parser
    pub fn from_file(file: File, number_of_threads: u32, cache_size: u64) -> Result<Self> {
        Self::new(StreamReader::from_file(file)?, number_of_threads, cache_size)
    }

    /// Take the per-thread workers; yields them exactly once
    pub fn workers(&mut self) -> Vec<ReadWorker<F>> {
        self.workers.take().unwrap_or_default()
    }

    /// Copyaside fragments left behind at shutdown
    pub fn orphaned_fragments(&self) -> usize {
        self.manager.orphaned_fragments()
    }

    /// Total segment refills performed
    pub fn fill_count(&self) -> u64 {
        self.manager.fill_count()
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// A parser of whichever format the factory sniffed
pub enum ReadParser {
    /// The input began with `>`
    Fasta(FastaParser),
    /// The input began with `@`
    Fastq(FastqParser),
}

impl std::fmt::Debug for ReadParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadParser::Fasta(_) => f.debug_tuple("Fasta").finish(),
            ReadParser::Fastq(_) => f.debug_tuple("Fastq").finish(),
        }
    }
}

/// A worker of whichever format the factory sniffed
pub enum AnyReadWorker {
    /// Worker over FASTA input
    Fasta(ReadWorker<Fasta>),
    /// Worker over FASTQ input
    Fastq(ReadWorker<Fastq>),
}

impl ReadParser {
    /// Take the per-thread workers; yields them exactly once
    pub fn workers(&mut self) -> Vec<AnyReadWorker> {
        match self {
            ReadParser::Fasta(p) => p.workers().into_iter().map(AnyReadWorker::Fasta).collect(),
            ReadParser::Fastq(p) => p.workers().into_iter().map(AnyReadWorker::Fastq).collect(),
        }
    }

    /// Copyaside fragments left behind at shutdown
    pub fn orphaned_fragments(&self) -> usize {
        match self {
            ReadParser::Fasta(p) => p.orphaned_fragments(),
            ReadParser::Fastq(p) => p.orphaned_fragments(),
        }
    }
}

impl AnyReadWorker {
    /// Parse and return the next record owned by this worker
    pub fn get_next_read(&mut self) -> Result<SequenceRead> {
        match self {
            AnyReadWorker::Fasta(w) => w.get_next_read(),
            AnyReadWorker::Fastq(w) => w.get_next_read(),
        }
    }

    /// True once the stream is exhausted and this worker's bytes are spent
    pub fn is_complete(&mut self) -> Result<bool> {
        match self {
            AnyReadWorker::Fasta(w) => w.is_complete(),
            AnyReadWorker::Fastq(w) => w.is_complete(),
        }
    }
}

impl Iterator for AnyReadWorker {
    type Item = Result<SequenceRead>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            AnyReadWorker::Fasta(w) => w.next(),
            AnyReadWorker::Fastq(w) => w.next(),
        }
    }
}

/// Open `path`, sniff transport and format, and build the right parser
///
/// The first logical content byte selects the variant: `>` for FASTA, `@`
/// for FASTQ. An empty input builds a FASTA parser whose workers report
/// completion immediately; any other first byte is
/// [`SeqCacheError::UnknownReadFormat`].
pub fn get_parser<P: AsRef<Path>>(
    path: P,
    number_of_threads: u32,
    cache_size: u64,
) -> Result<ReadParser> {
    let path = path.as_ref();
    let mut probe = StreamReader::open(path)?;
    let mut first = [0u8; 1];
    let n = probe.read_into_cache(&mut first)?;
    drop(probe);

    match (n, first[0]) {
        (0, _) | (_, b'>') => Ok(ReadParser::Fasta(FastaParser::from_path(
            path,
            number_of_threads,
            cache_size,
        )?)),
        (_, b'@') => Ok(ReadParser::Fastq(FastqParser::from_path(
            path,
            number_of_threads,
            cache_size,
        )?)),
        (_, other) => Err(SeqCacheError::UnknownReadFormat { found: other }),
    }
}
