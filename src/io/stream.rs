//! Stream readers: a uniform blocking fill primitive over three transports
//!
//! The cache manager consumes bytes through a single operation,
//! [`StreamReader::read_into_cache`], which fills a caller-owned slab as
//! fully as the stream allows. Transport selection is by magic-byte sniff:
//! `1F 8B` selects gzip, `BZh` selects bzip2, anything else is read raw.
//! The sniffed bytes are chained back in front of the transport so the
//! logical stream always starts at byte 0.

use crate::error::{Result, SeqCacheError};
use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::time::Instant;

/// Number of bytes sniffed from the head of the input
const MAGIC_LEN: usize = 4;

/// Cumulative counters for one stream reader
///
/// Plain additive fields, read at shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamReaderStats {
    /// Decompressed bytes handed to the cache
    pub numbytes_read: u64,
    /// Wall-clock nanoseconds spent inside `read_into_cache`
    pub clock_nsecs_reading: u64,
}

/// The sniffed head bytes replayed in front of the rest of the file
type SniffedInput = io::Chain<io::Cursor<Vec<u8>>, File>;

/// Byte source for the cache manager, chosen by magic-byte sniff
///
/// Dispatch is static over the three transports; no trait object is
/// involved on the refill path.
pub enum StreamReader {
    /// Uncompressed input
    Raw(RawStreamReader),
    /// Gzip-compressed input (possibly concatenated members)
    Gz(GzStreamReader),
    /// Bzip2-compressed input (possibly concatenated streams)
    Bz2(Bz2StreamReader),
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamReader::Raw(_) => f.debug_tuple("Raw").finish(),
            StreamReader::Gz(_) => f.debug_tuple("Gz").finish(),
            StreamReader::Bz2(_) => f.debug_tuple("Bz2").finish(),
        }
    }
}

/// Uncompressed transport
pub struct RawStreamReader {
    inner: SniffedInput,
    alignment: usize,
    at_eos: bool,
    stats: StreamReaderStats,
}

/// Gzip transport
pub struct GzStreamReader {
    inner: MultiGzDecoder<BufReader<SniffedInput>>,
    at_eos: bool,
    stats: StreamReaderStats,
}

/// Bzip2 transport
pub struct Bz2StreamReader {
    inner: MultiBzDecoder<BufReader<SniffedInput>>,
    at_eos: bool,
    stats: StreamReaderStats,
}

impl StreamReader {
    /// Open a path, sniff its head bytes, and select the transport
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| SeqCacheError::InvalidStreamHandle {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_file(file)
    }

    /// Sniff a pre-opened handle and select the transport
    ///
    /// The handle is consumed; the sniffed bytes are logically re-presented
    /// so the reader is positioned at byte 0 of content.
    pub fn from_file(mut file: File) -> Result<Self> {
        let mut magic = [0u8; MAGIC_LEN];
        let mut got = 0;
        while got < MAGIC_LEN {
            match file.read(&mut magic[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(SeqCacheError::InvalidStreamHandle {
                        path: "<handle>".to_string(),
                        source,
                    })
                }
            }
        }

        let replay = io::Cursor::new(magic[..got].to_vec()).chain(file);

        if got >= 2 && magic[0] == 0x1f && magic[1] == 0x8b {
            Ok(StreamReader::Gz(GzStreamReader {
                inner: MultiGzDecoder::new(BufReader::new(replay)),
                at_eos: false,
                stats: StreamReaderStats::default(),
            }))
        } else if got >= 3 && &magic[..3] == b"BZh" {
            Ok(StreamReader::Bz2(Bz2StreamReader {
                inner: MultiBzDecoder::new(BufReader::new(replay)),
                at_eos: false,
                stats: StreamReaderStats::default(),
            }))
        } else {
            Ok(StreamReader::Raw(RawStreamReader {
                inner: replay,
                alignment: 0,
                at_eos: false,
                stats: StreamReaderStats::default(),
            }))
        }
    }

    /// Fill `cache` from the stream, returning how many bytes were written
    ///
    /// Blocks until the buffer is full or end-of-stream; a short count
    /// means the stream ended and [`is_at_end_of_stream`] is now true.
    /// Decode and I/O failures surface as [`SeqCacheError::StreamRead`].
    ///
    /// [`is_at_end_of_stream`]: StreamReader::is_at_end_of_stream
    pub fn read_into_cache(&mut self, cache: &mut [u8]) -> Result<usize> {
        let start = Instant::now();
        let result = match self {
            StreamReader::Raw(r) => fill_from(&mut r.inner, cache, &mut r.at_eos),
            StreamReader::Gz(r) => fill_from(&mut r.inner, cache, &mut r.at_eos),
            StreamReader::Bz2(r) => fill_from(&mut r.inner, cache, &mut r.at_eos),
        };
        let elapsed = start.elapsed().as_nanos() as u64;

        let stats = self.stats_mut();
        stats.clock_nsecs_reading += elapsed;
        if let Ok(n) = result {
            stats.numbytes_read += n as u64;
        }
        result
    }

    /// Memory alignment this transport requires for its fill buffers
    ///
    /// Zero means no requirement. Compressed transports always declare 0.
    pub fn alignment(&self) -> usize {
        match self {
            StreamReader::Raw(r) => r.alignment,
            StreamReader::Gz(_) | StreamReader::Bz2(_) => 0,
        }
    }

    /// True once a read has observed the end of the stream
    pub fn is_at_end_of_stream(&self) -> bool {
        match self {
            StreamReader::Raw(r) => r.at_eos,
            StreamReader::Gz(r) => r.at_eos,
            StreamReader::Bz2(r) => r.at_eos,
        }
    }

    /// Cumulative read counters
    pub fn stats(&self) -> StreamReaderStats {
        match self {
            StreamReader::Raw(r) => r.stats,
            StreamReader::Gz(r) => r.stats,
            StreamReader::Bz2(r) => r.stats,
        }
    }

    fn stats_mut(&mut self) -> &mut StreamReaderStats {
        match self {
            StreamReader::Raw(r) => &mut r.stats,
            StreamReader::Gz(r) => &mut r.stats,
            StreamReader::Bz2(r) => &mut r.stats,
        }
    }
}

/// Read until `cache` is full or the source is exhausted
fn fill_from<R: Read>(reader: &mut R, cache: &mut [u8], at_eos: &mut bool) -> Result<usize> {
    if *at_eos {
        return Ok(0);
    }
    let mut filled = 0;
    while filled < cache.len() {
        match reader.read(&mut cache[filled..]) {
            Ok(0) => {
                *at_eos = true;
                break;
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(SeqCacheError::StreamRead(e)),
        }
    }
    Ok(filled)
}
