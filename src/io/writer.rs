//! Writers that emit reads back out in FASTA or FASTQ form
//!
//! The inverse of the parsers, used to round-trip records: a read written
//! here and parsed again yields an identical [`SequenceRead`]
//! (`bytes_consumed` aside).
//!
//! [`SequenceRead`]: crate::types::SequenceRead

use crate::error::{Result, SeqCacheError};
use crate::types::SequenceRead;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// FASTQ record writer
///
/// # Example
///
/// ```no_run
/// use seqcache::{FastqWriter, SequenceRead};
///
/// # fn main() -> seqcache::Result<()> {
/// let mut writer = FastqWriter::create("out.fq")?;
/// let read = SequenceRead::new(
///     "r1".to_string(),
///     String::new(),
///     b"ACGT".to_vec(),
///     b"IIII".to_vec(),
/// );
/// writer.write_read(&read)?;
/// writer.finish()?;
/// # Ok(())
/// # }
/// ```
pub struct FastqWriter<W: Write> {
    writer: W,
    records_written: usize,
}

impl FastqWriter<BufWriter<File>> {
    /// Create a writer over a new file at `path`
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::from_writer(BufWriter::new(file)))
    }
}

impl<W: Write> FastqWriter<W> {
    /// Wrap any byte sink
    pub fn from_writer(writer: W) -> Self {
        Self {
            writer,
            records_written: 0,
        }
    }

    /// Write one read as a four-line FASTQ record
    ///
    /// Rejects reads whose sequence and accuracy lengths differ, so a file
    /// written here always parses back.
    pub fn write_read(&mut self, read: &SequenceRead) -> Result<()> {
        if read.sequence.len() != read.accuracy.len() {
            return Err(SeqCacheError::InvalidFastqFormat {
                msg: format!(
                    "sequence length ({}) != accuracy length ({})",
                    read.sequence.len(),
                    read.accuracy.len()
                ),
            });
        }
        write_header(&mut self.writer, b'@', read)?;
        self.writer.write_all(&read.sequence)?;
        self.writer.write_all(b"\n+\n")?;
        self.writer.write_all(&read.accuracy)?;
        self.writer.write_all(b"\n")?;
        self.records_written += 1;
        Ok(())
    }

    /// Number of records written so far
    pub fn records_written(&self) -> usize {
        self.records_written
    }

    /// Flush and return the underlying sink
    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// FASTA record writer; sequences are written on a single line
pub struct FastaWriter<W: Write> {
    writer: W,
    records_written: usize,
}

impl FastaWriter<BufWriter<File>> {
    /// Create a writer over a new file at `path`
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::from_writer(BufWriter::new(file)))
    }
}

impl<W: Write> FastaWriter<W> {
    /// Wrap any byte sink
    pub fn from_writer(writer: W) -> Self {
        Self {
            writer,
            records_written: 0,
        }
    }

    /// Write one read as a FASTA record
    pub fn write_read(&mut self, read: &SequenceRead) -> Result<()> {
        if read.sequence.is_empty() {
            return Err(SeqCacheError::InvalidFastaFormat {
                msg: format!("record '{}' has no sequence", read.name),
            });
        }
        write_header(&mut self.writer, b'>', read)?;
        self.writer.write_all(&read.sequence)?;
        self.writer.write_all(b"\n")?;
        self.records_written += 1;
        Ok(())
    }

    /// Number of records written so far
    pub fn records_written(&self) -> usize {
        self.records_written
    }

    /// Flush and return the underlying sink
    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

fn write_header<W: Write>(writer: &mut W, sigil: u8, read: &SequenceRead) -> Result<()> {
    writer.write_all(&[sigil])?;
    writer.write_all(read.name.as_bytes())?;
    if !read.annotations.is_empty() {
        writer.write_all(b" ")?;
        writer.write_all(read.annotations.as_bytes())?;
    }
    writer.write_all(b"\n")?;
    Ok(())
}
