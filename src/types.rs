//! Common types used throughout seqcache

/// One parsed sequencing read, FASTA or FASTQ
///
/// `accuracy` is empty for FASTA records. `bytes_consumed` counts every
/// source byte the parser advanced past for this record, including the
/// header sigil and line terminators, so summing it over all emitted reads
/// reproduces the decompressed stream length exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceRead {
    /// Record name (without the '>' or '@' sigil, up to the first whitespace)
    pub name: String,
    /// Remainder of the header line after the name (may be empty)
    pub annotations: String,
    /// Sequence bases
    pub sequence: Vec<u8>,
    /// Quality string (FASTQ only; same length as `sequence`)
    pub accuracy: Vec<u8>,
    /// Total source bytes consumed to parse this record
    pub bytes_consumed: u64,
}

impl SequenceRead {
    /// Create a read from its parts
    pub fn new(name: String, annotations: String, sequence: Vec<u8>, accuracy: Vec<u8>) -> Self {
        Self {
            name,
            annotations,
            sequence,
            accuracy,
            bytes_consumed: 0,
        }
    }

    /// Clear all fields so the value can be reused as parse scratch
    pub fn reset(&mut self) {
        self.name.clear();
        self.annotations.clear();
        self.sequence.clear();
        self.accuracy.clear();
        self.bytes_consumed = 0;
    }

    /// Check if the record has an empty sequence
    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// True when this record carries a quality string (i.e. came from FASTQ)
    pub fn has_accuracy(&self) -> bool {
        !self.accuracy.is_empty()
    }
}
