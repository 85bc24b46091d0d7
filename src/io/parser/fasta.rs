//! FASTA record layout
//!
//! A record is a `>` header line followed by one or more sequence lines,
//! terminated by the next `>` header or the end of the data. Sequence
//! lines are concatenated with internal whitespace removed; records with
//! no sequence are rejected.

use super::{preview, split_header, ParseOutcome, RecordFormat, ScanLine, WorkerCore};
use crate::error::{Result, SeqCacheError};
use crate::types::SequenceRead;

/// Marker type for the FASTA layout
pub struct Fasta;

impl RecordFormat for Fasta {
    const NAME: &'static str = "FASTA";

    fn parse_record(core: &mut WorkerCore) -> Result<ParseOutcome> {
        let record_start = core.parser_pos();
        let mut consumed = 0u64;

        // Header line; blank lines before it are tolerated and counted.
        let (header, header_terminated) = loop {
            let out = core.copy_line()?;
            if out.consumed == 0 && !out.terminated {
                if core.at_terminus() {
                    return Ok(ParseOutcome::Drained);
                }
                return Ok(ParseOutcome::Overrun { record_start });
            }
            consumed += out.consumed;
            if core.line_bytes().is_empty() && out.terminated {
                continue;
            }
            break (core.take_line(), out.terminated);
        };
        if !header_terminated && !core.at_terminus() {
            return Ok(ParseOutcome::Overrun { record_start });
        }
        if header.first() != Some(&b'>') {
            return Err(SeqCacheError::InvalidFastaFormat {
                msg: format!("expected '>' at start of header, got: {}", preview(&header)),
            });
        }
        let (name, annotations) =
            split_header(&header[1..]).ok_or_else(|| SeqCacheError::InvalidFastaFormat {
                msg: "header is not valid UTF-8".to_string(),
            })?;

        // Sequence lines until the next header or end of data.
        let mut sequence = Vec::new();
        loop {
            match core.peek_byte()? {
                None => {
                    if core.at_terminus() {
                        break;
                    }
                    return Ok(ParseOutcome::Overrun { record_start });
                }
                Some(b'>') => break,
                Some(_) => {
                    let out = core.copy_line()?;
                    consumed += out.consumed;
                    if !out.terminated && !core.at_terminus() {
                        return Ok(ParseOutcome::Overrun { record_start });
                    }
                    sequence.extend(
                        core.line_bytes()
                            .iter()
                            .copied()
                            .filter(|b| !b.is_ascii_whitespace()),
                    );
                    if !out.terminated {
                        break;
                    }
                }
            }
        }
        if sequence.is_empty() {
            return Err(SeqCacheError::InvalidFastaFormat {
                msg: format!("record '{}' has no sequence", name),
            });
        }

        let mut read = SequenceRead::new(name, annotations, sequence, Vec::new());
        read.bytes_consumed = consumed;
        Ok(ParseOutcome::Read(read))
    }

    fn scan_push(_window: &mut Vec<ScanLine>, line: ScanLine) -> Option<u64> {
        (line.at_line_start && line.bytes.first() == Some(&b'>')).then_some(line.pos)
    }

    fn scan_pending(_window: &[ScanLine]) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::super::FastaParser;
    use crate::error::{Result, SeqCacheError};
    use crate::types::SequenceRead;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse_all(content: &[u8]) -> Result<Vec<SequenceRead>> {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        let mut parser = FastaParser::from_path(f.path(), 1, 1 << 20)?;
        parser.workers().pop().unwrap().collect()
    }

    #[test]
    fn test_single_record() {
        let reads = parse_all(b">r1 note\nACGT\nACGT\n").unwrap();
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].name, "r1");
        assert_eq!(reads[0].annotations, "note");
        assert_eq!(reads[0].sequence, b"ACGTACGT");
        assert!(reads[0].accuracy.is_empty());
        assert_eq!(reads[0].bytes_consumed, 19);
    }

    #[test]
    fn test_multiple_records() {
        let reads = parse_all(b">a\nAC\n>b desc here\nGT\nTT\n").unwrap();
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].name, "a");
        assert_eq!(reads[0].sequence, b"AC");
        assert_eq!(reads[1].name, "b");
        assert_eq!(reads[1].annotations, "desc here");
        assert_eq!(reads[1].sequence, b"GTTT");
    }

    #[test]
    fn test_final_record_without_newline() {
        let reads = parse_all(b">a\nACGT").unwrap();
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].sequence, b"ACGT");
        assert_eq!(reads[0].bytes_consumed, 7);
    }

    #[test]
    fn test_crlf_line_endings() {
        let reads = parse_all(b">a x\r\nAC\r\nGT\r\n").unwrap();
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].name, "a");
        assert_eq!(reads[0].annotations, "x");
        assert_eq!(reads[0].sequence, b"ACGT");
        assert_eq!(reads[0].bytes_consumed, 14);
    }

    #[test]
    fn test_blank_lines_between_records() {
        let reads = parse_all(b">a\nAC\n\n>b\nGT\n").unwrap();
        assert_eq!(reads.len(), 2);
        // Conservation: every byte lands in some record's tally.
        let total: u64 = reads.iter().map(|r| r.bytes_consumed).sum();
        assert_eq!(total, 13);
    }

    #[test]
    fn test_missing_header_rejected() {
        let err = parse_all(b"ACGT\n").unwrap_err();
        assert!(matches!(err, SeqCacheError::InvalidFastaFormat { .. }));
    }

    #[test]
    fn test_empty_sequence_rejected() {
        let err = parse_all(b">a\n>b\nACGT\n").unwrap_err();
        assert!(matches!(err, SeqCacheError::InvalidFastaFormat { .. }));
    }

    #[test]
    fn test_error_then_next_record_parses() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b">a\n>b\nACGT\n").unwrap();
        f.flush().unwrap();
        let mut parser = FastaParser::from_path(f.path(), 1, 1 << 20).unwrap();
        let mut worker = parser.workers().pop().unwrap();

        assert!(worker.get_next_read().is_err());
        let read = worker.get_next_read().unwrap();
        assert_eq!(read.name, "b");
        assert_eq!(read.sequence, b"ACGT");
    }
}
