//! FASTQ record layout
//!
//! A record is exactly four lines: an `@` header, the sequence, a `+`
//! separator that may repeat the header, and an accuracy string of the
//! same length as the sequence. Names ending in `/1` or `/2` have the
//! suffix moved into the annotations so mates of a pair share a name.

use super::{preview, split_header, ParseOutcome, RecordFormat, ScanLine, WorkerCore};
use crate::error::{Result, SeqCacheError};
use crate::types::SequenceRead;

/// Marker type for the FASTQ layout
pub struct Fastq;

enum LineRead {
    Line(Vec<u8>),
    Overrun,
    Truncated,
}

// Pull one of the record's fixed lines, classifying segment exhaustion as
// either a boundary overrun or a truncated record at end-of-stream.
fn read_record_line(core: &mut WorkerCore, consumed: &mut u64) -> Result<LineRead> {
    let out = core.copy_line()?;
    if out.consumed == 0 && !out.terminated {
        if core.at_terminus() {
            return Ok(LineRead::Truncated);
        }
        return Ok(LineRead::Overrun);
    }
    *consumed += out.consumed;
    if !out.terminated && !core.at_terminus() {
        return Ok(LineRead::Overrun);
    }
    Ok(LineRead::Line(core.take_line()))
}

impl RecordFormat for Fastq {
    const NAME: &'static str = "FASTQ";

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
        if header.first() != Some(&b'@') {
            return Err(SeqCacheError::InvalidFastqFormat {
                msg: format!("expected '@' at start of header, got: {}", preview(&header)),
            });
        }

        let sequence = match read_record_line(core, &mut consumed)? {
            LineRead::Line(bytes) => bytes,
            LineRead::Overrun => return Ok(ParseOutcome::Overrun { record_start }),
            LineRead::Truncated => {
                return Err(SeqCacheError::InvalidFastqFormat {
                    msg: "unexpected end of input after header".to_string(),
                })
            }
        };
        let separator = match read_record_line(core, &mut consumed)? {
            LineRead::Line(bytes) => bytes,
            LineRead::Overrun => return Ok(ParseOutcome::Overrun { record_start }),
            LineRead::Truncated => {
                return Err(SeqCacheError::InvalidFastqFormat {
                    msg: "unexpected end of input after sequence".to_string(),
                })
            }
        };
        let accuracy = match read_record_line(core, &mut consumed)? {
            LineRead::Line(bytes) => bytes,
            LineRead::Overrun => return Ok(ParseOutcome::Overrun { record_start }),
            LineRead::Truncated => {
                return Err(SeqCacheError::InvalidFastqFormat {
                    msg: "unexpected end of input after separator".to_string(),
                })
            }
        };

        if separator.first() != Some(&b'+') {
            return Err(SeqCacheError::InvalidFastqFormat {
                msg: format!("expected '+' at start of separator, got: {}", preview(&separator)),
            });
        }

        let (mut name, mut annotations) =
            split_header(&header[1..]).ok_or_else(|| SeqCacheError::InvalidFastqFormat {
                msg: "header is not valid UTF-8".to_string(),
            })?;

        // The separator may repeat the full header or just the name.
        if separator.len() > 1 {
            let repeat = &separator[1..];
            if repeat != &header[1..] && repeat != name.as_bytes() {
                return Err(SeqCacheError::InvalidFastqFormat {
                    msg: format!("separator does not repeat the header: {}", preview(&separator)),
                });
            }
        }

        if sequence.len() != accuracy.len() {
            return Err(SeqCacheError::InvalidFastqFormat {
                msg: format!(
                    "sequence length ({}) != accuracy length ({})",
                    sequence.len(),
                    accuracy.len()
                ),
            });
        }

        // Mate suffix: "/1" and "/2" move into the annotations so paired
        // records can be matched by equal names.
        if name.len() >= 2 && (name.ends_with("/1") || name.ends_with("/2")) {
            let suffix = name.split_off(name.len() - 2);
            if !annotations.split_whitespace().any(|token| token == suffix) {
                if annotations.is_empty() {
                    annotations = suffix;
                } else {
                    annotations = format!("{} {}", suffix, annotations);
                }
            }
        }

        let mut read = SequenceRead::new(name, annotations, sequence, accuracy);
        read.bytes_consumed = consumed;
        Ok(ParseOutcome::Read(read))
    }

    fn scan_push(window: &mut Vec<ScanLine>, line: ScanLine) -> Option<u64> {
        window.push(line);
        loop {
            while let Some(first) = window.first() {
                if first.at_line_start && first.bytes.first() == Some(&b'@') {
                    break;
                }
                window.remove(0);
            }
            if window.len() < 4 {
                return None;
            }
            let plausible = window[2].bytes.first() == Some(&b'+')
                && window[1].bytes.len() == window[3].bytes.len();
            if plausible {
                return Some(window[0].pos);
            }
            window.remove(0);
        }
    }

    fn scan_pending(window: &[ScanLine]) -> Option<u64> {
        window
            .iter()
            .find(|l| l.at_line_start && l.bytes.first() == Some(&b'@'))
            .map(|l| l.pos)
    }
}
