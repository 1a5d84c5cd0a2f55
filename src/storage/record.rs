use crc32fast::Hasher as Crc32Hasher;
use std::io::{self, Read, Write};

/// Framing for one durable record: `[len: u32 le][crc32: u32 le][payload]`.
/// The CRC covers the payload only.
const FRAME_HEADER_BYTES: usize = 8;

/// Upper bound on a single record payload. A length field beyond this is
/// treated as a decode boundary, not an allocation request.
const MAX_RECORD_BYTES: u32 = 16 * 1024 * 1024;

pub fn write_record<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let mut hasher = Crc32Hasher::new();
    hasher.update(payload);
    let crc = hasher.finalize();
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&crc.to_le_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

/// Why a sequential scan stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanEnd {
    /// File ended exactly on a record boundary.
    CleanEof,
    /// A trailing record was cut short, e.g. by a crash mid-write. The
    /// tail is discarded; everything before it remains valid.
    TruncatedTail,
    /// The trailing record framed but failed its checksum.
    ChecksumMismatch,
}

#[derive(Debug)]
pub enum ScanOutcome {
    Record(Vec<u8>),
    End(ScanEnd),
}

/// Forward scanner over a sequence of framed records.
pub struct RecordReader<R: Read> {
    inner: R,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next record. Truncation and checksum failures at the tail
    /// are reported as scan boundaries; only genuine read failures error.
    pub fn read_next(&mut self) -> io::Result<ScanOutcome> {
        let mut header = [0u8; FRAME_HEADER_BYTES];
        match read_exact_or_eof(&mut self.inner, &mut header)? {
            FillResult::Empty => return Ok(ScanOutcome::End(ScanEnd::CleanEof)),
            FillResult::Partial => return Ok(ScanOutcome::End(ScanEnd::TruncatedTail)),
            FillResult::Full => {}
        }
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if len > MAX_RECORD_BYTES {
            return Ok(ScanOutcome::End(ScanEnd::ChecksumMismatch));
        }
        let mut payload = vec![0u8; len as usize];
        match read_exact_or_eof(&mut self.inner, &mut payload)? {
            FillResult::Full => {}
            FillResult::Empty | FillResult::Partial => {
                return Ok(ScanOutcome::End(ScanEnd::TruncatedTail));
            }
        }
        let mut hasher = Crc32Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != expected_crc {
            return Ok(ScanOutcome::End(ScanEnd::ChecksumMismatch));
        }
        Ok(ScanOutcome::Record(payload))
    }
}

enum FillResult {
    Full,
    Partial,
    Empty,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<FillResult> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    FillResult::Empty
                } else {
                    FillResult::Partial
                });
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(FillResult::Full)
}
