//! Record framing: `magic(4) | payload_len(8) | payload | crc32c(4)`.

use std::io::{self, Read, Write};

/// Frame marker, little-endian on disk.
pub const MAGIC: u32 = 0x5A5A_5A5A;

/// Framing bytes per record: magic + length + trailing CRC.
pub const FRAME_OVERHEAD: i64 = 16;

/// Upper bound on a single payload; larger lengths are treated as a
/// corrupt frame rather than an allocation request.
const MAX_PAYLOAD: i64 = 1 << 30;

/// Outcome of decoding one frame from a reader.
#[derive(Debug)]
pub(crate) enum Decoded {
    /// A complete, CRC-verified payload.
    Record(Vec<u8>),
    /// Clean end of file exactly on a frame boundary.
    Eof,
    /// The frame was cut short mid-record.
    Truncated,
    /// Magic, length, or CRC check failed.
    Corrupt(&'static str),
}

/// Appends one framed record to `w` and returns the number of bytes written.
pub fn encode_record(w: &mut impl Write, payload: &[u8]) -> io::Result<i64> {
    let crc = crc32c::crc32c(payload);
    w.write_all(&MAGIC.to_le_bytes())?;
    w.write_all(&(payload.len() as i64).to_le_bytes())?;
    w.write_all(payload)?;
    w.write_all(&crc.to_le_bytes())?;
    Ok(payload.len() as i64 + FRAME_OVERHEAD)
}

/// Reads one framed record from `r`.
pub(crate) fn decode_frame(r: &mut impl Read) -> io::Result<Decoded> {
    let mut magic = [0u8; 4];
    match read_exact_or_eof(r, &mut magic)? {
        ReadOutcome::Full => {}
        ReadOutcome::Empty => return Ok(Decoded::Eof),
        ReadOutcome::Partial => return Ok(Decoded::Truncated),
    }
    if u32::from_le_bytes(magic) != MAGIC {
        return Ok(Decoded::Corrupt("magic mismatch"));
    }

    let mut len = [0u8; 8];
    match read_exact_or_eof(r, &mut len)? {
        ReadOutcome::Full => {}
        ReadOutcome::Empty | ReadOutcome::Partial => return Ok(Decoded::Truncated),
    }
    let payload_len = i64::from_le_bytes(len);
    if !(0..=MAX_PAYLOAD).contains(&payload_len) {
        return Ok(Decoded::Corrupt("invalid payload length"));
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let mut buf = vec![0u8; payload_len as usize + 4];
    match read_exact_or_eof(r, &mut buf)? {
        ReadOutcome::Full => {}
        ReadOutcome::Empty | ReadOutcome::Partial => return Ok(Decoded::Truncated),
    }

    let crc_pos = buf.len() - 4;
    let stored = u32::from_le_bytes(buf[crc_pos..].try_into().expect("4-byte slice"));
    buf.truncate(crc_pos);
    if crc32c::crc32c(&buf) != stored {
        return Ok(Decoded::Corrupt("crc mismatch"));
    }
    Ok(Decoded::Record(buf))
}

enum ReadOutcome {
    Full,
    Empty,
    Partial,
}

/// Like `read_exact`, but distinguishes a clean EOF before the first byte
/// from EOF in the middle of the buffer.
fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Empty
                } else {
                    ReadOutcome::Partial
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Full)
}

/// Decodes one record from a byte slice, for callers that already hold the
/// framed bytes in memory (e.g. message-sink reassembly tests).
pub fn decode_record(bytes: &[u8]) -> io::Result<Option<(Vec<u8>, usize)>> {
    let mut cursor = io::Cursor::new(bytes);
    match decode_frame(&mut cursor)? {
        Decoded::Record(payload) => {
            #[allow(clippy::cast_possible_truncation)]
            let consumed = cursor.position() as usize;
            Ok(Some((payload, consumed)))
        }
        Decoded::Eof | Decoded::Truncated => Ok(None),
        Decoded::Corrupt(reason) => Err(io::Error::new(io::ErrorKind::InvalidData, reason)),
    }
}
