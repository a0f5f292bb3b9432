//! duct-wire: the length-delimited framing used by every stream transport.
//!
//! Each frame is a fixed 16-byte header followed by `payload_len` bytes of
//! payload. All header integers are big-endian:
//!
//! | offset | size | field       | constraint            |
//! |-------:|-----:|-------------|-----------------------|
//! |      0 |    4 | magic       | `0x44554354` ("DUCT") |
//! |      4 |    2 | version     | 1                     |
//! |      6 |    2 | header_len  | 16                    |
//! |      8 |    4 | payload_len | <= 65536              |
//! |     12 |    4 | flags       | reserved bits         |
//!
//! Any header violating these constraints is a `ProtocolError` and
//! terminates the connection.

use std::io::{ErrorKind, Read, Write};

use duct_types::{Message, Result, Status};

/// Frame magic: the ASCII bytes "DUCT".
pub const PROTOCOL_MAGIC: u32 = 0x4455_4354;
/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;
/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 16;
/// Maximum payload carried by a single frame. Larger messages would require
/// fragmentation, which is explicitly deferred.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Reserved frame flag bits.
pub mod flags {
    /// At-least-once delivery enabled for this pipe (reserved).
    pub const RELIABLE: u32 = 1 << 0;
    /// Payload is a fragment of a larger message (reserved).
    pub const FRAG: u32 = 1 << 4;
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub header_len: u16,
    pub payload_len: u32,
    pub flags: u32,
}

impl FrameHeader {
    /// A well-formed header for a payload of `payload_len` bytes.
    pub fn for_payload(payload_len: u32, flags: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            header_len: HEADER_LEN as u16,
            payload_len,
            flags,
        }
    }
}

/// Encode a header into its 16-byte wire form.
pub fn encode_header(h: &FrameHeader) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..4].copy_from_slice(&h.magic.to_be_bytes());
    out[4..6].copy_from_slice(&h.version.to_be_bytes());
    out[6..8].copy_from_slice(&h.header_len.to_be_bytes());
    out[8..12].copy_from_slice(&h.payload_len.to_be_bytes());
    out[12..16].copy_from_slice(&h.flags.to_be_bytes());
    out
}

/// Decode and validate a 16-byte header.
pub fn decode_header(buf: &[u8; HEADER_LEN]) -> Result<FrameHeader> {
    let h = FrameHeader {
        magic: u32::from_be_bytes(buf[0..4].try_into().expect("4-byte slice")),
        version: u16::from_be_bytes(buf[4..6].try_into().expect("2-byte slice")),
        header_len: u16::from_be_bytes(buf[6..8].try_into().expect("2-byte slice")),
        payload_len: u32::from_be_bytes(buf[8..12].try_into().expect("4-byte slice")),
        flags: u32::from_be_bytes(buf[12..16].try_into().expect("4-byte slice")),
    };

    if h.magic != PROTOCOL_MAGIC {
        return Err(Status::protocol_error("bad magic"));
    }
    if h.version != PROTOCOL_VERSION {
        return Err(Status::protocol_error("unsupported version"));
    }
    if h.header_len as usize != HEADER_LEN {
        return Err(Status::protocol_error("bad header_len"));
    }
    if h.payload_len as usize > MAX_FRAME_PAYLOAD {
        return Err(Status::protocol_error("payload too large (frame)"));
    }
    Ok(h)
}

/// Write the whole buffer, retrying on interruption.
///
/// A 0-byte write means the peer went away and maps to `Closed`; any other
/// failure is an `IoError`.
pub fn write_all(w: &mut impl Write, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match w.write(buf) {
            Ok(0) => return Err(Status::closed("peer closed")),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                return Err(Status::closed("peer closed"));
            }
            Err(e) => return Err(Status::io_error(format!("write failed: {e}"))),
        }
    }
    Ok(())
}

/// Fill the whole buffer, retrying on interruption.
///
/// End-of-stream (a 0-byte read) maps to `Closed`; any other failure is an
/// `IoError`.
pub fn read_exact(r: &mut impl Read, mut buf: &mut [u8]) -> Result<()> {
    while !buf.is_empty() {
        match r.read(buf) {
            Ok(0) => return Err(Status::closed("peer closed")),
            Ok(n) => {
                let rest = buf;
                buf = &mut rest[n..];
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                return Err(Status::closed("peer closed"));
            }
            Err(e) => return Err(Status::io_error(format!("read failed: {e}"))),
        }
    }
    Ok(())
}

/// Frame and write one message.
pub fn write_frame(w: &mut impl Write, msg: &Message, frame_flags: u32) -> Result<()> {
    if msg.len() > MAX_FRAME_PAYLOAD {
        return Err(Status::invalid_argument(
            "message too large for a single frame",
        ));
    }

    let header = encode_header(&FrameHeader::for_payload(msg.len() as u32, frame_flags));
    write_all(w, &header)?;
    write_all(w, msg.data())?;
    w.flush()
        .map_err(|e| Status::io_error(format!("flush failed: {e}")))
}

/// Read and validate one frame, returning its payload.
pub fn read_frame(r: &mut impl Read) -> Result<Message> {
    let mut header = [0u8; HEADER_LEN];
    read_exact(r, &mut header)?;
    let h = decode_header(&header)?;

    let mut payload = vec![0u8; h.payload_len as usize];
    if !payload.is_empty() {
        read_exact(r, &mut payload)?;
    }
    Ok(Message::from_vec(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use duct_types::StatusCode;

    #[test]
    fn header_roundtrip() {
        let h = FrameHeader::for_payload(1234, flags::RELIABLE);
        let encoded = encode_header(&h);
        let decoded = decode_header(&encoded).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn header_wire_layout_is_big_endian() {
        let h = FrameHeader::for_payload(5, 0);
        let encoded = encode_header(&h);
        assert_eq!(&encoded[0..4], b"DUCT");
        assert_eq!(&encoded[4..6], &[0, 1]);
        assert_eq!(&encoded[6..8], &[0, 16]);
        assert_eq!(&encoded[8..12], &[0, 0, 0, 5]);
    }

    #[test]
    fn all_zero_header_is_bad_magic() {
        let err = decode_header(&[0u8; HEADER_LEN]).unwrap_err();
        assert_eq!(err.code(), StatusCode::ProtocolError);
        assert_eq!(err.message(), "bad magic");
    }

    #[test]
    fn header_constraint_violations() {
        let mut bad_version = encode_header(&FrameHeader::for_payload(0, 0));
        bad_version[5] = 9;
        assert_eq!(
            decode_header(&bad_version).unwrap_err().message(),
            "unsupported version"
        );

        let mut bad_header_len = encode_header(&FrameHeader::for_payload(0, 0));
        bad_header_len[7] = 20;
        assert_eq!(
            decode_header(&bad_header_len).unwrap_err().message(),
            "bad header_len"
        );

        let oversize = encode_header(&FrameHeader {
            payload_len: MAX_FRAME_PAYLOAD as u32 + 1,
            ..FrameHeader::for_payload(0, 0)
        });
        assert_eq!(
            decode_header(&oversize).unwrap_err().message(),
            "payload too large (frame)"
        );
    }

    #[test]
    fn frame_roundtrip() {
        let msg = Message::from_string("hello");
        let mut wire = Vec::new();
        write_frame(&mut wire, &msg, 0).unwrap();
        assert_eq!(wire.len(), HEADER_LEN + 5);

        let decoded = read_frame(&mut wire.as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Message::new(), 0).unwrap();
        let decoded = read_frame(&mut wire.as_slice()).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn max_payload_roundtrip() {
        let payload: Vec<u8> = (0..MAX_FRAME_PAYLOAD).map(|i| i as u8).collect();
        let msg = Message::from_vec(payload);
        let mut wire = Vec::new();
        write_frame(&mut wire, &msg, 0).unwrap();
        let decoded = read_frame(&mut wire.as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn oversize_payload_rejected_before_write() {
        let msg = Message::from_vec(vec![0u8; MAX_FRAME_PAYLOAD + 1]);
        let mut wire = Vec::new();
        let err = write_frame(&mut wire, &msg, 0).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert!(wire.is_empty());
    }

    #[test]
    fn truncated_stream_reads_as_closed() {
        // Header promises 100 payload bytes; the stream ends after 3.
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_header(&FrameHeader::for_payload(100, 0)));
        wire.extend_from_slice(&[1, 2, 3]);

        let err = read_frame(&mut wire.as_slice()).unwrap_err();
        assert_eq!(err.code(), StatusCode::Closed);
    }

    #[test]
    fn empty_stream_reads_as_closed() {
        let err = read_frame(&mut (&[] as &[u8])).unwrap_err();
        assert_eq!(err.code(), StatusCode::Closed);
    }

    #[test]
    fn back_to_back_frames() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Message::from_string("first"), 0).unwrap();
        write_frame(&mut wire, &Message::from_string("second"), 0).unwrap();

        let mut cursor = wire.as_slice();
        assert_eq!(read_frame(&mut cursor).unwrap().data(), b"first");
        assert_eq!(read_frame(&mut cursor).unwrap().data(), b"second");
        assert_eq!(
            read_frame(&mut cursor).unwrap_err().code(),
            StatusCode::Closed
        );
    }
}
