//! Packet framing.
//!
//! ```text
//! [size u32][flags u32][uncompressed_size u32][reserved u32][body: size bytes]
//! ```
//!
//! All fields are little-endian. With `COMPRESSED` set the body is an LZ4
//! block that expands to exactly `uncompressed_size` bytes; otherwise the
//! body is the payload and `uncompressed_size` equals `size`.

use crate::{VoodooError, VoodooResult};
use std::io::{self, Read, Write};

pub const HEADER_SIZE: usize = 16;
pub const FLAG_COMPRESSED: u32 = 1;

/// Whether the sender tries to compress a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    Never,
    /// Try for payloads of at least this many bytes.
    Above(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub size: u32,
    pub flags: u32,
    pub uncompressed_size: u32,
}

impl PacketHeader {
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..12].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        Self {
            size: word(0),
            flags: word(4),
            uncompressed_size: word(8),
        }
    }
}

/// Frames `payload`, compressing it when that makes the body strictly
/// smaller.
pub fn encode(payload: &[u8], compression: Compression) -> VoodooResult<Vec<u8>> {
    let uncompressed_size =
        u32::try_from(payload.len()).map_err(|_| VoodooError::Malformed("payload exceeds u32"))?;
    let compressed = match compression {
        Compression::Above(min) if payload.len() >= min.max(1) => {
            Some(lz4_flex::block::compress(payload)).filter(|body| body.len() < payload.len())
        }
        _ => None,
    };
    let (flags, body) = match &compressed {
        Some(body) => (FLAG_COMPRESSED, body.as_slice()),
        None => (0, payload),
    };
    let header = PacketHeader {
        size: body.len() as u32,
        flags,
        uncompressed_size,
    };
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Turns a received body back into the payload.
pub fn decode_body(header: PacketHeader, body: Vec<u8>, max: u32) -> VoodooResult<Vec<u8>> {
    if body.len() != header.size as usize {
        return Err(VoodooError::Malformed("body length differs from header"));
    }
    if !header.is_compressed() {
        if header.uncompressed_size != header.size {
            return Err(VoodooError::Malformed("plain packet with mismatched sizes"));
        }
        return Ok(body);
    }
    if header.uncompressed_size > max {
        return Err(VoodooError::Malformed("uncompressed size over limit"));
    }
    let payload = lz4_flex::block::decompress(&body, header.uncompressed_size as usize)
        .map_err(|_| VoodooError::Malformed("corrupt compressed body"))?;
    if payload.len() != header.uncompressed_size as usize {
        return Err(VoodooError::Malformed("decompressed size differs from header"));
    }
    Ok(payload)
}

/// Reads one packet. End of stream is `Closed`; a reader that times out
/// fails with `TimedOut`.
pub fn read_from(reader: &mut impl Read, max: u32) -> VoodooResult<Vec<u8>> {
    PacketBuffer::default()
        .read_from(reader, max)?
        .ok_or_else(|| io::Error::from(io::ErrorKind::TimedOut).into())
}

/// Bytes of the packet being received. A read that times out part way
/// keeps what already arrived, so the next read resumes the same packet.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    buf: Vec<u8>,
}

impl PacketBuffer {
    /// Reads until a whole packet is buffered and returns its payload, or
    /// `None` if `reader` timed out first.
    pub fn read_from(&mut self, reader: &mut impl Read, max: u32) -> VoodooResult<Option<Vec<u8>>> {
        loop {
            let wanted = match self.header(max)? {
                Some(header) if self.buf.len() == HEADER_SIZE + header.size as usize => {
                    let body = self.buf.split_off(HEADER_SIZE);
                    self.buf.clear();
                    return decode_body(header, body, max).map(Some);
                }
                Some(header) => HEADER_SIZE + header.size as usize - self.buf.len(),
                None => HEADER_SIZE - self.buf.len(),
            };
            let start = self.buf.len();
            self.buf.resize(start + wanted, 0);
            let read = reader.read(&mut self.buf[start..]);
            self.buf.truncate(start + read.as_ref().map_or(0, |n| *n));
            match read {
                Ok(0) => return Err(VoodooError::Closed),
                Ok(_) => {}
                Err(err)
                    if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return Ok(None)
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(closed_on_eof(err)),
            }
        }
    }

    /// Whether part of a packet is buffered.
    pub fn is_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    fn header(&self, max: u32) -> VoodooResult<Option<PacketHeader>> {
        let Some(raw) = self.buf.first_chunk::<HEADER_SIZE>() else {
            return Ok(None);
        };
        let header = PacketHeader::decode(raw);
        if header.size > max {
            return Err(VoodooError::Malformed("packet over size limit"));
        }
        Ok(Some(header))
    }
}

pub fn write_to(writer: &mut impl Write, payload: &[u8], compression: Compression) -> VoodooResult<()> {
    let framed = encode(payload, compression)?;
    writer.write_all(&framed)?;
    writer.flush()?;
    Ok(())
}

fn closed_on_eof(err: io::Error) -> VoodooError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => VoodooError::Closed,
        _ => VoodooError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn repetitive_payload_is_compressed() {
        let payload = vec![7u8; 4096];
        let framed = encode(&payload, Compression::Above(64)).unwrap();
        let header = PacketHeader::decode(framed[..HEADER_SIZE].try_into().unwrap());
        assert!(header.is_compressed());
        assert!((header.size as usize) < payload.len());
        assert_eq!(header.uncompressed_size, 4096);
        let back = read_from(&mut Cursor::new(framed), u32::MAX).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn incompressible_payload_is_sent_verbatim() {
        let payload: Vec<u8> = (0..200u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let framed = encode(&payload, Compression::Above(1)).unwrap();
        let header = PacketHeader::decode(framed[..HEADER_SIZE].try_into().unwrap());
        if !header.is_compressed() {
            assert_eq!(&framed[HEADER_SIZE..], payload.as_slice());
        }
        let framed = encode(&payload, Compression::Never).unwrap();
        assert_eq!(&framed[HEADER_SIZE..], payload.as_slice());
        assert_eq!(framed.len(), HEADER_SIZE + payload.len());
    }

    #[test]
    fn small_payloads_skip_compression() {
        let framed = encode(&[0u8; 32], Compression::Above(64)).unwrap();
        assert_eq!(PacketHeader::decode(framed[..HEADER_SIZE].try_into().unwrap()).flags, 0);
    }

    /// Hands out one scripted chunk per read; `None` entries time out.
    struct Trickle(Vec<Option<Vec<u8>>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() {
                return Ok(0);
            }
            match self.0.remove(0) {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(mut chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.0.insert(0, Some(chunk.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    #[test]
    fn timed_out_reads_resume_the_same_packet() {
        let first = encode(b"first packet", Compression::Never).unwrap();
        let second = encode(&[9u8; 300], Compression::Above(16)).unwrap();
        let mut reader = Trickle(vec![
            Some(first[..5].to_vec()),
            None,
            Some(first[5..20].to_vec()),
            None,
            Some([&first[20..], &second[..3]].concat()),
            Some(second[3..].to_vec()),
        ]);
        let mut buffer = PacketBuffer::default();
        assert_eq!(buffer.read_from(&mut reader, 1024).unwrap(), None);
        assert!(buffer.is_partial());
        assert_eq!(buffer.read_from(&mut reader, 1024).unwrap(), None);
        assert_eq!(
            buffer.read_from(&mut reader, 1024).unwrap().unwrap(),
            b"first packet"
        );
        assert_eq!(buffer.read_from(&mut reader, 1024).unwrap().unwrap(), vec![9u8; 300]);
        assert!(!buffer.is_partial());
        assert!(matches!(
            buffer.read_from(&mut reader, 1024),
            Err(VoodooError::Closed)
        ));
    }

    #[test]
    fn eof_before_header_is_closed() {
        let err = read_from(&mut Cursor::new(Vec::new()), 1024).unwrap_err();
        assert!(matches!(err, VoodooError::Closed));
    }

    #[test]
    fn oversized_and_inconsistent_packets_are_rejected() {
        let framed = encode(&[1u8; 100], Compression::Never).unwrap();
        assert!(matches!(
            read_from(&mut Cursor::new(framed.clone()), 50),
            Err(VoodooError::Malformed(_))
        ));

        let mut lying = framed;
        lying[8..12].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            read_from(&mut Cursor::new(lying), 1024),
            Err(VoodooError::Malformed(_))
        ));
    }

    proptest! {
        #[test]
        fn payload_survives_framing(payload in proptest::collection::vec(any::<u8>(), 0..2048), repeat in 0usize..4) {
            let mut payload = payload;
            for _ in 0..repeat {
                let copy = payload.clone();
                payload.extend_from_slice(&copy);
            }
            let framed = encode(&payload, Compression::Above(16)).unwrap();
            let header = PacketHeader::decode(framed[..HEADER_SIZE].try_into().unwrap());
            if header.is_compressed() {
                prop_assert!((header.size as usize) < payload.len());
            } else {
                prop_assert_eq!(&framed[HEADER_SIZE..], payload.as_slice());
            }
            let back = read_from(&mut Cursor::new(framed), u32::MAX).unwrap();
            prop_assert_eq!(back, payload);
        }
    }
}
