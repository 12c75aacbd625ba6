//! Messages carried inside packets, and the typed argument blocks that make
//! up their payloads.
//!
//! ```text
//! [serial u32][instance u32][method u32][kind u8][flags u8][reserved u16][result i32][args ...]
//! ```

use crate::{VoodooError, VoodooResult};
use fusion::{FusionError, FusionResult, ResultCode};
use std::ops::BitOr;

pub const MESSAGE_HEADER: usize = 20;

/// Identifies a registered instance on one connection.
pub type InstanceId = u32;
pub type MethodId = u32;

/// Instance id answering super lookups on every connection.
pub const SUPER_INSTANCE: InstanceId = 1;

pub(crate) const HELLO_MAGIC: u32 = 0x4f4f_4456;
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Request = 1,
    Response = 2,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const NONE: Self = Self(0);
    /// The sender waits for a response with the same serial.
    pub const RESPOND: Self = Self(1);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MessageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub serial: u32,
    pub instance: InstanceId,
    pub method: MethodId,
    pub kind: MessageKind,
    pub flags: MessageFlags,
    pub result: ResultCode,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn request(
        serial: u32,
        instance: InstanceId,
        method: MethodId,
        flags: MessageFlags,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            serial,
            instance,
            method,
            kind: MessageKind::Request,
            flags,
            result: ResultCode::Ok,
            payload,
        }
    }

    /// Response to `request` carrying `result` and, on success, `payload`.
    pub fn response(request: &Message, result: ResultCode, payload: Vec<u8>) -> Self {
        Self {
            serial: request.serial,
            instance: request.instance,
            method: request.method,
            kind: MessageKind::Response,
            flags: MessageFlags::NONE,
            result,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MESSAGE_HEADER + self.payload.len());
        buf.extend_from_slice(&self.serial.to_le_bytes());
        buf.extend_from_slice(&self.instance.to_le_bytes());
        buf.extend_from_slice(&self.method.to_le_bytes());
        buf.push(self.kind as u8);
        buf.push(self.flags.bits());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&self.result.as_i32().to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(mut buf: Vec<u8>) -> VoodooResult<Self> {
        if buf.len() < MESSAGE_HEADER {
            return Err(VoodooError::Malformed("message shorter than its header"));
        }
        let word = |at: usize| [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]];
        let serial = u32::from_le_bytes(word(0));
        let instance = u32::from_le_bytes(word(4));
        let method = u32::from_le_bytes(word(8));
        let kind = match buf[12] {
            1 => MessageKind::Request,
            2 => MessageKind::Response,
            _ => return Err(VoodooError::Malformed("unknown message kind")),
        };
        let flags = MessageFlags::from_bits(buf[13]);
        let result = ResultCode::from_wire(i32::from_le_bytes(word(16)));
        let payload = buf.split_off(MESSAGE_HEADER);
        Ok(Self {
            serial,
            instance,
            method,
            kind,
            flags,
            result,
            payload,
        })
    }
}

pub(crate) fn encode_hello(magic: u32, version: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&magic.to_le_bytes());
    buf[4..].copy_from_slice(&version.to_le_bytes());
    buf
}

/// Checks the peer's hello against ours.
pub(crate) fn check_hello(buf: &[u8]) -> FusionResult<()> {
    let bytes: [u8; 8] = buf
        .try_into()
        .map_err(|_| FusionError::InvArg("hello has the wrong length"))?;
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if magic != HELLO_MAGIC || version != PROTOCOL_VERSION {
        return Err(FusionError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            found: if magic == HELLO_MAGIC { version } else { 0 },
        });
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum ArgType {
    Id = 1,
    Int = 2,
    UInt = 3,
    Long = 4,
    Data = 5,
    OptionalData = 6,
    String = 7,
}

const ABSENT: u32 = u32::MAX;

/// Builds a payload out of typed blocks `[type u8][len u32][bytes]`.
#[derive(Clone, Debug, Default)]
pub struct ArgWriter {
    buf: Vec<u8>,
}

impl ArgWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn block(&mut self, ty: ArgType, bytes: &[u8]) -> &mut Self {
        self.buf.push(ty as u8);
        self.buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn id(&mut self, id: InstanceId) -> &mut Self {
        self.block(ArgType::Id, &id.to_le_bytes())
    }

    pub fn int(&mut self, value: i32) -> &mut Self {
        self.block(ArgType::Int, &value.to_le_bytes())
    }

    pub fn uint(&mut self, value: u32) -> &mut Self {
        self.block(ArgType::UInt, &value.to_le_bytes())
    }

    pub fn long(&mut self, value: i64) -> &mut Self {
        self.block(ArgType::Long, &value.to_le_bytes())
    }

    pub fn data(&mut self, bytes: &[u8]) -> &mut Self {
        self.block(ArgType::Data, bytes)
    }

    pub fn optional_data(&mut self, bytes: Option<&[u8]>) -> &mut Self {
        match bytes {
            Some(bytes) => self.block(ArgType::OptionalData, bytes),
            None => {
                self.buf.push(ArgType::OptionalData as u8);
                self.buf.extend_from_slice(&ABSENT.to_le_bytes());
                self
            }
        }
    }

    pub fn string(&mut self, value: &str) -> &mut Self {
        self.block(ArgType::String, value.as_bytes())
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Reads blocks written by [`ArgWriter`] in the same order. Any type
/// mismatch or truncation is `InvArg`.
#[derive(Clone, Debug)]
pub struct ArgReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ArgReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn block(&mut self, ty: ArgType) -> FusionResult<Option<&'a [u8]>> {
        let head = self
            .buf
            .get(self.pos..self.pos + 5)
            .ok_or(FusionError::InvArg("argument list truncated"))?;
        if head[0] != ty as u8 {
            return Err(FusionError::InvArg("argument type mismatch"));
        }
        let len = u32::from_le_bytes([head[1], head[2], head[3], head[4]]);
        if ty == ArgType::OptionalData && len == ABSENT {
            self.pos += 5;
            return Ok(None);
        }
        let start = self.pos + 5;
        let bytes = self
            .buf
            .get(start..start + len as usize)
            .ok_or(FusionError::InvArg("argument list truncated"))?;
        self.pos = start + len as usize;
        Ok(Some(bytes))
    }

    fn fixed<const N: usize>(&mut self, ty: ArgType) -> FusionResult<[u8; N]> {
        let bytes = self.block(ty)?.unwrap_or_default();
        bytes
            .try_into()
            .map_err(|_| FusionError::InvArg("argument has the wrong width"))
    }

    pub fn id(&mut self) -> FusionResult<InstanceId> {
        self.fixed(ArgType::Id).map(u32::from_le_bytes)
    }

    pub fn int(&mut self) -> FusionResult<i32> {
        self.fixed(ArgType::Int).map(i32::from_le_bytes)
    }

    pub fn uint(&mut self) -> FusionResult<u32> {
        self.fixed(ArgType::UInt).map(u32::from_le_bytes)
    }

    pub fn long(&mut self) -> FusionResult<i64> {
        self.fixed(ArgType::Long).map(i64::from_le_bytes)
    }

    pub fn data(&mut self) -> FusionResult<&'a [u8]> {
        Ok(self.block(ArgType::Data)?.unwrap_or_default())
    }

    pub fn optional_data(&mut self) -> FusionResult<Option<&'a [u8]>> {
        self.block(ArgType::OptionalData)
    }

    pub fn string(&mut self) -> FusionResult<&'a str> {
        let bytes = self.block(ArgType::String)?.unwrap_or_default();
        std::str::from_utf8(bytes).map_err(|_| FusionError::InvArg("string argument is not utf-8"))
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_stable() {
        let message = Message::request(9, 2, 3, MessageFlags::RESPOND, vec![0xAB]);
        let bytes = message.encode();
        assert_eq!(bytes.len(), MESSAGE_HEADER + 1);
        assert_eq!(&bytes[0..4], &9u32.to_le_bytes());
        assert_eq!(bytes[12], MessageKind::Request as u8);
        assert_eq!(bytes[13], 1);
        assert_eq!(&bytes[16..20], &0i32.to_le_bytes());
        assert_eq!(Message::decode(bytes).unwrap(), message);
    }

    #[test]
    fn responses_echo_the_request() {
        let request = Message::request(41, 5, 6, MessageFlags::RESPOND, Vec::new());
        let response = Message::response(&request, ResultCode::NoSuchMethod, Vec::new());
        let decoded = Message::decode(response.encode()).unwrap();
        assert_eq!(decoded.serial, 41);
        assert_eq!(decoded.kind, MessageKind::Response);
        assert_eq!(decoded.result, ResultCode::NoSuchMethod);
    }

    #[test]
    fn bad_headers_are_malformed() {
        assert!(matches!(
            Message::decode(vec![0; 4]),
            Err(VoodooError::Malformed(_))
        ));
        let mut bytes = Message::request(1, 1, 1, MessageFlags::NONE, Vec::new()).encode();
        bytes[12] = 9;
        assert!(matches!(Message::decode(bytes), Err(VoodooError::Malformed(_))));
    }

    #[test]
    fn arguments_read_back_in_order() {
        let mut writer = ArgWriter::new();
        writer
            .id(7)
            .int(-3)
            .uint(3)
            .long(i64::MIN)
            .data(b"pixels")
            .optional_data(None)
            .optional_data(Some(b""))
            .string("surface");
        let payload = writer.finish();
        assert!(writer.is_empty());

        let mut reader = ArgReader::new(&payload);
        assert_eq!(reader.id().unwrap(), 7);
        assert_eq!(reader.int().unwrap(), -3);
        assert_eq!(reader.uint().unwrap(), 3);
        assert_eq!(reader.long().unwrap(), i64::MIN);
        assert_eq!(reader.data().unwrap(), b"pixels");
        assert_eq!(reader.optional_data().unwrap(), None);
        assert_eq!(reader.optional_data().unwrap(), Some(&b""[..]));
        assert_eq!(reader.string().unwrap(), "surface");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn mismatched_or_truncated_arguments_are_invarg() {
        let payload = ArgWriter::new().int(5).data(b"abc").finish();
        let mut reader = ArgReader::new(&payload);
        assert!(matches!(reader.uint(), Err(FusionError::InvArg(_))));
        assert_eq!(reader.int().unwrap(), 5);

        let mut short = ArgReader::new(&payload[..payload.len() - 1]);
        short.int().unwrap();
        assert!(matches!(short.data(), Err(FusionError::InvArg(_))));
        assert!(matches!(ArgReader::new(&[]).long(), Err(FusionError::InvArg(_))));
    }

    #[test]
    fn hello_checks_magic_and_version() {
        assert!(check_hello(&encode_hello(HELLO_MAGIC, PROTOCOL_VERSION)).is_ok());
        assert_eq!(
            check_hello(&encode_hello(HELLO_MAGIC, 7)),
            Err(FusionError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found: 7
            })
        );
        assert!(matches!(
            check_hello(&encode_hello(0xdead, PROTOCOL_VERSION)),
            Err(FusionError::VersionMismatch { .. })
        ));
        assert!(check_hello(&[1, 2, 3]).is_err());
    }
}
