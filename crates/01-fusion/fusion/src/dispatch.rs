//! Inbox record formats and the per-participant dispatcher thread.
//!
//! Records are little-endian and fixed-header:
//!
//! ```text
//! CALL     [call u64][arg i64][reply u64][caller u32][flags u32][payload ...]
//! REACTION [reactor u64][origin u32][reserved u32][payload ...]
//! ```

use crate::call;
use crate::ids::ParticipantId;
use crate::inbox::{Inbox, InboxHeader, Record};
use crate::reactor;
use crate::region::{SharedRegion, ShmPtr};
use crate::world::WeakWorld;
use crate::{Cancel, FusionError, FusionResult};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub(crate) const TAG_CALL: u8 = 1;
pub(crate) const TAG_REACTION: u8 = 2;

const CALL_HEADER: usize = 32;
const REACTION_HEADER: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CallMessage {
    pub call: u64,
    pub arg: i64,
    pub reply: u64,
    pub caller: ParticipantId,
    pub flags: u32,
    pub payload: Vec<u8>,
}

impl CallMessage {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CALL_HEADER + self.payload.len());
        buf.extend_from_slice(&self.call.to_le_bytes());
        buf.extend_from_slice(&self.arg.to_le_bytes());
        buf.extend_from_slice(&self.reply.to_le_bytes());
        buf.extend_from_slice(&self.caller.get().to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> FusionResult<Self> {
        let mut reader = Reader::new(buf);
        let call = reader.u64()?;
        let arg = reader.u64()? as i64;
        let reply = reader.u64()?;
        let caller = ParticipantId::from_raw(reader.u32()?);
        let flags = reader.u32()?;
        Ok(Self {
            call,
            arg,
            reply,
            caller,
            flags,
            payload: reader.rest().to_vec(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ReactionMessage {
    pub reactor: u64,
    pub origin: ParticipantId,
    pub payload: Vec<u8>,
}

impl ReactionMessage {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REACTION_HEADER + self.payload.len());
        buf.extend_from_slice(&self.reactor.to_le_bytes());
        buf.extend_from_slice(&self.origin.get().to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> FusionResult<Self> {
        let mut reader = Reader::new(buf);
        let reactor = reader.u64()?;
        let origin = ParticipantId::from_raw(reader.u32()?);
        reader.u32()?;
        Ok(Self {
            reactor,
            origin,
            payload: reader.rest().to_vec(),
        })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> FusionResult<[u8; N]> {
        let end = self.pos + N;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(FusionError::InvArg("truncated inbox record"))?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u32(&mut self) -> FusionResult<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> FusionResult<u64> {
        self.take::<8>().map(u64::from_le_bytes)
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

pub(crate) fn spawn(
    world: WeakWorld,
    region: Arc<SharedRegion>,
    inbox: ShmPtr<InboxHeader>,
    cancel: Cancel,
    slice: Duration,
) -> FusionResult<JoinHandle<()>> {
    thread::Builder::new()
        .name("fusion-dispatch".into())
        .spawn(move || run(world, region, inbox, cancel, slice))
        .map_err(FusionError::from)
}

fn run(
    world: WeakWorld,
    region: Arc<SharedRegion>,
    at: ShmPtr<InboxHeader>,
    cancel: Cancel,
    slice: Duration,
) {
    let inbox = match Inbox::new(&region, at) {
        Ok(inbox) => inbox,
        Err(err) => {
            tracing::error!(%err, "dispatcher cannot open its inbox");
            return;
        }
    };
    while !cancel.is_cancelled() {
        match inbox.pop() {
            Ok(Some(record)) => {
                let Some(world) = world.upgrade() else {
                    break;
                };
                if let Err(err) = handle(&world, record) {
                    tracing::warn!(%err, participant = %world.id(), "dropping undeliverable record");
                }
            }
            Ok(None) => inbox.wait_for_records(slice),
            Err(err) => {
                tracing::error!(%err, "inbox corrupted; dispatcher stopping");
                break;
            }
        }
    }
    tracing::debug!("dispatcher stopped");
}

fn handle(world: &crate::World, record: Record) -> FusionResult<()> {
    match record.tag {
        TAG_CALL => call::serve(world, CallMessage::decode(&record.payload)?),
        TAG_REACTION => reactor::deliver(world, ReactionMessage::decode(&record.payload)?),
        tag => {
            tracing::warn!(tag, "unknown inbox record");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_record_layout_is_stable() {
        let message = CallMessage {
            call: 0x1000,
            arg: -7,
            reply: 0x2000,
            caller: ParticipantId::from_raw(3),
            flags: 1,
            payload: b"abc".to_vec(),
        };
        let bytes = message.encode();
        assert_eq!(bytes.len(), CALL_HEADER + 3);
        assert_eq!(&bytes[..8], &0x1000u64.to_le_bytes());
        assert_eq!(&bytes[24..28], &3u32.to_le_bytes());
        assert_eq!(CallMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn truncated_records_are_rejected() {
        let bytes = ReactionMessage {
            reactor: 64,
            origin: ParticipantId::from_raw(2),
            payload: vec![9; 4],
        }
        .encode();
        assert!(ReactionMessage::decode(&bytes).is_ok());
        assert!(matches!(
            ReactionMessage::decode(&bytes[..10]),
            Err(FusionError::InvArg(_))
        ));
        assert!(CallMessage::decode(&bytes[..20]).is_err());
    }
}
