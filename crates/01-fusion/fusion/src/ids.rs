//! Identities used for ownership and permission checks.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Identifier of one participant inside a world.
///
/// Ids start at 1 and are never reused for the lifetime of the arena, so a
/// stale id can always be told apart from a live one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(u32);

impl ParticipantId {
    /// Placeholder for locks that are not bound to any world.
    pub const NONE: Self = Self(0);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "participant#{}", self.0)
    }
}

static NEXT_THREAD: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_TOKEN: u32 = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
}

/// Process-unique token of the calling thread.
pub(crate) fn thread_token() -> u32 {
    THREAD_TOKEN.with(|token| *token)
}

/// Lock owner identity: participant in the high half, thread in the low half.
pub(crate) fn owner_token(participant: ParticipantId) -> u64 {
    ((participant.get() as u64) << 32) | thread_token() as u64
}

pub(crate) fn owner_participant(token: u64) -> ParticipantId {
    ParticipantId((token >> 32) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_differ_per_thread() {
        let here = owner_token(ParticipantId::from_raw(3));
        let there = std::thread::spawn(|| owner_token(ParticipantId::from_raw(3)))
            .join()
            .unwrap();
        assert_ne!(here, there);
        assert_eq!(owner_participant(here), ParticipantId::from_raw(3));
        assert_eq!(owner_participant(there), ParticipantId::from_raw(3));
    }
}
