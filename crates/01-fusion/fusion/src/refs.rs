//! Permissioned reference counts shared between participants.
//!
//! The count word carries a sticky dead bit: the decrement that reaches zero
//! swaps in `DEAD_BIT` with a single compare-exchange, so exactly one caller
//! observes the zero transition and no increment can resurrect the count.
//! Grants, in-flight references and the watch live beside the count and are
//! only edited under the ref's skirmish.

use crate::call::{Call, CallFlags, CallSlot};
use crate::ids::ParticipantId;
use crate::region::ShmPtr;
use crate::skirmish::SkirmishCell;
use crate::world::World;
use crate::{FusionError, FusionResult};
use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Participants (besides the creator) that may hold explicit grants.
pub const MAX_GRANTS: usize = 16;
const DEAD_BIT: u64 = 1 << 63;

const REF_ALIVE: u32 = 1;
const REF_DESTROYED: u32 = 2;

/// Bit set of operations a participant may perform on a ref.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Permissions(u32);

impl Permissions {
    pub const NONE: Self = Self(0);
    /// May call `up` and `down`.
    pub const REF_UNREF: Self = Self(1);
    /// May `catch` a reference thrown to it.
    pub const CATCH: Self = Self(2);
    pub const ALL: Self = Self(3);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.contains(Self::REF_UNREF) {
            set.entry(&"REF_UNREF");
        }
        if self.contains(Self::CATCH) {
            set.entry(&"CATCH");
        }
        set.finish()
    }
}

#[repr(C)]
#[derive(Debug, Default)]
struct GrantSlot {
    participant: AtomicU32,
    perms: AtomicU32,
    in_flight: AtomicU32,
    _reserved: AtomicU32,
}

/// Arena layout of a ref.
#[repr(C)]
#[derive(Debug, Default)]
pub struct RefShared {
    lock: SkirmishCell,
    count: AtomicU64,
    state: AtomicU32,
    creator: AtomicU32,
    watch_call: AtomicU64,
    watch_arg: AtomicI64,
    grants: [GrantSlot; MAX_GRANTS],
}

/// Minimal atomic surface the count transitions need; lets the loom model
/// drive the same code as the arena.
pub(crate) trait CountWord {
    fn load(&self) -> u64;
    fn compare_exchange(&self, current: u64, new: u64) -> Result<u64, u64>;
}

impl CountWord for AtomicU64 {
    fn load(&self) -> u64 {
        AtomicU64::load(self, Ordering::Acquire)
    }

    fn compare_exchange(&self, current: u64, new: u64) -> Result<u64, u64> {
        AtomicU64::compare_exchange(self, current, new, Ordering::AcqRel, Ordering::Acquire)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Transition {
    Alive(u64),
    Zero,
}

pub(crate) fn count_up<W: CountWord>(word: &W, by: u64) -> FusionResult<u64> {
    let mut current = word.load();
    loop {
        if current & DEAD_BIT != 0 {
            return Err(FusionError::Dead);
        }
        let next = current + by;
        match word.compare_exchange(current, next) {
            Ok(_) => return Ok(next),
            Err(seen) => current = seen,
        }
    }
}

pub(crate) fn count_down<W: CountWord>(word: &W) -> FusionResult<Transition> {
    let mut current = word.load();
    loop {
        if current & DEAD_BIT != 0 {
            return Err(FusionError::Dead);
        }
        if current == 0 {
            return Err(FusionError::Dead);
        }
        let next = current - 1;
        let stored = if next == 0 { DEAD_BIT } else { next };
        match word.compare_exchange(current, stored) {
            Ok(_) if next == 0 => return Ok(Transition::Zero),
            Ok(_) => return Ok(Transition::Alive(next)),
            Err(seen) => current = seen,
        }
    }
}

/// Handle to a shared reference count.
#[derive(Clone, Debug)]
pub struct Ref {
    world: World,
    ptr: ShmPtr<RefShared>,
    owned: bool,
}

impl Ref {
    /// Allocates a standalone ref created by this participant with count 0.
    pub fn new(world: &World) -> FusionResult<Ref> {
        let ptr = world.alloc::<RefShared>()?;
        init(world, ptr, world.id(), 0)?;
        Ok(Ref {
            world: world.clone(),
            ptr,
            owned: true,
        })
    }

    /// Opens a ref another participant created.
    pub fn attach(world: &World, ptr: ShmPtr<RefShared>) -> FusionResult<Ref> {
        world.check_usable()?;
        if world.at(ptr)?.state.load(Ordering::Acquire) != REF_ALIVE {
            return Err(FusionError::Destroyed);
        }
        Ok(Ref {
            world: world.clone(),
            ptr,
            owned: true,
        })
    }

    /// Ref embedded in a larger arena structure that owns its memory.
    pub(crate) fn embedded(world: &World, ptr: ShmPtr<RefShared>) -> Ref {
        Ref {
            world: world.clone(),
            ptr,
            owned: false,
        }
    }

    pub fn id(&self) -> ShmPtr<RefShared> {
        self.ptr
    }

    pub fn creator(&self) -> FusionResult<ParticipantId> {
        Ok(ParticipantId::from_raw(
            self.shared()?.creator.load(Ordering::Acquire),
        ))
    }

    fn shared(&self) -> FusionResult<&RefShared> {
        self.world.check_usable()?;
        let shared = self.world.at(self.ptr)?;
        match shared.state.load(Ordering::Acquire) {
            REF_ALIVE => Ok(shared),
            _ => Err(FusionError::Destroyed),
        }
    }

    fn locked<R>(&self, f: impl FnOnce(&RefShared) -> FusionResult<R>) -> FusionResult<R> {
        let shared = self.shared()?;
        self.world
            .with_cell_ctx(|ctx| shared.lock.locked(ctx, || f(shared)))
    }

    /// Increments the count on behalf of this participant.
    pub fn up(&self) -> FusionResult<u64> {
        let me = self.world.id();
        self.locked(|shared| {
            require(shared, me, Permissions::REF_UNREF)?;
            count_up(&shared.count, 1)
        })
    }

    /// Decrements the count; the call that reaches zero fires the watch.
    pub fn down(&self) -> FusionResult<u64> {
        let me = self.world.id();
        let (transition, watch) = self.locked(|shared| {
            require(shared, me, Permissions::REF_UNREF)?;
            let transition = count_down(&shared.count)?;
            let watch = (transition == Transition::Zero).then(|| {
                (
                    shared.watch_call.load(Ordering::Acquire),
                    shared.watch_arg.load(Ordering::Acquire),
                )
            });
            Ok((transition, watch))
        })?;

        match transition {
            Transition::Alive(left) => Ok(left),
            Transition::Zero => {
                tracing::trace!(ptr = ?self.ptr, "ref reached zero");
                if let Some((call, arg)) = watch.filter(|(call, _)| *call != 0) {
                    self.fire_watch(ShmPtr::from_raw(call), arg);
                }
                Ok(0)
            }
        }
    }

    fn fire_watch(&self, call: ShmPtr<CallSlot>, arg: i64) {
        let fired = Call::attach(&self.world, call)
            .and_then(|call| call.execute(arg, &[], CallFlags::ONEWAY | CallFlags::QUEUED));
        if let Err(err) = fired {
            tracing::warn!(%err, ptr = ?self.ptr, "ref watch could not be executed");
        }
    }

    /// Current count; zero once dead.
    pub fn stat(&self) -> FusionResult<u64> {
        self.locked(|shared| {
            let count = shared.count.load(Ordering::Acquire);
            Ok(if count & DEAD_BIT != 0 { 0 } else { count })
        })
    }

    pub fn is_dead(&self) -> FusionResult<bool> {
        Ok(self.shared()?.count.load(Ordering::Acquire) & DEAD_BIT != 0)
    }

    /// Hands a reference to `to`: the count grows by one on its behalf and
    /// `to` may `catch` it.
    pub fn throw(&self, to: ParticipantId) -> FusionResult<()> {
        let me = self.world.id();
        self.locked(|shared| {
            require(shared, me, Permissions::REF_UNREF)?;
            let slot = grant_slot(shared, to, true)?.ok_or(FusionError::Limit("grant list full"))?;
            count_up(&shared.count, 1)?;
            slot.perms
                .fetch_or(Permissions::CATCH.bits(), Ordering::AcqRel);
            slot.in_flight.fetch_add(1, Ordering::AcqRel);
            Ok(())
        })
    }

    /// Accepts a reference previously thrown to this participant, turning it
    /// into a held reference it may release with `down`.
    pub fn catch(&self) -> FusionResult<()> {
        let me = self.world.id();
        self.locked(|shared| {
            let slot = grant_slot(shared, me, false)?.ok_or(FusionError::AccessDenied)?;
            let perms = Permissions(slot.perms.load(Ordering::Acquire));
            if !perms.contains(Permissions::CATCH) || slot.in_flight.load(Ordering::Acquire) == 0 {
                return Err(FusionError::AccessDenied);
            }
            if shared.count.load(Ordering::Acquire) & DEAD_BIT != 0 {
                return Err(FusionError::Dead);
            }
            slot.in_flight.fetch_sub(1, Ordering::AcqRel);
            slot.perms.fetch_or(Permissions::ALL.bits(), Ordering::AcqRel);
            Ok(())
        })
    }

    /// Creator only: adds `perms` to `to`'s grant.
    pub fn grant(&self, to: ParticipantId, perms: Permissions) -> FusionResult<()> {
        let me = self.world.id();
        self.locked(|shared| {
            require_creator(shared, me)?;
            let slot = grant_slot(shared, to, true)?.ok_or(FusionError::Limit("grant list full"))?;
            slot.perms.fetch_or(perms.bits(), Ordering::AcqRel);
            Ok(())
        })
    }

    /// Creator only: removes `perms` from `from`'s grant.
    pub fn revoke(&self, from: ParticipantId, perms: Permissions) -> FusionResult<()> {
        let me = self.world.id();
        self.locked(|shared| {
            require_creator(shared, me)?;
            if let Some(slot) = grant_slot(shared, from, false)? {
                let left = slot.perms.fetch_and(!perms.bits(), Ordering::AcqRel) & !perms.bits();
                if left == 0 && slot.in_flight.load(Ordering::Acquire) == 0 {
                    slot.participant.store(0, Ordering::Release);
                }
            }
            Ok(())
        })
    }

    /// Effective permissions of `who`.
    pub fn permissions(&self, who: ParticipantId) -> FusionResult<Permissions> {
        self.locked(|shared| permissions_of(shared, who))
    }

    /// Creator only: queues `call` (one-way, with `arg`) on its owner once
    /// the count reaches zero.
    pub fn watch(&self, call: &Call, arg: i64) -> FusionResult<()> {
        let me = self.world.id();
        self.locked(|shared| {
            require_creator(shared, me)?;
            if shared.watch_call.load(Ordering::Acquire) != 0 {
                return Err(FusionError::Busy);
            }
            shared.watch_arg.store(arg, Ordering::Release);
            shared.watch_call.store(call.id().raw(), Ordering::Release);
            Ok(())
        })
    }

    /// Creator only: retires a standalone ref and returns its memory.
    pub fn destroy(&self) -> FusionResult<()> {
        if !self.owned {
            return Err(FusionError::InvArg("embedded refs die with their owner"));
        }
        let me = self.world.id();
        self.locked(|shared| {
            require_creator(shared, me)?;
            shared.state.store(REF_DESTROYED, Ordering::Release);
            Ok(())
        })?;
        self.world.free(self.ptr)
    }
}

/// Initialises a ref in freshly zeroed arena memory.
pub(crate) fn init(
    world: &World,
    ptr: ShmPtr<RefShared>,
    creator: ParticipantId,
    count: u64,
) -> FusionResult<()> {
    let shared = world.at(ptr)?;
    shared.creator.store(creator.get(), Ordering::Relaxed);
    shared.count.store(count, Ordering::Relaxed);
    shared.state.store(REF_ALIVE, Ordering::Release);
    Ok(())
}

/// Sets the watch of a ref being initialised; bypasses the creator check.
pub(crate) fn init_watch(
    world: &World,
    ptr: ShmPtr<RefShared>,
    call: ShmPtr<CallSlot>,
    arg: i64,
) -> FusionResult<()> {
    let shared = world.at(ptr)?;
    shared.watch_arg.store(arg, Ordering::Relaxed);
    shared.watch_call.store(call.raw(), Ordering::Release);
    Ok(())
}

fn permissions_of(shared: &RefShared, who: ParticipantId) -> FusionResult<Permissions> {
    if shared.creator.load(Ordering::Acquire) == who.get() {
        return Ok(Permissions::ALL);
    }
    Ok(grant_slot(shared, who, false)?
        .map(|slot| Permissions(slot.perms.load(Ordering::Acquire)))
        .unwrap_or(Permissions::NONE))
}

fn require(shared: &RefShared, who: ParticipantId, perms: Permissions) -> FusionResult<()> {
    if permissions_of(shared, who)?.contains(perms) {
        Ok(())
    } else {
        Err(FusionError::AccessDenied)
    }
}

fn require_creator(shared: &RefShared, who: ParticipantId) -> FusionResult<()> {
    if shared.creator.load(Ordering::Acquire) == who.get() {
        Ok(())
    } else {
        Err(FusionError::AccessDenied)
    }
}

fn grant_slot(
    shared: &RefShared,
    who: ParticipantId,
    create: bool,
) -> FusionResult<Option<&GrantSlot>> {
    if who.is_none() {
        return Err(FusionError::InvArg("participant id zero"));
    }
    if let Some(slot) = shared
        .grants
        .iter()
        .find(|slot| slot.participant.load(Ordering::Acquire) == who.get())
    {
        return Ok(Some(slot));
    }
    if !create {
        return Ok(None);
    }
    Ok(shared
        .grants
        .iter()
        .find(|slot| slot.participant.load(Ordering::Acquire) == 0)
        .inspect(|slot| {
            slot.perms.store(0, Ordering::Relaxed);
            slot.in_flight.store(0, Ordering::Relaxed);
            slot.participant.store(who.get(), Ordering::Release);
        }))
}
