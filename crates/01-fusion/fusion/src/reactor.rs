//! Reactors: fan a fixed-size message out to every attached listener.
//!
//! The arena keeps, per roster slot, how many listeners each participant has
//! attached; the closures themselves stay in the attaching process. A
//! dispatch runs global reactions and then this process's listeners under
//! the reactor's skirmish, noting which other participants still listen.
//! Their REACTION records are posted after the skirmish is released, since a
//! post blocks while the target's inbox is full and the target's dispatcher
//! may need the skirmish to drain it. Each dispatcher delivers records in
//! arrival order, so dispatches issued by one thread reach every listener in
//! issue order.
//!
//! Lock order is shared reactor lock before the local dispatch lock; nothing
//! takes the shared lock while holding the local one.

use crate::call::{Call, CallContext, CallFlags, CallReturn, CallSlot};
use crate::dispatch::{ReactionMessage, TAG_REACTION};
use crate::ids::ParticipantId;
use crate::region::{bytes_of, read_from_bytes, Shareable, ShmPtr};
use crate::skirmish::SkirmishCell;
use crate::world::{World, MAX_PARTICIPANTS};
use crate::{FusionError, FusionResult};
use parking_lot::{Mutex, ReentrantMutex};
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Global reaction slots per reactor.
pub const MAX_GLOBALS: usize = 8;

const REACTOR_ALIVE: u32 = 1;
const REACTOR_DESTROYED: u32 = 2;

/// What a listener wants after seeing a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReactionResult {
    /// Stay attached.
    Ok,
    /// Detach; no further messages are delivered to this listener.
    Remove,
}

pub(crate) type GlobalReaction = Arc<dyn Fn(&[u8], u64) -> ReactionResult + Send + Sync>;
type Listener = Arc<dyn Fn(&[u8]) -> ReactionResult + Send + Sync>;

#[repr(C)]
#[derive(Debug, Default)]
struct ListenerCount {
    participant: AtomicU32,
    count: AtomicU32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct GlobalEntry {
    index: AtomicU32,
    active: AtomicU32,
    ctx: AtomicU64,
}

/// Arena layout of a reactor.
#[repr(C)]
#[derive(Debug)]
pub struct ReactorShared {
    lock: SkirmishCell,
    id: AtomicU32,
    owner: AtomicU32,
    state: AtomicU32,
    msg_size: AtomicU32,
    dispatch_call: AtomicU64,
    zombie_call: AtomicU64,
    zombie_arg: AtomicI64,
    listeners: [ListenerCount; MAX_PARTICIPANTS],
    globals: [GlobalEntry; MAX_GLOBALS],
}

/// Listeners a process has attached to one reactor.
#[derive(Default)]
pub(crate) struct LocalReactor {
    dispatch: ReentrantMutex<()>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next: AtomicU64,
}

impl LocalReactor {
    fn contains(&self, id: u64) -> bool {
        self.listeners.lock().iter().any(|(at, _)| *at == id)
    }
}

/// Returned by [`Reactor::attach`]; pass it to [`Reactor::detach`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerHandle {
    reactor: u64,
    id: u64,
}

/// Returned by [`Reactor::attach_global`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalHandle {
    reactor: u64,
    slot: usize,
}

/// Typed handle to a reactor carrying messages of type `M`.
pub struct Reactor<M> {
    world: World,
    ptr: ShmPtr<ReactorShared>,
    owned: bool,
    _message: PhantomData<fn(M)>,
}

impl<M> Clone for Reactor<M> {
    fn clone(&self) -> Self {
        Self {
            world: self.world.clone(),
            ptr: self.ptr,
            owned: self.owned,
            _message: PhantomData,
        }
    }
}

impl<M> std::fmt::Debug for Reactor<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("ptr", &self.ptr)
            .field("owned", &self.owned)
            .finish()
    }
}

impl<M: Shareable> Reactor<M> {
    /// Allocates a reactor owned by this participant.
    pub fn new(world: &World) -> FusionResult<Reactor<M>> {
        let ptr = world.alloc::<ReactorShared>()?;
        init(world, ptr, world.id(), size_of::<M>() as u32)?;
        Ok(Reactor {
            world: world.clone(),
            ptr,
            owned: true,
            _message: PhantomData,
        })
    }

    /// Opens an existing reactor. Fails with `InvArg` if it was created for
    /// a message of a different size.
    pub fn open(world: &World, ptr: ShmPtr<ReactorShared>) -> FusionResult<Reactor<M>> {
        let reactor = Reactor {
            world: world.clone(),
            ptr,
            owned: true,
            _message: PhantomData,
        };
        reactor.bind_message_size()?;
        Ok(reactor)
    }

    /// Reactor embedded in an object; memory goes away with the object.
    pub(crate) fn embedded(world: &World, ptr: ShmPtr<ReactorShared>) -> FusionResult<Reactor<M>> {
        let reactor = Reactor {
            world: world.clone(),
            ptr,
            owned: false,
            _message: PhantomData,
        };
        reactor.bind_message_size()?;
        Ok(reactor)
    }

    fn bind_message_size(&self) -> FusionResult<()> {
        let shared = self.shared()?;
        let size = size_of::<M>() as u32;
        match shared
            .msg_size
            .compare_exchange(0, size, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(bound) if bound == size => Ok(()),
            Err(_) => Err(FusionError::InvArg("reactor message size mismatch")),
        }
    }

    pub fn id(&self) -> ShmPtr<ReactorShared> {
        self.ptr
    }

    pub fn owner(&self) -> FusionResult<ParticipantId> {
        Ok(ParticipantId::from_raw(
            self.shared()?.owner.load(Ordering::Acquire),
        ))
    }

    fn shared(&self) -> FusionResult<&ReactorShared> {
        shared(&self.world, self.ptr)
    }

    /// Adds a listener in this process. Messages dispatched before this
    /// returns are not delivered to it.
    pub fn attach(
        &self,
        listener: impl Fn(&M) -> ReactionResult + Send + Sync + 'static,
    ) -> FusionResult<ListenerHandle> {
        let shared = self.shared()?;
        let local = local_reactor(&self.world, self.ptr, true)
            .ok_or(FusionError::Bug("local reactor table missing"))?;
        let id = local.next.fetch_add(1, Ordering::Relaxed) + 1;
        let ptr = self.ptr;
        let typed: Listener = Arc::new(move |bytes: &[u8]| match read_from_bytes::<M>(bytes) {
            Ok(message) => listener(&message),
            Err(err) => {
                tracing::warn!(%err, ?ptr, "reaction payload does not fit listener type");
                ReactionResult::Ok
            }
        });

        let slot = self.world.slot_index();
        let me = self.world.id();
        self.world.with_cell_ctx(|ctx| {
            shared.lock.locked(ctx, || {
                if shared.state.load(Ordering::Acquire) != REACTOR_ALIVE {
                    return Err(FusionError::Destroyed);
                }
                let entry = &shared.listeners[slot];
                if entry.participant.load(Ordering::Acquire) != me.get() {
                    entry.count.store(0, Ordering::Relaxed);
                    entry.participant.store(me.get(), Ordering::Release);
                }
                entry.count.fetch_add(1, Ordering::AcqRel);
                local.listeners.lock().push((id, typed));
                Ok(())
            })
        })?;
        tracing::trace!(reactor = ?self.ptr, listener = id, "listener attached");
        Ok(ListenerHandle {
            reactor: self.ptr.raw(),
            id,
        })
    }

    /// Removes a listener. Once this returns the listener will not run again.
    pub fn detach(&self, handle: ListenerHandle) -> FusionResult<()> {
        if handle.reactor != self.ptr.raw() {
            return Err(FusionError::InvArg("listener belongs to another reactor"));
        }
        let local = local_reactor(&self.world, self.ptr, false)
            .ok_or(FusionError::InvArg("unknown listener"))?;
        {
            let _dispatching = local.dispatch.lock();
            let mut listeners = local.listeners.lock();
            let before = listeners.len();
            listeners.retain(|(id, _)| *id != handle.id);
            if listeners.len() == before {
                return Err(FusionError::InvArg("unknown listener"));
            }
        }
        release_listeners(&self.world, self.ptr, 1)
    }

    /// Registers the global reaction installed at `index` with `ctx` as its
    /// context. Global reactions run in the dispatching process.
    pub fn attach_global(&self, index: u32, ctx: u64) -> FusionResult<GlobalHandle> {
        let shared = self.shared()?;
        let slot = self.world.with_cell_ctx(|cell| {
            shared.lock.locked(cell, || {
                let slot = shared
                    .globals
                    .iter()
                    .position(|entry| entry.active.load(Ordering::Acquire) == 0)
                    .ok_or(FusionError::Limit("global reactions full"))?;
                let entry = &shared.globals[slot];
                entry.index.store(index, Ordering::Relaxed);
                entry.ctx.store(ctx, Ordering::Relaxed);
                entry.active.store(1, Ordering::Release);
                Ok(slot)
            })
        })?;
        Ok(GlobalHandle {
            reactor: self.ptr.raw(),
            slot,
        })
    }

    pub fn detach_global(&self, handle: GlobalHandle) -> FusionResult<()> {
        if handle.reactor != self.ptr.raw() {
            return Err(FusionError::InvArg("global belongs to another reactor"));
        }
        let shared = self.shared()?;
        let entry = shared
            .globals
            .get(handle.slot)
            .ok_or(FusionError::InvArg("global slot out of range"))?;
        self.world.with_cell_ctx(|ctx| {
            shared.lock.locked(ctx, || {
                entry.active.store(0, Ordering::Release);
                Ok(())
            })
        })
    }

    /// Delivers `message` to every listener. Listeners of this participant
    /// are skipped unless `include_self`.
    ///
    /// When a dispatch call is set and this participant is not the owner,
    /// the message is forwarded to the owner, which dispatches it.
    pub fn dispatch(&self, message: &M, include_self: bool) -> FusionResult<()> {
        let shared = self.shared()?;
        let bytes = bytes_of(message);
        let call = shared.dispatch_call.load(Ordering::Acquire);
        let owner = shared.owner.load(Ordering::Acquire);
        if call != 0 && owner != self.world.id().get() {
            let call = Call::attach(&self.world, ShmPtr::<CallSlot>::from_raw(call))?;
            call.execute(include_self as i64, bytes, CallFlags::NONE)?;
            return Ok(());
        }
        dispatch_bytes(&self.world, self.ptr, self.world.id(), bytes, include_self)
    }

    /// Owner only: routes dispatches from other participants through a call
    /// into this participant. Returns the call so its lifetime can be managed.
    pub fn set_dispatch_call(&self) -> FusionResult<Call> {
        let shared = self.shared()?;
        if shared.owner.load(Ordering::Acquire) != self.world.id().get() {
            return Err(FusionError::AccessDenied);
        }
        let weak = self.world.downgrade();
        let ptr = self.ptr;
        let call = Call::new(&self.world, move |ctx: &CallContext<'_>| {
            let Some(world) = weak.upgrade() else {
                return CallReturn::Error(FusionError::Destroyed);
            };
            match dispatch_bytes(&world, ptr, ctx.caller(), ctx.payload(), ctx.arg() != 0) {
                Ok(()) => CallReturn::Return(0),
                Err(err) => CallReturn::Error(err),
            }
        })?;
        let previous = shared.dispatch_call.swap(call.id().raw(), Ordering::AcqRel);
        if previous != 0 {
            tracing::debug!(reactor = ?ptr, "dispatch call replaced");
        }
        Ok(call)
    }

    /// Listeners attached across all live participants.
    pub fn listener_count(&self) -> FusionResult<u32> {
        let shared = self.shared()?;
        self.world
            .with_cell_ctx(|ctx| shared.lock.locked(ctx, || Ok(total_listeners(&self.world, shared))))
    }

    /// Owner only: retires a standalone reactor.
    pub fn destroy(&self) -> FusionResult<()> {
        if !self.owned {
            return Err(FusionError::InvArg("embedded reactors die with their object"));
        }
        let shared = self.shared()?;
        if shared.owner.load(Ordering::Acquire) != self.world.id().get() {
            return Err(FusionError::AccessDenied);
        }
        retire(&self.world, self.ptr)?;
        self.world.free(self.ptr)
    }
}

fn shared(world: &World, ptr: ShmPtr<ReactorShared>) -> FusionResult<&ReactorShared> {
    world.check_usable()?;
    let shared = world.at(ptr)?;
    match shared.state.load(Ordering::Acquire) {
        REACTOR_ALIVE => Ok(shared),
        _ => Err(FusionError::Destroyed),
    }
}

fn local_reactor(world: &World, ptr: ShmPtr<ReactorShared>, create: bool) -> Option<Arc<LocalReactor>> {
    let mut reactors = world.locals().reactors.lock();
    if create {
        Some(reactors.entry(ptr.raw()).or_default().clone())
    } else {
        reactors.get(&ptr.raw()).cloned()
    }
}

/// Initialises a reactor in freshly zeroed arena memory. A `msg_size` of
/// zero leaves the message type to be bound by the first typed open.
pub(crate) fn init(
    world: &World,
    ptr: ShmPtr<ReactorShared>,
    owner: ParticipantId,
    msg_size: u32,
) -> FusionResult<()> {
    let shared = world.at(ptr)?;
    shared.id.store(world.next_id()?, Ordering::Relaxed);
    shared.owner.store(owner.get(), Ordering::Relaxed);
    shared.msg_size.store(msg_size, Ordering::Relaxed);
    shared.state.store(REACTOR_ALIVE, Ordering::Release);
    Ok(())
}

/// Marks the reactor destroyed and drops this process's listeners.
pub(crate) fn retire(world: &World, ptr: ShmPtr<ReactorShared>) -> FusionResult<()> {
    let shared = world.at(ptr)?;
    world.with_cell_ctx(|ctx| {
        shared.lock.locked(ctx, || {
            shared.state.store(REACTOR_DESTROYED, Ordering::Release);
            Ok(())
        })
    })?;
    world.locals().reactors.lock().remove(&ptr.raw());
    Ok(())
}

/// Arms the zombie call if anyone still listens. Returns whether it did;
/// when it did, the last detach executes `call` with `arg`.
pub(crate) fn arm_zombie(
    world: &World,
    ptr: ShmPtr<ReactorShared>,
    call: ShmPtr<CallSlot>,
    arg: i64,
) -> FusionResult<bool> {
    let shared = shared(world, ptr)?;
    world.with_cell_ctx(|ctx| {
        shared.lock.locked(ctx, || {
            let listening = total_listeners(world, shared) > 0;
            if listening {
                shared.zombie_arg.store(arg, Ordering::Relaxed);
                shared.zombie_call.store(call.raw(), Ordering::Release);
            }
            Ok(listening)
        })
    })
}

fn total_listeners(world: &World, shared: &ReactorShared) -> u32 {
    let mut total = 0;
    for entry in &shared.listeners {
        let participant = ParticipantId::from_raw(entry.participant.load(Ordering::Acquire));
        if participant.is_none() {
            continue;
        }
        if !world.is_alive(participant) {
            entry.count.store(0, Ordering::Relaxed);
            entry.participant.store(0, Ordering::Release);
            continue;
        }
        total += entry.count.load(Ordering::Acquire);
    }
    total
}

fn release_listeners(world: &World, ptr: ShmPtr<ReactorShared>, n: u32) -> FusionResult<()> {
    let shared = shared(world, ptr)?;
    let slot = world.slot_index();
    let zombie = world.with_cell_ctx(|ctx| {
        shared.lock.locked(ctx, || {
            let entry = &shared.listeners[slot];
            let left = entry.count.load(Ordering::Acquire).saturating_sub(n);
            entry.count.store(left, Ordering::Release);
            if left == 0 {
                entry.participant.store(0, Ordering::Release);
            }
            let call = shared.zombie_call.load(Ordering::Acquire);
            Ok((call != 0 && total_listeners(world, shared) == 0).then(|| {
                shared.zombie_call.store(0, Ordering::Release);
                (call, shared.zombie_arg.load(Ordering::Acquire))
            }))
        })
    })?;
    if let Some((call, arg)) = zombie {
        tracing::debug!(reactor = ?ptr, "last listener gone; finishing zombie");
        Call::attach(world, ShmPtr::from_raw(call))?.execute(
            arg,
            &[],
            CallFlags::ONEWAY | CallFlags::QUEUED,
        )?;
    }
    Ok(())
}

fn dispatch_bytes(
    world: &World,
    ptr: ShmPtr<ReactorShared>,
    origin: ParticipantId,
    bytes: &[u8],
    include_origin: bool,
) -> FusionResult<()> {
    let shared = shared(world, ptr)?;
    let size = shared.msg_size.load(Ordering::Acquire) as usize;
    if size != 0 && size != bytes.len() {
        return Err(FusionError::InvArg("reactor message size mismatch"));
    }
    let me = world.id();
    let (removed, remote) = world.with_cell_ctx(|ctx| {
        shared
            .lock
            .locked(ctx, || fan_out(world, shared, ptr, me, origin, bytes, include_origin))
    })?;
    if removed > 0 {
        release_listeners(world, ptr, removed)?;
    }
    if remote.is_empty() {
        return Ok(());
    }

    let record = ReactionMessage {
        reactor: ptr.raw(),
        origin,
        payload: bytes.to_vec(),
    }
    .encode();
    for participant in remote {
        match world.post(participant, TAG_REACTION, &record) {
            Ok(()) => {}
            Err(FusionError::Destroyed) => {
                tracing::debug!(%participant, reactor = ?ptr, "listener participant gone");
                forget_participant(world, shared, participant)?;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn forget_participant(
    world: &World,
    shared: &ReactorShared,
    participant: ParticipantId,
) -> FusionResult<()> {
    world.with_cell_ctx(|ctx| {
        shared.lock.locked(ctx, || {
            for entry in &shared.listeners {
                if entry.participant.load(Ordering::Acquire) == participant.get() {
                    entry.count.store(0, Ordering::Relaxed);
                    entry.participant.store(0, Ordering::Release);
                }
            }
            Ok(())
        })
    })
}

/// Runs global reactions and this process's listeners under the reactor
/// lock. Returns how many local listeners asked to be removed and which
/// other participants still need a REACTION record.
fn fan_out(
    world: &World,
    shared: &ReactorShared,
    ptr: ShmPtr<ReactorShared>,
    me: ParticipantId,
    origin: ParticipantId,
    bytes: &[u8],
    include_origin: bool,
) -> FusionResult<(u32, Vec<ParticipantId>)> {
    for entry in &shared.globals {
        if entry.active.load(Ordering::Acquire) == 0 {
            continue;
        }
        let index = entry.index.load(Ordering::Acquire);
        let reaction = world.locals().globals.lock().get(&index).cloned();
        match reaction {
            Some(reaction) => {
                if reaction(bytes, entry.ctx.load(Ordering::Acquire)) == ReactionResult::Remove {
                    entry.active.store(0, Ordering::Release);
                }
            }
            None => tracing::warn!(index, reactor = ?ptr, "no global reaction registered"),
        }
    }

    let mut removed = 0;
    let mut remote = Vec::new();
    for entry in &shared.listeners {
        let participant = ParticipantId::from_raw(entry.participant.load(Ordering::Acquire));
        if participant.is_none() || entry.count.load(Ordering::Acquire) == 0 {
            continue;
        }
        if participant == origin && !include_origin {
            continue;
        }
        if participant == me {
            removed += run_local(world, ptr, bytes);
        } else {
            remote.push(participant);
        }
    }
    Ok((removed, remote))
}

/// Runs this process's listeners. Returns how many detached themselves; the
/// caller adjusts the shared count after dropping the dispatch lock.
fn run_local(world: &World, ptr: ShmPtr<ReactorShared>, bytes: &[u8]) -> u32 {
    let Some(local) = local_reactor(world, ptr, false) else {
        return 0;
    };
    let _dispatching = local.dispatch.lock();
    let snapshot: Vec<(u64, Listener)> = local.listeners.lock().clone();
    let mut removed = Vec::new();
    for (id, listener) in snapshot {
        if !local.contains(id) {
            continue;
        }
        if listener(bytes) == ReactionResult::Remove {
            local.listeners.lock().retain(|(at, _)| *at != id);
            removed.push(id);
        }
    }
    removed.len() as u32
}

/// Delivers a REACTION record to this process's listeners.
pub(crate) fn deliver(world: &World, message: ReactionMessage) -> FusionResult<()> {
    let ptr = ShmPtr::<ReactorShared>::from_raw(message.reactor);
    let removed = run_local(world, ptr, &message.payload);
    if removed > 0 {
        release_listeners(world, ptr, removed)?;
    }
    Ok(())
}
