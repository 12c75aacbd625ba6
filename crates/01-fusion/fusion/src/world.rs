//! Worlds: one shared arena plus the roster of processes participating in it.
//!
//! ```text
//! fusion.<index>
//! +--------------+-----------+-------------+-----------+------------------+
//! | ArenaHeader  | HeapHeader| arena lock  | roster[32]| roots[32]        |
//! +--------------+-----------+-------------+-----------+------------------+
//! | heap: inboxes, skirmishes, refs, reactors, pools, objects, replies ... |
//! +-----------------------------------------------------------------------+
//! ```
//!
//! The first participant (master) creates and formats the arena; slaves map
//! it once it is marked ready. Every participant gets a roster slot and an
//! inbox, and runs one dispatcher thread that drains that inbox.

use crate::call::CallHandler;
use crate::config::FusionConfig;
use crate::dispatch;
use crate::heap::{Heap, HeapHeader, HeapStats};
use crate::ids::{owner_token, ParticipantId};
use crate::inbox::{self, Inbox, InboxHeader};
use crate::reactor::{GlobalReaction, LocalReactor, ReactionResult};
use crate::region::{align_up, bytes_of, read_from_bytes, Shareable, SharedRegion, ShmPtr};
use crate::skirmish::{CellCtx, SkirmishCell};
use crate::wait::WaitScope;
use crate::{Cancel, FusionError, FusionResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::mem::{offset_of, size_of};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

/// Maximum number of simultaneously active participants per world.
pub const MAX_PARTICIPANTS: usize = 32;
/// Arena layout version; slaves refuse arenas with a different one.
pub const ARENA_VERSION: u32 = 1;
const MAX_ROOTS: usize = 32;
const ROOT_NAME_LEN: usize = 32;
const ARENA_MAGIC: u64 = 0x4655_5349_4f4e_4152;

const SLOT_FREE: u32 = 0;
const SLOT_ACTIVE: u32 = 1;

const STATE_ACTIVE: u32 = 0;
const STATE_LEFT: u32 = 1;
const STATE_FORKED: u32 = 2;

const HEADER: ShmPtr<ArenaHeader> = ShmPtr::from_raw(0);

#[repr(C)]
struct ParticipantSlot {
    id: AtomicU32,
    state: AtomicU32,
    pid: AtomicU32,
    master: AtomicU32,
    inbox: AtomicU64,
}

#[repr(C)]
struct RootSlot {
    name: [AtomicU64; ROOT_NAME_LEN / 8],
    ptr: AtomicU64,
    used: AtomicU64,
}

#[repr(C)]
struct ArenaHeader {
    magic: AtomicU64,
    version: AtomicU32,
    ready: AtomicU32,
    index: AtomicU32,
    master: AtomicU32,
    size: AtomicU64,
    next_participant: AtomicU32,
    next_id: AtomicU32,
    inbox_capacity: AtomicU32,
    _reserved: AtomicU32,
    heap: HeapHeader,
    lock: SkirmishCell,
    roster: [ParticipantSlot; MAX_PARTICIPANTS],
    roots: [RootSlot; MAX_ROOTS],
}

const HEAP_HEADER: ShmPtr<HeapHeader> = HEADER.byte_add(offset_of!(ArenaHeader, heap) as u64);
const HEAP_START: usize = align_up(size_of::<ArenaHeader>(), 64);

/// How a process wants to join a world.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Create the arena; fails with `Busy` if a live master already exists.
    Master,
    /// Join an arena created by a master.
    Slave,
    /// Master if no live arena exists, slave otherwise.
    Any,
}

/// What a forked child does with the world it inherited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkAction {
    /// Enter the same world again as a new participant.
    Rejoin,
    /// Drop out; the inherited handle becomes unusable.
    Leave,
}

/// Result of [`World::fork`] on each side of the fork.
#[derive(Debug)]
pub enum ForkOutcome {
    Parent { child_pid: u32 },
    Child(Option<World>),
}

/// Process-local state attached to a participant: handlers and listeners
/// that cannot live in shared memory.
#[derive(Default)]
pub(crate) struct Locals {
    pub(crate) calls: Mutex<HashMap<u64, Arc<dyn CallHandler>>>,
    pub(crate) reactors: Mutex<HashMap<u64, Arc<LocalReactor>>>,
    pub(crate) globals: Mutex<HashMap<u32, GlobalReaction>>,
}

struct WorldInner {
    region: Arc<SharedRegion>,
    index: u32,
    me: ParticipantId,
    slot: usize,
    master: bool,
    pid: u32,
    config: FusionConfig,
    state: AtomicU32,
    cancel: Cancel,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    locals: Locals,
}

/// Handle to this process's membership in a world. Cloning is cheap; the
/// participant leaves when the last clone drops (or on [`World::leave`]).
#[derive(Clone)]
pub struct World {
    inner: Arc<WorldInner>,
}

/// Non-owning world handle, held by handlers and the dispatcher thread.
#[derive(Clone)]
pub struct WeakWorld {
    inner: Weak<WorldInner>,
}

impl WeakWorld {
    pub fn upgrade(&self) -> Option<World> {
        self.inner.upgrade().map(|inner| World { inner })
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("index", &self.inner.index)
            .field("participant", &self.inner.me)
            .field("master", &self.inner.master)
            .finish()
    }
}

impl World {
    /// Joins world `index` under `config.shm_dir`.
    pub fn enter(index: u32, role: Role, config: &FusionConfig) -> FusionResult<World> {
        std::fs::create_dir_all(&config.shm_dir)?;
        let path = config.arena_path(index);
        let (region, master) = match role {
            Role::Master => (create_arena(&path, index, config)?, true),
            Role::Slave => (open_arena(&path, config)?, false),
            Role::Any => match create_arena(&path, index, config) {
                Ok(region) => (region, true),
                Err(FusionError::Busy) => (open_arena(&path, config)?, false),
                Err(err) => return Err(err),
            },
        };
        join(region, index, master, config)
    }

    pub fn index(&self) -> u32 {
        self.inner.index
    }

    /// This process's participant id.
    pub fn id(&self) -> ParticipantId {
        self.inner.me
    }

    pub fn is_master(&self) -> bool {
        self.inner.master
    }

    pub fn config(&self) -> &FusionConfig {
        &self.inner.config
    }

    pub fn path(&self) -> &Path {
        self.inner.region.path()
    }

    pub fn downgrade(&self) -> WeakWorld {
        WeakWorld {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether `id` is an active participant whose process still exists.
    pub fn is_alive(&self, id: ParticipantId) -> bool {
        self.inner.is_alive(id)
    }

    /// Ids of all live participants, in roster order.
    pub fn participants(&self) -> FusionResult<Vec<ParticipantId>> {
        self.check_usable()?;
        let header = self.inner.header()?;
        Ok(header
            .roster
            .iter()
            .filter(|slot| slot.state.load(Ordering::Acquire) == SLOT_ACTIVE)
            .filter(|slot| pid_alive(slot.pid.load(Ordering::Acquire)))
            .map(|slot| ParticipantId::from_raw(slot.id.load(Ordering::Acquire)))
            .collect())
    }

    /// Stops the dispatcher and gives up this participant's roster slot.
    /// Every handle (and everything created through it) becomes unusable.
    pub fn leave(&self) -> FusionResult<()> {
        self.inner.depart()
    }

    /// Master only: leaves and removes the arena file if configured to.
    pub fn shutdown(&self) -> FusionResult<()> {
        if !self.inner.master {
            return Err(FusionError::AccessDenied);
        }
        self.inner.depart()?;
        if self.inner.config.unlink_on_shutdown {
            match std::fs::remove_file(self.path()) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        tracing::debug!(index = self.inner.index, "world shut down");
        Ok(())
    }

    /// Forks the process and applies `action` in the child.
    ///
    /// Only the calling thread survives in the child; the inherited handle
    /// stops working there either way and the parent is unaffected.
    pub fn fork(&self, action: ForkAction) -> FusionResult<ForkOutcome> {
        self.check_usable()?;
        // SAFETY: the child only touches state owned by this thread before it
        // either re-enters the world from scratch or abandons the handle.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(std::io::Error::last_os_error().into()),
            0 => {
                self.inner.state.store(STATE_FORKED, Ordering::Release);
                match action {
                    ForkAction::Rejoin => {
                        let world = World::enter(self.inner.index, Role::Slave, &self.inner.config)?;
                        Ok(ForkOutcome::Child(Some(world)))
                    }
                    ForkAction::Leave => Ok(ForkOutcome::Child(None)),
                }
            }
            child => Ok(ForkOutcome::Parent {
                child_pid: child as u32,
            }),
        }
    }

    /// Allocates `len` zeroed bytes from the arena heap.
    pub fn alloc_bytes(&self, len: usize) -> FusionResult<ShmPtr<u8>> {
        self.check_usable()?;
        let heap = Heap::new(&self.inner.region, HEAP_HEADER)?;
        let offset = self.with_cell_ctx(|ctx| heap.alloc(ctx, len))?;
        Ok(ShmPtr::from_raw(offset))
    }

    /// Allocates room for `value` and copies it in.
    pub fn alloc_value<T: Shareable>(&self, value: &T) -> FusionResult<ShmPtr<T>> {
        let ptr = self.alloc::<T>()?;
        self.write(ptr, value)?;
        Ok(ptr)
    }

    /// Returns an allocation made by any participant to the heap.
    pub fn free<T>(&self, ptr: ShmPtr<T>) -> FusionResult<()> {
        self.check_usable()?;
        let heap = Heap::new(&self.inner.region, HEAP_HEADER)?;
        self.with_cell_ctx(|ctx| heap.free(ctx, ptr.raw()))
    }

    pub fn read<T: Shareable>(&self, ptr: ShmPtr<T>) -> FusionResult<T> {
        self.check_usable()?;
        let bytes = self.inner.region.read_bytes(ptr.raw(), size_of::<T>())?;
        read_from_bytes(&bytes)
    }

    pub fn write<T: Shareable>(&self, ptr: ShmPtr<T>, value: &T) -> FusionResult<()> {
        self.check_usable()?;
        self.inner.region.write_bytes(ptr.raw(), bytes_of(value))
    }

    pub fn heap_stats(&self) -> FusionResult<HeapStats> {
        Ok(Heap::new(&self.inner.region, HEAP_HEADER)?.stats())
    }

    /// Publishes `ptr` under `name` so other participants can find it.
    pub fn publish_root<T>(&self, name: &str, ptr: ShmPtr<T>) -> FusionResult<()> {
        let words = encode_name(name)?;
        self.with_arena_lock(|header| {
            if find_root(header, &words).is_some() {
                return Err(FusionError::Busy);
            }
            let slot = header
                .roots
                .iter()
                .find(|slot| slot.used.load(Ordering::Relaxed) == 0)
                .ok_or(FusionError::Limit("root table full"))?;
            for (word, value) in slot.name.iter().zip(words) {
                word.store(value, Ordering::Relaxed);
            }
            slot.ptr.store(ptr.raw(), Ordering::Relaxed);
            slot.used.store(1, Ordering::Release);
            Ok(())
        })
    }

    pub fn lookup_root<T>(&self, name: &str) -> FusionResult<Option<ShmPtr<T>>> {
        let words = encode_name(name)?;
        self.with_arena_lock(|header| {
            Ok(find_root(header, &words)
                .map(|slot| ShmPtr::from_raw(slot.ptr.load(Ordering::Relaxed))))
        })
    }

    /// Removes a published name; returns whether it existed.
    pub fn unpublish_root(&self, name: &str) -> FusionResult<bool> {
        let words = encode_name(name)?;
        self.with_arena_lock(|header| match find_root(header, &words) {
            Some(slot) => {
                slot.used.store(0, Ordering::Release);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    /// Installs the reaction run for global listeners registered at `index`.
    ///
    /// Global reactions are looked up in the dispatching process, so every
    /// participant that may dispatch must register the same table.
    pub fn register_global_reaction(
        &self,
        index: u32,
        reaction: impl Fn(&[u8], u64) -> ReactionResult + Send + Sync + 'static,
    ) -> FusionResult<()> {
        self.check_usable()?;
        let mut globals = self.inner.locals.globals.lock();
        if globals.contains_key(&index) {
            return Err(FusionError::Busy);
        }
        globals.insert(index, Arc::new(reaction));
        Ok(())
    }

    pub(crate) fn alloc<T>(&self) -> FusionResult<ShmPtr<T>> {
        Ok(self.alloc_bytes(size_of::<T>())?.cast())
    }

    pub(crate) fn at<T>(&self, ptr: ShmPtr<T>) -> FusionResult<&T> {
        self.inner.region.at(ptr)
    }

    pub(crate) fn region(&self) -> &SharedRegion {
        &self.inner.region
    }

    pub(crate) fn locals(&self) -> &Locals {
        &self.inner.locals
    }

    /// Roster slot of this participant.
    pub(crate) fn slot_index(&self) -> usize {
        self.inner.slot
    }

    /// Participant currently occupying roster slot `slot`, if any.
    pub(crate) fn slot_participant(&self, slot: usize) -> Option<ParticipantId> {
        let header = self.inner.header().ok()?;
        let slot = header.roster.get(slot)?;
        (slot.state.load(Ordering::Acquire) == SLOT_ACTIVE)
            .then(|| ParticipantId::from_raw(slot.id.load(Ordering::Acquire)))
    }

    /// World-unique id for objects and reactors.
    pub(crate) fn next_id(&self) -> FusionResult<u32> {
        Ok(self.inner.header()?.next_id.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Fails once this handle may no longer touch the arena.
    pub(crate) fn check_usable(&self) -> FusionResult<()> {
        self.inner.check_usable()
    }

    pub(crate) fn with_cell_ctx<R>(&self, f: impl FnOnce(&CellCtx<'_>) -> R) -> R {
        self.inner.with_cell_ctx(f)
    }

    /// Queues a record on `target`'s inbox.
    pub(crate) fn post(&self, target: ParticipantId, tag: u8, payload: &[u8]) -> FusionResult<()> {
        self.check_usable()?;
        let header = self.inner.header()?;
        let at = header
            .roster
            .iter()
            .find(|slot| {
                slot.id.load(Ordering::Acquire) == target.get()
                    && slot.state.load(Ordering::Acquire) == SLOT_ACTIVE
            })
            .map(|slot| ShmPtr::<InboxHeader>::from_raw(slot.inbox.load(Ordering::Acquire)))
            .ok_or(FusionError::Destroyed)?;
        let inbox = Inbox::new(&self.inner.region, at)?;
        self.with_cell_ctx(|ctx| inbox.post(ctx, target, tag, payload))
    }

    fn with_arena_lock<R>(
        &self,
        f: impl FnOnce(&ArenaHeader) -> FusionResult<R>,
    ) -> FusionResult<R> {
        self.check_usable()?;
        let header = self.inner.header()?;
        self.with_cell_ctx(|ctx| header.lock.locked(ctx, || f(header)))
    }
}

impl WorldInner {
    fn header(&self) -> FusionResult<&ArenaHeader> {
        self.region.at(HEADER)
    }

    fn check_usable(&self) -> FusionResult<()> {
        match self.state.load(Ordering::Acquire) {
            STATE_ACTIVE if self.pid == std::process::id() => Ok(()),
            STATE_ACTIVE => {
                tracing::error!(participant = %self.me, "world handle used in a forked child");
                Err(FusionError::Bug("world handle used in a forked child"))
            }
            _ => Err(FusionError::Destroyed),
        }
    }

    fn is_alive(&self, id: ParticipantId) -> bool {
        if id == self.me {
            return self.state.load(Ordering::Acquire) == STATE_ACTIVE;
        }
        self.header().is_ok_and(|header| roster_alive(header, id))
    }

    fn with_cell_ctx<R>(&self, f: impl FnOnce(&CellCtx<'_>) -> R) -> R {
        let alive = |id: ParticipantId| self.is_alive(id);
        let ctx = CellCtx {
            me: owner_token(self.me),
            scope: WaitScope::Shared,
            slice: self.config.liveness_interval,
            alive: &alive,
        };
        f(&ctx)
    }

    fn inbox(&self) -> FusionResult<Inbox<'_>> {
        let header = self.header()?;
        let at = header.roster[self.slot].inbox.load(Ordering::Acquire);
        Inbox::new(&self.region, ShmPtr::from_raw(at))
    }

    fn depart(&self) -> FusionResult<()> {
        if self.pid != std::process::id() || self.state.load(Ordering::Acquire) == STATE_FORKED {
            // The dispatcher thread does not exist in a forked child.
            if let Some(handle) = self.dispatcher.lock().take() {
                std::mem::forget(handle);
            }
            return Ok(());
        }
        if self
            .state
            .compare_exchange(STATE_ACTIVE, STATE_LEFT, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        self.cancel.cancel();
        let inbox = self.inbox()?;
        inbox.ring_doorbell();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!(participant = %self.me, "dispatcher thread panicked");
            }
        }
        self.locals.calls.lock().clear();
        self.locals.reactors.lock().clear();

        let header = self.header()?;
        self.with_cell_ctx(|ctx| {
            header.lock.locked(ctx, || {
                let closed = inbox.close(ctx);
                let slot = &header.roster[self.slot];
                slot.state.store(SLOT_FREE, Ordering::Release);
                let _ = header.master.compare_exchange(
                    self.me.get(),
                    0,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                closed
            })
        })?;
        tracing::debug!(index = self.index, participant = %self.me, "left world");
        Ok(())
    }
}

impl Drop for WorldInner {
    fn drop(&mut self) {
        if let Err(err) = self.depart() {
            tracing::warn!(%err, participant = %self.me, "failed to leave world cleanly");
        }
    }
}

fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if pid == std::process::id() {
        return true;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn roster_alive(header: &ArenaHeader, id: ParticipantId) -> bool {
    header.roster.iter().any(|slot| {
        slot.id.load(Ordering::Acquire) == id.get()
            && slot.state.load(Ordering::Acquire) == SLOT_ACTIVE
            && pid_alive(slot.pid.load(Ordering::Acquire))
    })
}

fn encode_name(name: &str) -> FusionResult<[u64; ROOT_NAME_LEN / 8]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > ROOT_NAME_LEN {
        return Err(FusionError::InvArg("root names must be 1 to 32 bytes"));
    }
    let mut raw = [0u8; ROOT_NAME_LEN];
    raw[..bytes.len()].copy_from_slice(bytes);
    let mut words = [0u64; ROOT_NAME_LEN / 8];
    for (word, chunk) in words.iter_mut().zip(raw.chunks_exact(8)) {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(chunk);
        *word = u64::from_le_bytes(buf);
    }
    Ok(words)
}

fn find_root<'a>(header: &'a ArenaHeader, words: &[u64; ROOT_NAME_LEN / 8]) -> Option<&'a RootSlot> {
    header.roots.iter().find(|slot| {
        slot.used.load(Ordering::Acquire) != 0
            && slot
                .name
                .iter()
                .zip(words)
                .all(|(word, expected)| word.load(Ordering::Relaxed) == *expected)
    })
}

/// An arena nobody can still be using: no live participant, or an
/// initialisation that never finished.
fn arena_is_stale(path: &Path, config: &FusionConfig) -> FusionResult<bool> {
    let region = match SharedRegion::open(path) {
        Ok(region) => region,
        Err(FusionError::Init) => return Ok(true),
        Err(err) => return Err(err),
    };
    if region.len() < size_of::<ArenaHeader>() {
        return Ok(true);
    }
    let header = region.at(HEADER)?;
    if header.ready.load(Ordering::Acquire) == 0 {
        let age = std::fs::metadata(path)?
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or_default();
        return Ok(age > config.enter_timeout);
    }
    Ok(!header.roster.iter().any(|slot| {
        slot.state.load(Ordering::Acquire) == SLOT_ACTIVE
            && pid_alive(slot.pid.load(Ordering::Acquire))
    }))
}

fn create_arena(path: &Path, index: u32, config: &FusionConfig) -> FusionResult<SharedRegion> {
    let minimum = HEAP_START + 4 * inbox::footprint(config.inbox_capacity);
    if config.arena_size < minimum {
        return Err(FusionError::InvArg("arena too small for header and inboxes"));
    }
    if path.exists() {
        if !arena_is_stale(path, config)? {
            return Err(FusionError::Busy);
        }
        tracing::warn!(path = %path.display(), "replacing stale arena");
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }

    let region = SharedRegion::create(path, config.arena_size).map_err(|err| {
        if path.exists() {
            FusionError::Busy
        } else {
            err
        }
    })?;
    let header = region.at(HEADER)?;
    header.version.store(ARENA_VERSION, Ordering::Relaxed);
    header.index.store(index, Ordering::Relaxed);
    header.size.store(config.arena_size as u64, Ordering::Relaxed);
    header.next_participant.store(1, Ordering::Relaxed);
    header
        .inbox_capacity
        .store(config.inbox_capacity as u32, Ordering::Relaxed);
    Heap::new(&region, HEAP_HEADER)?.format(HEAP_START as u64, region.len() as u64)?;
    header.magic.store(ARENA_MAGIC, Ordering::Release);
    header.ready.store(1, Ordering::Release);
    tracing::debug!(index, path = %path.display(), size = config.arena_size, "created arena");
    Ok(region)
}

fn open_arena(path: &Path, config: &FusionConfig) -> FusionResult<SharedRegion> {
    let deadline = Instant::now() + config.enter_timeout;
    loop {
        let last_err = match SharedRegion::open(path) {
            Ok(region) if region.len() >= size_of::<ArenaHeader>() => {
                let header = region.at(HEADER)?;
                if header.ready.load(Ordering::Acquire) != 0 {
                    if header.magic.load(Ordering::Acquire) != ARENA_MAGIC {
                        return Err(FusionError::Init);
                    }
                    let found = header.version.load(Ordering::Acquire);
                    if found != ARENA_VERSION {
                        return Err(FusionError::VersionMismatch {
                            expected: ARENA_VERSION,
                            found,
                        });
                    }
                    return Ok(region);
                }
                FusionError::Timeout
            }
            Ok(_) => FusionError::Timeout,
            Err(_) => FusionError::Init,
        };
        if Instant::now() >= deadline {
            return Err(last_err);
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn join(region: SharedRegion, index: u32, master: bool, config: &FusionConfig) -> FusionResult<World> {
    let region = Arc::new(region);
    let header = region.at(HEADER)?;
    let me = ParticipantId::from_raw(header.next_participant.fetch_add(1, Ordering::AcqRel));
    let pid = std::process::id();
    let capacity = header.inbox_capacity.load(Ordering::Acquire) as usize;

    let alive = |id: ParticipantId| roster_alive(header, id);
    let ctx = CellCtx {
        me: owner_token(me),
        scope: WaitScope::Shared,
        slice: config.liveness_interval,
        alive: &alive,
    };
    let (slot, inbox) = header.lock.locked(&ctx, || {
        claim_slot(&region, header, &ctx, me, pid, master, capacity)
    })?;

    let world = World {
        inner: Arc::new(WorldInner {
            region: Arc::clone(&region),
            index,
            me,
            slot,
            master,
            pid,
            config: config.clone(),
            state: AtomicU32::new(STATE_ACTIVE),
            cancel: Cancel::new(),
            dispatcher: Mutex::new(None),
            locals: Locals::default(),
        }),
    };
    let handle = dispatch::spawn(
        world.downgrade(),
        region,
        inbox,
        world.inner.cancel.clone(),
        config.liveness_interval,
    )?;
    *world.inner.dispatcher.lock() = Some(handle);
    tracing::debug!(index, participant = %me, master, "entered world");
    Ok(world)
}

fn claim_slot(
    region: &SharedRegion,
    header: &ArenaHeader,
    ctx: &CellCtx<'_>,
    me: ParticipantId,
    pid: u32,
    master: bool,
    capacity: usize,
) -> FusionResult<(usize, ShmPtr<InboxHeader>)> {
    for slot in &header.roster {
        if slot.state.load(Ordering::Acquire) == SLOT_ACTIVE
            && !pid_alive(slot.pid.load(Ordering::Acquire))
        {
            let gone = ParticipantId::from_raw(slot.id.load(Ordering::Relaxed));
            tracing::warn!(participant = %gone, "pruning participant whose process exited");
            slot.state.store(SLOT_FREE, Ordering::Release);
        }
    }

    let (index, slot) = header
        .roster
        .iter()
        .enumerate()
        .find(|(_, slot)| slot.state.load(Ordering::Acquire) == SLOT_FREE)
        .ok_or(FusionError::Limit("participant roster full"))?;

    let mut at = slot.inbox.load(Ordering::Acquire);
    if at == 0 {
        at = Heap::new(region, HEAP_HEADER)?.alloc(ctx, inbox::footprint(capacity))?;
        slot.inbox.store(at, Ordering::Release);
    }
    let inbox_ptr = ShmPtr::<InboxHeader>::from_raw(at);
    Inbox::new(region, inbox_ptr)?.reset(ctx, me, capacity)?;

    slot.id.store(me.get(), Ordering::Relaxed);
    slot.pid.store(pid, Ordering::Relaxed);
    slot.master.store(master as u32, Ordering::Relaxed);
    slot.state.store(SLOT_ACTIVE, Ordering::Release);
    if master {
        header.master.store(me.get(), Ordering::Release);
    }
    Ok((index, inbox_ptr))
}
