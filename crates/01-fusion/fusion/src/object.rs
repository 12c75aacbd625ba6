//! Pools of shared objects whose lifetime follows a ref.
//!
//! ```text
//! object allocation
//! +--------------------------------------------------------------+---------+
//! | ObjectHeader: lock, id, state, list links, ref, reactor       | payload |
//! +--------------------------------------------------------------+---------+
//! ```
//!
//! A pool is the only allocator of its objects. Every object's ref watches
//! the pool's destructor call, which is owned by the participant that
//! created the pool. When the count reaches zero the owner's dispatcher runs
//! the destructor: objects that still have reactor listeners become zombies
//! and finish once the last listener detaches; the rest run the user
//! destructor and return their memory.

use crate::call::{Call, CallContext, CallReturn, CallSlot};
use crate::ids::ParticipantId;
use crate::reactor::{self, Reactor, ReactorShared};
use crate::refs::{self, Ref, RefShared};
use crate::region::{align_up, Shareable, ShmPtr, ARENA_ALIGNMENT};
use crate::skirmish::{Skirmish, SkirmishCell};
use crate::world::World;
use crate::{FusionError, FusionResult};
use std::marker::PhantomData;
use std::mem::{align_of, offset_of, size_of};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

const POOL_ALIVE: u32 = 1;
const POOL_DESTROYED: u32 = 2;

const PAYLOAD_OFFSET: usize = align_up(size_of::<ObjectHeader>(), ARENA_ALIGNMENT);

/// Lifecycle of a shared object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectState {
    Init,
    Active,
    Zombie,
    Destroyed,
}

impl ObjectState {
    fn from_raw(raw: u32) -> FusionResult<Self> {
        match raw {
            1 => Ok(Self::Init),
            2 => Ok(Self::Active),
            3 => Ok(Self::Zombie),
            4 => Ok(Self::Destroyed),
            _ => crate::fusion_bug!("object state word corrupted"),
        }
    }

    const fn raw(self) -> u32 {
        match self {
            Self::Init => 1,
            Self::Active => 2,
            Self::Zombie => 3,
            Self::Destroyed => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on objects alive at once (zombies included); zero means
    /// the pool grows until the arena is full.
    pub max_objects: u32,
}

impl PoolConfig {
    pub fn bounded(max_objects: u32) -> Self {
        Self { max_objects }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub live: u32,
    pub zombies: u32,
    pub created: u64,
    pub destroyed: u64,
}

/// Arena layout of a pool.
#[repr(C)]
#[derive(Debug, Default)]
pub struct PoolShared {
    lock: SkirmishCell,
    state: AtomicU32,
    owner: AtomicU32,
    max_objects: AtomicU32,
    payload_size: AtomicU32,
    destructor: AtomicU64,
    head: AtomicU64,
    live: AtomicU32,
    zombies: AtomicU32,
    created: AtomicU64,
    destroyed: AtomicU64,
}

#[repr(C)]
struct ObjectHeader {
    lock: SkirmishCell,
    id: AtomicU32,
    state: AtomicU32,
    pool: AtomicU64,
    next: AtomicU64,
    prev: AtomicU64,
    external_lock: AtomicU64,
    creator: AtomicU32,
    _reserved: AtomicU32,
    refs: RefShared,
    reactor: ReactorShared,
}

type Destructor<T> = Arc<dyn Fn(&Object<T>) + Send + Sync>;

/// Handle to a pool of `T` objects.
pub struct ObjectPool<T> {
    world: World,
    ptr: ShmPtr<PoolShared>,
    name: Option<String>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            world: self.world.clone(),
            ptr: self.ptr,
            name: self.name.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("ptr", &self.ptr)
            .field("name", &self.name)
            .finish()
    }
}

impl<T: Shareable> ObjectPool<T> {
    /// Creates a pool owned by this participant and publishes it as a world
    /// root under `name`. `destructor` runs here, on this participant's
    /// dispatcher, for every object whose ref reaches zero.
    pub fn create(
        world: &World,
        name: &str,
        config: PoolConfig,
        destructor: impl Fn(&Object<T>) + Send + Sync + 'static,
    ) -> FusionResult<ObjectPool<T>> {
        if align_of::<T>() > ARENA_ALIGNMENT {
            return Err(FusionError::InvArg("payload alignment exceeds arena alignment"));
        }
        let ptr = world.alloc::<PoolShared>()?;
        let shared = world.at(ptr)?;
        shared.owner.store(world.id().get(), Ordering::Relaxed);
        shared.max_objects.store(config.max_objects, Ordering::Relaxed);
        shared.payload_size.store(size_of::<T>() as u32, Ordering::Relaxed);

        let weak = world.downgrade();
        let destructor: Destructor<T> = Arc::new(destructor);
        let call = Call::new(world, move |ctx: &CallContext<'_>| {
            let Some(world) = weak.upgrade() else {
                return CallReturn::Error(FusionError::Destroyed);
            };
            let object = ShmPtr::<ObjectHeader>::from_raw(ctx.arg() as u64);
            match finalize(&world, ptr, object, &destructor) {
                Ok(()) => CallReturn::Return(0),
                Err(err) => {
                    tracing::warn!(%err, ?object, "object destructor failed");
                    CallReturn::Error(err)
                }
            }
        })?;
        shared.destructor.store(call.id().raw(), Ordering::Relaxed);
        shared.state.store(POOL_ALIVE, Ordering::Release);

        if let Err(err) = world.publish_root(name, ptr) {
            call.destroy()?;
            world.free(ptr)?;
            return Err(err);
        }
        tracing::debug!(name, ?ptr, max_objects = config.max_objects, "object pool created");
        Ok(ObjectPool {
            world: world.clone(),
            ptr,
            name: Some(name.to_owned()),
            _payload: PhantomData,
        })
    }

    /// Opens the pool published under `name`.
    pub fn attach(world: &World, name: &str) -> FusionResult<ObjectPool<T>> {
        let ptr = world
            .lookup_root::<PoolShared>(name)?
            .ok_or(FusionError::InvArg("no pool published under that name"))?;
        let mut pool = Self::attach_ptr(world, ptr)?;
        pool.name = Some(name.to_owned());
        Ok(pool)
    }

    pub fn attach_ptr(world: &World, ptr: ShmPtr<PoolShared>) -> FusionResult<ObjectPool<T>> {
        let pool = ObjectPool {
            world: world.clone(),
            ptr,
            name: None,
            _payload: PhantomData,
        };
        if pool.shared()?.payload_size.load(Ordering::Acquire) != size_of::<T>() as u32 {
            return Err(FusionError::InvArg("pool payload type mismatch"));
        }
        Ok(pool)
    }

    pub fn id(&self) -> ShmPtr<PoolShared> {
        self.ptr
    }

    fn shared(&self) -> FusionResult<&PoolShared> {
        pool_shared(&self.world, self.ptr)
    }

    fn locked<R>(&self, f: impl FnOnce(&PoolShared) -> FusionResult<R>) -> FusionResult<R> {
        pool_locked(&self.world, self.ptr, f)
    }

    /// Allocates a zeroed object in state `Init` holding one reference for
    /// this participant.
    pub fn create_object(&self) -> FusionResult<Object<T>> {
        let world = &self.world;
        let me = world.id();
        let object = self.locked(|pool| {
            let max = pool.max_objects.load(Ordering::Acquire);
            let alive = pool.live.load(Ordering::Acquire) + pool.zombies.load(Ordering::Acquire);
            if max != 0 && alive >= max {
                return Err(FusionError::Limit("pool is full"));
            }
            let object = world
                .alloc_bytes(PAYLOAD_OFFSET + size_of::<T>())?
                .cast::<ObjectHeader>();
            let header = world.at(object)?;
            header.id.store(world.next_id()?, Ordering::Relaxed);
            header.pool.store(self.ptr.raw(), Ordering::Relaxed);
            header.creator.store(me.get(), Ordering::Relaxed);

            let refs = refs_ptr(object);
            refs::init(world, refs, me, 1)?;
            let destructor = ShmPtr::<CallSlot>::from_raw(pool.destructor.load(Ordering::Acquire));
            refs::init_watch(world, refs, destructor, object.raw() as i64)?;
            reactor::init(world, reactor_ptr(object), me, 0)?;

            let head = pool.head.load(Ordering::Acquire);
            header.next.store(head, Ordering::Relaxed);
            if head != 0 {
                world
                    .at(ShmPtr::<ObjectHeader>::from_raw(head))?
                    .prev
                    .store(object.raw(), Ordering::Release);
            }
            pool.head.store(object.raw(), Ordering::Release);
            header.state.store(ObjectState::Init.raw(), Ordering::Release);
            pool.live.fetch_add(1, Ordering::AcqRel);
            pool.created.fetch_add(1, Ordering::AcqRel);
            Ok(object)
        })?;
        tracing::trace!(?object, pool = ?self.ptr, "object created");
        Ok(Object::new(world, object))
    }

    /// Visits every `Active` object under the pool lock. Returning `false`
    /// from `visit` stops the walk.
    ///
    /// Dropping a reference from inside `visit` is safe: destruction runs
    /// later on the pool owner's dispatcher.
    pub fn enumerate(&self, mut visit: impl FnMut(&Object<T>) -> bool) -> FusionResult<()> {
        let world = &self.world;
        self.locked(|pool| {
            let mut at = pool.head.load(Ordering::Acquire);
            while at != 0 {
                let ptr = ShmPtr::<ObjectHeader>::from_raw(at);
                let header = world.at(ptr)?;
                at = header.next.load(Ordering::Acquire);
                if header.state.load(Ordering::Acquire) != ObjectState::Active.raw() {
                    continue;
                }
                if !visit(&Object::new(world, ptr)) {
                    break;
                }
            }
            Ok(())
        })
    }

    /// Looks up a live object by id.
    pub fn get(&self, id: u32) -> FusionResult<Option<Object<T>>> {
        let world = &self.world;
        self.locked(|pool| {
            let mut at = pool.head.load(Ordering::Acquire);
            while at != 0 {
                let ptr = ShmPtr::<ObjectHeader>::from_raw(at);
                let header = world.at(ptr)?;
                if header.id.load(Ordering::Acquire) == id {
                    return Ok(Some(Object::new(world, ptr)));
                }
                at = header.next.load(Ordering::Acquire);
            }
            Ok(None)
        })
    }

    pub fn stats(&self) -> FusionResult<PoolStats> {
        self.locked(|pool| {
            Ok(PoolStats {
                live: pool.live.load(Ordering::Acquire),
                zombies: pool.zombies.load(Ordering::Acquire),
                created: pool.created.load(Ordering::Acquire),
                destroyed: pool.destroyed.load(Ordering::Acquire),
            })
        })
    }

    /// Owner only: retires an empty pool. `Busy` while objects or zombies
    /// remain.
    pub fn destroy(&self) -> FusionResult<()> {
        let me = self.world.id();
        let destructor = self.locked(|pool| {
            if pool.owner.load(Ordering::Acquire) != me.get() {
                return Err(FusionError::AccessDenied);
            }
            if pool.live.load(Ordering::Acquire) + pool.zombies.load(Ordering::Acquire) != 0 {
                return Err(FusionError::Busy);
            }
            pool.state.store(POOL_DESTROYED, Ordering::Release);
            Ok(ShmPtr::<CallSlot>::from_raw(pool.destructor.load(Ordering::Acquire)))
        })?;
        if let Some(name) = &self.name {
            let published = self.world.lookup_root::<PoolShared>(name)?;
            if published == Some(self.ptr) {
                self.world.unpublish_root(name)?;
            }
        }
        Call::attach(&self.world, destructor)?.destroy()?;
        tracing::debug!(pool = ?self.ptr, "object pool destroyed");
        self.world.free(self.ptr)
    }
}

fn pool_shared(world: &World, ptr: ShmPtr<PoolShared>) -> FusionResult<&PoolShared> {
    world.check_usable()?;
    let shared = world.at(ptr)?;
    match shared.state.load(Ordering::Acquire) {
        POOL_ALIVE => Ok(shared),
        _ => Err(FusionError::Destroyed),
    }
}

fn pool_locked<R>(
    world: &World,
    ptr: ShmPtr<PoolShared>,
    f: impl FnOnce(&PoolShared) -> FusionResult<R>,
) -> FusionResult<R> {
    let shared = pool_shared(world, ptr)?;
    world.with_cell_ctx(|ctx| shared.lock.locked(ctx, || f(shared)))
}

const fn refs_ptr(object: ShmPtr<ObjectHeader>) -> ShmPtr<RefShared> {
    object.byte_add(offset_of!(ObjectHeader, refs) as u64)
}

const fn reactor_ptr(object: ShmPtr<ObjectHeader>) -> ShmPtr<ReactorShared> {
    object.byte_add(offset_of!(ObjectHeader, reactor) as u64)
}

/// Runs on the pool owner's dispatcher each time an object's destruction
/// advances: once when the ref reaches zero and, for zombies, again when the
/// last listener detaches. The dispatcher serializes both.
fn finalize<T: Shareable>(
    world: &World,
    pool: ShmPtr<PoolShared>,
    ptr: ShmPtr<ObjectHeader>,
    destructor: &Destructor<T>,
) -> FusionResult<()> {
    let header = world.at(ptr)?;
    let state = ObjectState::from_raw(header.state.load(Ordering::Acquire))?;
    match state {
        ObjectState::Init | ObjectState::Active => {
            let call =
                ShmPtr::<CallSlot>::from_raw(pool_shared(world, pool)?.destructor.load(Ordering::Acquire));
            if reactor::arm_zombie(world, reactor_ptr(ptr), call, ptr.raw() as i64)? {
                pool_locked(world, pool, |shared| {
                    header.state.store(ObjectState::Zombie.raw(), Ordering::Release);
                    shared.live.fetch_sub(1, Ordering::AcqRel);
                    shared.zombies.fetch_add(1, Ordering::AcqRel);
                    Ok(())
                })?;
                tracing::debug!(object = ?ptr, "object became a zombie");
                return Ok(());
            }
        }
        ObjectState::Zombie => {}
        ObjectState::Destroyed => {
            crate::fusion_bug!("destructor ran for a destroyed object");
        }
    }

    // Unlinked first so enumeration and lookups never see an object whose
    // destructor has started.
    pool_locked(world, pool, |shared| {
        let next = header.next.load(Ordering::Acquire);
        let prev = header.prev.load(Ordering::Acquire);
        if prev == 0 {
            shared.head.store(next, Ordering::Release);
        } else {
            world
                .at(ShmPtr::<ObjectHeader>::from_raw(prev))?
                .next
                .store(next, Ordering::Release);
        }
        if next != 0 {
            world
                .at(ShmPtr::<ObjectHeader>::from_raw(next))?
                .prev
                .store(prev, Ordering::Release);
        }
        header.next.store(0, Ordering::Relaxed);
        header.prev.store(0, Ordering::Relaxed);
        header.state.store(ObjectState::Destroyed.raw(), Ordering::Release);
        Ok(())
    })?;

    destructor(&Object::new(world, ptr));

    pool_locked(world, pool, |shared| {
        if state == ObjectState::Zombie {
            shared.zombies.fetch_sub(1, Ordering::AcqRel);
        } else {
            shared.live.fetch_sub(1, Ordering::AcqRel);
        }
        shared.destroyed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    })?;
    reactor::retire(world, reactor_ptr(ptr))?;
    tracing::trace!(object = ?ptr, "object destroyed");
    world.free(ptr)
}

/// Handle to one object in a pool.
pub struct Object<T> {
    world: World,
    ptr: ShmPtr<ObjectHeader>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for Object<T> {
    fn clone(&self) -> Self {
        Self::new(&self.world, self.ptr)
    }
}

impl<T> std::fmt::Debug for Object<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object").field("ptr", &self.ptr).finish()
    }
}

impl<T> Object<T> {
    fn new(world: &World, ptr: ShmPtr<ObjectHeader>) -> Self {
        Self {
            world: world.clone(),
            ptr,
            _payload: PhantomData,
        }
    }
}

impl<T: Shareable> Object<T> {
    /// Opens an object by its arena offset, as handed out by [`Object::offset`].
    pub fn attach(world: &World, offset: u64) -> FusionResult<Object<T>> {
        let object = Self::new(world, ShmPtr::from_raw(offset));
        if object.state()? == ObjectState::Destroyed {
            return Err(FusionError::Destroyed);
        }
        Ok(object)
    }

    fn header(&self) -> FusionResult<&ObjectHeader> {
        self.world.check_usable()?;
        self.world.at(self.ptr)
    }

    pub fn id(&self) -> FusionResult<u32> {
        Ok(self.header()?.id.load(Ordering::Acquire))
    }

    /// Arena offset other participants can pass to [`Object::attach`].
    pub fn offset(&self) -> u64 {
        self.ptr.raw()
    }

    pub fn creator(&self) -> FusionResult<ParticipantId> {
        Ok(ParticipantId::from_raw(
            self.header()?.creator.load(Ordering::Acquire),
        ))
    }

    pub fn state(&self) -> FusionResult<ObjectState> {
        ObjectState::from_raw(self.header()?.state.load(Ordering::Acquire))
    }

    /// `Init` to `Active`; the object becomes visible to enumeration.
    pub fn activate(&self) -> FusionResult<()> {
        let header = self.header()?;
        let pool = ShmPtr::<PoolShared>::from_raw(header.pool.load(Ordering::Acquire));
        pool_locked(&self.world, pool, |_| {
            header
                .state
                .compare_exchange(
                    ObjectState::Init.raw(),
                    ObjectState::Active.raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .map(drop)
                .map_err(|_| FusionError::InvArg("object is not in its init state"))
        })
    }

    /// Makes [`Object::lock`] hand out `external` instead of the object's
    /// own skirmish. `external` must live in the same world.
    pub fn set_lock(&self, external: &Skirmish) -> FusionResult<()> {
        let cell = external
            .shared_ptr()
            .ok_or(FusionError::InvArg("object locks must be shared skirmishes"))?;
        self.header()?
            .external_lock
            .store(cell.raw(), Ordering::Release);
        Ok(())
    }

    /// The skirmish guarding the payload.
    pub fn lock(&self) -> FusionResult<Skirmish> {
        let external = self.header()?.external_lock.load(Ordering::Acquire);
        let cell = if external != 0 {
            ShmPtr::<SkirmishCell>::from_raw(external)
        } else {
            self.ptr.byte_add(offset_of!(ObjectHeader, lock) as u64)
        };
        Ok(Skirmish::embedded(&self.world, cell))
    }

    fn payload(&self) -> ShmPtr<T> {
        self.ptr.byte_add(PAYLOAD_OFFSET as u64)
    }

    pub fn read(&self) -> FusionResult<T> {
        let lock = self.lock()?;
        let _held = lock.lock()?;
        self.world.read(self.payload())
    }

    pub fn write(&self, value: &T) -> FusionResult<()> {
        let lock = self.lock()?;
        let _held = lock.lock()?;
        self.world.write(self.payload(), value)
    }

    /// Read-modify-write of the payload under the object lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> FusionResult<R> {
        let lock = self.lock()?;
        let _held = lock.lock()?;
        let mut value = self.world.read(self.payload())?;
        let result = f(&mut value);
        self.world.write(self.payload(), &value)?;
        Ok(result)
    }

    /// The object's ref; its zero transition destroys the object.
    pub fn refs(&self) -> Ref {
        Ref::embedded(&self.world, refs_ptr(self.ptr))
    }

    /// The object's reactor, typed for messages `M`. The first typed open
    /// binds the message size.
    pub fn reactor<M: Shareable>(&self) -> FusionResult<Reactor<M>> {
        Reactor::embedded(&self.world, reactor_ptr(self.ptr))
    }
}
