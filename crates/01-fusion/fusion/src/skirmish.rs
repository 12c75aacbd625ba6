//! Recursive lock and monitor ("skirmish").
//!
//! A skirmish is owned by one thread of one participant at a time. The owner
//! may re-acquire it; every acquire must be paired with a release before any
//! other thread gets in. While holding it, the owner can `wait` (releasing all
//! recursion levels until notified) and `notify` other waiters.
//!
//! Two backings share the exact same semantics:
//!
//! * [`Skirmish::new_local`] keeps its state in process memory behind a
//!   `parking_lot` mutex and condvars.
//! * [`Skirmish::new_shared`] keeps a [`SkirmishCell`] inside a world's arena
//!   and parks on process-shared futex words, so any participant can lock it.
//!
//! Shared waiters sleep in bounded slices. Between slices they check whether
//! the holder's participant is still alive and take the lock over if it is
//! not, which is the only way a blocked acquire ends other than success.

use crate::ids::{owner_participant, owner_token, ParticipantId};
use crate::region::ShmPtr;
use crate::wait::{self, WaitResult, WaitScope};
use crate::world::World;
use crate::{FusionError, FusionResult};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const GUARD_FREE: u32 = 0;
const GUARD_LOCKED: u32 = 1;
const GUARD_CONTENDED: u32 = 2;
const GUARD_SPINS: u32 = 64;

const FLAG_DESTROYED: u32 = 1;

/// Skirmish state as laid out in an arena.
///
/// `guard` is a tiny internal mutex protecting the logical fields; it is only
/// ever held for a handful of instructions and never across a blocking wait.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SkirmishCell {
    guard: AtomicU32,
    lock_seq: AtomicU32,
    notify_seq: AtomicU32,
    recursion: AtomicU32,
    owner: AtomicU64,
    waiters: AtomicU32,
    signals: AtomicU32,
    acquirers: AtomicU32,
    flags: AtomicU32,
}

/// Per-call context for operating on a [`SkirmishCell`].
pub(crate) struct CellCtx<'a> {
    pub me: u64,
    pub scope: WaitScope,
    pub slice: Duration,
    pub alive: &'a dyn Fn(ParticipantId) -> bool,
}

struct GuardLock<'a> {
    word: &'a AtomicU32,
    scope: WaitScope,
}

impl Drop for GuardLock<'_> {
    fn drop(&mut self) {
        if self.word.swap(GUARD_FREE, Ordering::Release) == GUARD_CONTENDED {
            wait::wake_one(self.word, self.scope);
        }
    }
}

/// Hold on a [`SkirmishCell`]; dropping it releases one recursion level,
/// also while unwinding.
pub(crate) struct CellHold<'a> {
    cell: &'a SkirmishCell,
    ctx: &'a CellCtx<'a>,
}

impl Drop for CellHold<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.cell.release(self.ctx) {
            tracing::error!(%err, "failed to release skirmish cell");
        }
    }
}

impl SkirmishCell {
    /// Acquires the cell for the scope of the returned hold.
    pub(crate) fn hold<'a>(&'a self, ctx: &'a CellCtx<'a>) -> FusionResult<CellHold<'a>> {
        self.acquire(ctx)?;
        Ok(CellHold { cell: self, ctx })
    }

    /// Runs `f` with the cell held.
    pub(crate) fn locked<R>(
        &self,
        ctx: &CellCtx<'_>,
        f: impl FnOnce() -> FusionResult<R>,
    ) -> FusionResult<R> {
        let _hold = self.hold(ctx)?;
        f()
    }

    fn guard(&self, scope: WaitScope) -> GuardLock<'_> {
        let word = &self.guard;
        for _ in 0..GUARD_SPINS {
            if word
                .compare_exchange_weak(
                    GUARD_FREE,
                    GUARD_LOCKED,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return GuardLock { word, scope };
            }
            std::hint::spin_loop();
        }
        while word.swap(GUARD_CONTENDED, Ordering::Acquire) != GUARD_FREE {
            wait::wait_u32(word, GUARD_CONTENDED, scope, None);
        }
        GuardLock { word, scope }
    }

    fn destroyed(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_DESTROYED != 0
    }

    /// Claims the lock for `ctx.me` if it is free, already ours, or held by a
    /// participant that no longer exists. Must run under the guard.
    fn claim(&self, ctx: &CellCtx<'_>) -> bool {
        let owner = self.owner.load(Ordering::Relaxed);
        if owner == 0 || owner == ctx.me {
            self.owner.store(ctx.me, Ordering::Relaxed);
            self.recursion.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        let holder = owner_participant(owner);
        if !holder.is_none() && !(ctx.alive)(holder) {
            tracing::warn!(%holder, "taking over skirmish held by a departed participant");
            self.owner.store(ctx.me, Ordering::Relaxed);
            self.recursion.store(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    pub(crate) fn acquire(&self, ctx: &CellCtx<'_>) -> FusionResult<()> {
        loop {
            let seq = {
                let _guard = self.guard(ctx.scope);
                if self.destroyed() {
                    return Err(FusionError::Destroyed);
                }
                if self.claim(ctx) {
                    return Ok(());
                }
                self.acquirers.fetch_add(1, Ordering::Relaxed);
                self.lock_seq.load(Ordering::Relaxed)
            };
            wait::wait_u32(&self.lock_seq, seq, ctx.scope, Some(ctx.slice));
            self.acquirers.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn try_acquire(&self, ctx: &CellCtx<'_>) -> FusionResult<()> {
        let _guard = self.guard(ctx.scope);
        if self.destroyed() {
            return Err(FusionError::Destroyed);
        }
        if self.claim(ctx) {
            Ok(())
        } else {
            Err(FusionError::Busy)
        }
    }

    pub(crate) fn release(&self, ctx: &CellCtx<'_>) -> FusionResult<()> {
        let wake = {
            let _guard = self.guard(ctx.scope);
            if self.owner.load(Ordering::Relaxed) != ctx.me {
                tracing::error!(
                    owner = self.owner.load(Ordering::Relaxed),
                    caller = ctx.me,
                    "skirmish released by non-owner"
                );
                return Err(FusionError::AccessDenied);
            }
            let remaining = self.recursion.load(Ordering::Relaxed) - 1;
            self.recursion.store(remaining, Ordering::Relaxed);
            if remaining == 0 {
                self.owner.store(0, Ordering::Relaxed);
                self.lock_seq.fetch_add(1, Ordering::Release);
                true
            } else {
                false
            }
        };
        if wake {
            wait::wake_one(&self.lock_seq, ctx.scope);
        }
        Ok(())
    }

    pub(crate) fn lock_count(&self) -> u32 {
        self.recursion.load(Ordering::Acquire)
    }

    pub(crate) fn wait(&self, ctx: &CellCtx<'_>, timeout: Option<Duration>) -> FusionResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let (saved, mut seq) = {
            let _guard = self.guard(ctx.scope);
            if self.owner.load(Ordering::Relaxed) != ctx.me {
                return Err(FusionError::AccessDenied);
            }
            let saved = self.recursion.swap(0, Ordering::Relaxed);
            self.owner.store(0, Ordering::Relaxed);
            self.waiters.fetch_add(1, Ordering::Relaxed);
            self.lock_seq.fetch_add(1, Ordering::Release);
            (saved, self.notify_seq.load(Ordering::Relaxed))
        };
        wait::wake_one(&self.lock_seq, ctx.scope);

        let mut outcome = Ok(());
        loop {
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    deadline.saturating_duration_since(now).min(ctx.slice)
                }
                None => ctx.slice,
            };
            wait::wait_u32(&self.notify_seq, seq, ctx.scope, Some(slice));

            let _guard = self.guard(ctx.scope);
            if self.signals.load(Ordering::Relaxed) > 0 {
                self.signals.fetch_sub(1, Ordering::Relaxed);
                self.waiters.fetch_sub(1, Ordering::Relaxed);
                break;
            }
            if self.destroyed() {
                self.waiters.fetch_sub(1, Ordering::Relaxed);
                outcome = Err(FusionError::Destroyed);
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.waiters.fetch_sub(1, Ordering::Relaxed);
                outcome = Err(FusionError::Timeout);
                break;
            }
            seq = self.notify_seq.load(Ordering::Relaxed);
        }

        if matches!(outcome, Err(FusionError::Destroyed)) {
            return outcome;
        }
        self.acquire(ctx)?;
        self.recursion.store(saved, Ordering::Relaxed);
        outcome
    }

    pub(crate) fn notify(&self, ctx: &CellCtx<'_>, all: bool) -> FusionResult<()> {
        {
            let _guard = self.guard(ctx.scope);
            if self.owner.load(Ordering::Relaxed) != ctx.me {
                return Err(FusionError::AccessDenied);
            }
            let waiters = self.waiters.load(Ordering::Relaxed);
            let signals = self.signals.load(Ordering::Relaxed);
            if all {
                self.signals.store(waiters, Ordering::Relaxed);
            } else if waiters > signals {
                self.signals.store(signals + 1, Ordering::Relaxed);
            } else {
                return Ok(());
            }
            self.notify_seq.fetch_add(1, Ordering::Release);
        }
        wait::wake_all(&self.notify_seq, ctx.scope);
        Ok(())
    }

    pub(crate) fn destroy(&self, scope: WaitScope) -> FusionResult<()> {
        {
            let _guard = self.guard(scope);
            if self.destroyed() {
                return Err(FusionError::Destroyed);
            }
            if self.owner.load(Ordering::Relaxed) != 0
                || self.waiters.load(Ordering::Relaxed) != 0
                || self.acquirers.load(Ordering::Relaxed) != 0
            {
                tracing::error!("attempt to destroy a skirmish that is held or waited on");
                return Err(FusionError::Locked);
            }
            self.flags.fetch_or(FLAG_DESTROYED, Ordering::Release);
            self.lock_seq.fetch_add(1, Ordering::Release);
            self.notify_seq.fetch_add(1, Ordering::Release);
        }
        wait::wake_all(&self.lock_seq, scope);
        wait::wake_all(&self.notify_seq, scope);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LocalState {
    owner: u64,
    recursion: u32,
    waiters: u32,
    signals: u32,
    acquirers: u32,
    destroyed: bool,
}

/// In-process skirmish backing.
#[derive(Debug, Default)]
struct LocalSkirmish {
    state: Mutex<LocalState>,
    unlocked: Condvar,
    notified: Condvar,
}

impl LocalSkirmish {
    fn acquire(&self, me: u64) -> FusionResult<()> {
        let mut state = self.state.lock();
        loop {
            if state.destroyed {
                return Err(FusionError::Destroyed);
            }
            if state.owner == 0 || state.owner == me {
                state.owner = me;
                state.recursion += 1;
                return Ok(());
            }
            state.acquirers += 1;
            self.unlocked.wait(&mut state);
            state.acquirers -= 1;
        }
    }

    fn try_acquire(&self, me: u64) -> FusionResult<()> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(FusionError::Destroyed);
        }
        if state.owner == 0 || state.owner == me {
            state.owner = me;
            state.recursion += 1;
            Ok(())
        } else {
            Err(FusionError::Busy)
        }
    }

    fn release(&self, me: u64) -> FusionResult<()> {
        let mut state = self.state.lock();
        if state.owner != me {
            tracing::error!(owner = state.owner, caller = me, "skirmish released by non-owner");
            return Err(FusionError::AccessDenied);
        }
        state.recursion -= 1;
        if state.recursion == 0 {
            state.owner = 0;
            self.unlocked.notify_one();
        }
        Ok(())
    }

    fn wait(&self, me: u64, timeout: Option<Duration>) -> FusionResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        if state.owner != me {
            return Err(FusionError::AccessDenied);
        }
        let saved = std::mem::take(&mut state.recursion);
        state.owner = 0;
        state.waiters += 1;
        self.unlocked.notify_one();

        let mut outcome = Ok(());
        loop {
            if state.signals > 0 {
                state.signals -= 1;
                break;
            }
            if state.destroyed {
                state.waiters -= 1;
                return Err(FusionError::Destroyed);
            }
            match deadline {
                Some(deadline) => {
                    if self.notified.wait_until(&mut state, deadline).timed_out()
                        && state.signals == 0
                    {
                        outcome = Err(FusionError::Timeout);
                        break;
                    }
                }
                None => self.notified.wait(&mut state),
            }
        }
        state.waiters -= 1;

        while state.owner != 0 && state.owner != me {
            if state.destroyed {
                return Err(FusionError::Destroyed);
            }
            state.acquirers += 1;
            self.unlocked.wait(&mut state);
            state.acquirers -= 1;
        }
        state.owner = me;
        state.recursion = saved;
        outcome
    }

    fn notify(&self, me: u64, all: bool) -> FusionResult<()> {
        let mut state = self.state.lock();
        if state.owner != me {
            return Err(FusionError::AccessDenied);
        }
        if all {
            state.signals = state.waiters;
            self.notified.notify_all();
        } else if state.waiters > state.signals {
            state.signals += 1;
            self.notified.notify_one();
        }
        Ok(())
    }

    fn destroy(&self) -> FusionResult<()> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(FusionError::Destroyed);
        }
        if state.owner != 0 || state.waiters != 0 || state.acquirers != 0 {
            tracing::error!("attempt to destroy a skirmish that is held or waited on");
            return Err(FusionError::Locked);
        }
        state.destroyed = true;
        self.unlocked.notify_all();
        self.notified.notify_all();
        Ok(())
    }
}

#[derive(Clone)]
enum Backend {
    Local(Arc<LocalSkirmish>),
    Shared {
        world: World,
        cell: ShmPtr<SkirmishCell>,
        owned: bool,
    },
}

/// Handle to a recursive lock/monitor. Cloning shares the same lock.
#[derive(Clone)]
pub struct Skirmish {
    backend: Backend,
}

impl std::fmt::Debug for Skirmish {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.backend {
            Backend::Local(_) => f.write_str("Skirmish::Local"),
            Backend::Shared { cell, .. } => write!(f, "Skirmish::Shared({cell:?})"),
        }
    }
}

impl Skirmish {
    /// Creates a lock usable only by threads of this process.
    pub fn new_local() -> Self {
        Self {
            backend: Backend::Local(Arc::new(LocalSkirmish::default())),
        }
    }

    /// Allocates a lock in `world`'s arena, usable by every participant.
    pub fn new_shared(world: &World) -> FusionResult<Self> {
        let cell = world.alloc::<SkirmishCell>()?;
        Ok(Self {
            backend: Backend::Shared {
                world: world.clone(),
                cell,
                owned: true,
            },
        })
    }

    /// Opens a lock another participant allocated with [`Skirmish::new_shared`].
    pub fn attach(world: &World, cell: ShmPtr<SkirmishCell>) -> FusionResult<Self> {
        world.at(cell)?;
        Ok(Self {
            backend: Backend::Shared {
                world: world.clone(),
                cell,
                owned: true,
            },
        })
    }

    /// Wraps a cell embedded inside a larger shared structure.
    pub(crate) fn embedded(world: &World, cell: ShmPtr<SkirmishCell>) -> Self {
        Self {
            backend: Backend::Shared {
                world: world.clone(),
                cell,
                owned: false,
            },
        }
    }

    /// Arena location of a shared lock, for handing it to other participants.
    pub fn shared_ptr(&self) -> Option<ShmPtr<SkirmishCell>> {
        match &self.backend {
            Backend::Local(_) => None,
            Backend::Shared { cell, .. } => Some(*cell),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backend, Backend::Shared { .. })
    }

    fn with_cell<R>(
        &self,
        world: &World,
        cell: ShmPtr<SkirmishCell>,
        f: impl FnOnce(&SkirmishCell, &CellCtx<'_>) -> FusionResult<R>,
    ) -> FusionResult<R> {
        world.check_usable()?;
        let cell = world.at(cell)?;
        world.with_cell_ctx(|ctx| f(cell, ctx))
    }

    /// Blocks until the lock is held by the calling thread.
    pub fn acquire(&self) -> FusionResult<()> {
        match &self.backend {
            Backend::Local(local) => local.acquire(owner_token(ParticipantId::NONE)),
            Backend::Shared { world, cell, .. } => {
                self.with_cell(world, *cell, |cell, ctx| cell.acquire(ctx))
            }
        }
    }

    /// Acquires without blocking; `Busy` when another thread holds the lock.
    pub fn try_acquire(&self) -> FusionResult<()> {
        match &self.backend {
            Backend::Local(local) => local.try_acquire(owner_token(ParticipantId::NONE)),
            Backend::Shared { world, cell, .. } => {
                self.with_cell(world, *cell, |cell, ctx| cell.try_acquire(ctx))
            }
        }
    }

    /// Drops one recursion level; the last one hands the lock to a waiter.
    pub fn release(&self) -> FusionResult<()> {
        match &self.backend {
            Backend::Local(local) => local.release(owner_token(ParticipantId::NONE)),
            Backend::Shared { world, cell, .. } => {
                self.with_cell(world, *cell, |cell, ctx| cell.release(ctx))
            }
        }
    }

    /// Current recursion depth (diagnostic; racy by nature).
    pub fn lock_count(&self) -> u32 {
        match &self.backend {
            Backend::Local(local) => local.state.lock().recursion,
            Backend::Shared { world, cell, .. } => world
                .at(*cell)
                .map(|cell| cell.lock_count())
                .unwrap_or(0),
        }
    }

    /// Releases the lock, waits for a notify, then re-acquires it at the same
    /// recursion depth. The caller must hold the lock.
    pub fn wait(&self) -> FusionResult<()> {
        self.wait_inner(None)
    }

    /// Like [`Skirmish::wait`] but gives up with `Timeout` after `timeout`.
    /// The lock is held again when this returns either way.
    pub fn wait_timeout(&self, timeout: Duration) -> FusionResult<()> {
        self.wait_inner(Some(timeout))
    }

    fn wait_inner(&self, timeout: Option<Duration>) -> FusionResult<()> {
        match &self.backend {
            Backend::Local(local) => local.wait(owner_token(ParticipantId::NONE), timeout),
            Backend::Shared { world, cell, .. } => {
                self.with_cell(world, *cell, |cell, ctx| cell.wait(ctx, timeout))
            }
        }
    }

    /// Wakes one waiter. The caller must hold the lock.
    pub fn notify(&self) -> FusionResult<()> {
        self.notify_inner(false)
    }

    /// Wakes every waiter. The caller must hold the lock.
    pub fn notify_all(&self) -> FusionResult<()> {
        self.notify_inner(true)
    }

    fn notify_inner(&self, all: bool) -> FusionResult<()> {
        match &self.backend {
            Backend::Local(local) => local.notify(owner_token(ParticipantId::NONE), all),
            Backend::Shared { world, cell, .. } => {
                self.with_cell(world, *cell, |cell, ctx| cell.notify(ctx, all))
            }
        }
    }

    /// Retires the lock. Fails with `Locked` while it is held or waited on.
    pub fn destroy(&self) -> FusionResult<()> {
        match &self.backend {
            Backend::Local(local) => local.destroy(),
            Backend::Shared {
                world, cell, owned, ..
            } => {
                world.check_usable()?;
                world.at(*cell)?.destroy(WaitScope::Shared)?;
                if *owned {
                    world.free(*cell)?;
                }
                Ok(())
            }
        }
    }

    /// Acquires the lock and releases it when the guard drops.
    pub fn lock(&self) -> FusionResult<SkirmishGuard<'_>> {
        self.acquire()?;
        Ok(SkirmishGuard { skirmish: self })
    }
}

/// Scoped hold on a [`Skirmish`].
pub struct SkirmishGuard<'a> {
    skirmish: &'a Skirmish,
}

impl SkirmishGuard<'_> {
    /// Monitor wait while keeping the guard alive.
    pub fn wait(&self) -> FusionResult<()> {
        self.skirmish.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> FusionResult<()> {
        self.skirmish.wait_timeout(timeout)
    }

    pub fn notify(&self) -> FusionResult<()> {
        self.skirmish.notify()
    }

    pub fn notify_all(&self) -> FusionResult<()> {
        self.skirmish.notify_all()
    }
}

impl Drop for SkirmishGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.skirmish.release() {
            tracing::error!(%err, "failed to release skirmish guard");
        }
    }
}
