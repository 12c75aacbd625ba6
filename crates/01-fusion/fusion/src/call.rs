//! Synchronous calls into the participant that owns a handler.
//!
//! A call lives in the arena as a small slot naming its owner; the handler
//! itself only exists in the owner's process. Executing from the owner runs
//! the handler inline. Everyone else posts a CALL record to the owner's inbox
//! and parks on a reply block until the owner's dispatcher fills it in.
//!
//! Reply blocks are freed by whichever side touches them last: the caller
//! after reading a completed reply, or the completer when it finds the caller
//! already gave up. A caller whose owner died frees the block itself.

use crate::dispatch::{CallMessage, TAG_CALL};
use crate::ids::ParticipantId;
use crate::region::ShmPtr;
use crate::wait::{self, WaitScope};
use crate::world::World;
use crate::{FusionError, FusionResult, ResultCode};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::ops::BitOr;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CALL_ALIVE: u32 = 1;
const CALL_DESTROYED: u32 = 2;

const REPLY_PENDING: u32 = 0;
const REPLY_DONE: u32 = 1;
const REPLY_ABANDONED: u32 = 2;

/// Arena slot identifying a call. Other participants refer to a call by
/// `ShmPtr<CallSlot>`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct CallSlot {
    owner: AtomicU32,
    state: AtomicU32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct ReplyBlock {
    state: AtomicU32,
    result: AtomicI32,
    value: AtomicI64,
}

/// Execution flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CallFlags(u32);

impl CallFlags {
    pub const NONE: Self = Self(0);
    /// Do not wait for (or produce) a reply.
    pub const ONEWAY: Self = Self(1);
    /// Deliver through the owner's inbox even when the caller is the owner.
    pub const QUEUED: Self = Self(2);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CallFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// What a handler tells the dispatcher once it returns.
#[derive(Debug)]
pub enum CallReturn {
    /// Reply with this value.
    Return(i64),
    /// Reply with this error's result code.
    Error(FusionError),
    /// The handler took the reply with [`CallContext::defer`] and will
    /// complete it later.
    Resume,
}

/// Code run in the owning process when a call executes.
pub trait CallHandler: Send + Sync {
    fn handle(&self, ctx: &CallContext<'_>) -> CallReturn;
}

impl<F> CallHandler for F
where
    F: Fn(&CallContext<'_>) -> CallReturn + Send + Sync,
{
    fn handle(&self, ctx: &CallContext<'_>) -> CallReturn {
        self(ctx)
    }
}

/// Arguments of one call execution as seen by its handler.
pub struct CallContext<'a> {
    caller: ParticipantId,
    arg: i64,
    payload: &'a [u8],
    reply: RefCell<Option<PendingReply>>,
}

impl CallContext<'_> {
    pub fn caller(&self) -> ParticipantId {
        self.caller
    }

    pub fn arg(&self) -> i64 {
        self.arg
    }

    pub fn payload(&self) -> &[u8] {
        self.payload
    }

    /// Takes ownership of the reply so it can be completed after the handler
    /// returns [`CallReturn::Resume`]. `None` for one-way executions.
    ///
    /// Once deferred, the value of a `Return` or `Error` from the handler is
    /// discarded; only the [`PendingReply`] answers the caller.
    pub fn defer(&self) -> Option<PendingReply> {
        self.reply.borrow_mut().take()
    }
}

#[derive(Debug, Default)]
struct LocalReply {
    result: Mutex<Option<FusionResult<i64>>>,
    abandoned: Mutex<bool>,
    done: Condvar,
}

impl LocalReply {
    fn finish(&self, result: FusionResult<i64>) {
        if *self.abandoned.lock() {
            return;
        }
        *self.result.lock() = Some(result);
        self.done.notify_all();
    }

    fn wait(&self, timeout: Duration) -> FusionResult<i64> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            if self.done.wait_until(&mut slot, deadline).timed_out() {
                if let Some(result) = slot.take() {
                    return result;
                }
                *self.abandoned.lock() = true;
                return Err(FusionError::Timeout);
            }
        }
    }
}

enum ReplyTarget {
    Local(Arc<LocalReply>),
    Shared {
        world: World,
        block: ShmPtr<ReplyBlock>,
    },
}

impl ReplyTarget {
    fn finish(self, result: FusionResult<i64>) -> FusionResult<()> {
        match self {
            ReplyTarget::Local(local) => {
                local.finish(result);
                Ok(())
            }
            ReplyTarget::Shared { world, block } => complete_shared(&world, block, result),
        }
    }
}

/// A reply owed to a caller. Dropping it unanswered replies `Failure`.
pub struct PendingReply {
    target: Option<ReplyTarget>,
}

impl PendingReply {
    fn new(target: ReplyTarget) -> Self {
        Self {
            target: Some(target),
        }
    }

    /// Delivers the result to the waiting caller.
    pub fn complete(mut self, result: FusionResult<i64>) -> FusionResult<()> {
        match self.target.take() {
            Some(target) => target.finish(result),
            None => Ok(()),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            tracing::warn!("pending reply dropped without completion");
            if let Err(err) = target.finish(Err(FusionError::Failure)) {
                tracing::warn!(%err, "failed to fail abandoned reply");
            }
        }
    }
}

fn complete_shared(
    world: &World,
    block: ShmPtr<ReplyBlock>,
    result: FusionResult<i64>,
) -> FusionResult<()> {
    world.check_usable()?;
    let reply = world.at(block)?;
    let (code, value) = match result {
        Ok(value) => (ResultCode::Ok.as_i32(), value),
        Err(err) => (err.code().as_i32(), 0),
    };
    reply.result.store(code, Ordering::Relaxed);
    reply.value.store(value, Ordering::Relaxed);
    match reply.state.compare_exchange(
        REPLY_PENDING,
        REPLY_DONE,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => {
            wait::wake_all(&reply.state, WaitScope::Shared);
            Ok(())
        }
        Err(REPLY_ABANDONED) => {
            tracing::debug!(?block, "caller gave up; reclaiming reply block");
            world.free(block)
        }
        Err(_) => crate::fusion_bug!("reply block completed twice"),
    }
}

fn run_handler(
    handler: &dyn CallHandler,
    caller: ParticipantId,
    arg: i64,
    payload: &[u8],
    target: Option<ReplyTarget>,
) -> FusionResult<()> {
    let owes_reply = target.is_some();
    let ctx = CallContext {
        caller,
        arg,
        payload,
        reply: RefCell::new(target.map(PendingReply::new)),
    };
    let returned = handler.handle(&ctx);
    let pending = ctx.reply.into_inner();
    match (returned, pending) {
        (CallReturn::Return(value), Some(reply)) => reply.complete(Ok(value)),
        (CallReturn::Error(err), Some(reply)) => reply.complete(Err(err)),
        (CallReturn::Resume, Some(reply)) => {
            tracing::warn!(%caller, "handler resumed without deferring its reply");
            reply.complete(Err(FusionError::Failure))
        }
        (CallReturn::Return(value), None) if owes_reply => {
            tracing::debug!(%caller, value, "deferred handler returned a value; discarded");
            Ok(())
        }
        (CallReturn::Error(err), None) if owes_reply => {
            tracing::debug!(%caller, %err, "deferred handler returned an error; discarded");
            Ok(())
        }
        (_, None) => Ok(()),
    }
}

/// Runs an incoming CALL record on this participant's dispatcher.
pub(crate) fn serve(world: &World, message: CallMessage) -> FusionResult<()> {
    let target = (message.reply != 0).then(|| ReplyTarget::Shared {
        world: world.clone(),
        block: ShmPtr::from_raw(message.reply),
    });
    let handler = world.locals().calls.lock().get(&message.call).cloned();
    match handler {
        Some(handler) => run_handler(
            handler.as_ref(),
            message.caller,
            message.arg,
            &message.payload,
            target,
        ),
        None => match target {
            Some(target) => target.finish(Err(FusionError::Destroyed)),
            None => Ok(()),
        },
    }
}

/// Handle to a call. Cloning shares the same slot.
#[derive(Clone, Debug)]
pub struct Call {
    world: World,
    slot: ShmPtr<CallSlot>,
}

impl Call {
    /// Creates a call owned by this participant.
    pub fn new(world: &World, handler: impl CallHandler + 'static) -> FusionResult<Call> {
        let slot = world.alloc::<CallSlot>()?;
        let cell = world.at(slot)?;
        cell.owner.store(world.id().get(), Ordering::Relaxed);
        cell.state.store(CALL_ALIVE, Ordering::Release);
        world
            .locals()
            .calls
            .lock()
            .insert(slot.raw(), Arc::new(handler));
        tracing::trace!(?slot, owner = %world.id(), "call created");
        Ok(Call {
            world: world.clone(),
            slot,
        })
    }

    /// Opens a call created by another participant.
    pub fn attach(world: &World, id: ShmPtr<CallSlot>) -> FusionResult<Call> {
        world.check_usable()?;
        if id.is_null() {
            return Err(FusionError::InvArg("null call id"));
        }
        if world.at(id)?.state.load(Ordering::Acquire) != CALL_ALIVE {
            return Err(FusionError::Destroyed);
        }
        Ok(Call {
            world: world.clone(),
            slot: id,
        })
    }

    pub fn id(&self) -> ShmPtr<CallSlot> {
        self.slot
    }

    pub fn owner(&self) -> FusionResult<ParticipantId> {
        let cell = self.world.at(self.slot)?;
        Ok(ParticipantId::from_raw(cell.owner.load(Ordering::Acquire)))
    }

    /// Runs the handler with `arg` and `payload` and returns its value.
    ///
    /// One-way executions return `Ok(0)` as soon as the request is queued.
    /// A blocking `QUEUED` execution by the owner must not come from the
    /// owner's own dispatcher thread, which would wait on itself.
    pub fn execute(&self, arg: i64, payload: &[u8], flags: CallFlags) -> FusionResult<i64> {
        let world = &self.world;
        world.check_usable()?;
        let cell = world.at(self.slot)?;
        if cell.state.load(Ordering::Acquire) != CALL_ALIVE {
            return Err(FusionError::Destroyed);
        }
        let owner = ParticipantId::from_raw(cell.owner.load(Ordering::Acquire));
        if owner == world.id() && !flags.contains(CallFlags::QUEUED) {
            return self.execute_local(arg, payload, flags);
        }
        if !world.is_alive(owner) {
            return Err(FusionError::Destroyed);
        }

        let mut message = CallMessage {
            call: self.slot.raw(),
            arg,
            reply: 0,
            caller: world.id(),
            flags: flags.bits(),
            payload: payload.to_vec(),
        };
        if flags.contains(CallFlags::ONEWAY) {
            world.post(owner, TAG_CALL, &message.encode())?;
            return Ok(0);
        }

        let block = world.alloc::<ReplyBlock>()?;
        message.reply = block.raw();
        if let Err(err) = world.post(owner, TAG_CALL, &message.encode()) {
            world.free(block)?;
            return Err(err);
        }
        self.await_reply(owner, block)
    }

    fn execute_local(&self, arg: i64, payload: &[u8], flags: CallFlags) -> FusionResult<i64> {
        let handler = self
            .world
            .locals()
            .calls
            .lock()
            .get(&self.slot.raw())
            .cloned()
            .ok_or(FusionError::Destroyed)?;
        let me = self.world.id();
        if flags.contains(CallFlags::ONEWAY) {
            run_handler(handler.as_ref(), me, arg, payload, None)?;
            return Ok(0);
        }
        let local = Arc::new(LocalReply::default());
        run_handler(
            handler.as_ref(),
            me,
            arg,
            payload,
            Some(ReplyTarget::Local(Arc::clone(&local))),
        )?;
        local.wait(self.world.config().call_timeout)
    }

    fn await_reply(&self, owner: ParticipantId, block: ShmPtr<ReplyBlock>) -> FusionResult<i64> {
        let world = &self.world;
        let config = world.config();
        let deadline = Instant::now() + config.call_timeout;
        let reply = world.at(block)?;
        loop {
            if reply.state.load(Ordering::Acquire) == REPLY_DONE {
                let code = ResultCode::from_wire(reply.result.load(Ordering::Relaxed));
                let value = reply.value.load(Ordering::Relaxed);
                world.free(block)?;
                return code.into_result().map(|()| value);
            }

            let now = Instant::now();
            let failure = if now >= deadline {
                Some(FusionError::Timeout)
            } else if !world.is_alive(owner) {
                Some(FusionError::Destroyed)
            } else {
                None
            };
            if let Some(err) = failure {
                if reply
                    .state
                    .compare_exchange(
                        REPLY_PENDING,
                        REPLY_ABANDONED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    tracing::warn!(%owner, %err, call = ?self.slot, "abandoning call reply");
                    if err == FusionError::Destroyed {
                        // Nobody is left to complete the block.
                        world.free(block)?;
                    }
                    return Err(err);
                }
                continue;
            }

            let slice = (deadline - now).min(config.liveness_interval);
            wait::wait_u32(&reply.state, REPLY_PENDING, WaitScope::Shared, Some(slice));
        }
    }

    /// Retires the call. Only the owner may destroy it; later executions
    /// anywhere fail with `Destroyed`.
    pub fn destroy(&self) -> FusionResult<()> {
        self.world.check_usable()?;
        let cell = self.world.at(self.slot)?;
        if cell.owner.load(Ordering::Acquire) != self.world.id().get() {
            return Err(FusionError::AccessDenied);
        }
        cell.state
            .compare_exchange(
                CALL_ALIVE,
                CALL_DESTROYED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| FusionError::Destroyed)?;
        self.world.locals().calls.lock().remove(&self.slot.raw());
        tracing::trace!(call = ?self.slot, "call destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::tests::master;
    use crate::world::Role;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn doubler() -> impl CallHandler {
        |ctx: &CallContext<'_>| CallReturn::Return(ctx.arg() * 2)
    }

    #[test]
    fn owner_executes_inline() {
        let (_dir, _config, world) = master();
        let call = Call::new(&world, doubler()).unwrap();
        assert_eq!(call.execute(7, &[], CallFlags::NONE).unwrap(), 14);
        assert_eq!(call.owner().unwrap(), world.id());
    }

    #[test]
    fn other_participant_goes_through_inbox() {
        let (_dir, config, owner) = master();
        let call = Call::new(&owner, |ctx: &CallContext<'_>| {
            let bonus = ctx.payload().len() as i64;
            CallReturn::Return(ctx.arg() * 2 + bonus)
        })
        .unwrap();

        let caller = World::enter(0, Role::Slave, &config).unwrap();
        let remote = Call::attach(&caller, call.id()).unwrap();
        assert_eq!(remote.execute(7, &[], CallFlags::NONE).unwrap(), 14);
        assert_eq!(remote.execute(7, b"xyz", CallFlags::NONE).unwrap(), 17);
    }

    #[test]
    fn handler_errors_cross_as_result_codes() {
        let (_dir, config, owner) = master();
        let call = Call::new(&owner, |ctx: &CallContext<'_>| {
            if ctx.arg() < 0 {
                CallReturn::Error(FusionError::AccessDenied)
            } else {
                CallReturn::Return(ctx.caller().get() as i64)
            }
        })
        .unwrap();
        let caller = World::enter(0, Role::Slave, &config).unwrap();
        let remote = Call::attach(&caller, call.id()).unwrap();
        assert_eq!(
            remote.execute(-1, &[], CallFlags::NONE),
            Err(FusionError::AccessDenied)
        );
        assert_eq!(
            remote.execute(1, &[], CallFlags::NONE).unwrap(),
            caller.id().get() as i64
        );
    }

    #[test]
    fn deferred_reply_completes_from_another_thread() {
        let (_dir, config, owner) = master();
        let call = Call::new(&owner, |ctx: &CallContext<'_>| {
            let reply = ctx.defer().expect("reply expected");
            let arg = ctx.arg();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                reply.complete(Ok(arg + 100)).unwrap();
            });
            CallReturn::Resume
        })
        .unwrap();
        assert_eq!(call.execute(1, &[], CallFlags::NONE).unwrap(), 101);

        let caller = World::enter(0, Role::Slave, &config).unwrap();
        let remote = Call::attach(&caller, call.id()).unwrap();
        assert_eq!(remote.execute(2, &[], CallFlags::NONE).unwrap(), 102);
    }

    #[test]
    fn deferred_reply_wins_over_returned_value() {
        let (_dir, _config, owner) = master();
        let call = Call::new(&owner, |ctx: &CallContext<'_>| {
            let reply = ctx.defer().expect("reply expected");
            reply.complete(Ok(ctx.arg() + 1)).unwrap();
            CallReturn::Return(-1)
        })
        .unwrap();
        assert_eq!(call.execute(41, &[], CallFlags::NONE).unwrap(), 42);
    }

    #[test]
    fn timed_out_reply_is_reclaimed_by_completer() {
        let (_dir, config, owner) = master();
        let parked: Arc<Mutex<Option<PendingReply>>> = Arc::default();
        let call = {
            let parked = Arc::clone(&parked);
            Call::new(&owner, move |ctx: &CallContext<'_>| {
                *parked.lock() = ctx.defer();
                CallReturn::Resume
            })
            .unwrap()
        };

        let impatient = config.clone().with_call_timeout(Duration::from_millis(100));
        let caller = World::enter(0, Role::Slave, &impatient).unwrap();
        let remote = Call::attach(&caller, call.id()).unwrap();
        let baseline = owner.heap_stats().unwrap().allocations;

        assert_eq!(
            remote.execute(1, &[], CallFlags::NONE),
            Err(FusionError::Timeout)
        );
        let late = parked.lock().take().expect("handler parked its reply");
        late.complete(Ok(5)).unwrap();
        assert_eq!(owner.heap_stats().unwrap().allocations, baseline);
    }

    #[test]
    fn oneway_does_not_wait() {
        let (_dir, config, owner) = master();
        let hits = Arc::new(AtomicUsize::new(0));
        let call = {
            let hits = Arc::clone(&hits);
            Call::new(&owner, move |_: &CallContext<'_>| {
                hits.fetch_add(1, Ordering::SeqCst);
                CallReturn::Return(0)
            })
            .unwrap()
        };
        let caller = World::enter(0, Role::Slave, &config).unwrap();
        let remote = Call::attach(&caller, call.id()).unwrap();
        for _ in 0..10 {
            assert_eq!(remote.execute(0, &[], CallFlags::ONEWAY).unwrap(), 0);
        }
        // A blocking call queues behind the one-way ones.
        remote.execute(0, &[], CallFlags::NONE).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn destroyed_and_departed_owners() {
        let (_dir, config, _master) = master();
        let owner = World::enter(0, Role::Slave, &config).unwrap();
        let caller = World::enter(0, Role::Slave, &config).unwrap();
        let call = Call::new(&owner, doubler()).unwrap();
        let remote = Call::attach(&caller, call.id()).unwrap();

        assert_eq!(remote.destroy(), Err(FusionError::AccessDenied));
        assert_eq!(remote.execute(1, &[], CallFlags::NONE).unwrap(), 2);

        let second = Call::new(&owner, doubler()).unwrap();
        let second_remote = Call::attach(&caller, second.id()).unwrap();
        call.destroy().unwrap();
        assert_eq!(
            remote.execute(1, &[], CallFlags::NONE),
            Err(FusionError::Destroyed)
        );
        assert!(Call::attach(&caller, call.id()).is_err());

        owner.leave().unwrap();
        assert_eq!(
            second_remote.execute(1, &[], CallFlags::NONE),
            Err(FusionError::Destroyed)
        );
    }
}
