//! Same-host object and call substrate shared by several processes.
//!
//! * [`World`] – a file-backed arena every participant maps, with a roster,
//!   a heap and named roots.
//! * [`Skirmish`] – recursive lock and monitor, process-local or in the arena.
//! * [`Ref`] – permissioned reference count whose zero transition fires a call.
//! * [`ObjectPool`] / [`Object`] – arena objects owned by a ref, with a reactor.
//! * [`Reactor`] – fixed-size message fan-out to listeners in any participant.
//! * [`Call`] – synchronous execution of a handler living in another process.
//!
//! Everything in the arena is addressed by [`ShmPtr`] offsets; each process
//! turns them into references only inside its own mapping.

mod call;
mod cancel;
mod config;
mod dispatch;
mod error;
mod heap;
mod ids;
mod inbox;
mod object;
mod reactor;
mod refs;
mod region;
mod skirmish;
pub mod wait;
mod world;

#[doc(hidden)]
pub use tracing as __tracing;

pub use call::{
    Call, CallContext, CallFlags, CallHandler, CallReturn, CallSlot, PendingReply,
};
pub use cancel::Cancel;
pub use config::{FusionConfig, DEFAULT_ARENA_SIZE, DEFAULT_INBOX_CAPACITY};
pub use error::{FusionError, FusionResult, ResultCode};
pub use heap::HeapStats;
pub use ids::ParticipantId;
pub use object::{Object, ObjectPool, ObjectState, PoolConfig, PoolShared, PoolStats};
pub use reactor::{
    GlobalHandle, ListenerHandle, ReactionResult, Reactor, ReactorShared, MAX_GLOBALS,
};
pub use refs::{Permissions, Ref, RefShared, MAX_GRANTS};
pub use region::{
    bytes_of, read_from_bytes, Shareable, SharedRegion, ShmPtr, ARENA_ALIGNMENT,
};
pub use skirmish::{Skirmish, SkirmishCell, SkirmishGuard};
pub use wait::WaitScope;
pub use world::{
    ForkAction, ForkOutcome, Role, WeakWorld, World, ARENA_VERSION, MAX_PARTICIPANTS,
};
