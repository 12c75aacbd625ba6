//! Forked children either rejoin the world as a new participant or drop it.
//! A child that dies inside a call it owns fails the caller instead of
//! hanging it.
//!
//! Lives in its own test binary, as a single test, so every fork happens
//! with as few threads running as possible.

use fusion::{
    Call, CallContext, CallFlags, CallReturn, CallSlot, ForkAction, ForkOutcome, FusionConfig,
    FusionError, Role, World,
};
use std::thread;
use std::time::{Duration, Instant};

fn exit_child(ok: bool) -> ! {
    // SAFETY: the child must not run the test harness's exit path.
    unsafe { libc::_exit(if ok { 0 } else { 1 }) }
}

fn assert_child_succeeded(child_pid: u32) {
    let mut status = 0;
    // SAFETY: waiting on our own child.
    let waited = unsafe { libc::waitpid(child_pid as libc::pid_t, &mut status, 0) };
    assert_eq!(waited, child_pid as libc::pid_t);
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 0, "child reported failure");
}

#[test]
fn forked_children_rejoin_leave_or_die() {
    let dir = tempfile::tempdir().unwrap();
    let config = FusionConfig::default()
        .with_shm_dir(dir.path())
        .with_arena_size(1024 * 1024)
        .with_call_timeout(Duration::from_secs(5));
    let parent = World::enter(0, Role::Master, &config).unwrap();
    let call = Call::new(&parent, |ctx: &CallContext<'_>| CallReturn::Return(ctx.arg() * 2)).unwrap();
    let call_id = call.id();

    match parent.fork(ForkAction::Rejoin).unwrap() {
        ForkOutcome::Child(world) => {
            let doubled = world
                .ok_or(FusionError::Init)
                .and_then(|world| Call::attach(&world, call_id)?.execute(7, &[], CallFlags::NONE));
            exit_child(doubled == Ok(14));
        }
        ForkOutcome::Parent { child_pid } => assert_child_succeeded(child_pid),
    }

    match parent.fork(ForkAction::Leave).unwrap() {
        ForkOutcome::Child(world) => {
            exit_child(world.is_none() && parent.alloc_value(&1u64).is_err());
        }
        ForkOutcome::Parent { child_pid } => assert_child_succeeded(child_pid),
    }

    assert!(parent.alloc_value(&2u64).is_ok());
    assert_eq!(call.execute(21, &[], CallFlags::NONE).unwrap(), 42);

    match parent.fork(ForkAction::Rejoin).unwrap() {
        ForkOutcome::Child(world) => {
            let published = world.ok_or(FusionError::Init).and_then(|world| {
                let doomed = Call::new(&world, |_: &CallContext<'_>| -> CallReturn {
                    exit_child(true)
                })?;
                world.publish_root("doomed", doomed.id())?;
                Ok(world)
            });
            if let Ok(_world) = published {
                thread::sleep(Duration::from_secs(30));
            }
            exit_child(false);
        }
        ForkOutcome::Parent { child_pid } => {
            let reaper = thread::spawn(move || assert_child_succeeded(child_pid));
            let deadline = Instant::now() + Duration::from_secs(10);
            let id = loop {
                if let Some(id) = parent.lookup_root::<CallSlot>("doomed").unwrap() {
                    break id;
                }
                assert!(Instant::now() < deadline, "child never published its call");
                thread::sleep(Duration::from_millis(5));
            };
            let doomed = Call::attach(&parent, id).unwrap();
            let baseline = parent.heap_stats().unwrap().allocations;

            let started = Instant::now();
            assert_eq!(
                doomed.execute(1, &[], CallFlags::NONE),
                Err(FusionError::Destroyed)
            );
            assert!(started.elapsed() < Duration::from_secs(3));
            assert_eq!(parent.heap_stats().unwrap().allocations, baseline);
            reaper.join().unwrap();
        }
    }
}
