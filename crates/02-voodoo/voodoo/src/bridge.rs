//! Exposes fusion calls over a voodoo connection.
//!
//! An exported call is an ordinary instance with one method, [`EXECUTE`],
//! taking `long arg, data payload, uint flags` and replying `long value`.
//! Handler errors travel back as the response's result code.

use crate::instance::{DispatchTable, Invocation};
use crate::manager::Manager;
use crate::message::{ArgReader, ArgWriter, InstanceId, MessageFlags, MethodId};
use fusion::{Call, CallFlags, FusionError, FusionResult};
use std::sync::Arc;

pub const EXECUTE: MethodId = 1;

/// Registers `call` on `manager` so the peer can execute it.
pub fn export_call(manager: &Manager, call: Call) -> FusionResult<InstanceId> {
    let table = DispatchTable::new().method(EXECUTE, |call: &Call, invocation: &mut Invocation<'_>| {
        let args = invocation.args();
        let arg = args.long()?;
        let payload = args.data()?;
        let flags = CallFlags::from_bits(args.uint()?);
        let value = call.execute(arg, payload, flags)?;
        invocation.reply().long(value);
        Ok(())
    });
    Ok(manager.register_instance(Arc::new(call), table)?)
}

/// Peer-side handle to an exported call.
#[derive(Clone, Debug)]
pub struct RemoteCall {
    manager: Manager,
    instance: InstanceId,
}

impl RemoteCall {
    pub fn new(manager: Manager, instance: InstanceId) -> Self {
        Self { manager, instance }
    }

    /// Resolves a call the peer published as a super instance.
    pub fn lookup(manager: Manager, name: &str) -> FusionResult<Self> {
        let instance = manager.lookup_super(name)?;
        Ok(Self { manager, instance })
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Same contract as [`Call::execute`]; `ONEWAY` returns `Ok(0)` once the
    /// request is written.
    pub fn execute(&self, arg: i64, payload: &[u8], flags: CallFlags) -> FusionResult<i64> {
        let args = ArgWriter::new()
            .long(arg)
            .data(payload)
            .uint(flags.bits())
            .finish();
        if flags.contains(CallFlags::ONEWAY) {
            self.manager
                .request(self.instance, EXECUTE, args, MessageFlags::NONE)?;
            return Ok(0);
        }
        let payload = self.manager.call(self.instance, EXECUTE, args)?.into_result()?;
        ArgReader::new(&payload)
            .long()
            .map_err(|_| FusionError::InvArg("malformed call reply"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SuperRegistry, VoodooConfig};
    use fusion::{CallContext, CallReturn, FusionConfig, Role, World};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::{Duration, Instant};

    fn world() -> (tempfile::TempDir, World) {
        let dir = tempfile::tempdir().unwrap();
        let config = FusionConfig::default()
            .with_shm_dir(dir.path())
            .with_arena_size(1024 * 1024);
        let world = World::enter(0, Role::Master, &config).unwrap();
        (dir, world)
    }

    #[test]
    fn call_doubles_across_the_network() {
        let (_dir, world) = world();
        let supers = SuperRegistry::new();
        let exported = world.clone();
        supers
            .register("double", move |manager: &Manager| {
                let call = Call::new(&exported, |ctx: &CallContext<'_>| {
                    CallReturn::Return(ctx.arg() * 2 + ctx.payload().len() as i64)
                })?;
                export_call(manager, call)
            })
            .unwrap();
        let (client, server) = Manager::pair(VoodooConfig::default(), supers).unwrap();
        server.spawn_dispatcher().unwrap();

        let remote = RemoteCall::lookup(client, "double").unwrap();
        assert_eq!(remote.execute(7, &[], CallFlags::NONE).unwrap(), 14);
        assert_eq!(remote.execute(7, b"abc", CallFlags::NONE).unwrap(), 17);
    }

    #[test]
    fn handler_errors_and_oneway_executions() {
        let (_dir, world) = world();
        let seen = Arc::new(AtomicI64::new(0));
        let recorder = seen.clone();
        let call = Call::new(&world, move |ctx: &CallContext<'_>| {
            if ctx.arg() < 0 {
                return CallReturn::Error(FusionError::AccessDenied);
            }
            recorder.store(ctx.arg(), Ordering::SeqCst);
            CallReturn::Return(0)
        })
        .unwrap();
        let (client, server) = Manager::pair(VoodooConfig::default(), SuperRegistry::new()).unwrap();
        let id = export_call(&server, call).unwrap();
        server.spawn_dispatcher().unwrap();

        let remote = RemoteCall::new(client, id);
        assert_eq!(
            remote.execute(-1, &[], CallFlags::NONE),
            Err(FusionError::AccessDenied)
        );
        assert_eq!(remote.execute(42, &[], CallFlags::ONEWAY).unwrap(), 0);
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::SeqCst) != 42 {
            assert!(Instant::now() < deadline, "one-way execution never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
