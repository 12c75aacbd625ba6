//! One doubling handler reached three ways: inline, through another
//! participant's inbox, and over a voodoo connection.

use crate::support::{connected, master, slave};
use fusion::{Call, CallContext, CallFlags, CallReturn, FusionError};
use voodoo::{export_call, Manager, RemoteCall, SuperRegistry, VoodooConfig};

fn doubler(ctx: &CallContext<'_>) -> CallReturn {
    if ctx.arg() < 0 {
        return CallReturn::Error(FusionError::InvArg("negative"));
    }
    CallReturn::Return(ctx.arg() * 2)
}

#[test]
fn owner_gets_fourteen_inline() {
    let (_dir, _config, world) = master();
    let call = Call::new(&world, doubler).unwrap();
    assert_eq!(call.execute(7, &[], CallFlags::NONE).unwrap(), 14);
}

#[test]
fn other_participant_gets_fourteen_through_the_inbox() {
    let (_dir, config, owner) = master();
    let call = Call::new(&owner, doubler).unwrap();
    let caller = slave(&config);
    let attached = Call::attach(&caller, call.id()).unwrap();
    assert_eq!(attached.execute(7, &[], CallFlags::NONE).unwrap(), 14);
    assert!(matches!(
        attached.execute(-7, &[], CallFlags::NONE),
        Err(FusionError::InvArg(_))
    ));
}

#[test]
fn network_client_gets_fourteen() {
    let (_dir, _config, world) = master();
    let call = Call::new(&world, doubler).unwrap();
    let (client, server) = connected(VoodooConfig::default(), SuperRegistry::new());
    let id = export_call(&server, call).unwrap();
    let remote = RemoteCall::new(client, id);
    assert_eq!(remote.execute(7, &[], CallFlags::NONE).unwrap(), 14);
    assert!(matches!(
        remote.execute(-7, &[], CallFlags::NONE),
        Err(FusionError::InvArg(_))
    ));
}

#[test]
fn network_call_is_relayed_to_the_owning_participant() {
    let (_dir, config, owner) = master();
    let call = Call::new(&owner, doubler).unwrap();
    let relay = slave(&config);
    let relayed = Call::attach(&relay, call.id()).unwrap();

    let supers = SuperRegistry::new();
    supers
        .register("double", move |manager: &Manager| {
            export_call(manager, relayed.clone())
        })
        .unwrap();
    let (client, _server) = connected(VoodooConfig::default(), supers);
    let remote = RemoteCall::lookup(client, "double").unwrap();
    for value in 0..20 {
        assert_eq!(remote.execute(value, &[], CallFlags::NONE).unwrap(), value * 2);
    }
}
