use crate::support::{master, slave, wait_for};
use fusion::{ReactionResult, Reactor};
use parking_lot::Mutex;
use std::sync::Arc;

#[test]
fn globals_then_locals_in_attach_order() {
    let (_dir, _config, world) = master();
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    for index in [0u32, 1] {
        let sink = order.clone();
        world
            .register_global_reaction(index, move |bytes, ctx| {
                sink.lock().push(format!("g{index}:{ctx}:{}", bytes[0]));
                ReactionResult::Ok
            })
            .unwrap();
    }

    let reactor = Reactor::<u8>::new(&world).unwrap();
    reactor.attach_global(1, 10).unwrap();
    reactor.attach_global(0, 20).unwrap();
    for name in ["a", "b", "c"] {
        let sink = order.clone();
        reactor
            .attach(move |value: &u8| {
                sink.lock().push(format!("{name}:{value}"));
                if name == "b" {
                    ReactionResult::Remove
                } else {
                    ReactionResult::Ok
                }
            })
            .unwrap();
    }
    assert_eq!(reactor.listener_count().unwrap(), 3);

    reactor.dispatch(&1, true).unwrap();
    reactor.dispatch(&2, true).unwrap();
    assert_eq!(
        *order.lock(),
        ["g1:10:1", "g0:20:1", "a:1", "b:1", "c:1", "g1:10:2", "g0:20:2", "a:2", "c:2"]
    );
    assert_eq!(reactor.listener_count().unwrap(), 2);
}

#[test]
fn dispatcher_can_skip_itself_but_reach_others() {
    let (_dir, config, owner) = master();
    let other = slave(&config);
    let reactor = Reactor::<u32>::new(&owner).unwrap();
    let remote = Reactor::<u32>::open(&other, reactor.id()).unwrap();

    let local_seen = Arc::new(Mutex::new(Vec::new()));
    let remote_seen = Arc::new(Mutex::new(Vec::new()));
    let sink = local_seen.clone();
    reactor
        .attach(move |value: &u32| {
            sink.lock().push(*value);
            ReactionResult::Ok
        })
        .unwrap();
    let sink = remote_seen.clone();
    remote
        .attach(move |value: &u32| {
            sink.lock().push(*value);
            ReactionResult::Ok
        })
        .unwrap();

    reactor.dispatch(&1, false).unwrap();
    reactor.dispatch(&2, true).unwrap();
    wait_for(|| remote_seen.lock().len() == 2);
    remote.dispatch(&3, true).unwrap();

    wait_for(|| remote_seen.lock().len() == 3);
    wait_for(|| local_seen.lock().len() == 2);
    assert_eq!(*remote_seen.lock(), vec![1, 2, 3]);
    assert_eq!(*local_seen.lock(), vec![2, 3]);
}
