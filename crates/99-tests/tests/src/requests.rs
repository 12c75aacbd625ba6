use crate::support::connected;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use voodoo::{
    ArgWriter, ConnectionState, DispatchTable, Invocation, MessageFlags, MethodId, SuperRegistry,
    VoodooConfig,
};

const PUSH: MethodId = 1;
const COUNT: MethodId = 2;
const ECHO: MethodId = 3;

#[derive(Default)]
struct Journal {
    entries: Mutex<Vec<u32>>,
}

fn journal_table() -> DispatchTable<Journal> {
    DispatchTable::new()
        .method(PUSH, |journal: &Journal, call: &mut Invocation<'_>| {
            let entry = call.args().uint()?;
            journal.entries.lock().push(entry);
            Ok(())
        })
        .method(COUNT, |journal: &Journal, call: &mut Invocation<'_>| {
            call.reply().uint(journal.entries.lock().len() as u32);
            Ok(())
        })
        .method(ECHO, |_: &Journal, call: &mut Invocation<'_>| {
            let data = call.args().data()?.to_vec();
            call.reply().data(&data);
            Ok(())
        })
}

#[test]
fn thousand_oneway_requests_precede_the_answered_one() {
    let (client, server) = connected(VoodooConfig::default(), SuperRegistry::new());
    let journal = Arc::new(Journal::default());
    let id = server.register_instance(journal.clone(), journal_table()).unwrap();

    for entry in 0..1000u32 {
        let args = ArgWriter::new().uint(entry).finish();
        assert!(client.request(id, PUSH, args, MessageFlags::NONE).unwrap().is_none());
    }
    let response = client
        .request(id, COUNT, Vec::new(), MessageFlags::RESPOND)
        .unwrap()
        .expect("response requested");
    assert_eq!(response.serial, 1001);
    assert_eq!(response.args().uint().unwrap(), 1000);
    assert_eq!(*journal.entries.lock(), (0..1000).collect::<Vec<_>>());
    assert_eq!(client.state(), ConnectionState::Established);
}

#[test]
fn closing_the_client_stops_the_serving_dispatcher() {
    let (client, server) = voodoo::Manager::pair(VoodooConfig::default(), SuperRegistry::new()).unwrap();
    let dispatcher = server.spawn_dispatcher().unwrap();
    client.close();
    dispatcher.join().unwrap();
    assert_eq!(server.state(), ConnectionState::Closed);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn payloads_survive_compressed_connections(
        chunk in proptest::collection::vec(any::<u8>(), 0..512),
        repeats in 1usize..16,
    ) {
        let config = VoodooConfig {
            compression_min_size: 16,
            ..VoodooConfig::default()
        };
        let (client, server) = connected(config, SuperRegistry::new());
        let id = server
            .register_instance(Arc::new(Journal::default()), journal_table())
            .unwrap();
        let payload = chunk.repeat(repeats);
        let response = client
            .call(id, ECHO, ArgWriter::new().data(&payload).finish())
            .unwrap();
        prop_assert_eq!(response.args().data().unwrap(), payload.as_slice());
        client.close();
        server.close();
    }
}
