//! One connection: handshake, instance registry, requests and dispatch.
//!
//! Either side may issue requests and serve them. Serials are assigned under
//! the write lock, so the wire carries requests in serial order. Only the
//! holder of the reader token reads from the link; a thread waiting for a
//! response either takes the token and reads (routing other responses to
//! their waiters and dispatching incoming requests inline) or parks on its
//! response channel until the current reader hands it over. The token is
//! reentrant, so a handler may issue nested requests on the connection it
//! is serving.

use crate::instance::{self, DispatchTable, Dispatch, InstanceRegistry, Invocation, SuperRegistry};
use crate::link::Link;
use crate::message::{
    check_hello, encode_hello, ArgReader, ArgWriter, InstanceId, Message, MessageFlags,
    MessageKind, MethodId, HELLO_MAGIC, PROTOCOL_VERSION, SUPER_INSTANCE,
};
use crate::packet::Compression;
use crate::{VoodooConfig, VoodooError, VoodooResult};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use fusion::{Cancel, FusionError, FusionResult, ResultCode};
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Method of [`SUPER_INSTANCE`] resolving a name to an instance id.
pub const LOOKUP_SUPER: MethodId = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Established,
    Closing,
    Closed,
}

/// A response matched to its request by serial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub serial: u32,
    pub result: ResultCode,
    pub payload: Vec<u8>,
}

impl Response {
    /// The payload if the peer reported success.
    pub fn into_result(self) -> FusionResult<Vec<u8>> {
        self.result.into_result().map(|()| self.payload)
    }

    pub fn args(&self) -> ArgReader<'_> {
        ArgReader::new(&self.payload)
    }
}

#[derive(Clone, Debug)]
enum Failure {
    Closed,
    Lost(String),
}

impl Failure {
    fn error(&self) -> VoodooError {
        match self {
            Failure::Closed => VoodooError::Closed,
            Failure::Lost(reason) => VoodooError::ConnectionLost(reason.clone()),
        }
    }
}

struct Inner {
    link: Link,
    config: VoodooConfig,
    state: Mutex<ConnectionState>,
    next_serial: Mutex<u32>,
    pending: Mutex<HashMap<u32, Sender<Response>>>,
    instances: Mutex<InstanceRegistry>,
    supers: SuperRegistry,
    super_cache: Mutex<HashMap<String, InstanceId>>,
    reader: ReentrantMutex<()>,
    depth: AtomicU32,
    failure: Mutex<Option<Failure>>,
    cancel: Cancel,
}

/// Handle to a connection. Clones share it.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("peer", &self.inner.link.peer())
            .field("state", &self.state())
            .finish()
    }
}

impl Manager {
    /// Runs the hello exchange on `link`. `supers` answers the peer's super
    /// lookups.
    pub fn new(link: Link, config: VoodooConfig, supers: SuperRegistry) -> VoodooResult<Manager> {
        let manager = Manager {
            inner: Arc::new(Inner {
                link,
                config,
                state: Mutex::new(ConnectionState::Connecting),
                next_serial: Mutex::new(1),
                pending: Mutex::new(HashMap::new()),
                instances: Mutex::new(InstanceRegistry::default()),
                supers,
                super_cache: Mutex::new(HashMap::new()),
                reader: ReentrantMutex::new(()),
                depth: AtomicU32::new(0),
                failure: Mutex::new(None),
                cancel: Cancel::new(),
            }),
        };
        if let Err(err) = manager.handshake() {
            tracing::warn!(%err, peer = manager.peer(), "voodoo handshake failed");
            manager.close();
            return Err(err);
        }
        *manager.inner.state.lock() = ConnectionState::Established;
        tracing::debug!(peer = manager.peer(), "voodoo connection established");
        Ok(manager)
    }

    pub fn connect_tcp(addr: impl ToSocketAddrs, config: VoodooConfig) -> VoodooResult<Manager> {
        Manager::new(Link::connect_tcp(addr)?, config, SuperRegistry::default())
    }

    pub fn connect_unix(path: impl AsRef<Path>, config: VoodooConfig) -> VoodooResult<Manager> {
        Manager::new(Link::connect_unix(path)?, config, SuperRegistry::default())
    }

    /// Two managers connected to each other in this process; the second
    /// serves `supers`.
    pub fn pair(config: VoodooConfig, supers: SuperRegistry) -> VoodooResult<(Manager, Manager)> {
        let (near, far) = Link::pair()?;
        let far_config = config.clone();
        let far = thread::Builder::new()
            .name("voodoo-handshake".into())
            .spawn(move || Manager::new(far, far_config, supers))?;
        let near = Manager::new(near, config, SuperRegistry::default());
        let far = far
            .join()
            .map_err(|_| VoodooError::ConnectionLost("handshake thread panicked".into()))?;
        Ok((near?, far?))
    }

    fn handshake(&self) -> VoodooResult<()> {
        let link = &self.inner.link;
        link.set_read_timeout(Some(self.inner.config.handshake_timeout))?;
        link.write_packet(&encode_hello(HELLO_MAGIC, PROTOCOL_VERSION), Compression::Never)?;
        let hello = link.read_packet(64)?;
        link.set_read_timeout(None)?;
        check_hello(&hello)?;
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn peer(&self) -> &str {
        self.inner.link.peer()
    }

    pub fn config(&self) -> &VoodooConfig {
        &self.inner.config
    }

    fn ensure_established(&self) -> VoodooResult<()> {
        match self.state() {
            ConnectionState::Established => Ok(()),
            _ => Err(self.failure_error()),
        }
    }

    fn failure_error(&self) -> VoodooError {
        self.inner
            .failure
            .lock()
            .as_ref()
            .map(Failure::error)
            .unwrap_or(VoodooError::Closed)
    }

    /// Makes `object` invocable by the peer through `table`.
    pub fn register_instance<T: Send + Sync + 'static>(
        &self,
        object: Arc<T>,
        table: DispatchTable<T>,
    ) -> VoodooResult<InstanceId> {
        self.register_dispatch(instance::erase(object, table))
    }

    pub fn register_dispatch(&self, instance: Arc<dyn Dispatch>) -> VoodooResult<InstanceId> {
        self.ensure_established()?;
        let id = self.inner.instances.lock().register(instance)?;
        tracing::trace!(id, peer = self.peer(), "instance registered");
        Ok(id)
    }

    pub fn unregister_instance(&self, id: InstanceId) -> VoodooResult<()> {
        Ok(self.inner.instances.lock().unregister(id)?)
    }

    pub fn instance_count(&self) -> usize {
        self.inner.instances.lock().len()
    }

    /// Sends a request. Without `RESPOND` this returns `None` once the
    /// packet is written; with it, blocks until the matching response.
    pub fn request(
        &self,
        instance: InstanceId,
        method: MethodId,
        args: Vec<u8>,
        flags: MessageFlags,
    ) -> VoodooResult<Option<Response>> {
        self.ensure_established()?;
        let (serial, waiter) = {
            let mut next = self.inner.next_serial.lock();
            let serial = *next;
            *next = next.wrapping_add(1).max(1);
            let waiter = flags.contains(MessageFlags::RESPOND).then(|| {
                let (tx, rx) = bounded(1);
                self.inner.pending.lock().insert(serial, tx);
                rx
            });
            let message = Message::request(serial, instance, method, flags, args);
            if let Err(err) = self.send(&message) {
                self.inner.pending.lock().remove(&serial);
                return Err(self.fail(err));
            }
            (serial, waiter)
        };
        match waiter {
            Some(waiter) => self.await_response(serial, waiter).map(Some),
            None => Ok(None),
        }
    }

    /// `RESPOND` request whose response is required.
    pub fn call(&self, instance: InstanceId, method: MethodId, args: Vec<u8>) -> VoodooResult<Response> {
        self.request(instance, method, args, MessageFlags::RESPOND)?
            .ok_or(VoodooError::Malformed("response missing"))
    }

    /// Resolves a named root instance on the peer, constructing it there on
    /// first use.
    pub fn lookup_super(&self, name: &str) -> VoodooResult<InstanceId> {
        let args = ArgWriter::new().string(name).finish();
        let payload = self.call(SUPER_INSTANCE, LOOKUP_SUPER, args)?.into_result()?;
        Ok(ArgReader::new(&payload).id()?)
    }

    fn send(&self, message: &Message) -> VoodooResult<()> {
        self.inner
            .link
            .write_packet(&message.encode(), self.inner.config.compression_policy())
    }

    fn await_response(&self, serial: u32, waiter: Receiver<Response>) -> VoodooResult<Response> {
        let deadline = Instant::now() + self.inner.config.request_timeout;
        let slice = self.inner.config.follower_slice;
        loop {
            match waiter.try_recv() {
                Ok(response) => return Ok(response),
                Err(TryRecvError::Disconnected) => return Err(self.failure_error()),
                Err(TryRecvError::Empty) => {}
            }
            if Instant::now() >= deadline {
                self.inner.pending.lock().remove(&serial);
                tracing::warn!(serial, peer = self.peer(), "request timed out");
                return Err(FusionError::Timeout.into());
            }
            match self.inner.reader.try_lock_for(slice) {
                Some(_token) => {
                    if let Ok(response) = waiter.try_recv() {
                        return Ok(response);
                    }
                    let left = deadline.saturating_duration_since(Instant::now());
                    self.pump_one(Some(left))?;
                }
                None => match waiter.recv_timeout(slice) {
                    Ok(response) => return Ok(response),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return Err(self.failure_error()),
                },
            }
        }
    }

    /// Reads and handles one packet, giving up quietly once `timeout`
    /// passes. Caller holds the reader token.
    fn pump_one(&self, timeout: Option<Duration>) -> VoodooResult<()> {
        let max = self.inner.config.max_packet_size;
        let read = match timeout {
            Some(timeout) => self.inner.link.read_packet_within(max, timeout),
            None => self.inner.link.read_packet(max).map(Some),
        };
        let Some(payload) = read.map_err(|err| self.fail(err))? else {
            return Ok(());
        };
        let message = Message::decode(payload).map_err(|err| self.fail(err))?;
        match message.kind {
            MessageKind::Response => {
                let waiter = self.inner.pending.lock().remove(&message.serial);
                match waiter {
                    Some(waiter) => {
                        let response = Response {
                            serial: message.serial,
                            result: message.result,
                            payload: message.payload,
                        };
                        if waiter.send(response).is_err() {
                            tracing::debug!(serial = message.serial, "waiter gone before response");
                        }
                    }
                    None => tracing::debug!(serial = message.serial, "response for unknown serial"),
                }
                Ok(())
            }
            MessageKind::Request => self.dispatch(message),
        }
    }

    fn dispatch(&self, message: Message) -> VoodooResult<()> {
        let depth = self.inner.depth.fetch_add(1, Ordering::AcqRel) + 1;
        let result = if depth > self.inner.config.max_dispatch_depth {
            tracing::warn!(depth, serial = message.serial, "dispatch nested too deeply");
            Err(FusionError::Limit("dispatch nested too deeply"))
        } else {
            self.invoke_local(&message)
        };
        self.inner.depth.fetch_sub(1, Ordering::AcqRel);

        if message.flags.contains(MessageFlags::RESPOND) {
            let (code, payload) = match result {
                Ok(payload) => (ResultCode::Ok, payload),
                Err(err) => (err.code(), Vec::new()),
            };
            self.send(&Message::response(&message, code, payload))
                .map_err(|err| self.fail(err))?;
        } else if let Err(err) = result {
            tracing::debug!(%err, serial = message.serial, "one-way request failed");
        }
        Ok(())
    }

    fn invoke_local(&self, message: &Message) -> FusionResult<Vec<u8>> {
        if message.instance == SUPER_INSTANCE {
            return self.serve_super(message);
        }
        let instance = self.inner.instances.lock().get(message.instance)?;
        let mut invocation = Invocation::new(self, message.instance, message.method, &message.payload);
        instance.dispatch(&mut invocation)?;
        Ok(invocation.into_reply())
    }

    fn serve_super(&self, message: &Message) -> FusionResult<Vec<u8>> {
        if message.method != LOOKUP_SUPER {
            return Err(FusionError::NoSuchMethod(message.method));
        }
        let name = ArgReader::new(&message.payload).string()?;
        let cached = self.inner.super_cache.lock().get(name).copied();
        let id = match cached {
            Some(id) => id,
            None => {
                let factory = self
                    .inner
                    .supers
                    .get(name)
                    .ok_or(FusionError::NoSuchInstance(SUPER_INSTANCE))?;
                let id = factory(self)?;
                tracing::debug!(name, id, "super instance constructed");
                self.inner.super_cache.lock().insert(name.to_owned(), id);
                id
            }
        };
        Ok(ArgWriter::new().id(id).finish())
    }

    /// Serves incoming traffic until the connection closes or
    /// [`Manager::cancel`] is signalled.
    pub fn run(&self) -> VoodooResult<()> {
        while !self.inner.cancel.is_cancelled() {
            if self.state() != ConnectionState::Established {
                break;
            }
            let _token = self.inner.reader.lock();
            match self.pump_one(None) {
                Ok(()) => {}
                Err(VoodooError::Closed) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Runs [`Manager::run`] on its own thread.
    pub fn spawn_dispatcher(&self) -> VoodooResult<JoinHandle<()>> {
        let manager = self.clone();
        Ok(thread::Builder::new()
            .name("voodoo-dispatch".into())
            .spawn(move || {
                if let Err(err) = manager.run() {
                    tracing::warn!(%err, peer = manager.peer(), "voodoo dispatcher stopped");
                }
            })?)
    }

    pub fn cancel(&self) -> Cancel {
        self.inner.cancel.clone()
    }

    /// Closes the connection; pending requests fail with `Closed`.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closing;
        }
        self.inner.failure.lock().get_or_insert(Failure::Closed);
        self.shut_down();
    }

    /// Records a transport failure and tears the connection down. Returns
    /// the error for the caller that observed it.
    fn fail(&self, err: VoodooError) -> VoodooError {
        if !err.is_fatal() {
            return err;
        }
        let first = {
            let mut failure = self.inner.failure.lock();
            let first = failure.is_none();
            failure.get_or_insert_with(|| match &err {
                VoodooError::Closed => Failure::Closed,
                other => Failure::Lost(other.to_string()),
            });
            first
        };
        if first {
            tracing::warn!(%err, peer = self.peer(), "voodoo connection failed");
        }
        self.shut_down();
        err
    }

    fn shut_down(&self) {
        if let Err(err) = self.inner.link.shutdown() {
            tracing::debug!(%err, "link shutdown failed");
        }
        *self.inner.state.lock() = ConnectionState::Closed;
        self.inner.pending.lock().clear();
        self.inner.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Doubler;

    const DOUBLE: MethodId = 1;
    const RECORD: MethodId = 2;

    fn doubler_table() -> DispatchTable<Doubler> {
        DispatchTable::new().method(DOUBLE, |_: &Doubler, call: &mut Invocation<'_>| {
            let value = call.args().long()?;
            call.reply().long(value * 2);
            Ok(())
        })
    }

    fn connected() -> (Manager, Manager) {
        let (client, server) = Manager::pair(VoodooConfig::default(), SuperRegistry::default()).unwrap();
        server.spawn_dispatcher().unwrap();
        (client, server)
    }

    #[test]
    fn request_round_trip_doubles() {
        let (client, server) = connected();
        let id = server
            .register_instance(Arc::new(Doubler), doubler_table())
            .unwrap();
        let response = client
            .call(id, DOUBLE, ArgWriter::new().long(7).finish())
            .unwrap();
        assert_eq!(response.result, ResultCode::Ok);
        assert_eq!(response.args().long().unwrap(), 14);
        client.close();
        server.close();
    }

    #[test]
    fn unknown_targets_do_not_close_the_connection() {
        let (client, server) = connected();
        let id = server
            .register_instance(Arc::new(Doubler), doubler_table())
            .unwrap();
        let missing = client.call(id + 50, DOUBLE, Vec::new()).unwrap();
        assert_eq!(missing.result, ResultCode::NoSuchInstance);
        let no_method = client.call(id, 99, Vec::new()).unwrap();
        assert_eq!(no_method.result, ResultCode::NoSuchMethod);
        let bad_args = client.call(id, DOUBLE, ArgWriter::new().string("x").finish()).unwrap();
        assert_eq!(bad_args.result, ResultCode::InvArg);
        assert_eq!(client.state(), ConnectionState::Established);
        let ok = client.call(id, DOUBLE, ArgWriter::new().long(1).finish()).unwrap();
        assert_eq!(ok.args().long().unwrap(), 2);
    }

    #[test]
    fn oneway_requests_arrive_in_serial_order() {
        struct Log(Mutex<Vec<i64>>);
        let (client, server) = connected();
        let log = Arc::new(Log(Mutex::new(Vec::new())));
        let id = server
            .register_instance(
                log.clone(),
                DispatchTable::new()
                    .method(RECORD, |log: &Log, call: &mut Invocation<'_>| {
                        let value = call.args().long()?;
                        log.0.lock().push(value);
                        Ok(())
                    })
                    .method(DOUBLE, |log: &Log, call: &mut Invocation<'_>| {
                        call.reply().uint(log.0.lock().len() as u32);
                        Ok(())
                    }),
            )
            .unwrap();
        for value in 0..200 {
            let sent = client
                .request(id, RECORD, ArgWriter::new().long(value).finish(), MessageFlags::NONE)
                .unwrap();
            assert!(sent.is_none());
        }
        let response = client.call(id, DOUBLE, Vec::new()).unwrap();
        assert_eq!(response.serial, 201);
        assert_eq!(response.args().uint().unwrap(), 200);
        assert_eq!(*log.0.lock(), (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_callers_get_their_own_responses() {
        let (client, server) = connected();
        let id = server
            .register_instance(Arc::new(Doubler), doubler_table())
            .unwrap();
        let workers: Vec<_> = (0..8i64)
            .map(|worker| {
                let client = client.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        let value = worker * 1000 + i;
                        let response = client
                            .call(id, DOUBLE, ArgWriter::new().long(value).finish())
                            .unwrap();
                        assert_eq!(response.args().long().unwrap(), value * 2);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    }

    struct Bouncer {
        peer_instance: AtomicU32,
    }

    const BOUNCE: MethodId = 3;

    fn bouncer_table() -> DispatchTable<Bouncer> {
        DispatchTable::new().method(BOUNCE, |bouncer: &Bouncer, call: &mut Invocation<'_>| {
            let left = call.args().uint()?;
            let answer = if left == 0 {
                0
            } else {
                let target = bouncer.peer_instance.load(Ordering::Acquire);
                let response = call
                    .manager()
                    .call(target, BOUNCE, ArgWriter::new().uint(left - 1).finish())
                    .map_err(FusionError::from)?;
                let payload = response.into_result()?;
                ArgReader::new(&payload).uint()? + 1
            };
            call.reply().uint(answer);
            Ok(())
        })
    }

    fn bouncing_pair(depth: u32) -> (Manager, Manager, InstanceId) {
        let config = VoodooConfig::default().with_max_dispatch_depth(depth);
        let (client, server) = Manager::pair(config, SuperRegistry::default()).unwrap();
        server.spawn_dispatcher().unwrap();
        let on_client = Arc::new(Bouncer {
            peer_instance: AtomicU32::new(0),
        });
        let on_server = Arc::new(Bouncer {
            peer_instance: AtomicU32::new(0),
        });
        let client_id = client.register_instance(on_client.clone(), bouncer_table()).unwrap();
        let server_id = server.register_instance(on_server.clone(), bouncer_table()).unwrap();
        on_client.peer_instance.store(server_id, Ordering::Release);
        on_server.peer_instance.store(client_id, Ordering::Release);
        (client, server, server_id)
    }

    #[test]
    fn nested_requests_are_served_while_waiting() {
        let (client, _server, target) = bouncing_pair(16);
        let response = client
            .call(target, BOUNCE, ArgWriter::new().uint(6).finish())
            .unwrap();
        assert_eq!(response.args().uint().unwrap(), 6);
    }

    #[test]
    fn nesting_beyond_the_limit_is_refused() {
        let (client, _server, target) = bouncing_pair(2);
        let response = client
            .call(target, BOUNCE, ArgWriter::new().uint(12).finish())
            .unwrap();
        assert_eq!(response.result, ResultCode::Limit);
        assert_eq!(client.state(), ConnectionState::Established);
    }

    #[test]
    fn super_instances_are_built_once_per_connection() {
        let built = Arc::new(AtomicUsize::new(0));
        let supers = SuperRegistry::new();
        let counter = built.clone();
        supers
            .register("doubler", move |manager: &Manager| {
                counter.fetch_add(1, Ordering::SeqCst);
                manager
                    .register_instance(Arc::new(Doubler), doubler_table())
                    .map_err(FusionError::from)
            })
            .unwrap();
        let (client, server) = Manager::pair(VoodooConfig::default(), supers).unwrap();
        server.spawn_dispatcher().unwrap();

        let id = client.lookup_super("doubler").unwrap();
        assert_eq!(client.lookup_super("doubler").unwrap(), id);
        assert_eq!(built.load(Ordering::SeqCst), 1);
        let response = client.call(id, DOUBLE, ArgWriter::new().long(21).finish()).unwrap();
        assert_eq!(response.args().long().unwrap(), 42);
        assert!(matches!(
            client.lookup_super("missing"),
            Err(VoodooError::Fusion(FusionError::NoSuchInstance(_)))
        ));
    }

    #[test]
    fn peer_loss_fails_pending_requests() {
        let (client, server) = Manager::pair(VoodooConfig::default(), SuperRegistry::default()).unwrap();
        let id = server
            .register_instance(
                Arc::new(Doubler),
                DispatchTable::new().method(DOUBLE, |_: &Doubler, _: &mut Invocation<'_>| {
                    thread::sleep(Duration::from_secs(5));
                    Ok(())
                }),
            )
            .unwrap();
        server.spawn_dispatcher().unwrap();
        let waiter = {
            let client = client.clone();
            thread::spawn(move || client.call(id, DOUBLE, Vec::new()))
        };
        thread::sleep(Duration::from_millis(50));
        server.close();
        let err = waiter.join().unwrap().unwrap_err();
        assert!(err.is_fatal(), "unexpected {err:?}");
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(client.request(id, DOUBLE, Vec::new(), MessageFlags::NONE).is_err());
    }

    #[test]
    fn requests_time_out_without_closing() {
        let config = VoodooConfig::default().with_request_timeout(Duration::from_millis(100));
        let (client, server) = Manager::pair(config, SuperRegistry::default()).unwrap();
        let id = server
            .register_instance(Arc::new(Doubler), doubler_table())
            .unwrap();
        let blocker = {
            let client = client.clone();
            thread::spawn(move || {
                let _token = client.inner.reader.lock();
                thread::sleep(Duration::from_millis(300));
            })
        };
        thread::sleep(Duration::from_millis(20));
        let err = client.call(id, DOUBLE, ArgWriter::new().long(1).finish()).unwrap_err();
        assert!(matches!(err, VoodooError::Fusion(FusionError::Timeout)));
        blocker.join().unwrap();
        assert_eq!(client.state(), ConnectionState::Established);
    }

    #[test]
    fn slow_handlers_time_out_the_reading_caller() {
        const NAP: MethodId = 4;
        let config = VoodooConfig::default().with_request_timeout(Duration::from_millis(200));
        let (client, server) = Manager::pair(config, SuperRegistry::default()).unwrap();
        let id = server
            .register_instance(
                Arc::new(Doubler),
                doubler_table().method(NAP, |_: &Doubler, call: &mut Invocation<'_>| {
                    let millis = call.args().uint()?;
                    thread::sleep(Duration::from_millis(u64::from(millis)));
                    call.reply().uint(millis);
                    Ok(())
                }),
            )
            .unwrap();
        server.spawn_dispatcher().unwrap();

        let started = Instant::now();
        let err = client.call(id, NAP, ArgWriter::new().uint(1500).finish()).unwrap_err();
        assert!(matches!(err, VoodooError::Fusion(FusionError::Timeout)));
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(client.state(), ConnectionState::Established);

        thread::sleep(Duration::from_millis(1500));
        let response = client
            .call(id, DOUBLE, ArgWriter::new().long(4).finish())
            .unwrap();
        assert_eq!(response.serial, 2);
        assert_eq!(response.args().long().unwrap(), 8);
    }

    #[test]
    fn version_mismatch_is_reported() {
        let (near, far) = Link::pair().unwrap();
        let impostor = thread::spawn(move || {
            far.write_packet(&encode_hello(HELLO_MAGIC, PROTOCOL_VERSION + 1), Compression::Never)
                .unwrap();
            far.read_packet(64)
        });
        let err = Manager::new(near, VoodooConfig::default(), SuperRegistry::default()).unwrap_err();
        assert!(matches!(
            err,
            VoodooError::Fusion(FusionError::VersionMismatch { .. })
        ));
        impostor.join().unwrap().unwrap();
    }
}
