//! Accept loop handing each connection its own thread. The hello exchange
//! runs on that thread, so a silent client never stalls the accept loop.

use crate::instance::SuperRegistry;
use crate::link::Link;
use crate::manager::Manager;
use crate::message::InstanceId;
use crate::{VoodooConfig, VoodooResult};
use fusion::{Cancel, FusionResult};
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl Listener {
    fn accept(&self) -> io::Result<Link> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept()?;
                stream.set_nonblocking(false)?;
                Link::tcp(stream)
            }
            Listener::Unix(listener, _) => {
                let (stream, _) = listener.accept()?;
                stream.set_nonblocking(false)?;
                Link::unix(stream)
            }
        }
    }
}

enum Slot {
    Handshaking,
    Ready(Manager),
    Closed,
}

/// One accepted connection: its thread and, once the hello exchange is
/// done, its manager.
struct Connection {
    peer: String,
    slot: Arc<Mutex<Slot>>,
    thread: JoinHandle<()>,
}

impl Connection {
    fn spawn(link: Link, config: VoodooConfig, supers: SuperRegistry) -> io::Result<Connection> {
        let peer = link.peer().to_owned();
        let slot = Arc::new(Mutex::new(Slot::Handshaking));
        let thread = {
            let slot = slot.clone();
            let peer = peer.clone();
            thread::Builder::new()
                .name("voodoo-conn".into())
                .spawn(move || serve_connection(link, config, supers, &slot, &peer))?
        };
        Ok(Connection { peer, slot, thread })
    }

    /// Closes the manager, or makes a handshake still in flight close it.
    fn close(&self) {
        if let Slot::Ready(manager) = std::mem::replace(&mut *self.slot.lock(), Slot::Closed) {
            manager.close();
        }
    }
}

fn serve_connection(
    link: Link,
    config: VoodooConfig,
    supers: SuperRegistry,
    slot: &Mutex<Slot>,
    peer: &str,
) {
    let manager = match Manager::new(link, config, supers) {
        Ok(manager) => manager,
        Err(err) => {
            tracing::warn!(%err, peer, "rejected voodoo client");
            return;
        }
    };
    {
        let mut slot = slot.lock();
        if matches!(*slot, Slot::Closed) {
            manager.close();
            return;
        }
        *slot = Slot::Ready(manager.clone());
    }
    tracing::debug!(peer, "voodoo client connected");
    if let Err(err) = manager.run() {
        tracing::warn!(%err, peer, "voodoo connection stopped");
    }
}

pub struct Server {
    listener: Listener,
    config: VoodooConfig,
    supers: SuperRegistry,
    cancel: Cancel,
}

impl Server {
    pub fn bind_tcp(addr: impl ToSocketAddrs, config: VoodooConfig) -> VoodooResult<Server> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        tracing::info!(addr = ?listener.local_addr().ok(), "voodoo server listening");
        Ok(Server::with_listener(Listener::Tcp(listener), config))
    }

    /// Binds a Unix socket at `path`, replacing a stale socket file.
    pub fn bind_unix(path: impl AsRef<Path>, config: VoodooConfig) -> VoodooResult<Server> {
        let path = path.as_ref().to_path_buf();
        match std::fs::remove_file(&path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
            _ => {}
        }
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        tracing::info!(path = %path.display(), "voodoo server listening");
        Ok(Server::with_listener(Listener::Unix(listener, path), config))
    }

    fn with_listener(listener: Listener, config: VoodooConfig) -> Server {
        Server {
            listener,
            config,
            supers: SuperRegistry::new(),
            cancel: Cancel::new(),
        }
    }

    /// The bound TCP address; `None` for Unix sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix(..) => None,
        }
    }

    /// Names a root instance every connection can look up.
    pub fn register_super(
        &self,
        name: &str,
        factory: impl Fn(&Manager) -> FusionResult<InstanceId> + Send + Sync + 'static,
    ) -> FusionResult<()> {
        self.supers.register(name, factory)
    }

    /// Stops [`Server::serve`] at its next poll.
    pub fn cancel(&self) -> Cancel {
        self.cancel.clone()
    }

    /// Accepts until cancelled, then closes every connection and joins its
    /// thread.
    pub fn serve(&self) -> VoodooResult<()> {
        let mut connections: Vec<Connection> = Vec::new();
        while !self.cancel.is_cancelled() {
            match self.listener.accept() {
                Ok(link) => {
                    match Connection::spawn(link, self.config.clone(), self.supers.clone()) {
                        Ok(connection) => connections.push(connection),
                        Err(err) => {
                            self.shut_down(connections);
                            return Err(err.into());
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.config.accept_poll);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    tracing::error!(%err, "voodoo accept failed");
                    self.shut_down(connections);
                    return Err(err.into());
                }
            }
            connections.retain(|connection| !connection.thread.is_finished());
        }
        self.shut_down(connections);
        Ok(())
    }

    fn shut_down(&self, connections: Vec<Connection>) {
        for connection in &connections {
            connection.close();
        }
        for connection in connections {
            if connection.thread.join().is_err() {
                tracing::warn!(peer = %connection.peer, "voodoo connection thread panicked");
            }
        }
        tracing::info!("voodoo server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Listener::Unix(_, path) = &self.listener {
            if let Err(err) = std::fs::remove_file(path) {
                tracing::debug!(%err, "could not remove socket file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArgWriter, DispatchTable, Invocation};
    use fusion::FusionError;
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    struct Greeter;

    fn greeter(manager: &Manager) -> FusionResult<InstanceId> {
        manager
            .register_instance(
                Arc::new(Greeter),
                DispatchTable::new().method(1, |_: &Greeter, call: &mut Invocation<'_>| {
                    let name = call.args().string()?.to_owned();
                    call.reply().string(&format!("hello {name}"));
                    Ok(())
                }),
            )
            .map_err(FusionError::from)
    }

    fn start(server: Server) -> (Arc<Server>, JoinHandle<VoodooResult<()>>) {
        let server = Arc::new(server);
        let serving = {
            let server = server.clone();
            thread::spawn(move || server.serve())
        };
        (server, serving)
    }

    #[test]
    fn tcp_clients_get_independent_connections() {
        let server = Server::bind_tcp("127.0.0.1:0", VoodooConfig::default()).unwrap();
        server.register_super("greeter", greeter).unwrap();
        let addr = server.local_addr().unwrap();
        let (server, serving) = start(server);

        let clients: Vec<_> = (0..3)
            .map(|_| Manager::connect_tcp(addr, VoodooConfig::default()).unwrap())
            .collect();
        for (i, client) in clients.iter().enumerate() {
            let id = client.lookup_super("greeter").unwrap();
            let args = ArgWriter::new().string(&format!("client {i}")).finish();
            let response = client.call(id, 1, args).unwrap();
            assert_eq!(response.args().string().unwrap(), format!("hello client {i}"));
        }

        server.cancel().cancel();
        serving.join().unwrap().unwrap();
        for client in &clients {
            assert!(client.call(2, 1, Vec::new()).is_err());
        }
    }

    #[test]
    fn silent_clients_do_not_hold_up_others() {
        let config = VoodooConfig {
            handshake_timeout: Duration::from_secs(3),
            ..VoodooConfig::default()
        };
        let server = Server::bind_tcp("127.0.0.1:0", config.clone()).unwrap();
        server.register_super("greeter", greeter).unwrap();
        let addr = server.local_addr().unwrap();
        let (server, serving) = start(server);

        let _silent = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        let client = Manager::connect_tcp(addr, config).unwrap();
        let id = client.lookup_super("greeter").unwrap();
        let response = client.call(id, 1, ArgWriter::new().string("eager").finish()).unwrap();
        assert_eq!(response.args().string().unwrap(), "hello eager");
        assert!(started.elapsed() < Duration::from_secs(1));

        server.cancel().cancel();
        serving.join().unwrap().unwrap();
    }

    #[test]
    fn unix_socket_is_served_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voodoo.sock");
        let server = Server::bind_unix(&path, VoodooConfig::default()).unwrap();
        server.register_super("greeter", greeter).unwrap();
        assert!(server.local_addr().is_none());
        let (server, serving) = start(server);

        let client = Manager::connect_unix(&path, VoodooConfig::default()).unwrap();
        let id = client.lookup_super("greeter").unwrap();
        let response = client.call(id, 1, ArgWriter::new().string("unix").finish()).unwrap();
        assert_eq!(response.args().string().unwrap(), "hello unix");
        client.close();

        server.cancel().cancel();
        serving.join().unwrap().unwrap();
        drop(server);
        assert!(!path.exists());
    }
}
