//! Byte transports a manager runs over: TCP, Unix sockets or a pair of
//! pipes. Reads and writes have separate locks so one thread can block in
//! a read while others send.

use crate::packet::{self, Compression, PacketBuffer};
use crate::VoodooResult;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

enum Control {
    Tcp(TcpStream),
    Unix(UnixStream),
    Pipe,
}

struct Inbound {
    stream: Box<dyn Read + Send>,
    partial: PacketBuffer,
}

impl Inbound {
    fn new(stream: impl Read + Send + 'static) -> Mutex<Inbound> {
        Mutex::new(Inbound {
            stream: Box::new(stream),
            partial: PacketBuffer::default(),
        })
    }
}

pub struct Link {
    reader: Mutex<Inbound>,
    writer: Mutex<Box<dyn Write + Send>>,
    control: Control,
    peer: String,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("peer", &self.peer).finish()
    }
}

impl Link {
    pub fn tcp(stream: TcpStream) -> io::Result<Link> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "tcp".into());
        Ok(Link {
            reader: Inbound::new(stream.try_clone()?),
            writer: Mutex::new(Box::new(io::BufWriter::new(stream.try_clone()?))),
            control: Control::Tcp(stream),
            peer,
        })
    }

    pub fn unix(stream: UnixStream) -> io::Result<Link> {
        let peer = stream
            .peer_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|path| path.display().to_string()))
            .unwrap_or_else(|| "unix".into());
        Ok(Link {
            reader: Inbound::new(stream.try_clone()?),
            writer: Mutex::new(Box::new(io::BufWriter::new(stream.try_clone()?))),
            control: Control::Unix(stream),
            peer,
        })
    }

    /// Link over an arbitrary reader/writer pair, e.g. a child's stdio.
    /// `shutdown` cannot interrupt a blocked read on such a link.
    pub fn pipe(reader: impl Read + Send + 'static, writer: impl Write + Send + 'static) -> Link {
        Link {
            reader: Inbound::new(reader),
            writer: Mutex::new(Box::new(io::BufWriter::new(writer))),
            control: Control::Pipe,
            peer: "pipe".into(),
        }
    }

    pub fn connect_tcp(addr: impl ToSocketAddrs) -> io::Result<Link> {
        Link::tcp(TcpStream::connect(addr)?)
    }

    pub fn connect_unix(path: impl AsRef<Path>) -> io::Result<Link> {
        Link::unix(UnixStream::connect(path)?)
    }

    /// Two connected links in this process.
    pub fn pair() -> io::Result<(Link, Link)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Link::unix(a)?, Link::unix(b)?))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match &self.control {
            Control::Tcp(stream) => stream.set_read_timeout(timeout),
            Control::Unix(stream) => stream.set_read_timeout(timeout),
            Control::Pipe => Ok(()),
        }
    }

    /// Blocks for the next packet and returns its (decompressed) payload.
    /// With a read timeout set, running out of time fails with `TimedOut`.
    pub fn read_packet(&self, max: u32) -> VoodooResult<Vec<u8>> {
        let mut inbound = self.reader.lock();
        let Inbound { stream, partial } = &mut *inbound;
        partial
            .read_from(stream, max)?
            .ok_or_else(|| io::Error::from(io::ErrorKind::TimedOut).into())
    }

    /// Like [`Link::read_packet`] but gives up after `timeout`, returning
    /// `None`. Bytes of a packet that only partly arrived are kept for the
    /// next read. Pipe links cannot time out and block instead.
    pub fn read_packet_within(&self, max: u32, timeout: Duration) -> VoodooResult<Option<Vec<u8>>> {
        let mut inbound = self.reader.lock();
        let Inbound { stream, partial } = &mut *inbound;
        self.set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))?;
        let read = partial.read_from(stream, max);
        self.set_read_timeout(None)?;
        if matches!(read, Ok(None)) {
            tracing::trace!(
                peer = %self.peer,
                partial = partial.is_partial(),
                "packet read timed out"
            );
        }
        read
    }

    pub fn write_packet(&self, payload: &[u8], compression: Compression) -> VoodooResult<()> {
        let mut writer = self.writer.lock();
        packet::write_to(&mut *writer, payload, compression)
    }

    /// Closes both directions, waking a reader blocked on a socket.
    pub fn shutdown(&self) -> io::Result<()> {
        let result = match &self.control {
            Control::Tcp(stream) => stream.shutdown(Shutdown::Both),
            Control::Unix(stream) => stream.shutdown(Shutdown::Both),
            Control::Pipe => Ok(()),
        };
        match result {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VoodooError;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn pair_carries_packets_both_ways() {
        let (a, b) = Link::pair().unwrap();
        a.write_packet(b"ping", Compression::Never).unwrap();
        assert_eq!(b.read_packet(1024).unwrap(), b"ping");
        b.write_packet(&[3u8; 512], Compression::Above(64)).unwrap();
        assert_eq!(a.read_packet(1024).unwrap(), vec![3u8; 512]);
    }

    #[test]
    fn shutdown_wakes_a_blocked_reader() {
        let (a, _b) = Link::pair().unwrap();
        let a = std::sync::Arc::new(a);
        let reader = {
            let a = a.clone();
            thread::spawn(move || a.read_packet(1024))
        };
        thread::sleep(Duration::from_millis(20));
        a.shutdown().unwrap();
        assert!(matches!(reader.join().unwrap(), Err(VoodooError::Closed)));
    }

    #[test]
    fn bounded_reads_time_out_and_resume() {
        let (a, b) = Link::pair().unwrap();
        let started = std::time::Instant::now();
        assert_eq!(a.read_packet_within(1024, Duration::from_millis(50)).unwrap(), None);
        assert!(started.elapsed() >= Duration::from_millis(40));

        let framed = packet::encode(b"split in two", Compression::Never).unwrap();
        let b = std::sync::Arc::new(b);
        let writer = {
            let b = b.clone();
            thread::spawn(move || {
                let mut raw = b.writer.lock();
                raw.write_all(&framed[..10]).unwrap();
                raw.flush().unwrap();
                thread::sleep(Duration::from_millis(150));
                raw.write_all(&framed[10..]).unwrap();
                raw.flush().unwrap();
            })
        };
        assert_eq!(a.read_packet_within(1024, Duration::from_millis(50)).unwrap(), None);
        writer.join().unwrap();
        assert_eq!(
            a.read_packet_within(1024, Duration::from_secs(5)).unwrap().unwrap(),
            b"split in two"
        );
        b.write_packet(b"after", Compression::Never).unwrap();
        assert_eq!(a.read_packet(1024).unwrap(), b"after");
    }

    #[test]
    fn tcp_links_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let link = Link::tcp(stream).unwrap();
            let payload = link.read_packet(1024).unwrap();
            link.write_packet(&payload, Compression::Never).unwrap();
        });
        let client = Link::connect_tcp(addr).unwrap();
        client.write_packet(b"echo", Compression::Never).unwrap();
        assert_eq!(client.read_packet(1024).unwrap(), b"echo");
        server.join().unwrap();
    }

    #[test]
    fn pipe_links_wrap_plain_io() {
        let mut sink = Vec::new();
        packet::write_to(&mut sink, b"hello", Compression::Never).unwrap();
        let link = Link::pipe(io::Cursor::new(sink), io::sink());
        assert_eq!(link.read_packet(64).unwrap(), b"hello");
        assert!(matches!(link.read_packet(64), Err(VoodooError::Closed)));
        link.write_packet(b"dropped", Compression::Never).unwrap();
    }
}
