//! Datagram transports the socket reads from and writes to.

use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;

/// The raw datagram transport under [super::DiscoverySocket].
pub trait Transport: Debug + Send {
    /// Returns `WouldBlock` or `TimedOut` when nothing arrived.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

pub mod real {
    use std::time::Duration;

    use super::*;

    /// How long a read may block the actor thread.
    pub const READ_TIMEOUT: Duration = Duration::from_millis(10);

    #[derive(Debug)]
    pub struct UdpTransport(std::net::UdpSocket);

    impl UdpTransport {
        pub fn bind(addr: SocketAddr) -> io::Result<Self> {
            let socket = std::net::UdpSocket::bind(addr)?;
            socket.set_read_timeout(Some(READ_TIMEOUT))?;

            Ok(Self(socket))
        }
    }

    impl Transport for UdpTransport {
        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.0.recv_from(buf)
        }
        fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
            self.0.send_to(buf, addr)
        }
        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.0.local_addr()
        }
    }
}

/// In-process transport, every bound address shares one registry of queues.
pub mod memory {
    use std::collections::{HashMap, VecDeque};
    use std::net::Ipv4Addr;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    use rand::Rng;

    use super::*;

    type Datagram = (Box<[u8]>, SocketAddr);

    static QUEUES: OnceLock<Mutex<HashMap<SocketAddr, VecDeque<Datagram>>>> = OnceLock::new();

    fn queues() -> io::Result<MutexGuard<'static, HashMap<SocketAddr, VecDeque<Datagram>>>> {
        QUEUES
            .get_or_init(|| Mutex::new(HashMap::new()))
            .lock()
            .map_err(|_| io::Error::other("memory transport registry poisoned"))
    }

    #[derive(Debug)]
    pub struct MemoryTransport(SocketAddr);

    impl MemoryTransport {
        /// Bind a fresh loopback address.
        pub fn bind() -> io::Result<Self> {
            let mut queues = queues()?;
            let mut rng = rand::thread_rng();

            loop {
                let local_addr =
                    SocketAddr::from((Ipv4Addr::LOCALHOST, rng.gen_range(1024..=u16::MAX)));

                if let std::collections::hash_map::Entry::Vacant(entry) = queues.entry(local_addr)
                {
                    entry.insert(VecDeque::new());
                    return Ok(Self(local_addr));
                }
            }
        }
    }

    impl Drop for MemoryTransport {
        fn drop(&mut self) {
            if let Ok(mut queues) = queues() {
                queues.remove(&self.0);
            }
        }
    }

    impl Transport for MemoryTransport {
        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            let mut queues = queues()?;

            let datagram = queues
                .get_mut(&self.0)
                .and_then(|queue| queue.pop_front());

            match datagram {
                Some((bytes, from)) => {
                    let size = bytes.len().min(buf.len());
                    buf[..size].copy_from_slice(&bytes[..size]);

                    Ok((size, from))
                }
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }

        fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
            let mut queues = queues()?;

            if let Some(queue) = queues.get_mut(&addr) {
                queue.push_back((buf.into(), self.0));
            }
            // Otherwise the datagram is lost, as it would be over UDP.

            Ok(buf.len())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.0)
        }
    }

}
