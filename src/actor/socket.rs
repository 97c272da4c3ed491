//! Datagram socket layer correlating outgoing requests with their responses.

mod inflight_requests;
pub mod transport;

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::packet::{validate_size, MAX_PACKET_SIZE};

use inflight_requests::InflightRequests;
use transport::Transport;

/// Read buffer, larger than any valid packet so oversized ones are seen whole and rejected.
const MTU: usize = 2048;

/// Default request timeout before abandoning an inflight request to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds

/// Cleanup interval for expired inflight requests to avoid overhead on every recv
const INFLIGHT_CLEANUP_INTERVAL: Duration = Duration::from_millis(200);

/// A transport wrapper that validates inbound datagrams and tracks inflight request ids.
#[derive(Debug)]
pub struct DiscoverySocket {
    next_request_id: u32,
    transport: Box<dyn Transport>,
    inflight_requests: InflightRequests,
    last_cleanup: Instant,
    local_addr: SocketAddr,
}

impl DiscoverySocket {
    pub fn new(transport: Box<dyn Transport>, request_timeout: Duration) -> std::io::Result<Self> {
        let local_addr = transport.local_addr()?;

        Ok(Self {
            next_request_id: rand::random(),
            transport,
            inflight_requests: InflightRequests::new(request_timeout),
            last_cleanup: Instant::now(),
            local_addr,
        })
    }

    // === Getters ===

    /// Returns the address the socket is bound to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    // === Public Methods ===

    /// Returns true if this request_id is still inflight
    pub fn inflight(&self, request_id: u32) -> bool {
        self.inflight_requests.contains(request_id)
    }

    /// Allocate a request id and track it as inflight toward `to`.
    pub fn track_request(&mut self, to: SocketAddr) -> u32 {
        let request_id = self.request_id();
        self.inflight_requests.add(request_id, to);

        request_id
    }

    /// Whether a response part matches an inflight request sent to `from`.
    pub fn is_expected_response(&mut self, request_id: u32, from: &SocketAddr, total: u8) -> bool {
        if self.inflight_requests.receive(request_id, from, total) {
            true
        } else {
            trace!(
                context = "socket_validation",
                request_id,
                ?from,
                "Unexpected response id or wrong address"
            );
            false
        }
    }

    /// Send an encoded packet.
    pub fn send(&mut self, to: SocketAddr, bytes: &[u8]) -> std::io::Result<()> {
        self.transport.send_to(bytes, to)?;
        trace!(context = "socket_packet_sending", ?to, size = bytes.len());

        Ok(())
    }

    /// Receives a single datagram within the packet size limits.
    pub fn recv_from(&mut self) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = [0_u8; MTU];

        let now = Instant::now();
        if now.duration_since(self.last_cleanup) > INFLIGHT_CLEANUP_INTERVAL {
            self.last_cleanup = now;
            self.inflight_requests.cleanup();
        }

        match self.transport.recv_from(&mut buf) {
            Ok((amt, from)) => {
                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!(
                        context = "socket_validation",
                        message = "Datagram from port 0"
                    );
                    return None;
                }

                if let Err(error) = validate_size(bytes) {
                    trace!(
                        context = "socket_validation",
                        ?error,
                        ?from,
                        max = MAX_PACKET_SIZE,
                        "Dropping datagram"
                    );
                    return None;
                }

                Some((bytes.to_vec(), from))
            }
            Err(error) => match error.kind() {
                ErrorKind::WouldBlock | ErrorKind::TimedOut => None,
                _ => {
                    warn!("IO error {error}");
                    None
                }
            },
        }
    }

    // === Private Methods ===

    /// Increments self.next_request_id and returns the previous value.
    fn request_id(&mut self) -> u32 {
        // Ids are not reused before wrapping around, far longer than the request timeout.
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        request_id
    }
}

#[cfg(test)]
mod tests {
    use super::transport::memory::MemoryTransport;
    use super::*;

    fn socket() -> DiscoverySocket {
        DiscoverySocket::new(
            Box::new(MemoryTransport::bind().unwrap()),
            DEFAULT_REQUEST_TIMEOUT,
        )
        .unwrap()
    }

    #[test]
    fn request_id() {
        let mut socket = socket();
        socket.next_request_id = 0;

        assert_eq!(socket.request_id(), 0);
        assert_eq!(socket.request_id(), 1);
        assert_eq!(socket.request_id(), 2);

        socket.next_request_id = u32::MAX;

        assert_eq!(socket.request_id(), 4294967295);
        assert_eq!(socket.request_id(), 0);
    }

    #[test]
    fn recv_valid_datagram() {
        let mut a = socket();
        let mut b = socket();

        a.send(b.local_addr(), &[0_u8; 100]).unwrap();

        let (bytes, from) = b.recv_from().unwrap();
        assert_eq!(bytes.len(), 100);
        assert_eq!(from, a.local_addr());
        assert!(b.recv_from().is_none());
    }

    #[test]
    fn drop_datagrams_outside_size_limits() {
        let mut a = socket();
        let mut b = socket();

        a.send(b.local_addr(), &[0_u8; 59]).unwrap();
        a.send(b.local_addr(), &[0_u8; 1281]).unwrap();
        a.send(b.local_addr(), &[0_u8; 60]).unwrap();
        a.send(b.local_addr(), &[0_u8; 1280]).unwrap();

        assert!(b.recv_from().is_none());
        assert!(b.recv_from().is_none());
        assert_eq!(b.recv_from().unwrap().0.len(), 60);
        assert_eq!(b.recv_from().unwrap().0.len(), 1280);
    }

    #[test]
    fn ignore_response_from_wrong_address() {
        let mut socket = socket();
        let to = SocketAddr::from(([127, 0, 0, 1], 4000));

        let request_id = socket.track_request(to);

        assert!(!socket.is_expected_response(request_id, &SocketAddr::from(([127, 0, 0, 1], 4001)), 1));
        assert!(socket.inflight(request_id));
        assert!(socket.is_expected_response(request_id, &to, 1));
        assert!(!socket.inflight(request_id));
    }
}
