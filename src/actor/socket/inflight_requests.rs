use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct InflightRequest {
    pub to: SocketAddr,
    pub sent_at: Instant,
    /// `Nodes` chunks received so far for this request.
    pub chunks: u8,
}

impl InflightRequest {
    pub fn does_match(&self, from: &SocketAddr) -> bool {
        if self.to.port() != from.port() {
            return false;
        }

        if self.to.ip().is_unspecified() {
            return true;
        }

        self.to.ip() == from.ip()
    }
}

#[derive(Debug)]
pub struct InflightRequests {
    requests: HashMap<u32, InflightRequest>,
    timeout: Duration,
}

impl InflightRequests {
    pub fn new(timeout: Duration) -> Self {
        Self {
            requests: HashMap::new(),
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Add a new inflight request O(1) amortized
    pub fn add(&mut self, request_id: u32, to: SocketAddr) {
        self.requests.insert(
            request_id,
            InflightRequest {
                to,
                sent_at: Instant::now(),
                chunks: 0,
            },
        );
    }

    /// Check if a request_id is still inflight and not expired O(1)
    pub fn contains(&self, request_id: u32) -> bool {
        if let Some(request) = self.requests.get(&request_id) {
            return request.sent_at.elapsed() < self.timeout;
        }
        false
    }

    /// Accept one of `total` response parts for `request_id` if it came from the right address.
    ///
    /// The request stays inflight until its last part arrived.
    pub fn receive(&mut self, request_id: u32, from: &SocketAddr, total: u8) -> bool {
        let Some(request) = self.requests.get_mut(&request_id) else {
            return false;
        };

        // Drop immediately if expired; avoid accepting late responses
        if request.sent_at.elapsed() >= self.timeout {
            self.requests.remove(&request_id);
            return false;
        }

        if !request.does_match(from) {
            return false;
        }

        request.chunks = request.chunks.saturating_add(1);

        if request.chunks >= total {
            self.requests.remove(&request_id);
        }

        true
    }

    /// Cleanup expired requests based on timeout
    pub fn cleanup(&mut self) {
        let timeout = self.timeout;

        self.requests
            .retain(|_, request| request.sent_at.elapsed() < timeout);
    }
}
