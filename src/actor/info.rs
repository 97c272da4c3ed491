use std::net::SocketAddr;

use crate::common::{Id, PeerRecord};

use super::Actor;

/// Information about this discovery node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddr,
    local_record: PeerRecord,
    observed_address: Option<SocketAddr>,
    routing_table_size: usize,
    sessions: usize,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Local UDP socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    /// The signed record this node advertises.
    pub fn local_record(&self) -> &PeerRecord {
        &self.local_record
    }
    /// Our address as reported by the last responding peer.
    pub fn observed_address(&self) -> Option<SocketAddr> {
        self.observed_address
    }
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }
    /// Number of cached sessions, established or not.
    pub fn sessions(&self) -> usize {
        self.sessions
    }
}

impl From<&Actor> for Info {
    fn from(actor: &Actor) -> Self {
        Self {
            id: *actor.id(),
            local_addr: actor.local_addr(),
            local_record: actor.local_record().clone(),
            observed_address: actor.observed_address(),
            routing_table_size: actor.routing_table().size(),
            sessions: actor.sessions().len(),
        }
    }
}
