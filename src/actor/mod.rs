//! Actor implementation - I/O orchestration layer of the discovery node.

pub(crate) mod config;
mod handle_packet;
mod handle_request;
mod handle_response;
mod info;
pub(crate) mod socket;
pub(crate) mod talk;

use std::net::SocketAddr;
use std::num::NonZeroUsize;

use bytes::Bytes;
use flume::Receiver;
use tracing::{debug, info, warn};

use crate::common::{
    Ed25519Identity, Id, Message, MessageError, MessageFactory, MessageKind, Node, PeerRecord,
    RecordError, RoutingTable,
};
use crate::core::lookup::{Lookup, LookupOutcome, LookupParams};
use crate::core::path_bucket::FindNodeQuery;
use crate::core::routing_maintenance::RoutingMaintenance;
use crate::packet::PacketError;
use crate::session::{Outbound, SessionError, SessionManager};

use config::{Config, ConfigError};
use socket::transport::real::UdpTransport;
use socket::DiscoverySocket;
use talk::{DefaultTalkHandler, TalkHandler};

pub use info::Info;
pub use socket::DEFAULT_REQUEST_TIMEOUT;

#[derive(Debug)]
/// Internal Actor called in the discovery thread loop, useful to drive a node manually.
pub struct Actor {
    local_record: PeerRecord,
    factory: MessageFactory,

    socket: DiscoverySocket,
    sessions: SessionManager,

    // Routing
    /// Closest nodes to this node
    routing_table: RoutingTable,
    /// Routing table maintenance (refresh/ping timing)
    maintenance: RoutingMaintenance,

    /// The single lookup in flight, if any.
    lookup: Option<(u64, Lookup)>,
    next_lookup_id: u64,
    lookup_params: LookupParams,

    talk_handler: Box<dyn TalkHandler>,
    /// Talk responses received since the last tick.
    talk_responses: Vec<(u32, Bytes)>,

    /// Our address as last reported by a responding node.
    observed_address: Option<SocketAddr>,
}

impl Actor {
    /// Creates a new Actor. Does not perform network I/O beyond binding;
    /// call [`Actor::tick`] to handle datagrams and run scheduled maintenance.
    pub fn new(mut config: Config) -> Result<Self, ActorError> {
        config.validate()?;

        let transport = match config.transport.take() {
            Some(transport) => transport,
            None => Box::new(UdpTransport::bind(SocketAddr::new(
                config.bind_address,
                config.port.unwrap_or(0),
            ))?),
        };
        let socket = DiscoverySocket::new(transport, config.request_timeout)?;

        let signer = config
            .signing_key
            .take()
            .unwrap_or_else(|| ed25519_dalek::SigningKey::from_bytes(&rand::random()));

        let advertised = config.external_address.or_else(|| {
            let local = socket.local_addr();
            (!local.ip().is_unspecified()).then_some(local)
        });

        let mut builder = PeerRecord::builder(signer.clone());
        if let Some(address) = advertised {
            builder = builder.address(address);
        }
        let local_record = builder.build()?;

        let session_capacity =
            NonZeroUsize::new(config.session_capacity).ok_or(ConfigError::ZeroSessionCapacity)?;

        let sessions = SessionManager::new(
            signer,
            Box::new(Ed25519Identity),
            session_capacity,
            config.failure_threshold,
            config.request_timeout,
        );

        let mut routing_table =
            RoutingTable::with_bucket_size(local_record.node_id(), config.bucket_size);

        for record in &config.bootstrap {
            match sessions.identity().verify(record) {
                Ok(()) => {
                    routing_table.add(Node::new(record.clone()));
                }
                Err(error) => warn!(?error, ?record, "Ignoring invalid bootstrap record"),
            }
        }

        info!(
            id = ?local_record.node_id(),
            address = ?socket.local_addr(),
            "Discovery node listening"
        );

        let mut actor = Actor {
            factory: MessageFactory::new(local_record.seq()),
            local_record,

            socket,
            sessions,

            routing_table,
            maintenance: RoutingMaintenance::new(config.refresh_interval, config.ping_interval),

            lookup: None,
            next_lookup_id: 0,
            lookup_params: config.lookup_params(),

            talk_handler: config
                .talk_handler
                .take()
                .unwrap_or_else(|| Box::new(DefaultTalkHandler)),
            talk_responses: Vec::new(),

            observed_address: None,
        };

        // Establish sessions with the bootstrap nodes and learn their latest records.
        for node in actor.routing_table.to_owned_nodes() {
            if let Err(error) = actor.send_message(node.record(), actor.factory.ping()) {
                debug!(?error, node = ?node.id(), "Failed to ping bootstrap node");
            }
        }

        Ok(actor)
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> &Id {
        self.routing_table.id()
    }

    /// Returns the address the socket is bound to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Returns the signed record this node advertises.
    pub fn local_record(&self) -> &PeerRecord {
        &self.local_record
    }

    /// Our address as reported in the last `Pong` we received.
    pub fn observed_address(&self) -> Option<SocketAddr> {
        self.observed_address
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn routing_table_mut(&mut self) -> &mut RoutingTable {
        &mut self.routing_table
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Returns a thread safe and lightweight summary of this node's information.
    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Handles at most one inbound datagram and runs due maintenance.
    ///
    /// Call periodically; delays degrade lookups and routing table quality.
    pub fn tick(&mut self) -> TickReport {
        self.periodic_node_maintenance();

        if let Some((bytes, from)) = self.socket.recv_from() {
            self.handle_inbound_datagram(&bytes, from);
        }

        TickReport {
            talk_responses: std::mem::take(&mut self.talk_responses),
        }
    }

    /// Send a request to the peer described by `record`, returning its request id.
    ///
    /// Without an established session this starts a handshake and the request
    /// is delivered once it completes; this never blocks.
    pub fn send_message(&mut self, record: &PeerRecord, kind: MessageKind) -> Result<u32, SendError> {
        let Some(endpoint) = record.udp_socket() else {
            warn!(peer = ?record.node_id(), kind = kind.name(), "Peer record has no address");
            return Err(SendError::MissingAddress);
        };

        let request_id = self.socket.track_request(endpoint);
        self.send(record, endpoint, Message::new(request_id, kind))?;

        Ok(request_id)
    }

    /// Start a lookup toward `target`, returning its id, deadline and the lanes' completion receivers.
    ///
    /// Fails while another lookup is in progress.
    pub fn start_lookup(&mut self, target: Id) -> Result<LookupStart, LookupError> {
        if let Some((_, lookup)) = &self.lookup {
            if lookup.is_in_progress() {
                return Err(LookupError::InProgress);
            }
        }

        if let Some((_, stale)) = self.lookup.take() {
            debug!(target = ?stale.target(), "Replacing a finished lookup");
        }

        let closest = self.routing_table.closest(&target);

        let (lookup, queries, receivers) =
            Lookup::start(*self.id(), target, closest, self.lookup_params);

        let id = self.next_lookup_id;
        self.next_lookup_id = self.next_lookup_id.wrapping_add(1);

        let start = LookupStart {
            id,
            deadline: lookup.deadline(),
            receivers,
        };

        self.lookup = Some((id, lookup));
        self.send_find_nodes(queries);

        Ok(start)
    }

    /// Finish the lookup `id`, merging its completed lanes.
    ///
    /// Returns `None` if that lookup was already finished or replaced.
    pub fn finish_lookup(&mut self, id: u64) -> Option<LookupOutcome> {
        match self.lookup.take() {
            Some((current, lookup)) if current == id => Some(lookup.finish()),
            other => {
                self.lookup = other;
                None
            }
        }
    }

    // === Private Methods ===

    /// Send a response to a request we received from `endpoint`.
    fn respond(&mut self, record: &PeerRecord, endpoint: SocketAddr, request_id: u32, kind: MessageKind) {
        if let Err(error) = self.send(record, endpoint, Message::new(request_id, kind)) {
            debug!(?error, to = ?endpoint, "Error sending response");
        }
    }

    /// Encrypt and send, or start a handshake leaving the message pending.
    fn send(
        &mut self,
        record: &PeerRecord,
        endpoint: SocketAddr,
        message: Message,
    ) -> Result<(), SendError> {
        let plaintext = message.to_bytes()?;
        let dest_id = record.node_id();

        let packet = match self.sessions.outbound(record, endpoint, plaintext)? {
            Outbound::Packet(packet) => packet,
            Outbound::Probe(packet) => {
                debug!(peer = ?dest_id, ?endpoint, "Starting handshake");
                packet
            }
            Outbound::Queued => return Ok(()),
        };

        self.socket.send(endpoint, &packet.encode(&dest_id)?)?;

        Ok(())
    }

    fn send_find_nodes(&mut self, queries: Vec<FindNodeQuery>) {
        let Some((_, lookup)) = &self.lookup else {
            return;
        };
        let target = *lookup.target();

        for query in queries {
            let kind = self
                .factory
                .find_node(&target, query.node.id(), query.vary_distance);

            if let Err(error) = self.send_message(query.node.record(), kind) {
                debug!(?error, lane = query.lane, node = ?query.node, "Failed to send FindNode");
            }
        }
    }

    /// Run periodic routing-table maintenance (purge, ping, refresh).
    fn periodic_node_maintenance(&mut self) {
        let decisions = self
            .maintenance
            .periodic_maintenance_decisions(&self.routing_table);

        for id in &decisions.nodes_to_purge {
            self.routing_table.remove(id);
        }

        for node in &decisions.nodes_to_ping {
            if let Err(error) = self.send_message(node.record(), self.factory.ping()) {
                debug!(?error, ?node, "Failed to ping node");
            }
        }

        if !decisions.nodes_to_purge.is_empty() || !decisions.nodes_to_ping.is_empty() {
            debug!(
                removed = decisions.nodes_to_purge.len(),
                pinged = decisions.nodes_to_ping.len(),
                "Node maintenance executed"
            );
        }

        if decisions.should_refresh {
            self.refresh();
        }
    }

    /// Ask the nodes closest to us for their neighbours, feeding the routing table.
    fn refresh(&mut self) {
        let id = *self.id();

        for node in self
            .routing_table
            .closest(&id)
            .into_iter()
            .take(self.lookup_params.alpha)
        {
            let kind = self.factory.find_node(&id, node.id(), false);
            if let Err(error) = self.send_message(node.record(), kind) {
                debug!(?error, ?node, "Failed to send refresh FindNode");
            }
        }
    }
}

/// Results from a single [`Actor::tick`] call.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Talk responses by the request id of their request.
    pub talk_responses: Vec<(u32, Bytes)>,
}

#[derive(Debug)]
/// A lookup that just started.
pub struct LookupStart {
    pub id: u64,
    pub deadline: std::time::Instant,
    /// One receiver per lane, signalled when the lane completes.
    pub receivers: Vec<Receiver<()>>,
}

#[derive(thiserror::Error, Debug)]
/// Errors starting an [Actor].
pub enum ActorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
/// Errors sending a message to a peer.
pub enum SendError {
    #[error("Peer record has no IP address or UDP port")]
    MissingAddress,

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("Another lookup is in progress")]
    InProgress,

    #[error(transparent)]
    DiscoveryWasShutdown(#[from] crate::DiscoveryWasShutdown),
}
