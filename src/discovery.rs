//! Discovery node.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info};

use crate::actor::config::Config;
use crate::actor::socket::transport::Transport;
use crate::actor::talk::TalkHandler;
use crate::actor::{Actor, ActorError, Info, LookupError, LookupStart, SendError};
use crate::common::{Id, PeerRecord};
use crate::core::lookup::LookupOutcome;

#[derive(Debug, Default)]
/// Discovery node builder
pub struct DiscoveryBuilder(Config);

impl DiscoveryBuilder {
    /// Key signing the local record. Defaults to a random key.
    pub fn signing_key(&mut self, signing_key: SigningKey) -> &mut Self {
        self.0.signing_key = Some(signing_key);

        self
    }

    /// Address to bind the UDP socket to.
    pub fn bind_address(&mut self, bind_address: IpAddr) -> &mut Self {
        self.0.bind_address = bind_address;

        self
    }

    /// Explicit port to listen on.
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.0.port = Some(port);

        self
    }

    /// Address advertised in the local record.
    pub fn external_address(&mut self, external_address: SocketAddr) -> &mut Self {
        self.0.external_address = Some(external_address);

        self
    }

    /// Records of nodes to seed the routing table with.
    pub fn bootstrap(&mut self, bootstrap: &[PeerRecord]) -> &mut Self {
        self.0.bootstrap = bootstrap.to_vec();

        self
    }

    /// Add more bootstrap records alongside the ones already set.
    pub fn extra_bootstrap(&mut self, extra_bootstrap: &[PeerRecord]) -> &mut Self {
        self.0.bootstrap.extend_from_slice(extra_bootstrap);

        self
    }

    /// Set the request timeout, also bounding pending handshakes.
    pub fn request_timeout(&mut self, request_timeout: Duration) -> &mut Self {
        self.0.request_timeout = request_timeout;

        self
    }

    /// Peers queried concurrently by each lookup lane.
    pub fn alpha(&mut self, alpha: usize) -> &mut Self {
        self.0.alpha = alpha;

        self
    }

    /// Number of disjoint lanes a lookup runs.
    pub fn lookup_parallelism(&mut self, lookup_parallelism: usize) -> &mut Self {
        self.0.lookup_parallelism = lookup_parallelism;

        self
    }

    /// Nodes per bucket, also the size of lookup results.
    pub fn bucket_size(&mut self, bucket_size: usize) -> &mut Self {
        self.0.bucket_size = bucket_size;

        self
    }

    /// Deadline shared by all the lanes of a lookup.
    pub fn lookup_timeout(&mut self, lookup_timeout: Duration) -> &mut Self {
        self.0.lookup_timeout = lookup_timeout;

        self
    }

    /// Maximum number of cached sessions.
    pub fn session_capacity(&mut self, session_capacity: usize) -> &mut Self {
        self.0.session_capacity = session_capacity;

        self
    }

    /// Consecutive decryption failures before a session is demoted.
    pub fn failure_threshold(&mut self, failure_threshold: u32) -> &mut Self {
        self.0.failure_threshold = failure_threshold;

        self
    }

    /// Handler of inbound talk requests.
    pub fn talk_handler(&mut self, talk_handler: Box<dyn TalkHandler>) -> &mut Self {
        self.0.talk_handler = Some(talk_handler);

        self
    }

    /// Use a custom datagram transport instead of binding a UDP socket.
    pub fn transport(&mut self, transport: Box<dyn Transport>) -> &mut Self {
        self.0.transport = Some(transport);

        self
    }

    /// Create a discovery node and start its actor thread.
    pub fn build(&mut self) -> Result<Discovery, ActorError> {
        Discovery::new(std::mem::take(&mut self.0))
    }
}

#[derive(Debug, Clone)]
/// Discovery node, a handle to the actor thread.
pub struct Discovery {
    sender: Sender<ActorMessage>,
    request_timeout: Duration,
}

impl Discovery {
    /// Create a new discovery node with the default configurations.
    pub fn client() -> Result<Self, ActorError> {
        Discovery::builder().build()
    }

    /// Returns a builder to edit configurations before creating a node.
    pub fn builder() -> DiscoveryBuilder {
        DiscoveryBuilder::default()
    }

    /// Create a new discovery node.
    ///
    /// The socket is bound before this returns, so binding errors surface here.
    pub fn new(config: Config) -> Result<Self, ActorError> {
        let request_timeout = config.request_timeout;

        let actor = Actor::new(config)?;
        let (sender, receiver) = flume::unbounded();

        thread::Builder::new()
            .name("kadwire".to_string())
            .spawn(move || run(actor, receiver))?;

        Ok(Discovery {
            sender,
            request_timeout,
        })
    }

    // === Getters ===

    /// Information about the running node.
    pub fn info(&self) -> Result<Info, DiscoveryWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Info(sender))
            .map_err(|_| DiscoveryWasShutdown)?;

        receiver.recv().map_err(|_| DiscoveryWasShutdown)
    }

    /// The signed record this node advertises, to hand to other nodes as bootstrap.
    pub fn local_record(&self) -> Result<PeerRecord, DiscoveryWasShutdown> {
        Ok(self.info()?.local_record().clone())
    }

    // === Public Methods ===

    /// Add a verified record to the routing table, returns `false` if rejected.
    pub fn add_node(&self, record: PeerRecord) -> Result<bool, DiscoveryWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::AddNode(record, sender))
            .map_err(|_| DiscoveryWasShutdown)?;

        receiver.recv().map_err(|_| DiscoveryWasShutdown)
    }

    /// Start a lookup toward `target` without waiting for it.
    ///
    /// Only one lookup runs at a time; starting another while one is in progress
    /// fails with [LookupError::InProgress].
    pub fn start_lookup(&self, target: Id) -> Result<LookupHandle, LookupError> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::StartLookup(target, sender))
            .map_err(|_| DiscoveryWasShutdown)?;

        let start = receiver.recv().map_err(|_| DiscoveryWasShutdown)??;

        Ok(LookupHandle {
            start,
            sender: self.sender.clone(),
        })
    }

    /// Find the closest nodes to `target`, blocking until the lookup finishes.
    pub fn find_node(&self, target: Id) -> Result<Vec<PeerRecord>, LookupError> {
        Ok(self.start_lookup(target)?.wait()?.records)
    }

    /// Send a talk request and wait for the response, at most the request timeout.
    pub fn talk_request(
        &self,
        record: &PeerRecord,
        protocol: impl Into<Bytes>,
        request: impl Into<Bytes>,
    ) -> Result<Bytes, TalkError> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Talk {
                record: record.clone(),
                protocol: protocol.into(),
                request: request.into(),
                sender,
            })
            .map_err(|_| DiscoveryWasShutdown)?;

        // The handshake, if needed, counts toward the same deadline.
        match receiver.recv_timeout(self.request_timeout * 2) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(TalkError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(DiscoveryWasShutdown.into()),
        }
    }

    /// Stop the actor thread, every clone of this handle stops working.
    pub fn shutdown(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown);
    }
}

#[derive(Debug)]
/// A lookup in flight, see [Discovery::start_lookup].
pub struct LookupHandle {
    start: LookupStart,
    sender: Sender<ActorMessage>,
}

impl LookupHandle {
    /// Number of lanes the lookup runs.
    pub fn lanes(&self) -> usize {
        self.start.receivers.len()
    }

    /// Wait for every lane to complete or the lookup deadline, then merge the completed lanes.
    pub fn wait(self) -> Result<LookupOutcome, DiscoveryWasShutdown> {
        let lanes = self.lanes();

        for receiver in &self.start.receivers {
            // A disconnected receiver means the lookup was finished or replaced.
            let _ = receiver.recv_deadline(self.start.deadline);
        }

        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::FinishLookup(self.start.id, sender))
            .map_err(|_| DiscoveryWasShutdown)?;

        let outcome = receiver.recv().map_err(|_| DiscoveryWasShutdown)?;

        Ok(outcome.unwrap_or(LookupOutcome {
            records: vec![],
            completed_lanes: 0,
            timed_out_lanes: lanes,
        }))
    }
}

fn run(mut actor: Actor, receiver: Receiver<ActorMessage>) {
    let mut talk_senders: HashMap<u32, Sender<Result<Bytes, TalkError>>> = HashMap::new();

    loop {
        match receiver.try_recv() {
            Ok(actor_message) => match actor_message {
                ActorMessage::Shutdown => {
                    info!("Discovery node shutting down");
                    break;
                }
                ActorMessage::Info(sender) => {
                    let _ = sender.send(actor.info());
                }
                ActorMessage::AddNode(record, sender) => {
                    let added = actor.sessions().identity().verify(&record).is_ok()
                        && actor.routing_table_mut().add(record.into());

                    let _ = sender.send(added);
                }
                ActorMessage::StartLookup(target, sender) => {
                    let _ = sender.send(actor.start_lookup(target));
                }
                ActorMessage::FinishLookup(id, sender) => {
                    let _ = sender.send(actor.finish_lookup(id));
                }
                ActorMessage::Talk {
                    record,
                    protocol,
                    request,
                    sender,
                } => {
                    let kind = crate::common::MessageKind::TalkRequest { protocol, request };

                    match actor.send_message(&record, kind) {
                        Ok(request_id) => {
                            talk_senders.insert(request_id, sender);
                        }
                        Err(error) => {
                            let _ = sender.send(Err(error.into()));
                        }
                    }
                }
            },
            Err(TryRecvError::Disconnected) => {
                // Every handle was dropped, kill this thread.
                debug!("kadwire::Discovery's actor thread was shutdown after Drop.");
                break;
            }
            Err(TryRecvError::Empty) => {
                // No op
            }
        }

        let report = actor.tick();

        for (request_id, response) in report.talk_responses {
            if let Some(sender) = talk_senders.remove(&request_id) {
                let _ = sender.send(Ok(response));
            }
        }

        talk_senders.retain(|_, sender| !sender.is_disconnected());
    }
}

#[derive(Debug)]
enum ActorMessage {
    Info(Sender<Info>),
    AddNode(PeerRecord, Sender<bool>),
    StartLookup(Id, Sender<Result<LookupStart, LookupError>>),
    FinishLookup(u64, Sender<Option<LookupOutcome>>),
    Talk {
        record: PeerRecord,
        protocol: Bytes,
        request: Bytes,
        sender: Sender<Result<Bytes, TalkError>>,
    },
    Shutdown,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Discovery node was shutdown")]
/// The actor thread stopped.
pub struct DiscoveryWasShutdown;

#[derive(thiserror::Error, Debug)]
/// Errors of [Discovery::talk_request].
pub enum TalkError {
    #[error("Talk request timed out")]
    Timeout,

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    DiscoveryWasShutdown(#[from] DiscoveryWasShutdown),
}
