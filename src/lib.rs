#![doc = include_str!("../README.md")]

// Public modules
mod actor;
mod common;
mod core;
mod discovery;
pub mod packet;
pub mod session;

pub use crate::actor::config::{Config, ConfigError};
pub use crate::actor::socket::transport::{memory::MemoryTransport, real::UdpTransport, Transport};
pub use crate::actor::talk::{DefaultTalkHandler, TalkHandler};
pub use crate::actor::{
    Actor, ActorError, Info, LookupError, LookupStart, SendError, TickReport,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use crate::common::{
    ClosestNodes, Ed25519Identity, Id, IdentityScheme, Message, MessageError, MessageFactory,
    MessageKind, Node, PeerRecord, PeerRecordBuilder, RecordError, RoutingTable,
    MAX_BUCKET_SIZE_K, MAX_RECORD_SIZE,
};
pub use crate::core::lookup::LookupOutcome;
pub use crate::discovery::{
    Discovery, DiscoveryBuilder, DiscoveryWasShutdown, LookupHandle, TalkError,
};

pub use bytes::Bytes;
pub use ed25519_dalek::SigningKey;
