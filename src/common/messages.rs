//! Serialize and deserialize protocol messages, carried encrypted inside packets.

mod factory;
mod internal;

use std::convert::TryInto;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;
use serde_bytes::ByteBuf;

use crate::common::{PeerRecord, RecordError};

pub use factory::MessageFactory;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    /// Correlates responses with requests, chosen by the requester.
    pub request_id: u32,

    pub kind: MessageKind,
}

#[derive(Debug, PartialEq, Clone)]
/// Every message kind of the protocol.
pub enum MessageKind {
    Ping {
        enr_seq: u64,
    },
    Pong {
        enr_seq: u64,
        /// The requester's address as seen by the responder.
        address: SocketAddr,
    },
    FindNode {
        distances: Vec<u16>,
    },
    Nodes {
        /// Number of `Nodes` messages answering the same request.
        total: u8,
        records: Vec<PeerRecord>,
    },
    TalkRequest {
        protocol: Bytes,
        request: Bytes,
    },
    TalkResponse {
        response: Bytes,
    },
}

impl MessageKind {
    /// Returns `true` for messages that expect a response.
    pub fn is_request(&self) -> bool {
        match self {
            MessageKind::Ping { .. }
            | MessageKind::FindNode { .. }
            | MessageKind::TalkRequest { .. } => true,
            MessageKind::Pong { .. }
            | MessageKind::Nodes { .. }
            | MessageKind::TalkResponse { .. } => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Ping { .. } => "ping",
            MessageKind::Pong { .. } => "pong",
            MessageKind::FindNode { .. } => "findnode",
            MessageKind::Nodes { .. } => "nodes",
            MessageKind::TalkRequest { .. } => "talkreq",
            MessageKind::TalkResponse { .. } => "talkresp",
        }
    }
}

impl Message {
    pub fn new(request_id: u32, kind: MessageKind) -> Self {
        Self { request_id, kind }
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message, MessageError> {
        Message::from_wire_message(internal::WireMessage::from_bytes(bytes.as_ref())?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(self.clone().into_wire_message()?.to_bytes()?)
    }

    fn into_wire_message(self) -> Result<internal::WireMessage, MessageError> {
        Ok(internal::WireMessage {
            request_id: self.request_id.to_be_bytes(),
            variant: match self.kind {
                MessageKind::Ping { enr_seq } => internal::WireMessageVariant::Ping {
                    arguments: internal::WirePingArguments { enr_seq },
                },
                MessageKind::Pong { enr_seq, address } => internal::WireMessageVariant::Pong {
                    arguments: internal::WirePongArguments {
                        enr_seq,
                        address: ByteBuf::from(sockaddr_to_bytes(&address)),
                    },
                },
                MessageKind::FindNode { distances } => internal::WireMessageVariant::FindNode {
                    arguments: internal::WireFindNodeArguments { distances },
                },
                MessageKind::Nodes { total, records } => internal::WireMessageVariant::Nodes {
                    arguments: internal::WireNodesArguments {
                        total,
                        records: records
                            .iter()
                            .map(|record| record.to_bytes().map(ByteBuf::from))
                            .collect::<Result<_, _>>()?,
                    },
                },
                MessageKind::TalkRequest { protocol, request } => {
                    internal::WireMessageVariant::TalkRequest {
                        arguments: internal::WireTalkRequestArguments {
                            protocol: ByteBuf::from(protocol.to_vec()),
                            request: ByteBuf::from(request.to_vec()),
                        },
                    }
                }
                MessageKind::TalkResponse { response } => {
                    internal::WireMessageVariant::TalkResponse {
                        arguments: internal::WireTalkResponseArguments {
                            response: ByteBuf::from(response.to_vec()),
                        },
                    }
                }
            },
        })
    }

    fn from_wire_message(msg: internal::WireMessage) -> Result<Message, MessageError> {
        Ok(Message {
            request_id: u32::from_be_bytes(msg.request_id),
            kind: match msg.variant {
                internal::WireMessageVariant::Ping { arguments } => MessageKind::Ping {
                    enr_seq: arguments.enr_seq,
                },
                internal::WireMessageVariant::Pong { arguments } => MessageKind::Pong {
                    enr_seq: arguments.enr_seq,
                    address: bytes_to_sockaddr(&arguments.address)?,
                },
                internal::WireMessageVariant::FindNode { arguments } => MessageKind::FindNode {
                    distances: arguments.distances,
                },
                internal::WireMessageVariant::Nodes { arguments } => MessageKind::Nodes {
                    total: arguments.total,
                    records: arguments
                        .records
                        .iter()
                        .map(PeerRecord::from_bytes)
                        .collect::<Result<_, _>>()?,
                },
                internal::WireMessageVariant::TalkRequest { arguments } => {
                    MessageKind::TalkRequest {
                        protocol: arguments.protocol.into_vec().into(),
                        request: arguments.request.into_vec().into(),
                    }
                }
                internal::WireMessageVariant::TalkResponse { arguments } => {
                    MessageKind::TalkResponse {
                        response: arguments.response.into_vec().into(),
                    }
                }
            },
        })
    }
}

fn sockaddr_to_bytes(address: &SocketAddr) -> Vec<u8> {
    let mut bytes = match address.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };

    bytes.extend_from_slice(&address.port().to_be_bytes());

    bytes
}

fn bytes_to_sockaddr(bytes: &[u8]) -> Result<SocketAddr, MessageError> {
    match bytes.len() {
        6 => {
            let octets: [u8; 4] = bytes[0..4]
                .try_into()
                .map_err(|_| MessageError::InvalidAddress)?;
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);

            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        18 => {
            let octets: [u8; 16] = bytes[0..16]
                .try_into()
                .map_err(|_| MessageError::InvalidAddress)?;
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);

            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(MessageError::InvalidAddress),
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors encoding or decoding a [Message].
pub enum MessageError {
    #[error("Failed to encode or decode message: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("Invalid socket address bytes")]
    InvalidAddress,

    #[error(transparent)]
    Record(#[from] RecordError),
}
