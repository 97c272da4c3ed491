use std::net::SocketAddr;

use bytes::Bytes;

use crate::common::{Id, PeerRecord, MAX_DISTANCE};
use crate::packet::MAX_MESSAGE_SIZE;

use super::{Message, MessageKind};

/// Room left for the bencode framing around the records of a `Nodes` message.
const NODES_FRAMING_OVERHEAD: usize = 64;

/// Builds outgoing message kinds for the local node.
#[derive(Debug, Clone, Copy)]
pub struct MessageFactory {
    enr_seq: u64,
}

impl MessageFactory {
    /// `enr_seq` is the sequence number of the local record.
    pub fn new(enr_seq: u64) -> Self {
        Self { enr_seq }
    }

    pub fn ping(&self) -> MessageKind {
        MessageKind::Ping {
            enr_seq: self.enr_seq,
        }
    }

    pub fn pong(&self, observed: SocketAddr) -> MessageKind {
        MessageKind::Pong {
            enr_seq: self.enr_seq,
            address: observed,
        }
    }

    /// Ask `dest` for nodes at the log2 distance between `dest` and `target`,
    /// or at the neighbouring distances when `vary_distance` is set.
    pub fn find_node(&self, target: &Id, dest: &Id, vary_distance: bool) -> MessageKind {
        MessageKind::FindNode {
            distances: find_node_distances(dest.distance(target), vary_distance),
        }
    }

    pub fn talk_request(&self, protocol: Bytes, request: Bytes) -> MessageKind {
        MessageKind::TalkRequest { protocol, request }
    }

    pub fn talk_response(&self, response: Bytes) -> MessageKind {
        MessageKind::TalkResponse { response }
    }

    /// Split records into as many `Nodes` messages as needed for each to fit in one packet.
    ///
    /// Always returns at least one message, `total` is the number of messages.
    pub fn nodes(&self, records: &[PeerRecord]) -> Vec<MessageKind> {
        let budget = MAX_MESSAGE_SIZE - NODES_FRAMING_OVERHEAD;

        let mut chunks: Vec<Vec<PeerRecord>> = vec![vec![]];
        let mut used = 0;

        for record in records {
            let size = match record.to_bytes() {
                Ok(bytes) => bytes.len() + 5,
                Err(_) => continue,
            };

            if used + size > budget {
                chunks.push(vec![]);
                used = 0;
            }

            used += size;

            if let Some(chunk) = chunks.last_mut() {
                chunk.push(record.clone());
            }
        }

        let total = chunks.len().min(u8::MAX as usize) as u8;

        chunks
            .into_iter()
            .take(total as usize)
            .map(|records| MessageKind::Nodes { total, records })
            .collect()
    }

    /// Wrap a kind into a [Message] with a request id.
    pub fn message(&self, request_id: u32, kind: MessageKind) -> Message {
        Message::new(request_id, kind)
    }
}

pub(crate) fn find_node_distances(distance: u16, vary_distance: bool) -> Vec<u16> {
    if !vary_distance {
        return vec![distance];
    }

    let mut distances = Vec::with_capacity(2);

    if distance > 1 {
        distances.push(distance - 1);
    }
    if distance < MAX_DISTANCE {
        distances.push(distance + 1);
    }

    distances
}
