use std::net::SocketAddr;

use tracing::{debug, trace};

use crate::common::{Message, MessageKind, Node, PeerRecord};

use super::Actor;

impl Actor {
    /// Handle an inbound response: match it to an inflight request, refresh
    /// records, and feed `Nodes` to the lookup in flight.
    pub(super) fn handle_response(&mut self, from_record: &PeerRecord, from: SocketAddr, message: Message) {
        let total = match &message.kind {
            MessageKind::Nodes { total, .. } => (*total).max(1),
            _ => 1,
        };

        if !self
            .socket
            .is_expected_response(message.request_id, &from, total)
        {
            return;
        }

        let sender = from_record.node_id();

        match message.kind {
            MessageKind::Pong { enr_seq, address } => {
                trace!(peer = ?sender, enr_seq, ?address, "Pong");

                if self.observed_address != Some(address) {
                    debug!(?address, "Peer reports a new address for us");
                    self.observed_address = Some(address);
                }

                if enr_seq > from_record.seq() {
                    debug!(
                        peer = ?sender,
                        known = from_record.seq(),
                        advertised = enr_seq,
                        "Requesting newer record"
                    );

                    let kind = MessageKind::FindNode { distances: vec![0] };
                    if let Err(error) = self.send_message(from_record, kind) {
                        debug!(?error, peer = ?sender, "Failed to request newer record");
                    }
                }
            }
            MessageKind::Nodes { total, records } => {
                let records = records
                    .into_iter()
                    .filter(|record| match self.sessions.identity().verify(record) {
                        Ok(()) => true,
                        Err(error) => {
                            debug!(?error, peer = ?sender, "Dropping unverifiable record");
                            false
                        }
                    })
                    .collect::<Vec<_>>();

                for record in &records {
                    // Our own record, as seen by others, is of no use here.
                    if record.node_id() == *self.id() {
                        continue;
                    }

                    if record.node_id() == sender && record.seq() > from_record.seq() {
                        debug!(peer = ?sender, seq = record.seq(), "Updated record");
                    }

                    self.routing_table.add(Node::new(record.clone()));
                }

                let queries = match &mut self.lookup {
                    Some((_, lookup)) if lookup.involves(&sender) => {
                        lookup.handle_nodes(&sender, total, &records)
                    }
                    _ => vec![],
                };

                self.send_find_nodes(queries);
            }
            MessageKind::TalkResponse { response } => {
                self.talk_responses.push((message.request_id, response));
            }
            other => {
                debug!(kind = other.name(), "Not a response");
            }
        }
    }
}
