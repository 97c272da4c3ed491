use std::net::SocketAddr;

use tracing::{debug, trace};

use crate::common::{Message, MessageKind, PeerRecord, MAX_DISTANCE};

use super::Actor;

impl Actor {
    /// Serve an inbound request from an authenticated peer.
    pub(super) fn handle_request(&mut self, from_record: &PeerRecord, from: SocketAddr, message: Message) {
        let request_id = message.request_id;

        match message.kind {
            MessageKind::Ping { enr_seq } => {
                trace!(peer = ?from_record.node_id(), enr_seq, "Ping");

                let pong = self.factory.pong(from);
                self.respond(from_record, from, request_id, pong);
            }
            MessageKind::FindNode { distances } => {
                let records = self.records_at_distances(&distances);

                trace!(
                    peer = ?from_record.node_id(),
                    ?distances,
                    found = records.len(),
                    "FindNode"
                );

                for chunk in self.factory.nodes(&records) {
                    self.respond(from_record, from, request_id, chunk);
                }
            }
            MessageKind::TalkRequest { protocol, request } => {
                let response = self
                    .talk_handler
                    .handle(&from_record.node_id(), &protocol, &request);

                let kind = self.factory.talk_response(response);
                self.respond(from_record, from, request_id, kind);
            }
            other => {
                debug!(kind = other.name(), "Not a request");
            }
        }
    }

    /// Records at the requested log2 distances from us, at most K of them.
    ///
    /// Distance 0 is our own record.
    pub(super) fn records_at_distances(&self, distances: &[u16]) -> Vec<PeerRecord> {
        let k = self.routing_table.bucket_size();
        let mut records = Vec::with_capacity(k);

        let mut seen = Vec::with_capacity(distances.len());

        for distance in distances {
            if *distance > MAX_DISTANCE || seen.contains(distance) {
                continue;
            }
            seen.push(*distance);

            if *distance == 0 {
                records.push(self.local_record.clone());
            } else {
                records.extend(
                    self.routing_table
                        .nodes_at_distance(*distance)
                        .into_iter()
                        .map(|node| node.record().clone()),
                );
            }

            if records.len() >= k {
                break;
            }
        }

        records.truncate(k);
        records
    }
}
