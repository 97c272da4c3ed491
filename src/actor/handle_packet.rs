use std::net::SocketAddr;

use tracing::{debug, trace};

use crate::common::{Id, Message, Node};
use crate::packet::{validate_size, Packet, PacketKind};

use super::{Actor, SendError};

impl Actor {
    /// Decode one datagram and dispatch it by packet kind.
    ///
    /// Malformed, unauthenticated or unexpected packets are logged and dropped.
    pub fn handle_inbound_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        if let Err(error) = validate_size(bytes) {
            trace!(context = "packet_validation", ?error, ?from, "Dropping datagram");
            return;
        }

        let packet = match Packet::decode(bytes, self.id()) {
            Ok(packet) => packet,
            Err(error) => {
                debug!(?error, ?from, "Dropping malformed packet");
                return;
            }
        };

        trace!(context = "packet_receiving", kind = ?packet.kind(), ?from);

        match packet.kind() {
            PacketKind::Ordinary => self.handle_ordinary(packet, from),
            PacketKind::Challenge => self.handle_challenge(packet, from),
            PacketKind::Handshake => self.handle_handshake(packet, from),
        }
    }

    // === Private Methods ===

    fn handle_ordinary(&mut self, packet: Packet, from: SocketAddr) {
        let Some(src_id) = packet.src_id() else {
            return;
        };

        if let Some(session) = self.sessions.get(&src_id, from) {
            if session.is_established() {
                match session.decrypt(&packet) {
                    Ok(plaintext) => return self.handle_plaintext(src_id, from, &plaintext),
                    // The peer may have lost its keys, challenge it for new ones.
                    Err(error) => debug!(?error, ?from, "Undecryptable packet"),
                }
            }
        }

        // Unknown sender or no keys yet, ask who they are.
        let known_seq = self
            .routing_table
            .get(&src_id)
            .map(|node| node.seq())
            .unwrap_or(0);

        let challenge = match self
            .sessions
            .challenge(src_id, from, *packet.nonce(), known_seq)
        {
            Ok(Some(challenge)) => challenge,
            Ok(None) => {
                trace!(peer = ?src_id, ?from, "Handshake already underway");
                return;
            }
            Err(error) => {
                debug!(?error, peer = ?src_id, ?from, "Failed to create challenge");
                return;
            }
        };

        let result = challenge
            .encode(&src_id)
            .map_err(SendError::from)
            .and_then(|bytes| Ok(self.socket.send(from, &bytes)?));

        match result {
            Ok(()) => trace!(peer = ?src_id, ?from, "Sent challenge"),
            Err(error) => debug!(?error, peer = ?src_id, ?from, "Failed to send challenge"),
        }
    }

    fn handle_challenge(&mut self, packet: Packet, from: SocketAddr) {
        let Some(peer_id) = self.sessions.find_by_nonce(from, packet.nonce()) else {
            debug!(?from, "Dropping unsolicited challenge");
            return;
        };

        let result = self
            .sessions
            .accept_challenge(peer_id, from, &packet, &self.local_record)
            .map_err(SendError::from)
            .and_then(|handshake| Ok(handshake.encode(&peer_id)?))
            .and_then(|bytes| Ok(self.socket.send(from, &bytes)?));

        match result {
            Ok(()) => debug!(peer = ?peer_id, ?from, "Session established as initiator"),
            Err(error) => {
                debug!(?error, peer = ?peer_id, ?from, "Failed to answer challenge");
                return;
            }
        }

        self.flush_pending(&peer_id, from);
    }

    fn handle_handshake(&mut self, packet: Packet, from: SocketAddr) {
        let Some(src_id) = packet.src_id() else {
            return;
        };

        let known_record = self
            .routing_table
            .get(&src_id)
            .map(|node| node.record().clone());

        let (record, plaintext) = match self.sessions.accept_handshake(from, &packet, known_record) {
            Ok(accepted) => accepted,
            Err(error) => {
                debug!(?error, peer = ?src_id, ?from, "Rejected handshake");
                return;
            }
        };

        debug!(peer = ?src_id, ?from, "Session established as recipient");

        self.routing_table.add(Node::new(record));

        // Messages too large for the handshake follow as ordinary packets.
        if !plaintext.is_empty() {
            self.handle_plaintext(src_id, from, &plaintext);
        }

        self.flush_pending(&src_id, from);
    }

    /// Send the messages queued while the handshake with `peer_id` was in progress.
    fn flush_pending(&mut self, peer_id: &Id, from: SocketAddr) {
        let packets = match self.sessions.flush_pending(peer_id, from) {
            Ok(packets) => packets,
            Err(error) => {
                debug!(?error, peer = ?peer_id, "Failed to encrypt pending messages");
                return;
            }
        };

        for packet in packets {
            let result = packet
                .encode(peer_id)
                .map_err(SendError::from)
                .and_then(|bytes| Ok(self.socket.send(from, &bytes)?));

            if let Err(error) = result {
                debug!(?error, peer = ?peer_id, "Failed to send pending message");
            }
        }
    }

    /// Dispatch a decrypted message from an authenticated peer.
    fn handle_plaintext(&mut self, src_id: Id, from: SocketAddr, plaintext: &[u8]) {
        let message = match Message::from_bytes(plaintext) {
            Ok(message) => message,
            Err(error) => {
                debug!(?error, peer = ?src_id, ?from, "Dropping invalid message");
                return;
            }
        };

        trace!(
            context = "message_receiving",
            kind = message.kind.name(),
            request_id = message.request_id,
            peer = ?src_id,
            ?from
        );

        let from_session = self
            .sessions
            .get(&src_id, from)
            .and_then(|session| session.remote_record().cloned());
        let from_table = self.routing_table.get(&src_id).map(|n| n.record().clone());

        // The most recent of the two.
        let Some(record) = from_session
            .into_iter()
            .chain(from_table)
            .max_by_key(|record| record.seq())
        else {
            debug!(peer = ?src_id, "No record for an authenticated peer");
            return;
        };

        self.routing_table.mark_seen(&src_id);

        if message.kind.is_request() {
            self.handle_request(&record, from, message);
        } else {
            self.handle_response(&record, from, message);
        }
    }
}
