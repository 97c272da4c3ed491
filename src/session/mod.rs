//! Per-peer sessions: handshake state machine, symmetric keys and message counters.

pub mod crypto;

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use ed25519_dalek::SigningKey;
use lru::LruCache;
use rand::Rng;
use tracing::debug;

use crate::common::identity::{id_signature_input, sign_id_proof};
use crate::common::{Id, IdentityScheme, PeerRecord, RecordError};
use crate::packet::{
    AuthData, Packet, PacketError, ID_NONCE_SIZE, MAX_PACKET_SIZE, NONCE_SIZE, TAG_SIZE,
};

pub use crypto::{derive_keys, SharedKeys};

/// Sessions are keyed by the peer id and the endpoint it talks from.
pub type SessionKey = (Id, SocketAddr);

/// Messages kept while a handshake is in progress, the oldest is dropped beyond this.
pub const MAX_PENDING_MESSAGES: usize = 16;
/// Recently sent packets remembered per session, so a challenged message can be resent.
pub const SENT_CACHE_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub enum SessionState {
    Unestablished,
    HandshakeInitiated(Handshake),
    Established(Keys),
}

#[derive(Debug, Clone)]
pub enum Handshake {
    /// We sent a probe and wait for the peer's challenge.
    Probing { since: Instant },
    /// We challenged the peer and wait for its handshake.
    Challenged { since: Instant },
}

impl Handshake {
    fn since(&self) -> Instant {
        match self {
            Handshake::Probing { since } | Handshake::Challenged { since } => *since,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which side of the handshake we were, deciding which key encrypts outbound messages.
pub enum Role {
    Initiator,
    Recipient,
}

#[derive(Debug, Clone)]
pub struct Keys {
    role: Role,
    keys: SharedKeys,
}

impl Keys {
    fn outbound(&self) -> &[u8; crypto::KEY_SIZE] {
        match self.role {
            Role::Initiator => &self.keys.initiator_key,
            Role::Recipient => &self.keys.recipient_key,
        }
    }

    fn inbound(&self) -> &[u8; crypto::KEY_SIZE] {
        match self.role {
            Role::Initiator => &self.keys.recipient_key,
            Role::Recipient => &self.keys.initiator_key,
        }
    }
}

#[derive(Debug, Clone)]
/// A challenge we sent, the peer's handshake must sign over its data.
struct IssuedChallenge {
    data: Vec<u8>,
    since: Instant,
}

#[derive(Debug, Clone)]
/// A packet we sent; probes carry no plaintext.
struct Sent {
    nonce: [u8; NONCE_SIZE],
    plaintext: Option<Vec<u8>>,
}

/// Cryptographic context with one peer endpoint.
pub struct Session {
    state: SessionState,
    /// Messages encrypted with the current key pair.
    counter: u32,
    /// A challenge must echo one of these nonces.
    sent: VecDeque<Sent>,
    /// Plaintexts waiting for the handshake to complete, oldest first.
    pending: VecDeque<Vec<u8>>,
    /// Outstanding challenge, kept apart from `state` so established keys
    /// stay usable until the peer's handshake replaces them.
    challenge: Option<IssuedChallenge>,
    remote_record: Option<PeerRecord>,
    failures: u32,
    failure_threshold: u32,
}

impl Session {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            state: SessionState::Unestablished,
            counter: 0,
            sent: VecDeque::with_capacity(SENT_CACHE_SIZE),
            pending: VecDeque::new(),
            challenge: None,
            remote_record: None,
            failures: 0,
            failure_threshold,
        }
    }

    // === Getters ===

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, SessionState::Established(_))
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn remote_record(&self) -> Option<&PeerRecord> {
        self.remote_record.as_ref()
    }

    /// Number of messages waiting for the handshake.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    // === Public Methods ===

    /// Encrypt a message into an ordinary packet.
    pub fn encrypt(&mut self, local_id: &Id, plaintext: &[u8]) -> Result<Packet, SessionError> {
        let SessionState::Established(keys) = &self.state else {
            return Err(SessionError::NotEstablished);
        };
        let key = *keys.outbound();

        let nonce = self.next_nonce()?;

        let mut packet = Packet::ordinary(*local_id, nonce);
        packet.body = crypto::encrypt_message(&key, &nonce, plaintext, &packet.aad()?)?;

        self.remember_sent(nonce, Some(plaintext.to_vec()));

        Ok(packet)
    }

    /// Decrypt the body of an ordinary packet.
    ///
    /// Failures are counted, and the session is demoted once they reach the threshold.
    pub fn decrypt(&mut self, packet: &Packet) -> Result<Vec<u8>, SessionError> {
        let SessionState::Established(keys) = &self.state else {
            return Err(SessionError::NotEstablished);
        };

        match crypto::decrypt_message(keys.inbound(), packet.nonce(), &packet.body, &packet.aad()?)
        {
            Ok(plaintext) => {
                self.failures = 0;
                Ok(plaintext)
            }
            Err(error) => {
                self.record_failure();
                Err(error)
            }
        }
    }

    /// Drop keys and handshake state. Pending and sent messages survive for the next handshake.
    pub fn demote(&mut self) {
        self.state = SessionState::Unestablished;
        self.counter = 0;
        self.failures = 0;
        self.challenge = None;
    }

    // === Private Methods ===

    fn record_failure(&mut self) {
        self.failures += 1;

        if self.failures >= self.failure_threshold {
            debug!(failures = self.failures, "Demoting session");
            self.demote();
        }
    }

    /// `counter (u32 BE) || 8 random bytes`, the counter is never reused with the same keys.
    fn next_nonce(&mut self) -> Result<[u8; NONCE_SIZE], SessionError> {
        let counter = self.counter;

        if counter == u32::MAX {
            self.demote();
            return Err(SessionError::CounterExhausted);
        }
        self.counter += 1;

        let mut nonce = [0_u8; NONCE_SIZE];
        nonce[..4].copy_from_slice(&counter.to_be_bytes());
        rand::thread_rng().fill(&mut nonce[4..]);

        Ok(nonce)
    }

    fn remember_sent(&mut self, nonce: [u8; NONCE_SIZE], plaintext: Option<Vec<u8>>) {
        if self.sent.len() == SENT_CACHE_SIZE {
            self.sent.pop_front();
        }
        self.sent.push_back(Sent { nonce, plaintext });
    }

    fn queue(&mut self, plaintext: Vec<u8>) {
        if self.pending.len() == MAX_PENDING_MESSAGES {
            debug!("Pending queue full, dropping the oldest message");
            self.pending.pop_front();
        }
        self.pending.push_back(plaintext);
    }

    fn has_sent(&self, nonce: &[u8; NONCE_SIZE]) -> bool {
        self.sent.iter().any(|sent| &sent.nonce == nonce)
    }

    /// Move the challenged message and everything sent after it back to the
    /// front of the pending queue; the peer had no keys to read them.
    fn requeue_from(&mut self, nonce: &[u8; NONCE_SIZE]) {
        let Some(position) = self.sent.iter().position(|sent| &sent.nonce == nonce) else {
            return;
        };

        let unread = self
            .sent
            .drain(position..)
            .filter_map(|sent| sent.plaintext)
            .collect::<Vec<_>>();

        for plaintext in unread.into_iter().rev() {
            self.pending.push_front(plaintext);
        }
        self.pending.truncate(MAX_PENDING_MESSAGES);
    }

    fn establish(&mut self, role: Role, keys: SharedKeys) {
        self.state = SessionState::Established(Keys { role, keys });
        self.counter = 0;
        self.failures = 0;
        self.challenge = None;
        self.sent.clear();
    }

    fn handshake_expired(&self, timeout: Duration) -> bool {
        match &self.state {
            SessionState::HandshakeInitiated(handshake) => handshake.since().elapsed() > timeout,
            _ => false,
        }
    }

    fn is_probing(&self, timeout: Duration) -> bool {
        matches!(
            &self.state,
            SessionState::HandshakeInitiated(Handshake::Probing { since }) if since.elapsed() <= timeout
        )
    }

    fn fresh_challenge(&self, timeout: Duration) -> Option<&IssuedChallenge> {
        self.challenge
            .as_ref()
            .filter(|challenge| challenge.since.elapsed() <= timeout)
    }
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("counter", &self.counter)
            .field("pending", &self.pending.len())
            .field("challenged", &self.challenge.is_some())
            .field("failures", &self.failures)
            .finish()
    }
}

/// What to send when a message is handed to the session layer.
#[derive(Debug)]
pub enum Outbound {
    /// The session is established, send this ordinary packet.
    Packet(Packet),
    /// Handshake needed, send this probe; the message is kept pending.
    Probe(Packet),
    /// A handshake is already in progress, the message joined the pending queue.
    Queued,
}

/// Owns every session, bounded by an LRU cache.
pub struct SessionManager {
    local_id: Id,
    signer: SigningKey,
    identity: Box<dyn IdentityScheme>,
    sessions: LruCache<SessionKey, Session>,
    failure_threshold: u32,
    handshake_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        signer: SigningKey,
        identity: Box<dyn IdentityScheme>,
        capacity: NonZeroUsize,
        failure_threshold: u32,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            local_id: Id::from_public_key(&signer.verifying_key().to_bytes()),
            signer,
            identity,
            sessions: LruCache::new(capacity),
            failure_threshold,
            handshake_timeout,
        }
    }

    // === Getters ===

    pub fn local_id(&self) -> &Id {
        &self.local_id
    }

    pub fn identity(&self) -> &dyn IdentityScheme {
        self.identity.as_ref()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&mut self, peer_id: &Id, endpoint: SocketAddr) -> Option<&mut Session> {
        self.sessions.get_mut(&(*peer_id, endpoint))
    }

    // === Public Methods ===

    /// Returns the session registered under `(peer_id, endpoint)`, creating it if needed.
    pub fn get_or_create(&mut self, peer_id: Id, endpoint: SocketAddr) -> &mut Session {
        let failure_threshold = self.failure_threshold;

        self.sessions
            .get_or_insert_mut((peer_id, endpoint), || Session::new(failure_threshold))
    }

    /// Explicitly tear down a session.
    pub fn remove(&mut self, peer_id: &Id, endpoint: SocketAddr) -> Option<Session> {
        self.sessions.pop(&(*peer_id, endpoint))
    }

    /// Encrypt `plaintext` for a peer, or start a handshake keeping it pending.
    pub fn outbound(
        &mut self,
        record: &PeerRecord,
        endpoint: SocketAddr,
        plaintext: Vec<u8>,
    ) -> Result<Outbound, SessionError> {
        let local_id = self.local_id;
        let timeout = self.handshake_timeout;
        let session = self.get_or_create(record.node_id(), endpoint);

        if session.is_established() {
            return Ok(Outbound::Packet(session.encrypt(&local_id, &plaintext)?));
        }

        if session.handshake_expired(timeout) {
            debug!(peer = ?record.node_id(), "Discarding stale handshake");
            session.demote();
        }

        session.remote_record = Some(record.clone());
        session.queue(plaintext);

        if let SessionState::HandshakeInitiated(_) = session.state {
            return Ok(Outbound::Queued);
        }

        let probe = Packet::random(local_id);

        session.remember_sent(*probe.nonce(), None);
        session.state = SessionState::HandshakeInitiated(Handshake::Probing {
            since: Instant::now(),
        });

        Ok(Outbound::Probe(probe))
    }

    /// Answer a packet we could not decrypt with a challenge.
    ///
    /// Returns `None` when no challenge should be sent: one is already
    /// outstanding, or both sides probed at once and we stay the initiator
    /// (the lower id wins).
    ///
    /// `known_seq` is the sequence number of the peer's record we hold, 0 if none.
    pub fn challenge(
        &mut self,
        peer_id: Id,
        endpoint: SocketAddr,
        nonce: [u8; NONCE_SIZE],
        known_seq: u64,
    ) -> Result<Option<Packet>, SessionError> {
        let local_id = self.local_id;
        let timeout = self.handshake_timeout;
        let session = self.get_or_create(peer_id, endpoint);

        if session.fresh_challenge(timeout).is_some() {
            return Ok(None);
        }
        if session.is_probing(timeout) && local_id < peer_id {
            debug!(peer = ?peer_id, "Handshake collision, staying initiator");
            return Ok(None);
        }

        let id_nonce: [u8; ID_NONCE_SIZE] = rand::thread_rng().gen();
        let challenge = Packet::challenge(nonce, id_nonce, known_seq);
        let now = Instant::now();

        if !session.is_established() {
            session.state = SessionState::HandshakeInitiated(Handshake::Challenged { since: now });
            session.counter = 0;
        }
        session.challenge = Some(IssuedChallenge {
            data: challenge.aad()?,
            since: now,
        });

        Ok(Some(challenge))
    }

    /// Find the session that recently sent a packet with this nonce.
    pub fn find_by_nonce(&self, endpoint: SocketAddr, nonce: &[u8; NONCE_SIZE]) -> Option<Id> {
        self.sessions
            .iter()
            .find(|((_, address), session)| *address == endpoint && session.has_sent(nonce))
            .map(|((id, _), _)| *id)
    }

    /// Initiator: answer a challenge with a handshake packet.
    ///
    /// The handshake carries the challenged message, or the oldest pending one.
    /// Messages that do not fit stay pending, see [SessionManager::flush_pending].
    pub fn accept_challenge(
        &mut self,
        peer_id: Id,
        endpoint: SocketAddr,
        challenge: &Packet,
        local_record: &PeerRecord,
    ) -> Result<Packet, SessionError> {
        let AuthData::Challenge { enr_seq, .. } = challenge.authdata else {
            return Err(SessionError::UnexpectedPacket);
        };
        let challenge_data = challenge.aad()?;

        let local_id = self.local_id;
        let timeout = self.handshake_timeout;

        let session = self
            .sessions
            .get_mut(&(peer_id, endpoint))
            .ok_or(SessionError::UnsolicitedChallenge)?;

        if !session.has_sent(challenge.nonce()) {
            return Err(SessionError::UnsolicitedChallenge);
        }

        // Both sides challenged each other, the lower id stays initiator.
        if session.fresh_challenge(timeout).is_some() && local_id > peer_id {
            return Err(SessionError::HandshakeCollision);
        }

        let remote_record = session
            .remote_record
            .clone()
            .ok_or(SessionError::UnknownRecord)?;
        self.identity.verify(&remote_record)?;

        let (secret, ephemeral_key) = crypto::ecdh_initiator(remote_record.public_key())?;
        let keys = crypto::key_schedule(&secret, &challenge_data, &local_id, &peer_id)?;

        let signature = sign_id_proof(&self.signer, &challenge_data, &ephemeral_key, &peer_id);

        let record = (enr_seq < local_record.seq()).then(|| local_record.clone());

        let session = self
            .sessions
            .get_mut(&(peer_id, endpoint))
            .ok_or(SessionError::UnsolicitedChallenge)?;

        session.requeue_from(challenge.nonce());
        session.establish(Role::Initiator, keys.clone());
        let nonce = session.next_nonce()?;

        let mut packet = Packet::handshake(
            local_id,
            nonce,
            signature.to_vec(),
            ephemeral_key.to_vec(),
            record,
        )?;
        let aad = packet.aad()?;

        let fits = |plaintext: &Vec<u8>| aad.len() + plaintext.len() + TAG_SIZE <= MAX_PACKET_SIZE;
        let plaintext = if session.pending.front().is_some_and(fits) {
            session.pending.pop_front().unwrap_or_default()
        } else {
            Vec::new()
        };

        packet.body = crypto::encrypt_message(&keys.initiator_key, &nonce, &plaintext, &aad)?;

        Ok(packet)
    }

    /// Encrypt every pending message of an established session into ordinary packets.
    pub fn flush_pending(
        &mut self,
        peer_id: &Id,
        endpoint: SocketAddr,
    ) -> Result<Vec<Packet>, SessionError> {
        let local_id = self.local_id;

        let Some(session) = self.sessions.get_mut(&(*peer_id, endpoint)) else {
            return Ok(vec![]);
        };

        if !session.is_established() {
            return Ok(vec![]);
        }

        let pending = std::mem::take(&mut session.pending);

        pending
            .iter()
            .map(|plaintext| session.encrypt(&local_id, plaintext))
            .collect()
    }

    /// Recipient: verify a handshake, establish the session and decrypt its message.
    ///
    /// An established session is replaced once the handshake answering our
    /// challenge verifies. `known_record` is the initiator's record from the
    /// routing table, used when the handshake does not carry one.
    pub fn accept_handshake(
        &mut self,
        endpoint: SocketAddr,
        packet: &Packet,
        known_record: Option<PeerRecord>,
    ) -> Result<(PeerRecord, Vec<u8>), SessionError> {
        let AuthData::Handshake {
            src_id,
            signature,
            ephemeral_key,
            record,
        } = &packet.authdata
        else {
            return Err(SessionError::UnexpectedPacket);
        };

        let local_id = self.local_id;
        let timeout = self.handshake_timeout;

        let session = self
            .sessions
            .get_mut(&(*src_id, endpoint))
            .ok_or(SessionError::UnexpectedHandshake)?;

        let challenge_data = session
            .fresh_challenge(timeout)
            .map(|challenge| challenge.data.clone())
            .ok_or(SessionError::UnexpectedHandshake)?;

        let remote_record = match (record, known_record) {
            (Some(record), Some(known)) if known.seq() > record.seq() => known,
            (Some(record), _) => record.clone(),
            (None, Some(known)) => known,
            (None, None) => return Err(SessionError::UnknownRecord),
        };

        if self.identity.node_id(&remote_record) != *src_id {
            return Err(SessionError::UnknownRecord);
        }
        self.identity.verify(&remote_record)?;

        let input = id_signature_input(&challenge_data, ephemeral_key, &local_id);
        self.identity
            .verify_id_signature(&remote_record, &input, signature)
            .map_err(|_| SessionError::InvalidIdSignature)?;

        let secret = crypto::ecdh_recipient(&self.signer, ephemeral_key)?;
        let keys = crypto::key_schedule(&secret, &challenge_data, src_id, &local_id)?;

        let plaintext = crypto::decrypt_message(
            &keys.initiator_key,
            packet.nonce(),
            &packet.body,
            &packet.aad()?,
        )?;

        let session = self
            .sessions
            .get_mut(&(*src_id, endpoint))
            .ok_or(SessionError::UnexpectedHandshake)?;

        session.establish(Role::Recipient, keys);
        session.remote_record = Some(remote_record.clone());

        Ok((remote_record, plaintext))
    }
}

impl Debug for SessionManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("local_id", &self.local_id)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

#[derive(thiserror::Error, Debug)]
/// Session and handshake failures. They never abort the caller's operation.
pub enum SessionError {
    #[error("Session is not established")]
    NotEstablished,

    #[error("Failed to decrypt message")]
    Decryption,

    #[error("Failed to encrypt message")]
    Encryption,

    #[error("Message counter exhausted for this key pair")]
    CounterExhausted,

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Challenge does not match any packet we sent")]
    UnsolicitedChallenge,

    #[error("Handshake without a pending challenge")]
    UnexpectedHandshake,

    #[error("Both sides started a handshake, waiting for the peer's")]
    HandshakeCollision,

    #[error("Unexpected packet kind")]
    UnexpectedPacket,

    #[error("Invalid id signature")]
    InvalidIdSignature,

    #[error("Invalid static public key")]
    InvalidPublicKey,

    #[error("Invalid ephemeral key")]
    InvalidEphemeralKey,

    #[error("No verifiable record for the remote peer")]
    UnknownRecord,

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Packet(#[from] PacketError),
}

#[cfg(test)]
mod tests {
    use crate::common::record::random_signing_key;
    use crate::common::Ed25519Identity;

    use super::*;

    fn manager(signer: SigningKey) -> SessionManager {
        SessionManager::new(
            signer,
            Box::new(Ed25519Identity),
            NonZeroUsize::new(16).unwrap(),
            3,
            Duration::from_secs(2),
        )
    }

    fn record(signer: &SigningKey, port: u16) -> PeerRecord {
        PeerRecord::builder(signer.clone())
            .address(SocketAddr::from(([127, 0, 0, 1], port)))
            .build()
            .unwrap()
    }

    struct Pair {
        a: SessionManager,
        b: SessionManager,
        a_record: PeerRecord,
        b_record: PeerRecord,
        a_addr: SocketAddr,
        b_addr: SocketAddr,
    }

    fn handshake() -> Pair {
        let a_signer = random_signing_key();
        let b_signer = random_signing_key();
        let a_record = record(&a_signer, 1000);
        let b_record = record(&b_signer, 2000);
        let a_addr = a_record.udp_socket().unwrap();
        let b_addr = b_record.udp_socket().unwrap();

        let mut a = manager(a_signer);
        let mut b = manager(b_signer);

        // A -> B: probe
        let Outbound::Probe(probe) = a.outbound(&b_record, b_addr, b"hello".to_vec()).unwrap()
        else {
            panic!("expected a probe");
        };
        let probe = Packet::decode(&probe.encode(&b_record.node_id()).unwrap(), b.local_id()).unwrap();

        // B -> A: challenge
        let challenge = b
            .challenge(a_record.node_id(), a_addr, *probe.nonce(), 0)
            .unwrap()
            .unwrap();
        let challenge =
            Packet::decode(&challenge.encode(&a_record.node_id()).unwrap(), a.local_id()).unwrap();

        assert_eq!(
            a.find_by_nonce(b_addr, challenge.nonce()),
            Some(b_record.node_id())
        );

        // A -> B: handshake
        let handshake = a
            .accept_challenge(b_record.node_id(), b_addr, &challenge, &a_record)
            .unwrap();
        let handshake =
            Packet::decode(&handshake.encode(&b_record.node_id()).unwrap(), b.local_id()).unwrap();

        let (remote, plaintext) = b.accept_handshake(a_addr, &handshake, None).unwrap();

        assert_eq!(remote, a_record);
        assert_eq!(plaintext, b"hello");

        Pair {
            a,
            b,
            a_record,
            b_record,
            a_addr,
            b_addr,
        }
    }

    #[test]
    fn full_handshake_then_ordinary_messages() {
        let mut pair = handshake();

        let a_id = pair.a_record.node_id();
        let b_id = pair.b_record.node_id();

        // A -> B
        let Outbound::Packet(packet) = pair
            .a
            .outbound(&pair.b_record, pair.b_addr, b"ping".to_vec())
            .unwrap()
        else {
            panic!("expected an ordinary packet");
        };
        let packet = Packet::decode(&packet.encode(&b_id).unwrap(), &b_id).unwrap();
        let session = pair.b.get(&a_id, pair.a_addr).unwrap();
        assert_eq!(session.decrypt(&packet).unwrap(), b"ping");

        // B -> A
        let Outbound::Packet(packet) = pair
            .b
            .outbound(&pair.a_record, pair.a_addr, b"pong".to_vec())
            .unwrap()
        else {
            panic!("expected an ordinary packet");
        };
        let packet = Packet::decode(&packet.encode(&a_id).unwrap(), &a_id).unwrap();
        let session = pair.a.get(&b_id, pair.b_addr).unwrap();
        assert_eq!(session.decrypt(&packet).unwrap(), b"pong");
    }

    #[test]
    fn counter_strictly_increases() {
        let mut pair = handshake();
        let local_id = *pair.a.local_id();
        let session = pair
            .a
            .get(&pair.b_record.node_id(), pair.b_addr)
            .unwrap();

        let mut previous = session.counter();
        let mut counters = vec![];

        for _ in 0..10 {
            let packet = session.encrypt(&local_id, b"x").unwrap();
            let counter = u32::from_be_bytes(packet.nonce()[..4].try_into().unwrap());

            assert!(session.counter() > previous);
            previous = session.counter();
            counters.push(counter);
        }

        let mut sorted = counters.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, counters);
    }

    #[test]
    fn counter_exhaustion_demotes() {
        let mut pair = handshake();
        let local_id = *pair.a.local_id();
        let session = pair
            .a
            .get(&pair.b_record.node_id(), pair.b_addr)
            .unwrap();

        session.counter = u32::MAX;

        assert!(matches!(
            session.encrypt(&local_id, b"x"),
            Err(SessionError::CounterExhausted)
        ));
        assert!(!session.is_established());
    }

    #[test]
    fn demotion_at_failure_threshold() {
        let mut pair = handshake();
        let a_id = pair.a_record.node_id();

        let session = pair.b.get(&a_id, pair.a_addr).unwrap();

        let mut garbage = Packet::ordinary(a_id, [0; NONCE_SIZE]);
        garbage.body = vec![0; 32];

        assert!(matches!(
            session.decrypt(&garbage),
            Err(SessionError::Decryption)
        ));
        assert!(session.is_established());
        assert!(session.decrypt(&garbage).is_err());
        assert!(session.is_established());
        assert_eq!(session.failures(), 2);

        assert!(session.decrypt(&garbage).is_err());
        assert!(!session.is_established());

        assert!(matches!(
            session.decrypt(&garbage),
            Err(SessionError::NotEstablished)
        ));
    }

    #[test]
    fn reject_challenge_with_wrong_nonce() {
        let a_signer = random_signing_key();
        let b_signer = random_signing_key();
        let a_record = record(&a_signer, 1000);
        let b_record = record(&b_signer, 2000);
        let b_addr = b_record.udp_socket().unwrap();

        let mut a = manager(a_signer);

        a.outbound(&b_record, b_addr, b"hello".to_vec()).unwrap();

        let challenge = Packet::challenge([0xee; NONCE_SIZE], [1; ID_NONCE_SIZE], 0);

        assert_eq!(a.find_by_nonce(b_addr, challenge.nonce()), None);
        assert!(matches!(
            a.accept_challenge(b_record.node_id(), b_addr, &challenge, &a_record),
            Err(SessionError::UnsolicitedChallenge)
        ));
    }

    #[test]
    fn queue_while_probing() {
        let b_record = record(&random_signing_key(), 2000);
        let b_addr = b_record.udp_socket().unwrap();

        let mut a = manager(random_signing_key());

        assert!(matches!(
            a.outbound(&b_record, b_addr, b"1".to_vec()).unwrap(),
            Outbound::Probe(_)
        ));
        assert!(matches!(
            a.outbound(&b_record, b_addr, b"2".to_vec()).unwrap(),
            Outbound::Queued
        ));

        let session = a.get(&b_record.node_id(), b_addr).unwrap();
        assert_eq!(session.pending, vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[test]
    fn pending_queue_is_bounded() {
        let b_record = record(&random_signing_key(), 2000);
        let b_addr = b_record.udp_socket().unwrap();

        let mut a = manager(random_signing_key());

        for i in 0..MAX_PENDING_MESSAGES + 2 {
            a.outbound(&b_record, b_addr, vec![i as u8]).unwrap();
        }

        let session = a.get(&b_record.node_id(), b_addr).unwrap();
        assert_eq!(session.pending(), MAX_PENDING_MESSAGES);
        assert_eq!(session.pending.front(), Some(&vec![2_u8]));
    }

    /// Encode then decode, as the peer would receive it.
    fn transmit(packet: &Packet, dest: &Id) -> Packet {
        Packet::decode(&packet.encode(dest).unwrap(), dest).unwrap()
    }

    #[test]
    fn queued_messages_flush_after_handshake() {
        let a_signer = random_signing_key();
        let b_signer = random_signing_key();
        let a_record = record(&a_signer, 1000);
        let b_record = record(&b_signer, 2000);
        let a_addr = a_record.udp_socket().unwrap();
        let b_addr = b_record.udp_socket().unwrap();
        let a_id = a_record.node_id();
        let b_id = b_record.node_id();

        let mut a = manager(a_signer);
        let mut b = manager(b_signer);

        let Outbound::Probe(probe) = a.outbound(&b_record, b_addr, b"1".to_vec()).unwrap() else {
            panic!("expected a probe");
        };
        a.outbound(&b_record, b_addr, b"2".to_vec()).unwrap();
        a.outbound(&b_record, b_addr, b"3".to_vec()).unwrap();

        let challenge = b.challenge(a_id, a_addr, *probe.nonce(), 0).unwrap().unwrap();
        let handshake = a
            .accept_challenge(b_id, b_addr, &transmit(&challenge, &a_id), &a_record)
            .unwrap();

        let (_, plaintext) = b
            .accept_handshake(a_addr, &transmit(&handshake, &b_id), None)
            .unwrap();
        assert_eq!(plaintext, b"1");

        let packets = a.flush_pending(&b_id, b_addr).unwrap();
        assert_eq!(packets.len(), 2);

        let session = b.get(&a_id, a_addr).unwrap();
        let received = packets
            .iter()
            .map(|packet| session.decrypt(&transmit(packet, &b_id)).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(received, vec![b"2".to_vec(), b"3".to_vec()]);
    }

    #[test]
    fn oversized_first_message_follows_handshake() {
        let a_signer = random_signing_key();
        let b_signer = random_signing_key();
        let a_record = record(&a_signer, 1000);
        let b_record = record(&b_signer, 2000);
        let a_addr = a_record.udp_socket().unwrap();
        let b_addr = b_record.udp_socket().unwrap();
        let a_id = a_record.node_id();
        let b_id = b_record.node_id();

        let mut a = manager(a_signer);
        let mut b = manager(b_signer);

        let large = vec![7_u8; 1100];

        let Outbound::Probe(probe) = a.outbound(&b_record, b_addr, large.clone()).unwrap() else {
            panic!("expected a probe");
        };

        let challenge = b.challenge(a_id, a_addr, *probe.nonce(), 0).unwrap().unwrap();
        let handshake = a
            .accept_challenge(b_id, b_addr, &transmit(&challenge, &a_id), &a_record)
            .unwrap();

        // Still fits the packet size limit, with an empty message.
        let (_, plaintext) = b
            .accept_handshake(a_addr, &transmit(&handshake, &b_id), None)
            .unwrap();
        assert!(plaintext.is_empty());

        let packets = a.flush_pending(&b_id, b_addr).unwrap();
        assert_eq!(packets.len(), 1);

        let session = b.get(&a_id, a_addr).unwrap();
        assert_eq!(session.decrypt(&transmit(&packets[0], &b_id)).unwrap(), large);
    }

    #[test]
    fn challenged_message_is_resent_in_handshake() {
        let mut pair = handshake();
        let a_id = pair.a_record.node_id();
        let b_id = pair.b_record.node_id();

        let mut sent = vec![];
        for message in [&b"first"[..], b"second"] {
            let Outbound::Packet(packet) = pair
                .a
                .outbound(&pair.b_record, pair.b_addr, message.to_vec())
                .unwrap()
            else {
                panic!("expected an ordinary packet");
            };
            sent.push(packet);
        }

        // B lost its session and challenges the first packet.
        pair.b.remove(&a_id, pair.a_addr);
        let challenge = pair
            .b
            .challenge(a_id, pair.a_addr, *sent[0].nonce(), 0)
            .unwrap()
            .unwrap();

        // One challenge at a time.
        assert!(pair
            .b
            .challenge(a_id, pair.a_addr, *sent[1].nonce(), 0)
            .unwrap()
            .is_none());

        let challenge = transmit(&challenge, &a_id);
        assert_eq!(pair.a.find_by_nonce(pair.b_addr, challenge.nonce()), Some(b_id));

        let handshake = pair
            .a
            .accept_challenge(b_id, pair.b_addr, &challenge, &pair.a_record)
            .unwrap();

        let (_, plaintext) = pair
            .b
            .accept_handshake(pair.a_addr, &transmit(&handshake, &b_id), Some(pair.a_record.clone()))
            .unwrap();
        assert_eq!(plaintext, b"first");

        let packets = pair.a.flush_pending(&b_id, pair.b_addr).unwrap();
        let session = pair.b.get(&a_id, pair.a_addr).unwrap();
        assert_eq!(
            session.decrypt(&transmit(&packets[0], &b_id)).unwrap(),
            b"second"
        );
    }

    #[test]
    fn established_session_can_be_rekeyed() {
        let mut pair = handshake();
        let a_id = pair.a_record.node_id();
        let b_id = pair.b_record.node_id();

        // A lost its session and probes again.
        pair.a.remove(&b_id, pair.b_addr);
        let Outbound::Probe(probe) = pair
            .a
            .outbound(&pair.b_record, pair.b_addr, b"again".to_vec())
            .unwrap()
        else {
            panic!("expected a probe");
        };
        let probe = transmit(&probe, &b_id);

        let session = pair.b.get(&a_id, pair.a_addr).unwrap();
        assert!(session.decrypt(&probe).is_err());
        assert_eq!(session.failures(), 1);

        let challenge = pair
            .b
            .challenge(a_id, pair.a_addr, *probe.nonce(), 0)
            .unwrap()
            .unwrap();

        // Old keys stay until the new handshake verifies.
        assert!(pair.b.get(&a_id, pair.a_addr).unwrap().is_established());

        let handshake = pair
            .a
            .accept_challenge(b_id, pair.b_addr, &transmit(&challenge, &a_id), &pair.a_record)
            .unwrap();
        let (_, plaintext) = pair
            .b
            .accept_handshake(pair.a_addr, &transmit(&handshake, &b_id), Some(pair.a_record.clone()))
            .unwrap();

        assert_eq!(plaintext, b"again");
        assert_eq!(pair.b.get(&a_id, pair.a_addr).unwrap().failures(), 0);
    }

    #[test]
    fn simultaneous_probes_lower_id_initiates() {
        let a_signer = random_signing_key();
        let b_signer = random_signing_key();
        let a_record = record(&a_signer, 1000);
        let b_record = record(&b_signer, 2000);
        let a_addr = a_record.udp_socket().unwrap();
        let b_addr = b_record.udp_socket().unwrap();
        let a_id = a_record.node_id();
        let b_id = b_record.node_id();

        let mut a = manager(a_signer);
        let mut b = manager(b_signer);

        let Outbound::Probe(a_probe) = a.outbound(&b_record, b_addr, b"from a".to_vec()).unwrap()
        else {
            panic!("expected a probe");
        };
        let Outbound::Probe(b_probe) = b.outbound(&a_record, a_addr, b"from b".to_vec()).unwrap()
        else {
            panic!("expected a probe");
        };

        let a_challenge = a.challenge(b_id, b_addr, *b_probe.nonce(), 0).unwrap();
        let b_challenge = b.challenge(a_id, a_addr, *a_probe.nonce(), 0).unwrap();

        // Exactly one side answers, the other keeps initiating.
        assert_eq!(a_challenge.is_some(), a_id > b_id);
        assert_eq!(b_challenge.is_some(), b_id > a_id);
    }

    #[test]
    fn reject_forged_id_signature() {
        let a_signer = random_signing_key();
        let b_signer = random_signing_key();
        let a_record = record(&a_signer, 1000);
        let b_record = record(&b_signer, 2000);
        let a_addr = a_record.udp_socket().unwrap();
        let b_addr = b_record.udp_socket().unwrap();

        let mut a = manager(a_signer);
        let mut b = manager(b_signer);

        let Outbound::Probe(probe) = a.outbound(&b_record, b_addr, b"hello".to_vec()).unwrap()
        else {
            panic!("expected a probe");
        };
        let challenge = b
            .challenge(a_record.node_id(), a_addr, *probe.nonce(), 0)
            .unwrap()
            .unwrap();
        let challenge =
            Packet::decode(&challenge.encode(&a_record.node_id()).unwrap(), a.local_id()).unwrap();

        let mut handshake = a
            .accept_challenge(b_record.node_id(), b_addr, &challenge, &a_record)
            .unwrap();

        if let AuthData::Handshake { signature, .. } = &mut handshake.authdata {
            signature[0] ^= 0xff;
        }
        let handshake =
            Packet::decode(&handshake.encode(&b_record.node_id()).unwrap(), b.local_id()).unwrap();

        assert!(matches!(
            b.accept_handshake(a_addr, &handshake, None),
            Err(SessionError::InvalidIdSignature)
        ));
    }
}
