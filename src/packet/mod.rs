//! Packet framing: static header, authdata, masking and size validation.
//!
//! ```text
//! packet        = masking-iv || masked-header || body
//! masked-header = chacha20(dest-id, masking-iv) applied to (static-header || authdata)
//! static-header = protocol-id || version || flag || nonce || authdata-size
//! ```
//!
//! The body of an ordinary or handshake packet is the AES-GCM ciphertext of a
//! [Message](crate::common::Message), see [crate::session].

use std::convert::TryInto;

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use rand::Rng;

use crate::common::{Id, PeerRecord, RecordError, ID_SIZE};

pub const PROTOCOL_ID: &[u8; 7] = b"kadwire";
pub const VERSION: u16 = 1;

pub const MASKING_IV_SIZE: usize = 12;
pub const NONCE_SIZE: usize = 12;
pub const ID_NONCE_SIZE: usize = 16;
/// protocol-id (7) + version (2) + flag (1) + nonce (12) + authdata-size (2)
pub const STATIC_HEADER_SIZE: usize = PROTOCOL_ID.len() + 2 + 1 + NONCE_SIZE + 2;

pub const ORDINARY_AUTHDATA_SIZE: usize = ID_SIZE;
pub const CHALLENGE_AUTHDATA_SIZE: usize = ID_NONCE_SIZE + 8;
/// src-id (32) + sig-size (1) + key-size (1)
pub const HANDSHAKE_AUTHDATA_HEAD_SIZE: usize = ID_SIZE + 2;

/// AES-GCM authentication tag size.
pub const TAG_SIZE: usize = 16;

/// The smallest valid packet, a challenge.
pub const MIN_PACKET_SIZE: usize = MASKING_IV_SIZE + STATIC_HEADER_SIZE + CHALLENGE_AUTHDATA_SIZE;
pub const MAX_PACKET_SIZE: usize = 1280;

/// The largest encoded message that fits in an ordinary packet.
pub const MAX_MESSAGE_SIZE: usize =
    MAX_PACKET_SIZE - MASKING_IV_SIZE - STATIC_HEADER_SIZE - ORDINARY_AUTHDATA_SIZE - TAG_SIZE;

/// Size of the random body of a handshake probe.
const RANDOM_BODY_SIZE: usize = 44;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
/// The closed set of packet kinds, carried in the static header flag.
pub enum PacketKind {
    /// Encrypted message with an established session, or a handshake probe.
    Ordinary = 0,
    /// "Who are you": asks the sender to prove its identity.
    Challenge = 1,
    /// Identity proof plus ephemeral key, carrying an encrypted message.
    Handshake = 2,
}

impl TryFrom<u8> for PacketKind {
    type Error = PacketError;

    fn try_from(flag: u8) -> Result<Self, Self::Error> {
        match flag {
            0 => Ok(PacketKind::Ordinary),
            1 => Ok(PacketKind::Challenge),
            2 => Ok(PacketKind::Handshake),
            flag => Err(PacketError::UnknownFlag(flag)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticHeader {
    pub kind: PacketKind,
    pub nonce: [u8; NONCE_SIZE],
    pub authdata_size: u16,
}

impl StaticHeader {
    fn to_bytes(&self) -> [u8; STATIC_HEADER_SIZE] {
        let mut bytes = [0_u8; STATIC_HEADER_SIZE];

        bytes[0..7].copy_from_slice(PROTOCOL_ID);
        bytes[7..9].copy_from_slice(&VERSION.to_be_bytes());
        bytes[9] = self.kind as u8;
        bytes[10..22].copy_from_slice(&self.nonce);
        bytes[22..24].copy_from_slice(&self.authdata_size.to_be_bytes());

        bytes
    }

    fn from_bytes(bytes: &[u8; STATIC_HEADER_SIZE]) -> Result<Self, PacketError> {
        if &bytes[0..7] != PROTOCOL_ID {
            return Err(PacketError::InvalidProtocolId);
        }

        let version = u16::from_be_bytes([bytes[7], bytes[8]]);
        if version != VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }

        let kind = PacketKind::try_from(bytes[9])?;

        let mut nonce = [0_u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[10..22]);

        Ok(StaticHeader {
            kind,
            nonce,
            authdata_size: u16::from_be_bytes([bytes[22], bytes[23]]),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthData {
    Ordinary {
        src_id: Id,
    },
    Challenge {
        id_nonce: [u8; ID_NONCE_SIZE],
        /// Sequence number of the sender's record the challenger knows, 0 if none.
        enr_seq: u64,
    },
    Handshake {
        src_id: Id,
        signature: Vec<u8>,
        ephemeral_key: Vec<u8>,
        record: Option<PeerRecord>,
    },
}

impl AuthData {
    pub fn kind(&self) -> PacketKind {
        match self {
            AuthData::Ordinary { .. } => PacketKind::Ordinary,
            AuthData::Challenge { .. } => PacketKind::Challenge,
            AuthData::Handshake { .. } => PacketKind::Handshake,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, PacketError> {
        Ok(match self {
            AuthData::Ordinary { src_id } => src_id.to_vec(),
            AuthData::Challenge { id_nonce, enr_seq } => {
                let mut bytes = Vec::with_capacity(CHALLENGE_AUTHDATA_SIZE);
                bytes.extend_from_slice(id_nonce);
                bytes.extend_from_slice(&enr_seq.to_be_bytes());
                bytes
            }
            AuthData::Handshake {
                src_id,
                signature,
                ephemeral_key,
                record,
            } => {
                let signature_size: u8 = signature
                    .len()
                    .try_into()
                    .map_err(|_| PacketError::InvalidAuthData(PacketKind::Handshake))?;
                let key_size: u8 = ephemeral_key
                    .len()
                    .try_into()
                    .map_err(|_| PacketError::InvalidAuthData(PacketKind::Handshake))?;

                let mut bytes = Vec::with_capacity(HANDSHAKE_AUTHDATA_HEAD_SIZE + 96);
                bytes.extend_from_slice(src_id.as_bytes());
                bytes.push(signature_size);
                bytes.push(key_size);
                bytes.extend_from_slice(signature);
                bytes.extend_from_slice(ephemeral_key);

                if let Some(record) = record {
                    bytes.extend_from_slice(&record.to_bytes()?);
                }

                bytes
            }
        })
    }

    fn from_bytes(kind: PacketKind, bytes: &[u8]) -> Result<Self, PacketError> {
        match kind {
            PacketKind::Ordinary => {
                if bytes.len() != ORDINARY_AUTHDATA_SIZE {
                    return Err(PacketError::InvalidAuthData(kind));
                }

                Ok(AuthData::Ordinary {
                    src_id: Id::from_bytes(bytes).map_err(|_| PacketError::InvalidAuthData(kind))?,
                })
            }
            PacketKind::Challenge => {
                if bytes.len() != CHALLENGE_AUTHDATA_SIZE {
                    return Err(PacketError::InvalidAuthData(kind));
                }

                let mut id_nonce = [0_u8; ID_NONCE_SIZE];
                id_nonce.copy_from_slice(&bytes[..ID_NONCE_SIZE]);

                let enr_seq: [u8; 8] = bytes[ID_NONCE_SIZE..]
                    .try_into()
                    .map_err(|_| PacketError::InvalidAuthData(kind))?;

                Ok(AuthData::Challenge {
                    id_nonce,
                    enr_seq: u64::from_be_bytes(enr_seq),
                })
            }
            PacketKind::Handshake => {
                if bytes.len() < HANDSHAKE_AUTHDATA_HEAD_SIZE {
                    return Err(PacketError::InvalidAuthData(kind));
                }

                let src_id = Id::from_bytes(&bytes[..ID_SIZE])
                    .map_err(|_| PacketError::InvalidAuthData(kind))?;
                let signature_size = bytes[ID_SIZE] as usize;
                let key_size = bytes[ID_SIZE + 1] as usize;

                let signature_start = HANDSHAKE_AUTHDATA_HEAD_SIZE;
                let key_start = signature_start + signature_size;
                let record_start = key_start + key_size;

                if bytes.len() < record_start {
                    return Err(PacketError::InvalidAuthData(kind));
                }

                let record = if bytes.len() > record_start {
                    Some(PeerRecord::from_bytes(&bytes[record_start..])?)
                } else {
                    None
                };

                Ok(AuthData::Handshake {
                    src_id,
                    signature: bytes[signature_start..key_start].to_vec(),
                    ephemeral_key: bytes[key_start..record_start].to_vec(),
                    record,
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A decoded (unmasked) packet. The body stays encrypted.
pub struct Packet {
    pub masking_iv: [u8; MASKING_IV_SIZE],
    pub header: StaticHeader,
    pub authdata: AuthData,
    pub body: Vec<u8>,
}

impl Packet {
    fn new(nonce: [u8; NONCE_SIZE], authdata: AuthData) -> Result<Packet, PacketError> {
        let authdata_size = authdata
            .to_bytes()?
            .len()
            .try_into()
            .map_err(|_| PacketError::InvalidAuthData(authdata.kind()))?;

        Ok(Packet {
            masking_iv: rand::thread_rng().gen(),
            header: StaticHeader {
                kind: authdata.kind(),
                nonce,
                authdata_size,
            },
            authdata,
            body: vec![],
        })
    }

    /// Header for an encrypted message, the caller sets the body to the ciphertext.
    pub fn ordinary(src_id: Id, nonce: [u8; NONCE_SIZE]) -> Packet {
        Packet {
            masking_iv: rand::thread_rng().gen(),
            header: StaticHeader {
                kind: PacketKind::Ordinary,
                nonce,
                authdata_size: ORDINARY_AUTHDATA_SIZE as u16,
            },
            authdata: AuthData::Ordinary { src_id },
            body: vec![],
        }
    }

    /// An ordinary packet with a random nonce and body, that the recipient
    /// can not decrypt and answers with a challenge.
    pub fn random(src_id: Id) -> Packet {
        let mut rng = rand::thread_rng();

        let mut body = vec![0_u8; RANDOM_BODY_SIZE];
        rng.fill(&mut body[..]);

        let mut packet = Packet::ordinary(src_id, rng.gen());
        packet.body = body;

        packet
    }

    pub fn challenge(nonce: [u8; NONCE_SIZE], id_nonce: [u8; ID_NONCE_SIZE], enr_seq: u64) -> Packet {
        Packet {
            masking_iv: rand::thread_rng().gen(),
            header: StaticHeader {
                kind: PacketKind::Challenge,
                nonce,
                authdata_size: CHALLENGE_AUTHDATA_SIZE as u16,
            },
            authdata: AuthData::Challenge { id_nonce, enr_seq },
            body: vec![],
        }
    }

    pub fn handshake(
        src_id: Id,
        nonce: [u8; NONCE_SIZE],
        signature: Vec<u8>,
        ephemeral_key: Vec<u8>,
        record: Option<PeerRecord>,
    ) -> Result<Packet, PacketError> {
        Packet::new(
            nonce,
            AuthData::Handshake {
                src_id,
                signature,
                ephemeral_key,
                record,
            },
        )
    }

    // === Getters ===

    pub fn kind(&self) -> PacketKind {
        self.header.kind
    }

    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.header.nonce
    }

    /// The sender id, for packet kinds that carry one.
    pub fn src_id(&self) -> Option<Id> {
        match &self.authdata {
            AuthData::Ordinary { src_id } | AuthData::Handshake { src_id, .. } => Some(*src_id),
            AuthData::Challenge { .. } => None,
        }
    }

    /// `masking-iv || static-header || authdata`, all unmasked.
    ///
    /// This is the additional authenticated data of the body, and, for a
    /// challenge, the challenge data both sides feed into key derivation.
    pub fn aad(&self) -> Result<Vec<u8>, PacketError> {
        let authdata = self.authdata.to_bytes()?;

        let mut aad = Vec::with_capacity(MASKING_IV_SIZE + STATIC_HEADER_SIZE + authdata.len());
        aad.extend_from_slice(&self.masking_iv);
        aad.extend_from_slice(&self.header.to_bytes());
        aad.extend_from_slice(&authdata);

        Ok(aad)
    }

    // === Public Methods ===

    /// Mask the header with the destination id and append the body.
    pub fn encode(&self, dest_id: &Id) -> Result<Vec<u8>, PacketError> {
        let mut bytes = self.aad()?;

        let mut cipher = masking_cipher(dest_id, &self.masking_iv);
        cipher.apply_keystream(&mut bytes[MASKING_IV_SIZE..]);

        bytes.extend_from_slice(&self.body);

        validate_size(&bytes)?;

        Ok(bytes)
    }

    /// Unmask and parse a packet addressed to `local_id`.
    pub fn decode(bytes: &[u8], local_id: &Id) -> Result<Packet, PacketError> {
        validate_size(bytes)?;

        let (masking_iv, header, mut cipher) = unmask_static_header(bytes, local_id)?;

        let authdata_start = MASKING_IV_SIZE + STATIC_HEADER_SIZE;
        let authdata_end = authdata_start + header.authdata_size as usize;

        if bytes.len() < authdata_end {
            return Err(PacketError::Truncated);
        }

        let mut authdata = bytes[authdata_start..authdata_end].to_vec();
        cipher.apply_keystream(&mut authdata);

        let authdata = AuthData::from_bytes(header.kind, &authdata)?;

        Ok(Packet {
            masking_iv,
            header,
            authdata,
            body: bytes[authdata_end..].to_vec(),
        })
    }
}

/// Rejects packets outside `MIN_PACKET_SIZE..=MAX_PACKET_SIZE`.
pub fn validate_size(bytes: &[u8]) -> Result<(), PacketError> {
    let size = bytes.len();

    if size < MIN_PACKET_SIZE {
        return Err(PacketError::TooSmall(size));
    }
    if size > MAX_PACKET_SIZE {
        return Err(PacketError::TooLarge(size));
    }

    Ok(())
}

/// Unmask and parse only the static header, without touching authdata or body.
pub fn parse_static_header(
    bytes: &[u8],
    local_id: &Id,
) -> Result<([u8; MASKING_IV_SIZE], StaticHeader), PacketError> {
    let (masking_iv, header, _) = unmask_static_header(bytes, local_id)?;

    Ok((masking_iv, header))
}

fn unmask_static_header(
    bytes: &[u8],
    local_id: &Id,
) -> Result<([u8; MASKING_IV_SIZE], StaticHeader, ChaCha20), PacketError> {
    if bytes.len() < MASKING_IV_SIZE + STATIC_HEADER_SIZE {
        return Err(PacketError::Truncated);
    }

    let mut masking_iv = [0_u8; MASKING_IV_SIZE];
    masking_iv.copy_from_slice(&bytes[..MASKING_IV_SIZE]);

    let mut header = [0_u8; STATIC_HEADER_SIZE];
    header.copy_from_slice(&bytes[MASKING_IV_SIZE..MASKING_IV_SIZE + STATIC_HEADER_SIZE]);

    let mut cipher = masking_cipher(local_id, &masking_iv);
    cipher.apply_keystream(&mut header);

    Ok((masking_iv, StaticHeader::from_bytes(&header)?, cipher))
}

fn masking_cipher(dest_id: &Id, masking_iv: &[u8; MASKING_IV_SIZE]) -> ChaCha20 {
    ChaCha20::new(
        chacha20::Key::from_slice(dest_id.as_bytes()),
        chacha20::Nonce::from_slice(masking_iv),
    )
}

#[derive(thiserror::Error, Debug)]
/// Malformed packets, dropped at the receive boundary.
pub enum PacketError {
    #[error("Packet too small: {0} bytes")]
    TooSmall(usize),

    #[error("Packet too large: {0} bytes")]
    TooLarge(usize),

    #[error("Packet is truncated")]
    Truncated,

    #[error("Invalid protocol id")]
    InvalidProtocolId,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("Unknown packet flag: {0}")]
    UnknownFlag(u8),

    #[error("Invalid authdata for {0:?} packet")]
    InvalidAuthData(PacketKind),

    #[error("Invalid record in handshake authdata: {0}")]
    Record(#[from] RecordError),
}
