//! Signed, extensible peer records.
//!
//! A record is a sorted map of entries, a sequence number, and an ed25519
//! signature over both. It is encoded as a bencode dictionary, so entries are
//! naturally sorted by key and every value is a length-prefixed byte string.

use std::collections::BTreeMap;
use std::convert::TryInto;
use std::fmt::{self, Debug, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::common::Id;

/// Largest encoded record accepted or produced.
pub const MAX_RECORD_SIZE: usize = 300;

/// The only identity scheme supported so far.
pub const ID_SCHEME: &[u8] = b"ed25519";

/// Identity scheme entry.
pub const KEY_ID: &str = "id";
/// ed25519 public key entry.
pub const KEY_PUBLIC_KEY: &str = "pk";
/// IPv4 or IPv6 address entry.
pub const KEY_IP: &str = "ip";
/// UDP port entry, big endian.
pub const KEY_UDP: &str = "udp";
/// Attestation subnets bitfield entry.
pub const KEY_ATTNETS: &str = "attnets";

#[derive(Clone, PartialEq, Eq)]
/// A signed peer record.
pub struct PeerRecord {
    id: Id,
    public_key: [u8; 32],
    seq: u64,
    entries: BTreeMap<String, Bytes>,
    signature: [u8; 64],
}

impl PeerRecord {
    /// Start building a record signed by `signer`.
    pub fn builder(signer: SigningKey) -> PeerRecordBuilder {
        PeerRecordBuilder::new(signer)
    }

    // === Getters ===

    /// Node [Id] derived from this record's public key.
    pub fn node_id(&self) -> Id {
        self.id
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn signature(&self) -> &[u8; 64] {
        &self.signature
    }

    /// Returns the raw value of an entry, if present.
    pub fn get_entry(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(|value| value.as_ref())
    }

    /// Iterate over all entries, sorted by key.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_ref()))
    }

    pub fn ip(&self) -> Option<IpAddr> {
        let bytes = self.get_entry(KEY_IP)?;

        match bytes.len() {
            4 => {
                let octets: [u8; 4] = bytes.try_into().ok()?;
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            16 => {
                let octets: [u8; 16] = bytes.try_into().ok()?;
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }

    pub fn udp(&self) -> Option<u16> {
        let bytes: [u8; 2] = self.get_entry(KEY_UDP)?.try_into().ok()?;

        Some(u16::from_be_bytes(bytes))
    }

    /// The UDP endpoint of this peer, if both `ip` and `udp` entries are present.
    pub fn udp_socket(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.ip()?, self.udp()?))
    }

    pub fn attnets(&self) -> Option<&[u8]> {
        self.get_entry(KEY_ATTNETS)
    }

    // === Public Methods ===

    /// Check the signature over this record's entries and sequence number.
    pub fn verify(&self) -> Result<(), RecordError> {
        let key =
            VerifyingKey::from_bytes(&self.public_key).map_err(|_| RecordError::InvalidPublicKey)?;
        let signable = encode_signable(&self.entries, self.seq)?;

        key.verify(&signable, &Signature::from_bytes(&self.signature))
            .map_err(|_| RecordError::InvalidSignature)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RecordError> {
        Ok(serde_bencode::to_bytes(&RecordWire {
            entries: self.entries.clone(),
            seq: self.seq,
            signature: Bytes::copy_from_slice(&self.signature),
        })?)
    }

    /// Decode a record. The signature is not checked, see [Self::verify].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<PeerRecord, RecordError> {
        let bytes = bytes.as_ref();

        if bytes.len() > MAX_RECORD_SIZE {
            return Err(RecordError::TooLarge(bytes.len()));
        }

        let wire: RecordWire = serde_bencode::from_bytes(bytes)?;

        let signature: [u8; 64] = wire
            .signature
            .as_ref()
            .try_into()
            .map_err(|_| RecordError::InvalidSignature)?;

        if wire.entries.get(KEY_ID).map(|scheme| scheme.as_ref()) != Some(ID_SCHEME) {
            return Err(RecordError::UnsupportedIdScheme);
        }

        let public_key: [u8; 32] = wire
            .entries
            .get(KEY_PUBLIC_KEY)
            .ok_or(RecordError::MissingPublicKey)?
            .as_ref()
            .try_into()
            .map_err(|_| RecordError::InvalidPublicKey)?;

        Ok(PeerRecord {
            id: Id::from_public_key(&public_key),
            public_key,
            seq: wire.seq,
            entries: wire.entries,
            signature,
        })
    }
}

impl Debug for PeerRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRecord")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("ip", &self.ip())
            .field("udp", &self.udp())
            .finish()
    }
}

/// Builds and signs a [PeerRecord].
///
/// The signing key is required up front, so every built record is signed.
#[derive(Clone)]
pub struct PeerRecordBuilder {
    signer: SigningKey,
    seq: u64,
    entries: BTreeMap<String, Bytes>,
}

impl PeerRecordBuilder {
    pub fn new(signer: SigningKey) -> Self {
        Self {
            signer,
            seq: 1,
            entries: BTreeMap::new(),
        }
    }

    pub fn seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn ip(self, ip: IpAddr) -> Self {
        let bytes = match ip {
            IpAddr::V4(ip) => Bytes::copy_from_slice(&ip.octets()),
            IpAddr::V6(ip) => Bytes::copy_from_slice(&ip.octets()),
        };

        self.entry(KEY_IP, bytes)
    }

    pub fn udp(self, port: u16) -> Self {
        self.entry(KEY_UDP, Bytes::copy_from_slice(&port.to_be_bytes()))
    }

    /// Set both `ip` and `udp` entries.
    pub fn address(self, address: SocketAddr) -> Self {
        self.ip(address.ip()).udp(address.port())
    }

    pub fn attnets(self, bitfield: &[u8]) -> Self {
        self.entry(KEY_ATTNETS, Bytes::copy_from_slice(bitfield))
    }

    /// Set an arbitrary entry. `id` and `pk` are always overwritten by [Self::build].
    pub fn entry(mut self, key: &str, value: impl Into<Bytes>) -> Self {
        self.entries.insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> Result<PeerRecord, RecordError> {
        let PeerRecordBuilder {
            signer,
            seq,
            mut entries,
        } = self;

        let public_key = signer.verifying_key().to_bytes();

        entries.insert(KEY_ID.to_string(), Bytes::from_static(ID_SCHEME));
        entries.insert(
            KEY_PUBLIC_KEY.to_string(),
            Bytes::copy_from_slice(&public_key),
        );

        let signable = encode_signable(&entries, seq)?;
        let signature = signer.sign(&signable).to_bytes();

        let record = PeerRecord {
            id: Id::from_public_key(&public_key),
            public_key,
            seq,
            entries,
            signature,
        };

        let size = record.to_bytes()?.len();
        if size > MAX_RECORD_SIZE {
            return Err(RecordError::TooLarge(size));
        }

        Ok(record)
    }
}

#[derive(Serialize, Deserialize)]
struct RecordWire {
    #[serde(rename = "e")]
    entries: BTreeMap<String, Bytes>,
    #[serde(rename = "q")]
    seq: u64,
    #[serde(rename = "s")]
    signature: Bytes,
}

#[derive(Serialize)]
struct Signable<'a> {
    #[serde(rename = "e")]
    entries: &'a BTreeMap<String, Bytes>,
    #[serde(rename = "q")]
    seq: u64,
}

fn encode_signable(entries: &BTreeMap<String, Bytes>, seq: u64) -> Result<Vec<u8>, RecordError> {
    Ok(serde_bencode::to_bytes(&Signable { entries, seq })?)
}

#[derive(thiserror::Error, Debug)]
/// Errors decoding, building or verifying a [PeerRecord].
pub enum RecordError {
    #[error("Failed to encode or decode record: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("Record is too large: {0} bytes")]
    TooLarge(usize),

    #[error("Unsupported identity scheme")]
    UnsupportedIdScheme,

    #[error("Record is missing its public key")]
    MissingPublicKey,

    #[error("Invalid ed25519 public key")]
    InvalidPublicKey,

    #[error("Invalid record signature")]
    InvalidSignature,
}

#[cfg(test)]
pub(crate) fn random_signing_key() -> SigningKey {
    use rand::Rng;

    SigningKey::from_bytes(&rand::thread_rng().gen())
}
