//! Kademlia node Id or a lookup target
use rand::Rng;
use sha2::{Digest, Sha256};
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 32;
/// The size of node IDs in bits, which is also the largest log2 distance.
pub const MAX_DISTANCE: u16 = ID_SIZE as u16 * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target
pub struct Id([u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE](crate::common::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, InvalidIdSize> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    /// Derive a node Id from an ed25519 public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Id {
        let digest: [u8; ID_SIZE] = Sha256::digest(public_key).into();

        Id(digest)
    }

    /// Bytes of this Id.
    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// Full XOR distance between this Id and another, comparable as
    /// a big-endian unsigned integer.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Simplified (log2) XOR distance between this Id and a target Id.
    ///
    /// The distance is the number of trailing non zero bits in the XOR result.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Id is 256
    /// Distance to an Id with 5 leading matching bits is 251
    pub fn distance(&self, other: &Id) -> u16 {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                // leading zeros so far + leading zeros of this byte
                let leading_zeros = i as u16 * 8 + (a ^ b).leading_zeros() as u16;

                return MAX_DISTANCE - leading_zeros;
            }
        }

        0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = DecodeIdError;

    fn from_str(s: &str) -> Result<Id, DecodeIdError> {
        let bytes = hex::decode(s)?;

        Ok(Id::from_bytes(bytes)?)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("Invalid Id size, expected {ID_SIZE}, got {0}")]
pub struct InvalidIdSize(pub usize);

#[derive(thiserror::Error, Debug)]
/// Failed to parse an [Id] from a hex string.
pub enum DecodeIdError {
    #[error(transparent)]
    InvalidHex(#[from] hex::FromHexError),

    #[error(transparent)]
    InvalidIdSize(#[from] InvalidIdSize),
}
