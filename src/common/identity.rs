//! Identity schemes: how node ids are derived and how records and id proofs are verified.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::common::{Id, PeerRecord, RecordError};

/// Domain separation prefix for handshake id proofs.
pub const ID_SIGNATURE_TEXT: &[u8] = b"kadwire identity proof";

/// Derives node ids from records and verifies signatures made by record owners.
pub trait IdentityScheme: Send + Sync + std::fmt::Debug {
    /// The [Id] a record belongs to.
    fn node_id(&self, record: &PeerRecord) -> Id;

    /// Verify the record's own signature.
    fn verify(&self, record: &PeerRecord) -> Result<(), RecordError>;

    /// Verify a signature over `message` made by the owner of `record`.
    fn verify_id_signature(
        &self,
        record: &PeerRecord,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), RecordError>;
}

#[derive(Debug, Clone, Copy, Default)]
/// Node id = SHA-256(ed25519 public key), ed25519 signatures.
pub struct Ed25519Identity;

impl IdentityScheme for Ed25519Identity {
    fn node_id(&self, record: &PeerRecord) -> Id {
        Id::from_public_key(record.public_key())
    }

    fn verify(&self, record: &PeerRecord) -> Result<(), RecordError> {
        record.verify()
    }

    fn verify_id_signature(
        &self,
        record: &PeerRecord,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), RecordError> {
        let signature: [u8; 64] = signature
            .try_into()
            .map_err(|_| RecordError::InvalidSignature)?;
        let key = VerifyingKey::from_bytes(record.public_key())
            .map_err(|_| RecordError::InvalidPublicKey)?;

        key.verify(message, &Signature::from_bytes(&signature))
            .map_err(|_| RecordError::InvalidSignature)
    }
}

/// The message signed by a handshake initiator to prove ownership of its id.
pub fn id_signature_input(challenge_data: &[u8], ephemeral_key: &[u8], dest_id: &Id) -> [u8; 32] {
    let mut hasher = Sha256::new();

    hasher.update(ID_SIGNATURE_TEXT);
    hasher.update(challenge_data);
    hasher.update(ephemeral_key);
    hasher.update(dest_id.as_bytes());

    hasher.finalize().into()
}

/// Sign a handshake id proof.
pub fn sign_id_proof(
    signer: &SigningKey,
    challenge_data: &[u8],
    ephemeral_key: &[u8],
    dest_id: &Id,
) -> [u8; 64] {
    let input = id_signature_input(challenge_data, ephemeral_key, dest_id);

    signer.sign(&input).to_bytes()
}

#[cfg(test)]
mod tests {
    use crate::common::record::random_signing_key;

    use super::*;

    #[test]
    fn node_id_matches_record() {
        let record = PeerRecord::builder(random_signing_key())
            .udp(9000)
            .build()
            .unwrap();

        assert_eq!(Ed25519Identity.node_id(&record), record.node_id());
        assert!(Ed25519Identity.verify(&record).is_ok());
    }

    #[test]
    fn id_proof() {
        let signer = random_signing_key();
        let record = PeerRecord::builder(signer.clone()).build().unwrap();

        let dest = Id::random();
        let signature = sign_id_proof(&signer, b"challenge", &[7; 32], &dest);
        let input = id_signature_input(b"challenge", &[7; 32], &dest);

        assert!(Ed25519Identity
            .verify_id_signature(&record, &input, &signature)
            .is_ok());

        let other = id_signature_input(b"challenge", &[7; 32], &Id::random());
        assert!(Ed25519Identity
            .verify_id_signature(&record, &other, &signature)
            .is_err());

        assert!(Ed25519Identity
            .verify_id_signature(&record, &input, &signature[..63])
            .is_err());
    }
}
