//! Key agreement, key schedule and message encryption.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use ed25519_dalek::{SigningKey, VerifyingKey};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::common::Id;
use crate::packet::NONCE_SIZE;

use super::SessionError;

/// Domain separation prefix of the key schedule.
pub const KEY_AGREEMENT_TEXT: &[u8] = b"kadwire key agreement";

pub const KEY_SIZE: usize = 16;
pub const EPHEMERAL_KEY_SIZE: usize = 32;

#[derive(Clone, PartialEq, Eq)]
/// Symmetric keys of a session, named after the side that encrypts with them.
pub struct SharedKeys {
    pub initiator_key: [u8; KEY_SIZE],
    pub recipient_key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for SharedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKeys(..)")
    }
}

/// Split 32 bytes of key material into the initiator key (first half)
/// and the recipient key (second half).
pub fn derive_keys(material: [u8; 32]) -> SharedKeys {
    let mut initiator_key = [0_u8; KEY_SIZE];
    let mut recipient_key = [0_u8; KEY_SIZE];

    initiator_key.copy_from_slice(&material[..KEY_SIZE]);
    recipient_key.copy_from_slice(&material[KEY_SIZE..]);

    SharedKeys {
        initiator_key,
        recipient_key,
    }
}

/// HKDF-SHA256 over an ECDH secret, salted with the challenge data.
pub fn key_schedule(
    secret: &[u8; 32],
    challenge_data: &[u8],
    initiator_id: &Id,
    recipient_id: &Id,
) -> Result<SharedKeys, SessionError> {
    let mut info = Vec::with_capacity(KEY_AGREEMENT_TEXT.len() + 64);
    info.extend_from_slice(KEY_AGREEMENT_TEXT);
    info.extend_from_slice(initiator_id.as_bytes());
    info.extend_from_slice(recipient_id.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(challenge_data), secret);

    let mut material = [0_u8; 32];
    hkdf.expand(&info, &mut material)
        .map_err(|_| SessionError::KeyDerivation)?;

    Ok(derive_keys(material))
}

/// Initiator side: a fresh ephemeral key against the recipient's static key.
///
/// Returns the shared secret and the ephemeral public key to send.
pub fn ecdh_initiator(
    remote_public_key: &[u8; 32],
) -> Result<([u8; 32], [u8; EPHEMERAL_KEY_SIZE]), SessionError> {
    let remote = VerifyingKey::from_bytes(remote_public_key)
        .map_err(|_| SessionError::InvalidPublicKey)?;
    let remote = PublicKey::from(remote.to_montgomery().to_bytes());

    let ephemeral = EphemeralSecret::random_from_rng(rand::thread_rng());
    let ephemeral_public = PublicKey::from(&ephemeral);

    let secret = ephemeral.diffie_hellman(&remote);
    if !secret.was_contributory() {
        return Err(SessionError::InvalidPublicKey);
    }

    Ok((secret.to_bytes(), ephemeral_public.to_bytes()))
}

/// Recipient side: the local static key against the initiator's ephemeral key.
pub fn ecdh_recipient(
    local_signer: &SigningKey,
    ephemeral_key: &[u8],
) -> Result<[u8; 32], SessionError> {
    let ephemeral: [u8; EPHEMERAL_KEY_SIZE] = ephemeral_key
        .try_into()
        .map_err(|_| SessionError::InvalidEphemeralKey)?;

    let local = StaticSecret::from(local_signer.to_scalar_bytes());
    let secret = local.diffie_hellman(&PublicKey::from(ephemeral));

    if !secret.was_contributory() {
        return Err(SessionError::InvalidEphemeralKey);
    }

    Ok(secret.to_bytes())
}

pub fn encrypt_message(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, SessionError> {
    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| SessionError::Encryption)?;

    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| SessionError::Encryption)
}

pub fn decrypt_message(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, SessionError> {
    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| SessionError::Decryption)?;

    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| SessionError::Decryption)
}

#[cfg(test)]
mod tests {
    use crate::common::record::random_signing_key;

    use super::*;

    #[test]
    fn key_split() {
        for _ in 0..16 {
            let material: [u8; 32] = rand::random();
            let keys = derive_keys(material);

            assert_eq!(keys.initiator_key.len(), 16);
            assert_eq!(keys.recipient_key.len(), 16);

            let joined = [keys.initiator_key, keys.recipient_key].concat();
            assert_eq!(joined, material);
        }
    }

    #[test]
    fn both_sides_agree() {
        let recipient = random_signing_key();
        let initiator_id = Id::random();
        let recipient_id = Id::from_public_key(&recipient.verifying_key().to_bytes());

        let (initiator_secret, ephemeral_key) =
            ecdh_initiator(&recipient.verifying_key().to_bytes()).unwrap();
        let recipient_secret = ecdh_recipient(&recipient, &ephemeral_key).unwrap();

        assert_eq!(initiator_secret, recipient_secret);

        let a = key_schedule(&initiator_secret, b"challenge", &initiator_id, &recipient_id).unwrap();
        let b = key_schedule(&recipient_secret, b"challenge", &initiator_id, &recipient_id).unwrap();
        assert_eq!(a, b);

        let c = key_schedule(&recipient_secret, b"other", &initiator_id, &recipient_id).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn encrypt_then_decrypt() {
        let key = [1_u8; KEY_SIZE];
        let nonce = [2_u8; NONCE_SIZE];

        let ciphertext = encrypt_message(&key, &nonce, b"hello", b"header").unwrap();

        assert_eq!(
            decrypt_message(&key, &nonce, &ciphertext, b"header").unwrap(),
            b"hello"
        );
        assert!(decrypt_message(&key, &nonce, &ciphertext, b"tampered").is_err());
        assert!(decrypt_message(&[3; KEY_SIZE], &nonce, &ciphertext, b"header").is_err());
    }
}
