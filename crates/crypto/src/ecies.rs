//! Integrated encryption of handshake payloads to a static public key.
//!
//! Scheme: ephemeral secp256k1 ECDH, a one-round SP 800-56 concatenation KDF
//! over SHA-256, AES-128-CTR with a random IV, and an HMAC-SHA-256 tag over
//! `iv || ciphertext || shared_mac_data`. Wire layout:
//!
//! ```text
//! ephemeral pubkey (65) || iv (16) || ciphertext || tag (32)
//! ```

use aes::cipher::generic_array::GenericArray;
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{ecdh_x, PUBLIC_KEY_LEN};

/// Bytes the scheme adds on top of the plaintext.
pub const OVERHEAD: usize = PUBLIC_KEY_LEN + 1 + IV_LEN + TAG_LEN;

const KEY_LEN: usize = 16;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Error type for decryption failures.
///
/// Deliberately coarse: a decryption failure aborts the handshake either way
/// and finer distinctions would only aid an attacker.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EciesError {
    #[error("ciphertext shorter than scheme overhead")]
    TooShort,
    #[error("invalid ephemeral public key")]
    InvalidPublicKey,
    #[error("message authentication failed")]
    BadTag,
}

/// Encrypts `plaintext` to the holder of `to`, binding `shared_mac_data`
/// into the authentication tag.
pub fn encrypt<R>(
    rng: &mut R,
    to: &PublicKey,
    plaintext: &[u8],
    shared_mac_data: &[u8],
) -> Vec<u8>
where
    R: CryptoRng + RngCore,
{
    let ephemeral = SecretKey::random(rng);
    let (ke, km) = derive_keys(&ecdh_x(&ephemeral, to));

    let mut iv = [0_u8; IV_LEN];
    rng.fill_bytes(&mut iv);

    let mut body = plaintext.to_vec();
    Aes128Ctr::new(&ke.into(), &iv.into()).apply_keystream(&mut body);

    let point = ephemeral.public_key().to_encoded_point(false);

    let mut out = Vec::with_capacity(point.as_bytes().len() + IV_LEN + body.len() + TAG_LEN);
    out.extend_from_slice(point.as_bytes());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&body);

    let mut mac = hmac_for(&km);
    mac.update(&iv);
    mac.update(&body);
    mac.update(shared_mac_data);
    out.extend_from_slice(&mac.finalize().into_bytes());
    out
}

/// Decrypts a ciphertext produced by [`encrypt`]. The tag is verified in
/// constant time before any plaintext is produced.
///
/// # Errors
///
/// Returns [`EciesError`] if the ciphertext is truncated, the embedded
/// ephemeral key is invalid, or the tag does not match.
pub fn decrypt(
    secret: &SecretKey,
    ciphertext: &[u8],
    shared_mac_data: &[u8],
) -> Result<Vec<u8>, EciesError> {
    if ciphertext.len() < OVERHEAD {
        return Err(EciesError::TooShort);
    }

    let (public, rest) = ciphertext.split_at(PUBLIC_KEY_LEN + 1);
    let (iv, rest) = rest.split_at(IV_LEN);
    let (body, tag) = rest.split_at(rest.len() - TAG_LEN);

    let ephemeral = PublicKey::from_sec1_bytes(public).map_err(|_| EciesError::InvalidPublicKey)?;
    let (ke, km) = derive_keys(&ecdh_x(secret, &ephemeral));

    let mut mac = hmac_for(&km);
    mac.update(iv);
    mac.update(body);
    mac.update(shared_mac_data);
    mac.verify_slice(tag).map_err(|_| EciesError::BadTag)?;

    let mut out = body.to_vec();
    Aes128Ctr::new(&ke.into(), GenericArray::from_slice(iv)).apply_keystream(&mut out);
    Ok(out)
}

/// One round of the concatenation KDF, then an encryption key and a hashed
/// MAC key, exactly as the handshake's key agreement expects.
fn derive_keys(z: &[u8; 32]) -> ([u8; KEY_LEN], [u8; 32]) {
    let mut kdf = Sha256::new();
    kdf.update(1_u32.to_be_bytes());
    kdf.update(z);
    let derived = kdf.finalize();

    let mut ke = [0_u8; KEY_LEN];
    ke.copy_from_slice(&derived[..KEY_LEN]);
    let km = Sha256::digest(&derived[KEY_LEN..]).into();
    (ke, km)
}

fn hmac_for(km: &[u8; 32]) -> HmacSha256 {
    HmacSha256::new_from_slice(km).expect("HMAC accepts keys of any size")
}

#[cfg(test)]
mod tests {
    use eyre::OptionExt;
    use rand::thread_rng;

    use super::*;

    #[test]
    fn test_encrypt_decrypt() -> eyre::Result<()> {
        let mut csprng = thread_rng();
        let recipient = SecretKey::random(&mut csprng);

        let payload = b"auth message body";
        let prefix = [0x01, 0x02];

        let ciphertext = encrypt(&mut csprng, &recipient.public_key(), payload, &prefix);
        assert_eq!(ciphertext.len(), payload.len() + OVERHEAD);

        let decrypted = decrypt(&recipient, &ciphertext, &prefix)?;
        assert_eq!(decrypted, payload);
        Ok(())
    }

    #[test]
    fn test_decrypt_with_wrong_key() -> eyre::Result<()> {
        let mut csprng = thread_rng();
        let recipient = SecretKey::random(&mut csprng);
        let other = SecretKey::random(&mut csprng);

        let ciphertext = encrypt(&mut csprng, &recipient.public_key(), b"secret", b"");

        let err = decrypt(&other, &ciphertext, b"").err().ok_or_eyre("no error")?;
        assert!(matches!(err, EciesError::BadTag));
        Ok(())
    }

    #[test]
    fn test_tag_binds_shared_mac_data() -> eyre::Result<()> {
        let mut csprng = thread_rng();
        let recipient = SecretKey::random(&mut csprng);

        let ciphertext = encrypt(&mut csprng, &recipient.public_key(), b"secret", b"prefix");

        let err = decrypt(&recipient, &ciphertext, b"other")
            .err()
            .ok_or_eyre("no error")?;
        assert!(matches!(err, EciesError::BadTag));
        Ok(())
    }

    #[test]
    fn test_tampered_ciphertext_is_rejected() -> eyre::Result<()> {
        let mut csprng = thread_rng();
        let recipient = SecretKey::random(&mut csprng);

        let mut ciphertext = encrypt(&mut csprng, &recipient.public_key(), b"secret", b"");
        let mid = PUBLIC_KEY_LEN + 1 + IV_LEN + 2;
        ciphertext[mid] ^= 0x01;

        let err = decrypt(&recipient, &ciphertext, b"").err().ok_or_eyre("no error")?;
        assert!(matches!(err, EciesError::BadTag));
        Ok(())
    }

    #[test]
    fn test_truncated_ciphertext_is_rejected() {
        let mut csprng = thread_rng();
        let recipient = SecretKey::random(&mut csprng);

        assert!(matches!(
            decrypt(&recipient, &[0_u8; OVERHEAD - 1], b""),
            Err(EciesError::TooShort)
        ));
    }
}
