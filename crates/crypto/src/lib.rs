use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha3::{Digest, Keccak256};
use thiserror::Error;

pub use k256::{self, PublicKey, SecretKey};
pub use sha3;

pub mod ecies;

/// Length of a recoverable signature: `r || s || v`.
pub const SIGNATURE_LEN: usize = 65;

/// Length of an uncompressed public key without the SEC1 format byte.
pub const PUBLIC_KEY_LEN: usize = 64;

/// Keccak-256 digest length.
pub const DIGEST_LEN: usize = 32;

/// Error type for public key import failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeyError {
    /// The encoding is neither 64 bytes (raw) nor 65 bytes (SEC1 uncompressed).
    #[error("invalid public key length {0} (expect 64/65)")]
    InvalidLength(usize),
    /// The bytes do not describe a point on the secp256k1 curve.
    #[error("invalid public key: not a point on the curve")]
    InvalidPoint,
}

/// Error type for recoverable signature operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SignatureError {
    #[error("signing failed")]
    Signing,
    #[error("malformed signature")]
    Malformed,
    #[error("public key recovery failed")]
    Recovery,
}

/// Computes the Keccak-256 digest over the concatenation of `parts`.
#[must_use]
pub fn keccak256(parts: &[&[u8]]) -> [u8; DIGEST_LEN] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Performs ECDH between `secret` and `public` and returns the x coordinate
/// of the shared point, left-padded to 32 bytes.
#[must_use]
pub fn ecdh_x(secret: &SecretKey, public: &PublicKey) -> [u8; 32] {
    let shared = k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
    let mut x = [0_u8; 32];
    x.copy_from_slice(shared.raw_secret_bytes().as_slice());
    x
}

/// Signs a 32-byte prehashed message, producing a 65-byte recoverable
/// signature `r || s || v`.
///
/// # Errors
///
/// Returns [`SignatureError::Signing`] if the key rejects the digest.
pub fn sign_recoverable(
    secret: &SecretKey,
    digest: &[u8; DIGEST_LEN],
) -> Result<[u8; SIGNATURE_LEN], SignatureError> {
    let (signature, recovery_id) = SigningKey::from(secret)
        .sign_prehash_recoverable(digest)
        .map_err(|_| SignatureError::Signing)?;

    let mut out = [0_u8; SIGNATURE_LEN];
    out[..64].copy_from_slice(&signature.to_bytes());
    out[64] = recovery_id.to_byte();
    Ok(out)
}

/// Recovers the public key that produced `signature` over `digest`.
///
/// # Errors
///
/// Returns [`SignatureError::Malformed`] if the signature bytes do not parse
/// and [`SignatureError::Recovery`] if no key can be recovered.
pub fn recover(
    digest: &[u8; DIGEST_LEN],
    signature: &[u8; SIGNATURE_LEN],
) -> Result<PublicKey, SignatureError> {
    let recovery_id = RecoveryId::from_byte(signature[64]).ok_or(SignatureError::Malformed)?;
    let signature =
        Signature::from_slice(&signature[..64]).map_err(|_| SignatureError::Malformed)?;
    let recovered = VerifyingKey::recover_from_prehash(digest, &signature, recovery_id)
        .map_err(|_| SignatureError::Recovery)?;
    Ok(recovered.into())
}

/// Imports a 512-bit public key, with or without the SEC1 format byte.
///
/// # Errors
///
/// Returns [`KeyError`] if the length or the point is invalid.
pub fn import_public_key(bytes: &[u8]) -> Result<PublicKey, KeyError> {
    let mut sec1 = [0_u8; PUBLIC_KEY_LEN + 1];
    match bytes.len() {
        PUBLIC_KEY_LEN => {
            // add the 'uncompressed key' flag
            sec1[0] = 0x04;
            sec1[1..].copy_from_slice(bytes);
        }
        len if len == PUBLIC_KEY_LEN + 1 => sec1.copy_from_slice(bytes),
        len => return Err(KeyError::InvalidLength(len)),
    }
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| KeyError::InvalidPoint)
}

/// Exports a public key in uncompressed representation without the format byte.
#[must_use]
pub fn export_public_key(public: &PublicKey) -> [u8; PUBLIC_KEY_LEN] {
    let point = public.to_encoded_point(false);
    let mut out = [0_u8; PUBLIC_KEY_LEN];
    out.copy_from_slice(&point.as_bytes()[1..]);
    out
}

#[cfg(test)]
mod tests {
    use eyre::OptionExt;
    use rand::thread_rng;

    use super::*;

    #[test]
    fn test_keccak256_empty() {
        assert_eq!(
            hex::encode(keccak256(&[])),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470",
        );
    }

    #[test]
    fn test_keccak256_concatenation() {
        assert_eq!(
            keccak256(&[b"hello ", b"world"]),
            keccak256(&[b"hello world"]),
            "split inputs must hash like their concatenation",
        );
    }

    #[test]
    fn test_ecdh_is_symmetric() {
        let mut csprng = thread_rng();
        let alice = SecretKey::random(&mut csprng);
        let bob = SecretKey::random(&mut csprng);

        assert_eq!(
            ecdh_x(&alice, &bob.public_key()),
            ecdh_x(&bob, &alice.public_key()),
            "both sides must agree on the shared x coordinate",
        );
    }

    #[test]
    fn test_sign_and_recover() -> eyre::Result<()> {
        let mut csprng = thread_rng();
        let secret = SecretKey::random(&mut csprng);
        let digest = keccak256(&[b"signed message"]);

        let signature = sign_recoverable(&secret, &digest)?;
        let recovered = recover(&digest, &signature)?;

        assert_eq!(
            recovered,
            secret.public_key(),
            "recovery must yield the signing key"
        );
        Ok(())
    }

    #[test]
    fn test_recover_rejects_garbage() {
        let digest = [0x11_u8; DIGEST_LEN];
        let mut signature = [0_u8; SIGNATURE_LEN];
        signature[64] = 9; // not a valid recovery id

        assert!(matches!(
            recover(&digest, &signature),
            Err(SignatureError::Malformed)
        ));
    }

    #[test]
    fn test_public_key_round_trip() -> eyre::Result<()> {
        let mut csprng = thread_rng();
        let public = SecretKey::random(&mut csprng).public_key();

        let raw = export_public_key(&public);
        assert_eq!(import_public_key(&raw)?, public);

        // The 65-byte SEC1 form must import to the same key.
        let mut sec1 = [0_u8; PUBLIC_KEY_LEN + 1];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(&raw);
        assert_eq!(import_public_key(&sec1)?, public);
        Ok(())
    }

    #[test]
    fn test_import_rejects_bad_lengths() -> eyre::Result<()> {
        let err = import_public_key(&[0_u8; 33]).err().ok_or_eyre("no error")?;
        assert!(matches!(err, KeyError::InvalidLength(33)));
        Ok(())
    }
}
