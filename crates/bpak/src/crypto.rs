//! Hash and signature kinds, streaming hashing, and the signer/verifier seam.
//!
//! The archive format fixes *which* digest covers what and *where* signature
//! bytes live; the cryptographic primitives themselves sit behind the
//! [`Signer`] and [`Verifier`] traits. An Ed25519 implementation backed by
//! raw 32-byte key files is provided; the ECDSA and RSA wire kinds remain
//! valid header values for archives signed by external tooling.

use std::path::Path;
use std::str::FromStr;

use ed25519_dalek::{Signer as _, Verifier as _};
use sha2::Digest;

use crate::error::{Error, Result};

/// Digest algorithm covering the payload and the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashKind {
    Sha256,
    Sha384,
    Sha512,
}

impl HashKind {
    pub fn from_wire(value: u32) -> Result<Self> {
        match value {
            1 => Ok(HashKind::Sha256),
            2 => Ok(HashKind::Sha384),
            3 => Ok(HashKind::Sha512),
            _ => Err(Error::UnsupportedHash),
        }
    }

    pub fn wire(self) -> u32 {
        match self {
            HashKind::Sha256 => 1,
            HashKind::Sha384 => 2,
            HashKind::Sha512 => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashKind::Sha256 => "sha256",
            HashKind::Sha384 => "sha384",
            HashKind::Sha512 => "sha512",
        }
    }

    /// Size of the digest in bytes.
    pub fn digest_size(self) -> usize {
        match self {
            HashKind::Sha256 => 32,
            HashKind::Sha384 => 48,
            HashKind::Sha512 => 64,
        }
    }

    /// Create a fresh streaming hasher.
    pub fn hasher(self) -> Hasher {
        match self {
            HashKind::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            HashKind::Sha384 => Hasher::Sha384(sha2::Sha384::new()),
            HashKind::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }
}

impl FromStr for HashKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(HashKind::Sha256),
            "sha384" => Ok(HashKind::Sha384),
            "sha512" => Ok(HashKind::Sha512),
            _ => Err(Error::UnsupportedHash),
        }
    }
}

/// Streaming hasher dispatching over the supported digests.
#[derive(Debug, Clone)]
pub enum Hasher {
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
}

impl Hasher {
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Sha256(state) => state.update(bytes),
            Hasher::Sha384(state) => state.update(bytes),
            Hasher::Sha512(state) => state.update(bytes),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Sha256(state) => state.finalize().to_vec(),
            Hasher::Sha384(state) => state.finalize().to_vec(),
            Hasher::Sha512(state) => state.finalize().to_vec(),
        }
    }
}

/// Signature scheme identified by the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureKind {
    Prime256v1,
    Secp384r1,
    Secp521r1,
    Rsa4096,
    Ed25519,
}

impl SignatureKind {
    pub fn from_wire(value: u32) -> Result<Self> {
        match value {
            1 => Ok(SignatureKind::Prime256v1),
            2 => Ok(SignatureKind::Secp384r1),
            3 => Ok(SignatureKind::Secp521r1),
            4 => Ok(SignatureKind::Rsa4096),
            5 => Ok(SignatureKind::Ed25519),
            _ => Err(Error::UnsupportedSignature),
        }
    }

    pub fn wire(self) -> u32 {
        match self {
            SignatureKind::Prime256v1 => 1,
            SignatureKind::Secp384r1 => 2,
            SignatureKind::Secp521r1 => 3,
            SignatureKind::Rsa4096 => 4,
            SignatureKind::Ed25519 => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SignatureKind::Prime256v1 => "prime256v1",
            SignatureKind::Secp384r1 => "secp384r1",
            SignatureKind::Secp521r1 => "secp521r1",
            SignatureKind::Rsa4096 => "rsa4096",
            SignatureKind::Ed25519 => "ed25519",
        }
    }
}

impl FromStr for SignatureKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "prime256v1" => Ok(SignatureKind::Prime256v1),
            "secp384r1" => Ok(SignatureKind::Secp384r1),
            "secp521r1" => Ok(SignatureKind::Secp521r1),
            "rsa4096" => Ok(SignatureKind::Rsa4096),
            "ed25519" => Ok(SignatureKind::Ed25519),
            _ => Err(Error::UnsupportedSignature),
        }
    }
}

/// Produces raw signature bytes over a header digest.
pub trait Signer {
    /// Scheme this signer implements; must match the header's kind.
    fn kind(&self) -> SignatureKind;

    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>>;
}

/// Checks raw signature bytes against a header digest.
pub trait Verifier {
    fn kind(&self) -> SignatureKind;

    fn verify(&self, digest: &[u8], signature: &[u8]) -> Result<()>;
}

/// Ed25519 signer over a raw 32-byte seed.
pub struct Ed25519Signer {
    key: ed25519_dalek::SigningKey,
}

impl Ed25519Signer {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: ed25519_dalek::SigningKey::from_bytes(&seed),
        }
    }

    /// Load a signer from a file containing the raw 32-byte seed.
    pub fn from_seed_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(Error::ReadError)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidArgument("key file must hold a raw 32-byte seed"))?;
        Ok(Self::from_seed(seed))
    }

    /// Public key matching this signer.
    pub fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }
}

impl Signer for Ed25519Signer {
    fn kind(&self) -> SignatureKind {
        SignatureKind::Ed25519
    }

    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>> {
        Ok(self.key.sign(digest).to_bytes().to_vec())
    }
}

/// Ed25519 verifier over a raw 32-byte public key.
pub struct Ed25519Verifier {
    key: ed25519_dalek::VerifyingKey,
}

impl Ed25519Verifier {
    pub fn from_public_key(key: [u8; 32]) -> Result<Self> {
        Ok(Self {
            key: ed25519_dalek::VerifyingKey::from_bytes(&key)
                .map_err(|_| Error::InvalidArgument("not a valid ed25519 public key"))?,
        })
    }

    /// Load a verifier from a file containing the raw 32-byte public key.
    pub fn from_public_key_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(Error::ReadError)?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidArgument("key file must hold a raw 32-byte public key"))?;
        Self::from_public_key(key)
    }
}

impl Verifier for Ed25519Verifier {
    fn kind(&self) -> SignatureKind {
        SignatureKind::Ed25519
    }

    fn verify(&self, digest: &[u8], signature: &[u8]) -> Result<()> {
        let signature = ed25519_dalek::Signature::from_slice(signature)
            .map_err(|_| Error::InvalidSignature)?;
        self.key
            .verify(digest, &signature)
            .map_err(|_| Error::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_round_trip() {
        for kind in [HashKind::Sha256, HashKind::Sha384, HashKind::Sha512] {
            assert_eq!(HashKind::from_wire(kind.wire()).unwrap(), kind);
        }
        assert!(matches!(HashKind::from_wire(0), Err(Error::UnsupportedHash)));
        for kind in [
            SignatureKind::Prime256v1,
            SignatureKind::Secp384r1,
            SignatureKind::Secp521r1,
            SignatureKind::Rsa4096,
            SignatureKind::Ed25519,
        ] {
            assert_eq!(SignatureKind::from_wire(kind.wire()).unwrap(), kind);
        }
        assert!(matches!(
            SignatureKind::from_wire(99),
            Err(Error::UnsupportedSignature)
        ));
    }

    #[test]
    fn digest_sizes() {
        let mut hasher = HashKind::Sha384.hasher();
        hasher.update(b"abc");
        assert_eq!(hasher.finalize().len(), HashKind::Sha384.digest_size());
    }

    #[test]
    fn ed25519_sign_verify() {
        let signer = Ed25519Signer::from_seed([7; 32]);
        let verifier = Ed25519Verifier::from_public_key(signer.public_key()).unwrap();
        let digest = [0xAB; 32];
        let signature = signer.sign(&digest).unwrap();
        assert_eq!(signature.len(), 64);
        verifier.verify(&digest, &signature).unwrap();
        assert!(matches!(
            verifier.verify(&[0xAC; 32], &signature),
            Err(Error::InvalidSignature)
        ));
        assert!(matches!(
            verifier.verify(&digest, &signature[..63]),
            Err(Error::InvalidSignature)
        ));
    }
}
