//! Digests and signature checks over document content.
//!
//! Tor's RSA signatures are PKCS#1 v1.5 type 1 blocks wrapping the bare
//! digest, without the DigestInfo prefix other protocols put in front of it.

use std::fmt;

use crate::error::{DocumentParseError, SignatureError};
use crate::meta::{content_between, Fingerprint, Object};

//
// External dependencies
//
use log::trace;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use rsa::Pkcs1v15Sign;
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Hash function used for a digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        }
    }

    /// From the name used in `directory-signature` lines
    pub fn from_name(name: &str) -> Option<DigestAlgorithm> {
        match name {
            "sha1" => Some(DigestAlgorithm::Sha1),
            "sha256" => Some(DigestAlgorithm::Sha256),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Digest of `raw` from the first `start` through the first following `end`
pub fn digest_range(
    raw: &str,
    start: &str,
    end: &str,
    algorithm: DigestAlgorithm,
) -> Result<Vec<u8>, DocumentParseError> {
    let content = content_between(raw, start, end)?;
    Ok(algorithm.digest(content.as_bytes()))
}

/// SHA-1 digest as a [`Fingerprint`]
pub fn sha1_fingerprint(data: &[u8]) -> Fingerprint {
    let digest: [u8; 20] = Sha1::digest(data).into();
    Fingerprint::from(digest)
}

/// An RSA public key from a PKCS#1 `RSA PUBLIC KEY` block.
#[derive(Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    key: rsa::RsaPublicKey,
    der: Vec<u8>,
}

impl fmt::Debug for RsaPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RsaPublicKey({} bits, {})", self.key.n().bits(), self.fingerprint())
    }
}

impl RsaPublicKey {
    /// Parse DER `RSAPublicKey ::= SEQUENCE { modulus INTEGER, publicExponent INTEGER }`.
    pub fn from_der(der: &[u8]) -> Result<RsaPublicKey, SignatureError> {
        let key = rsa::RsaPublicKey::from_pkcs1_der(der).map_err(|e| SignatureError::MalformedKey(e.to_string()))?;
        Ok(RsaPublicKey { key, der: der.to_vec() })
    }

    pub fn from_object(object: &Object) -> Result<RsaPublicKey, DocumentParseError> {
        Ok(Self::from_der(&object.decode()?)?)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// SHA-1 of the DER encoding, which is how Tor identifies keys
    pub fn fingerprint(&self) -> Fingerprint {
        sha1_fingerprint(&self.der)
    }

    /// Check that `signature` was made over `expected` with this key.
    pub fn verify_digest(&self, signature: &[u8], expected: &[u8], what: &str) -> Result<(), SignatureError> {
        if signature.len() != self.key.size() {
            return Err(SignatureError::MalformedSignature(format!(
                "{} signature has {} bytes, but the key's blocks have {}",
                what,
                signature.len(),
                self.key.size()
            )));
        }
        trace!("checking {} signature over {}", what, hex::encode_upper(expected));
        self.key
            .verify(Pkcs1v15Sign::new_unprefixed(), expected, signature)
            .map_err(|_| SignatureError::DigestMismatch {
                what: what.to_string(),
                local: hex::encode_upper(expected),
            })
    }
}

/// Check an Ed25519 signature.
#[cfg(feature = "ed25519")]
pub fn verify_ed25519(
    key: &[u8; 32],
    message: &[u8],
    signature: &[u8; 64],
    what: &str,
) -> Result<(), SignatureError> {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let verifying_key = VerifyingKey::from_bytes(key)
        .map_err(|e| SignatureError::MalformedKey(format!("ed25519 key: {}", e)))?;
    let sig = Signature::from_bytes(signature);
    trace!("checking ed25519 {} signature", what);
    verifying_key
        .verify(message, &sig)
        .map_err(|_| SignatureError::Forged(what.to_string()))
}

/// Without ed25519 support signatures can't be checked, which is never
/// reported as success.
#[cfg(not(feature = "ed25519"))]
pub fn verify_ed25519(
    _key: &[u8; 32],
    _message: &[u8],
    _signature: &[u8; 64],
    _what: &str,
) -> Result<(), SignatureError> {
    Err(SignatureError::Unavailable("ed25519"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;

    // 512 bit toy key with e = 65537
    const TOY_MODULUS: &[u8] = b"B0132FB77A63300868C202CEE2F4D4B47ACBA2E0803A2DC4480CD3E8F4958D0CC81BBEC8447E04C96F7A2CD739902924AE17AD1DF883DF793486F4144F39E7A1";
    const TOY_PRIVATE_EXPONENT: &[u8] = b"71960F044819D094BC2FDC6BE69196DE4F112B23B4D4D34D7A457C371E01941986C3DD88FC49C2FE498A07FEE5B2585D4B7B106B242F714BCFFBED90066CB001";
    const BLOCK_SIZE: usize = 64;

    fn modulus() -> BigUint {
        BigUint::parse_bytes(TOY_MODULUS, 16).unwrap()
    }

    fn der_with_exponent(exponent: &[u8]) -> Vec<u8> {
        let modulus = modulus().to_bytes_be();
        let mut body = vec![0x02, modulus.len() as u8 + 1, 0x00];
        body.extend_from_slice(&modulus);
        body.extend_from_slice(&[0x02, exponent.len() as u8]);
        body.extend_from_slice(exponent);
        let mut der = vec![0x30, body.len() as u8];
        der.extend_from_slice(&body);
        der
    }

    fn toy_key() -> RsaPublicKey {
        RsaPublicKey::from_der(&der_with_exponent(&[0x01, 0x00, 0x01])).unwrap()
    }

    /// Raw private key operation over an already padded block
    fn sign_block(block: &[u8]) -> Vec<u8> {
        let d = BigUint::parse_bytes(TOY_PRIVATE_EXPONENT, 16).unwrap();
        let raw = BigUint::from_bytes_be(block).modpow(&d, &modulus()).to_bytes_be();
        let mut signature = vec![0u8; BLOCK_SIZE - raw.len()];
        signature.extend_from_slice(&raw);
        signature
    }

    fn sign(digest: &[u8]) -> Vec<u8> {
        let mut block = vec![0x00, 0x01];
        block.resize(BLOCK_SIZE - digest.len() - 1, 0xFF);
        block.push(0x00);
        block.extend_from_slice(digest);
        sign_block(&block)
    }

    #[test]
    fn test_digest_algorithms() {
        assert_eq!(20, DigestAlgorithm::Sha1.digest(b"abc").len());
        assert_eq!(
            "A9993E364706816ABA3E25717850C26C9CD0D89D",
            hex::encode_upper(DigestAlgorithm::Sha1.digest(b"abc"))
        );
        assert_eq!(32, DigestAlgorithm::Sha256.digest(b"abc").len());
        assert_eq!(Some(DigestAlgorithm::Sha256), DigestAlgorithm::from_name("sha256"));
        assert_eq!(None, DigestAlgorithm::from_name("md5"));
    }

    #[test]
    fn test_digest_range() {
        let raw = "@type x\nrouter a\nrouter-signature\nrest";
        let expected = DigestAlgorithm::Sha1.digest(b"router a\nrouter-signature\n");
        assert_eq!(
            expected,
            digest_range(raw, "router", "\nrouter-signature\n", DigestAlgorithm::Sha1).unwrap()
        );
    }

    #[test]
    fn test_rsa_signature() {
        let key = toy_key();
        let digest = DigestAlgorithm::Sha1.digest(b"content");
        let signature = sign(&digest);
        assert!(key.verify_digest(&signature, &digest, "test").is_ok());

        let other = DigestAlgorithm::Sha1.digest(b"tampered");
        let err = key.verify_digest(&signature, &other, "test").unwrap_err();
        assert!(matches!(err, SignatureError::DigestMismatch { .. }));
    }

    #[test]
    fn test_rsa_signature_without_padding() {
        let key = toy_key();
        let digest = DigestAlgorithm::Sha1.digest(b"content");
        // type 1 block with the separator right after the type
        let mut block = vec![0x00, 0x01, 0x00];
        block.extend_from_slice(&digest);
        block.resize(BLOCK_SIZE, 0x00);
        let signature = sign_block(&block);
        assert!(key.verify_digest(&signature, &digest, "test").is_err());

        // too little padding
        let mut block = vec![0x00, 0x01, 0xFF, 0xFF, 0x00];
        block.extend_from_slice(&[0xAB; BLOCK_SIZE - 5]);
        let signature = sign_block(&block);
        assert!(key.verify_digest(&signature, &[0xAB; BLOCK_SIZE - 5], "test").is_err());
    }

    #[test]
    fn test_garbage_signature() {
        let key = toy_key();
        let digest = DigestAlgorithm::Sha1.digest(b"content");
        assert!(matches!(
            key.verify_digest(&[0x42; 16], &digest, "test"),
            Err(SignatureError::MalformedSignature(_))
        ));
        assert!(key.verify_digest(&[0x42; BLOCK_SIZE], &digest, "test").is_err());
    }

    #[test]
    fn test_malformed_der() {
        assert!(RsaPublicKey::from_der(&[]).is_err());
        assert!(RsaPublicKey::from_der(&[0x30, 0x05, 0x02]).is_err());
        assert!(RsaPublicKey::from_der(&[0x31, 0x00]).is_err());
        let mut trailing = der_with_exponent(&[0x01, 0x00, 0x01]);
        trailing.push(0x00);
        assert!(RsaPublicKey::from_der(&trailing).is_err());
    }

    #[test]
    fn test_rejects_exponent_one() {
        let err = RsaPublicKey::from_der(&der_with_exponent(&[0x01])).unwrap_err();
        assert!(matches!(err, SignatureError::MalformedKey(_)));
    }

    #[cfg(feature = "ed25519")]
    #[test]
    fn test_ed25519_rejects_bad_signature() {
        let key = [0u8; 32];
        let result = verify_ed25519(&key, b"message", &[0u8; 64], "test");
        assert!(result.is_err());
    }
}
