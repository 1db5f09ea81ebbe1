//! Signing mechanisms and signature algorithms.
//!
//! All supported algorithms are RSA PKCS#1 v1.5 signatures. The device is
//! handed the DER encoded DigestInfo and applies the padding itself, which
//! is what the `CKM_RSA_PKCS` mechanism does.

use std::fmt;
use std::str::FromStr;
use bcder::Oid;
use bytes::{BufMut, Bytes, BytesMut};
use openssl::hash::MessageDigest;
use serde::{Deserialize, Serialize};
use super::error::DeviceError;


//------------ SignMechanism -------------------------------------------------

/// The device mechanism used for signing.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize
)]
pub enum SignMechanism {
    #[default]
    #[serde(rename = "CKM_RSA_PKCS")]
    RsaPkcs,
}

impl SignMechanism {
    pub fn as_str(self) -> &'static str {
        match self {
            SignMechanism::RsaPkcs => "CKM_RSA_PKCS",
        }
    }
}

impl fmt::Display for SignMechanism {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


//------------ SignAlgorithm -------------------------------------------------

/// A signature algorithm as requested by clients.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum SignAlgorithm {
    #[serde(rename = "SHA256withRSA")]
    Sha256WithRsa,

    #[serde(rename = "SHA384withRSA")]
    Sha384WithRsa,

    #[serde(rename = "SHA512withRSA")]
    Sha512WithRsa,
}

// DigestInfo ::= SEQUENCE { AlgorithmIdentifier, OCTET STRING } up to the
// start of the digest value.
const SHA256_DIGEST_INFO_PREFIX: &[u8] = &[
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03,
    0x04, 0x02, 0x01, 0x05, 0x00, 0x04, 0x20,
];
const SHA384_DIGEST_INFO_PREFIX: &[u8] = &[
    0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03,
    0x04, 0x02, 0x02, 0x05, 0x00, 0x04, 0x30,
];
const SHA512_DIGEST_INFO_PREFIX: &[u8] = &[
    0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03,
    0x04, 0x02, 0x03, 0x05, 0x00, 0x04, 0x40,
];

/// sha256WithRSAEncryption, 1.2.840.113549.1.1.11
pub const SHA256_WITH_RSA: Oid<&[u8]> =
    Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 11]);

/// sha384WithRSAEncryption, 1.2.840.113549.1.1.12
pub const SHA384_WITH_RSA: Oid<&[u8]> =
    Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 12]);

/// sha512WithRSAEncryption, 1.2.840.113549.1.1.13
pub const SHA512_WITH_RSA: Oid<&[u8]> =
    Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 13]);

impl SignAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            SignAlgorithm::Sha256WithRsa => "SHA256withRSA",
            SignAlgorithm::Sha384WithRsa => "SHA384withRSA",
            SignAlgorithm::Sha512WithRsa => "SHA512withRSA",
        }
    }

    /// The device mechanism implementing the algorithm.
    pub fn mechanism(self) -> SignMechanism {
        SignMechanism::RsaPkcs
    }

    /// The length of the digest in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            SignAlgorithm::Sha256WithRsa => 32,
            SignAlgorithm::Sha384WithRsa => 48,
            SignAlgorithm::Sha512WithRsa => 64,
        }
    }

    pub fn message_digest(self) -> MessageDigest {
        match self {
            SignAlgorithm::Sha256WithRsa => MessageDigest::sha256(),
            SignAlgorithm::Sha384WithRsa => MessageDigest::sha384(),
            SignAlgorithm::Sha512WithRsa => MessageDigest::sha512(),
        }
    }

    /// The object identifier used in X.509 AlgorithmIdentifiers.
    pub fn oid(self) -> Oid<&'static [u8]> {
        match self {
            SignAlgorithm::Sha256WithRsa => SHA256_WITH_RSA,
            SignAlgorithm::Sha384WithRsa => SHA384_WITH_RSA,
            SignAlgorithm::Sha512WithRsa => SHA512_WITH_RSA,
        }
    }

    fn digest_info_prefix(self) -> &'static [u8] {
        match self {
            SignAlgorithm::Sha256WithRsa => SHA256_DIGEST_INFO_PREFIX,
            SignAlgorithm::Sha384WithRsa => SHA384_DIGEST_INFO_PREFIX,
            SignAlgorithm::Sha512WithRsa => SHA512_DIGEST_INFO_PREFIX,
        }
    }

    /// Wraps a digest into a DER encoded DigestInfo.
    ///
    /// Fails if the digest has the wrong length for the algorithm.
    pub fn digest_info(self, digest: &[u8]) -> Result<Bytes, DeviceError> {
        if digest.len() != self.digest_len() {
            return Err(DeviceError::DigestLength {
                expected: self.digest_len(),
                actual: digest.len(),
            });
        }
        let prefix = self.digest_info_prefix();
        let mut res = BytesMut::with_capacity(prefix.len() + digest.len());
        res.put_slice(prefix);
        res.put_slice(digest);
        Ok(res.freeze())
    }

    /// Calculates the digest of the given data.
    pub fn digest(self, data: &[u8]) -> Result<Bytes, DeviceError> {
        let digest = openssl::hash::hash(self.message_digest(), data)?;
        Ok(Bytes::copy_from_slice(&digest))
    }
}

impl fmt::Display for SignAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignAlgorithm {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SHA256withRSA" => Ok(SignAlgorithm::Sha256WithRsa),
            "SHA384withRSA" => Ok(SignAlgorithm::Sha384WithRsa),
            "SHA512withRSA" => Ok(SignAlgorithm::Sha512WithRsa),
            _ => Err(DeviceError::UnsupportedMechanism(s.to_string())),
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_info_has_correct_length() {
        for alg in [
            SignAlgorithm::Sha256WithRsa,
            SignAlgorithm::Sha384WithRsa,
            SignAlgorithm::Sha512WithRsa,
        ] {
            let digest = alg.digest(b"hello").unwrap();
            let info = alg.digest_info(&digest).unwrap();

            // The outer SEQUENCE length covers the whole rest.
            assert_eq!(info[1] as usize, info.len() - 2);
            assert!(info.ends_with(&digest));
        }
    }

    #[test]
    fn wrong_digest_length_is_rejected() {
        let err = SignAlgorithm::Sha512WithRsa
            .digest_info(&[0u8; 32])
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::DigestLength { expected: 64, actual: 32 }
        ));
    }

    #[test]
    fn algorithm_names() {
        assert_eq!(
            SignAlgorithm::from_str("SHA384withRSA").unwrap(),
            SignAlgorithm::Sha384WithRsa
        );
        assert!(SignAlgorithm::from_str("SHA1withDSA").is_err());
        assert_eq!(
            serde_json::to_string(&SignMechanism::RsaPkcs).unwrap(),
            "\"CKM_RSA_PKCS\""
        );
    }
}
