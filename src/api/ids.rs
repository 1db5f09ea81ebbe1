//! Identifiers for tokens, keys, certificates and certificate requests.

use std::fmt;
use std::str::FromStr;
use rand::Rng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use crate::constants::KEY_ID_BYTES;


//------------ string_id -----------------------------------------------------

macro_rules! string_id {
    ( $(#[$attr:meta])* $name:ident ) => {
        $(#[$attr])*
        #[derive(
            Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
            Serialize
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = InvalidId;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.trim();
                if s.is_empty() {
                    Err(InvalidId(stringify!($name)))
                } else {
                    Ok($name(s.to_string()))
                }
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    }
}

string_id!(
    /// Identifies a token. Stable across restarts.
    TokenId
);

string_id!(
    /// Identifies a key within the whole registry.
    ///
    /// For device keys this is the hex encoded object identifier on the
    /// device.
    KeyId
);

string_id!(
    /// Identifies a certificate record.
    CertId
);

string_id!(
    /// Identifies a pending certificate request.
    CertRequestId
);

impl KeyId {
    /// Creates a random key identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_ID_BYTES];
        rand::rng().fill(&mut bytes);
        KeyId(hex::encode_upper(bytes))
    }

    /// Returns the raw bytes used as object id on a device.
    pub fn to_device_id(&self) -> Vec<u8> {
        hex::decode(&self.0).unwrap_or_else(|_| self.0.as_bytes().to_vec())
    }

    /// Creates the key id for a raw device object id.
    pub fn from_device_id(id: &[u8]) -> Self {
        KeyId(hex::encode_upper(id))
    }
}

impl CertId {
    pub fn random() -> Self {
        CertId(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl CertRequestId {
    pub fn random() -> Self {
        CertRequestId(uuid::Uuid::new_v4().simple().to_string())
    }
}


//------------ CertHash ------------------------------------------------------

/// The SHA-1 hash of a DER encoded certificate, in lowercase hex.
///
/// Parsing accepts any case so that lookups are case-insensitive.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CertHash(String);

impl CertHash {
    /// Calculates the hash for the given DER encoded certificate.
    pub fn of_der(der: &[u8]) -> Self {
        CertHash(hex::encode(openssl::sha::sha1(der)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for CertHash {
    type Err = InvalidId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            Err(InvalidId("CertHash"))
        } else {
            Ok(CertHash(s.to_ascii_lowercase()))
        }
    }
}

impl fmt::Display for CertHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for CertHash {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CertHash {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let string = String::deserialize(d)?;
        CertHash::from_str(&string).map_err(de::Error::custom)
    }
}


//------------ InvalidId -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InvalidId(&'static str);

impl fmt::Display for InvalidId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid {}", self.0)
    }
}

impl std::error::Error for InvalidId { }


//------------ Tests ---------------------------------------------------------
