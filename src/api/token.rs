//! Information about tokens, keys, certificates and certificate requests
//! as it is handed out to clients.

use std::fmt;
use std::str::FromStr;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use crate::device::mechanism::SignMechanism;
use super::ids::{CertHash, CertId, CertRequestId, KeyId, TokenId};
use super::member::ClientId;
use super::serde_ext::base64_bytes;


//------------ TokenKind -----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenKind {
    Software,
    Hardware,
}

impl TokenKind {
    pub fn is_software(self) -> bool {
        matches!(self, TokenKind::Software)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenKind::Software => f.write_str("software"),
            TokenKind::Hardware => f.write_str("hardware"),
        }
    }
}


//------------ TokenState ----------------------------------------------------

/// The activation state of a token.
///
/// Tokens start out as absent until discovery finds their device. Logging
/// in moves a present token to active.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenState {
    #[default]
    Absent,
    PresentInactive,
    Active,
}

impl TokenState {
    pub fn is_active(self) -> bool {
        matches!(self, TokenState::Active)
    }

    pub fn is_present(self) -> bool {
        !matches!(self, TokenState::Absent)
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenState::Absent => f.write_str("ABSENT"),
            TokenState::PresentInactive => f.write_str("PRESENT_INACTIVE"),
            TokenState::Active => f.write_str("ACTIVE"),
        }
    }
}


//------------ KeyUsage ------------------------------------------------------

/// What a key is used for.
///
/// Once set the usage of a key never changes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyUsage {
    Signing,
    Authentication,
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyUsage::Signing => f.write_str("SIGNING"),
            KeyUsage::Authentication => f.write_str("AUTHENTICATION"),
        }
    }
}

impl FromStr for KeyUsage {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "signing" | "sign" => Ok(KeyUsage::Signing),
            "authentication" | "auth" => Ok(KeyUsage::Authentication),
            _ => Err(UnknownValue::new("key usage", s)),
        }
    }
}


//------------ CertStatus ----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertStatus {
    Saved,
    RegistrationInProgress,
    Registered,
    DeletionInProgress,
    GlobalError,
}

impl CertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CertStatus::Saved => "saved",
            CertStatus::RegistrationInProgress => "registration-in-progress",
            CertStatus::Registered => "registered",
            CertStatus::DeletionInProgress => "deletion-in-progress",
            CertStatus::GlobalError => "global-error",
        }
    }
}

impl fmt::Display for CertStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            CertStatus::Saved,
            CertStatus::RegistrationInProgress,
            CertStatus::Registered,
            CertStatus::DeletionInProgress,
            CertStatus::GlobalError,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
        .ok_or_else(|| UnknownValue::new("certificate status", s))
    }
}


//------------ CertRequestFormat ---------------------------------------------

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CertRequestFormat {
    #[default]
    Der,
    Pem,
}

impl fmt::Display for CertRequestFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CertRequestFormat::Der => f.write_str("DER"),
            CertRequestFormat::Pem => f.write_str("PEM"),
        }
    }
}

impl FromStr for CertRequestFormat {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DER" => Ok(CertRequestFormat::Der),
            "PEM" => Ok(CertRequestFormat::Pem),
            _ => Err(UnknownValue::new("certificate request format", s)),
        }
    }
}


//------------ TokenInfo -----------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TokenInfo {
    pub id: TokenId,
    pub kind: TokenKind,
    pub module: String,
    pub friendly_name: Option<String>,
    pub label: Option<String>,
    pub serial_number: Option<String>,
    pub state: TokenState,
    pub read_only: bool,
    pub batch_signing_enabled: bool,
    pub keys: Vec<KeyInfo>,
}

impl TokenInfo {
    pub fn key(&self, key_id: &KeyId) -> Option<&KeyInfo> {
        self.keys.iter().find(|key| &key.id == key_id)
    }
}


//------------ KeyInfo -------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeyInfo {
    pub id: KeyId,
    pub token_id: TokenId,
    pub friendly_name: Option<String>,
    pub label: Option<String>,
    pub usage: Option<KeyUsage>,

    /// The DER encoded subject public key info.
    #[serde(with = "base64_bytes")]
    pub public_key: Bytes,

    pub sign_mechanism: SignMechanism,

    /// Whether the key was found on its device the last time we looked.
    pub available: bool,

    pub certs: Vec<CertificateInfo>,
    pub cert_requests: Vec<CertRequestInfo>,
}


//------------ CertificateInfo -----------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertificateInfo {
    pub id: CertId,
    pub member_id: Option<ClientId>,
    pub active: bool,
    pub status: CertStatus,
    pub hash: CertHash,

    #[serde(with = "base64_bytes")]
    pub certificate: Bytes,
}


//------------ CertRequestInfo -----------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertRequestInfo {
    pub id: CertRequestId,
    pub member_id: Option<ClientId>,
    pub subject_name: String,
    pub format: CertRequestFormat,
    pub usage: KeyUsage,
}


//------------ GeneratedCertRequestInfo --------------------------------------

/// A freshly (re)generated certificate request.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GeneratedCertRequestInfo {
    pub cert_request_id: CertRequestId,
    pub key_id: KeyId,
    pub member_id: Option<ClientId>,
    pub usage: KeyUsage,
    pub format: CertRequestFormat,

    /// The request in the requested format.
    #[serde(with = "base64_bytes")]
    pub cert_request: Bytes,
}


//------------ TokenInfoAndKeyId ---------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TokenInfoAndKeyId {
    pub token: TokenInfo,
    pub key_id: KeyId,
}


//------------ KeyIdInfo -----------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeyIdInfo {
    pub key_id: KeyId,
    pub sign_mechanism: SignMechanism,
}


//------------ MemberSigningInfo ---------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MemberSigningInfo {
    pub key_id: KeyId,
    pub cert: CertificateInfo,
    pub sign_mechanism: SignMechanism,
}


//------------ AuthKeyInfo ---------------------------------------------------

/// The authentication key of a security server.
///
/// Only identifies the key, the private key itself stays in the signer.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AuthKeyInfo {
    pub token_id: TokenId,
    pub key_id: KeyId,
    pub sign_mechanism: SignMechanism,
    pub cert: CertificateInfo,
}


//------------ UnknownValue --------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnknownValue {
    what: &'static str,
    value: String,
}

impl UnknownValue {
    fn new(what: &'static str, value: &str) -> Self {
        UnknownValue { what, value: value.to_string() }
    }
}

impl fmt::Display for UnknownValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.what, self.value)
    }
}

impl std::error::Error for UnknownValue { }


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_state_wire_names() {
        assert_eq!(
            serde_json::to_string(&TokenState::PresentInactive).unwrap(),
            "\"PRESENT_INACTIVE\""
        );
        assert_eq!(TokenState::default(), TokenState::Absent);
    }

    #[test]
    fn cert_status_parses_wire_names() {
        for status in [
            CertStatus::Saved,
            CertStatus::RegistrationInProgress,
            CertStatus::Registered,
            CertStatus::DeletionInProgress,
            CertStatus::GlobalError,
        ] {
            assert_eq!(CertStatus::from_str(status.as_str()).unwrap(), status);
            assert_eq!(
                serde_json::to_string(&status).unwrap(),
                format!("\"{}\"", status.as_str())
            );
        }
        assert!(CertStatus::from_str("revoked").is_err());
    }

    #[test]
    fn key_usage_from_cli_input() {
        assert_eq!(KeyUsage::from_str("sign").unwrap(), KeyUsage::Signing);
        assert_eq!(
            KeyUsage::from_str("AUTHENTICATION").unwrap(),
            KeyUsage::Authentication
        );
        assert!(KeyUsage::from_str("encrypt").is_err());
    }
}
