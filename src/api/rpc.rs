//! Request and response bodies of the RPC interface.
//!
//! Every operation is a `POST` of a JSON request body to
//! `/rpc/v1/<operation>`. Successful operations answer with a JSON body or,
//! where there is nothing to return, with an empty `200 OK`.

use std::fmt;
use std::str::FromStr;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use crate::device::mechanism::{SignAlgorithm, SignMechanism};
use super::ids::{CertHash, CertRequestId, KeyId, TokenId};
use super::member::{ClientId, SecurityServerId};
use super::serde_ext::{base64_bytes, opt_base64_bytes};
use super::token::{CertRequestFormat, CertStatus, KeyUsage};


//------------ RpcOperation --------------------------------------------------

macro_rules! rpc_operations {
    ( $( $variant:ident => $name:expr, )* ) => {
        /// All operations offered by the RPC interface.
        #[derive(Clone, Copy, Debug, Eq, PartialEq)]
        pub enum RpcOperation {
            $( $variant, )*
        }

        impl RpcOperation {
            pub const ALL: &'static [RpcOperation] = &[
                $( RpcOperation::$variant, )*
            ];

            /// Returns the path segment of the operation.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( RpcOperation::$variant => $name, )*
                }
            }
        }

        impl FromStr for RpcOperation {
            type Err = UnknownOperation;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $name => Ok(RpcOperation::$variant), )*
                    _ => Err(UnknownOperation(s.to_string())),
                }
            }
        }
    }
}

rpc_operations! {
    ListTokens => "list-tokens",
    GetToken => "get-token",
    GetTokenForKey => "get-token-for-key",
    GetTokenForCertHash => "get-token-for-cert-hash",
    GetTokenForCertRequest => "get-token-for-cert-request",
    ActivateToken => "activate-token",
    DeactivateToken => "deactivate-token",
    SetTokenFriendlyName => "set-token-friendly-name",
    InitSoftwareToken => "init-software-token",
    UpdateSoftwareTokenPin => "update-software-token-pin",
    IsBatchSigningEnabled => "is-batch-signing-enabled",
    IsHsmOperational => "is-hsm-operational",
    GenerateKey => "generate-key",
    SetKeyFriendlyName => "set-key-friendly-name",
    DeleteKey => "delete-key",
    GetSignMechanism => "get-sign-mechanism",
    Sign => "sign",
    SignCertificate => "sign-certificate",
    GenerateSelfSignedCert => "generate-self-signed-cert",
    ImportCert => "import-cert",
    ActivateCert => "activate-cert",
    DeactivateCert => "deactivate-cert",
    SetCertStatus => "set-cert-status",
    DeleteCert => "delete-cert",
    GenerateCertRequest => "generate-cert-request",
    RegenerateCertRequest => "regenerate-cert-request",
    DeleteCertRequest => "delete-cert-request",
    GetCertForHash => "get-cert-for-hash",
    GetKeyIdForCertHash => "get-key-id-for-cert-hash",
    GetTokenAndKeyIdForCertHash => "get-token-and-key-id-for-cert-hash",
    GetTokenAndKeyIdForCertRequest => "get-token-and-key-id-for-cert-request",
    GetMemberCerts => "get-member-certs",
    GetMemberSigningInfo => "get-member-signing-info",
    GetAuthKey => "get-auth-key",
    GetOcspResponses => "get-ocsp-responses",
    SetOcspResponses => "set-ocsp-responses",
}

impl RpcOperation {
    /// Returns whether the operation changes state.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            RpcOperation::ActivateToken
            | RpcOperation::DeactivateToken
            | RpcOperation::SetTokenFriendlyName
            | RpcOperation::InitSoftwareToken
            | RpcOperation::UpdateSoftwareTokenPin
            | RpcOperation::GenerateKey
            | RpcOperation::SetKeyFriendlyName
            | RpcOperation::DeleteKey
            | RpcOperation::GenerateSelfSignedCert
            | RpcOperation::ImportCert
            | RpcOperation::ActivateCert
            | RpcOperation::DeactivateCert
            | RpcOperation::SetCertStatus
            | RpcOperation::DeleteCert
            | RpcOperation::GenerateCertRequest
            | RpcOperation::RegenerateCertRequest
            | RpcOperation::DeleteCertRequest
            | RpcOperation::SetOcspResponses
        )
    }
}

impl fmt::Display for RpcOperation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct UnknownOperation(String);

impl fmt::Display for UnknownOperation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown operation '{}'", self.0)
    }
}

impl std::error::Error for UnknownOperation { }


//------------ Pin -----------------------------------------------------------

/// A token activation secret.
///
/// The secret is zeroized on drop and never shows up in debug output.
pub struct Pin(SecretString);

impl Pin {
    pub fn new(pin: impl Into<String>) -> Self {
        Pin(SecretString::from(pin.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn into_secret(self) -> SecretString {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl From<SecretString> for Pin {
    fn from(secret: SecretString) -> Self {
        Pin(secret)
    }
}

impl Clone for Pin {
    fn clone(&self) -> Self {
        Pin::new(self.expose())
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Pin(***)")
    }
}

impl Serialize for Pin {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for Pin {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        String::deserialize(d).map(Pin::new)
    }
}


//------------ Token requests ------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NoParams {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TokenIdRequest {
    pub token_id: TokenId,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KeyIdRequest {
    pub key_id: KeyId,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CertHashRequest {
    pub cert_hash: CertHash,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CertRequestIdRequest {
    pub cert_request_id: CertRequestId,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ActivateTokenRequest {
    pub token_id: TokenId,
    pub pin: Pin,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SetFriendlyNameRequest<Id> {
    pub id: Id,
    pub friendly_name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InitSoftwareTokenRequest {
    pub pin: Pin,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UpdateSoftwareTokenPinRequest {
    pub token_id: TokenId,
    pub old_pin: Pin,
    pub new_pin: Pin,
}


//------------ Key requests --------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GenerateKeyRequest {
    pub token_id: TokenId,
    #[serde(default)]
    pub key_label: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeleteKeyRequest {
    pub key_id: KeyId,
    #[serde(default)]
    pub delete_from_device: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SignRequest {
    pub key_id: KeyId,
    pub signature_algorithm: SignAlgorithm,

    /// The message digest to sign.
    #[serde(with = "base64_bytes")]
    pub digest: Bytes,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SignCertificateRequest {
    pub key_id: KeyId,
    pub signature_algorithm: SignAlgorithm,
    pub subject_name: String,

    /// The DER encoded subject public key info to certify.
    #[serde(with = "base64_bytes")]
    pub public_key: Bytes,
}


//------------ Certificate requests ------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GenerateSelfSignedCertRequest {
    pub key_id: KeyId,
    #[serde(default)]
    pub member_id: Option<ClientId>,
    pub key_usage: KeyUsage,
    pub common_name: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ImportCertRequest {
    /// The certificate, DER encoded.
    #[serde(with = "base64_bytes")]
    pub certificate: Bytes,
    pub initial_status: CertStatus,
    #[serde(default)]
    pub member_id: Option<ClientId>,
}

/// Identifies a certificate either by record id or by hash.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CertIdOrHashRequest {
    pub cert_id_or_hash: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SetCertStatusRequest {
    pub cert_id_or_hash: String,
    pub status: CertStatus,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GenerateCertRequestRequest {
    pub key_id: KeyId,
    #[serde(default)]
    pub member_id: Option<ClientId>,
    pub key_usage: KeyUsage,
    pub subject_name: String,
    #[serde(default)]
    pub format: CertRequestFormat,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegenerateCertRequestRequest {
    pub cert_request_id: CertRequestId,
    #[serde(default)]
    pub format: CertRequestFormat,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MemberIdRequest {
    pub member_id: ClientId,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AuthKeyRequest {
    pub security_server: SecurityServerId,
}


//------------ OCSP requests -------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GetOcspResponsesRequest {
    pub cert_hashes: Vec<CertHash>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SetOcspResponsesRequest {
    pub cert_hashes: Vec<CertHash>,

    /// DER encoded OCSP responses, base64, in the order of the hashes.
    pub responses: Vec<String>,
}


//------------ Responses -----------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BoolResponse {
    pub value: bool,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SignMechanismResponse {
    pub sign_mechanism: SignMechanism,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SignResponse {
    #[serde(with = "base64_bytes")]
    pub signature: Bytes,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertificateChainResponse {
    /// DER certificates, the new certificate first.
    pub certificate_chain: Vec<CertificateBytes>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CertificateBytes(#[serde(with = "base64_bytes")] pub Bytes);

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertificateResponse {
    #[serde(with = "base64_bytes")]
    pub certificate: Bytes,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ImportCertResponse {
    pub key_id: KeyId,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct OcspResponsesResponse {
    pub responses: Vec<OcspResponseEntry>,
}

/// The cached OCSP response for one certificate hash.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct OcspResponseEntry {
    pub cert_hash: CertHash,

    /// The DER encoded response, absent for unknown hashes.
    #[serde(default, with = "opt_base64_bytes")]
    pub response: Option<Bytes>,

    /// Set when the response is past its next update or its last refresh
    /// failed.
    #[serde(default)]
    pub stale: bool,
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_names_round_trip() {
        for op in RpcOperation::ALL {
            assert_eq!(RpcOperation::from_str(op.as_str()).unwrap(), *op);
        }
        assert!(RpcOperation::from_str("format-disk").is_err());
    }

    #[test]
    fn pin_is_not_in_debug_output() {
        let req = ActivateTokenRequest {
            token_id: TokenId::from("0"),
            pin: Pin::new("1234"),
        };
        let debug = format!("{req:?}");
        assert!(!debug.contains("1234"));

        let json = serde_json::to_string(&req).unwrap();
        let back: ActivateTokenRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pin.expose(), "1234");
    }

    #[test]
    fn sign_request_digest_is_base64() {
        let req: SignRequest = serde_json::from_str(
            r#"{"key_id":"AB","signature_algorithm":"SHA256withRSA","digest":"AAEC"}"#
        ).unwrap();
        assert_eq!(req.digest.as_ref(), &[0, 1, 2]);
        assert_eq!(req.signature_algorithm, SignAlgorithm::Sha256WithRsa);
    }
}
