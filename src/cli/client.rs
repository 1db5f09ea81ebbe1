//! A client for the signer's RPC interface.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;
use crate::api::ids::{CertHash, CertRequestId, KeyId, TokenId};
use crate::api::member::{ClientId, SecurityServerId};
use crate::api::rpc::{
    ActivateTokenRequest, AuthKeyRequest, BoolResponse, CertHashRequest,
    CertIdOrHashRequest, CertRequestIdRequest, CertificateChainResponse,
    CertificateResponse, DeleteKeyRequest, GenerateCertRequestRequest,
    GenerateKeyRequest, GenerateSelfSignedCertRequest,
    GetOcspResponsesRequest, ImportCertRequest, ImportCertResponse,
    InitSoftwareTokenRequest, KeyIdRequest, MemberIdRequest, NoParams,
    OcspResponseEntry, OcspResponsesResponse, Pin,
    RegenerateCertRequestRequest, RpcOperation, SetCertStatusRequest,
    SetFriendlyNameRequest, SetOcspResponsesRequest, SignCertificateRequest,
    SignMechanismResponse, SignRequest, SignResponse, TokenIdRequest,
    UpdateSoftwareTokenPinRequest,
};
use crate::api::token::{
    AuthKeyInfo, CertRequestFormat, CertStatus, CertificateInfo,
    GeneratedCertRequestInfo, KeyIdInfo, KeyInfo, KeyUsage,
    MemberSigningInfo, TokenInfo, TokenInfoAndKeyId,
};
use crate::constants::{RPC_PATH_PREFIX, RPC_VERSION};
use crate::device::mechanism::{SignAlgorithm, SignMechanism};
use super::httpcli::{self, Error, Target};


//------------ SignerClient --------------------------------------------------

/// A client for a signer.
#[derive(Clone, Debug)]
pub struct SignerClient {
    /// The base URI of the signer.
    base: Url,

    /// The bearer token, if the signer wants one.
    token: Option<String>,

    /// Only print calls instead of performing them.
    api_only: bool,

    client: reqwest::Client,
}

impl SignerClient {
    pub fn new(base: Url, token: Option<String>) -> Self {
        SignerClient {
            base, token,
            api_only: httpcli::api_only_from_env(),
            client: reqwest::Client::new(),
        }
    }

    /// Makes the client print calls and exit instead of sending them.
    pub fn with_api_only(mut self, api_only: bool) -> Self {
        self.api_only |= api_only;
        self
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn uri(&self, op: RpcOperation) -> String {
        let base = self.base.as_str();
        let sep = if base.ends_with('/') { "" } else { "/" };
        format!("{base}{sep}{RPC_PATH_PREFIX}/{RPC_VERSION}/{op}")
    }

    /// Performs an operation that answers with a JSON body.
    pub async fn call<Req, Res>(
        &self, op: RpcOperation, req: Req
    ) -> Result<Res, Error>
    where Req: Serialize, Res: DeserializeOwned {
        let uri = self.uri(op);
        httpcli::post_json_with_response(
            &self.client, self.target(&uri), req
        ).await
    }

    /// Performs an operation that answers with an empty body.
    pub async fn call_empty<Req: Serialize>(
        &self, op: RpcOperation, req: Req
    ) -> Result<(), Error> {
        let uri = self.uri(op);
        httpcli::post_json(&self.client, self.target(&uri), req).await
    }

    fn target<'a>(&'a self, uri: &'a str) -> Target<'a> {
        Target {
            uri,
            token: self.token.as_deref(),
            api_only: self.api_only,
        }
    }
}

/// # Tokens
impl SignerClient {
    pub async fn list_tokens(&self) -> Result<Vec<TokenInfo>, Error> {
        self.call(RpcOperation::ListTokens, NoParams::default()).await
    }

    pub async fn get_token(
        &self, token_id: &TokenId
    ) -> Result<TokenInfo, Error> {
        self.call(
            RpcOperation::GetToken,
            TokenIdRequest { token_id: token_id.clone() }
        ).await
    }

    pub async fn get_token_for_key(
        &self, key_id: &KeyId
    ) -> Result<TokenInfo, Error> {
        self.call(
            RpcOperation::GetTokenForKey,
            KeyIdRequest { key_id: key_id.clone() }
        ).await
    }

    pub async fn get_token_for_cert_hash(
        &self, cert_hash: &CertHash
    ) -> Result<TokenInfo, Error> {
        self.call(
            RpcOperation::GetTokenForCertHash,
            CertHashRequest { cert_hash: cert_hash.clone() }
        ).await
    }

    pub async fn get_token_for_cert_request(
        &self, cert_request_id: &CertRequestId
    ) -> Result<TokenInfo, Error> {
        self.call(
            RpcOperation::GetTokenForCertRequest,
            CertRequestIdRequest { cert_request_id: cert_request_id.clone() }
        ).await
    }

    pub async fn activate_token(
        &self, token_id: &TokenId, pin: Pin
    ) -> Result<(), Error> {
        self.call_empty(
            RpcOperation::ActivateToken,
            ActivateTokenRequest { token_id: token_id.clone(), pin }
        ).await
    }

    pub async fn deactivate_token(
        &self, token_id: &TokenId
    ) -> Result<(), Error> {
        self.call_empty(
            RpcOperation::DeactivateToken,
            TokenIdRequest { token_id: token_id.clone() }
        ).await
    }

    pub async fn set_token_friendly_name(
        &self, token_id: &TokenId, friendly_name: &str
    ) -> Result<(), Error> {
        self.call_empty(
            RpcOperation::SetTokenFriendlyName,
            SetFriendlyNameRequest {
                id: token_id.clone(),
                friendly_name: friendly_name.to_string(),
            }
        ).await
    }

    pub async fn init_software_token(&self, pin: Pin) -> Result<(), Error> {
        self.call_empty(
            RpcOperation::InitSoftwareToken,
            InitSoftwareTokenRequest { pin }
        ).await
    }

    pub async fn update_software_token_pin(
        &self, token_id: &TokenId, old_pin: Pin, new_pin: Pin,
    ) -> Result<(), Error> {
        self.call_empty(
            RpcOperation::UpdateSoftwareTokenPin,
            UpdateSoftwareTokenPinRequest {
                token_id: token_id.clone(), old_pin, new_pin
            }
        ).await
    }

    pub async fn is_batch_signing_enabled(
        &self, key_id: &KeyId
    ) -> Result<bool, Error> {
        self.call::<_, BoolResponse>(
            RpcOperation::IsBatchSigningEnabled,
            KeyIdRequest { key_id: key_id.clone() }
        ).await.map(|res| res.value)
    }

    pub async fn is_hsm_operational(&self) -> Result<bool, Error> {
        self.call::<_, BoolResponse>(
            RpcOperation::IsHsmOperational, NoParams::default()
        ).await.map(|res| res.value)
    }
}

/// # Keys
impl SignerClient {
    pub async fn generate_key(
        &self, token_id: &TokenId, key_label: Option<&str>
    ) -> Result<KeyInfo, Error> {
        self.call(
            RpcOperation::GenerateKey,
            GenerateKeyRequest {
                token_id: token_id.clone(),
                key_label: key_label.map(ToString::to_string),
            }
        ).await
    }

    pub async fn set_key_friendly_name(
        &self, key_id: &KeyId, friendly_name: &str
    ) -> Result<(), Error> {
        self.call_empty(
            RpcOperation::SetKeyFriendlyName,
            SetFriendlyNameRequest {
                id: key_id.clone(),
                friendly_name: friendly_name.to_string(),
            }
        ).await
    }

    pub async fn delete_key(
        &self, key_id: &KeyId, delete_from_device: bool
    ) -> Result<(), Error> {
        self.call_empty(
            RpcOperation::DeleteKey,
            DeleteKeyRequest { key_id: key_id.clone(), delete_from_device }
        ).await
    }

    pub async fn get_sign_mechanism(
        &self, key_id: &KeyId
    ) -> Result<SignMechanism, Error> {
        self.call::<_, SignMechanismResponse>(
            RpcOperation::GetSignMechanism,
            KeyIdRequest { key_id: key_id.clone() }
        ).await.map(|res| res.sign_mechanism)
    }

    pub async fn sign(
        &self,
        key_id: &KeyId,
        signature_algorithm: SignAlgorithm,
        digest: Bytes,
    ) -> Result<Bytes, Error> {
        self.call::<_, SignResponse>(
            RpcOperation::Sign,
            SignRequest {
                key_id: key_id.clone(), signature_algorithm, digest
            }
        ).await.map(|res| res.signature)
    }

    /// Returns the DER encoded chain, new certificate first.
    pub async fn sign_certificate(
        &self,
        key_id: &KeyId,
        signature_algorithm: SignAlgorithm,
        subject_name: &str,
        public_key: Bytes,
    ) -> Result<Vec<Bytes>, Error> {
        self.call::<_, CertificateChainResponse>(
            RpcOperation::SignCertificate,
            SignCertificateRequest {
                key_id: key_id.clone(),
                signature_algorithm,
                subject_name: subject_name.to_string(),
                public_key,
            }
        ).await.map(|res| {
            res.certificate_chain.into_iter().map(|cert| cert.0).collect()
        })
    }
}

/// # Certificates
impl SignerClient {
    pub async fn generate_self_signed_cert(
        &self,
        key_id: &KeyId,
        member_id: Option<&ClientId>,
        key_usage: KeyUsage,
        common_name: &str,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<Bytes, Error> {
        self.call::<_, CertificateResponse>(
            RpcOperation::GenerateSelfSignedCert,
            GenerateSelfSignedCertRequest {
                key_id: key_id.clone(),
                member_id: member_id.cloned(),
                key_usage,
                common_name: common_name.to_string(),
                not_before,
                not_after,
            }
        ).await.map(|res| res.certificate)
    }

    pub async fn import_cert(
        &self,
        certificate: Bytes,
        initial_status: CertStatus,
        member_id: Option<&ClientId>,
    ) -> Result<KeyId, Error> {
        self.call::<_, ImportCertResponse>(
            RpcOperation::ImportCert,
            ImportCertRequest {
                certificate, initial_status, member_id: member_id.cloned()
            }
        ).await.map(|res| res.key_id)
    }

    pub async fn activate_cert(&self, cert_id_or_hash: &str) -> Result<(), Error> {
        self.call_empty(
            RpcOperation::ActivateCert, Self::cert_ref(cert_id_or_hash)
        ).await
    }

    pub async fn deactivate_cert(
        &self, cert_id_or_hash: &str
    ) -> Result<(), Error> {
        self.call_empty(
            RpcOperation::DeactivateCert, Self::cert_ref(cert_id_or_hash)
        ).await
    }

    pub async fn set_cert_status(
        &self, cert_id_or_hash: &str, status: CertStatus
    ) -> Result<(), Error> {
        self.call_empty(
            RpcOperation::SetCertStatus,
            SetCertStatusRequest {
                cert_id_or_hash: cert_id_or_hash.to_string(), status
            }
        ).await
    }

    pub async fn delete_cert(&self, cert_id_or_hash: &str) -> Result<(), Error> {
        self.call_empty(
            RpcOperation::DeleteCert, Self::cert_ref(cert_id_or_hash)
        ).await
    }

    pub async fn get_cert_for_hash(
        &self, cert_hash: &CertHash
    ) -> Result<CertificateInfo, Error> {
        self.call(
            RpcOperation::GetCertForHash,
            CertHashRequest { cert_hash: cert_hash.clone() }
        ).await
    }

    pub async fn get_key_id_for_cert_hash(
        &self, cert_hash: &CertHash
    ) -> Result<KeyIdInfo, Error> {
        self.call(
            RpcOperation::GetKeyIdForCertHash,
            CertHashRequest { cert_hash: cert_hash.clone() }
        ).await
    }

    pub async fn get_token_and_key_id_for_cert_hash(
        &self, cert_hash: &CertHash
    ) -> Result<TokenInfoAndKeyId, Error> {
        self.call(
            RpcOperation::GetTokenAndKeyIdForCertHash,
            CertHashRequest { cert_hash: cert_hash.clone() }
        ).await
    }

    pub async fn get_token_and_key_id_for_cert_request(
        &self, cert_request_id: &CertRequestId
    ) -> Result<TokenInfoAndKeyId, Error> {
        self.call(
            RpcOperation::GetTokenAndKeyIdForCertRequest,
            CertRequestIdRequest { cert_request_id: cert_request_id.clone() }
        ).await
    }

    pub async fn get_member_certs(
        &self, member_id: &ClientId
    ) -> Result<Vec<CertificateInfo>, Error> {
        self.call(
            RpcOperation::GetMemberCerts,
            MemberIdRequest { member_id: member_id.clone() }
        ).await
    }

    pub async fn get_member_signing_info(
        &self, member_id: &ClientId
    ) -> Result<MemberSigningInfo, Error> {
        self.call(
            RpcOperation::GetMemberSigningInfo,
            MemberIdRequest { member_id: member_id.clone() }
        ).await
    }

    pub async fn get_auth_key(
        &self, security_server: &SecurityServerId
    ) -> Result<AuthKeyInfo, Error> {
        self.call(
            RpcOperation::GetAuthKey,
            AuthKeyRequest { security_server: security_server.clone() }
        ).await
    }

    fn cert_ref(cert_id_or_hash: &str) -> CertIdOrHashRequest {
        CertIdOrHashRequest { cert_id_or_hash: cert_id_or_hash.to_string() }
    }
}

/// # Certificate requests
impl SignerClient {
    pub async fn generate_cert_request(
        &self,
        key_id: &KeyId,
        member_id: Option<&ClientId>,
        key_usage: KeyUsage,
        subject_name: &str,
        format: CertRequestFormat,
    ) -> Result<GeneratedCertRequestInfo, Error> {
        self.call(
            RpcOperation::GenerateCertRequest,
            GenerateCertRequestRequest {
                key_id: key_id.clone(),
                member_id: member_id.cloned(),
                key_usage,
                subject_name: subject_name.to_string(),
                format,
            }
        ).await
    }

    pub async fn regenerate_cert_request(
        &self, cert_request_id: &CertRequestId, format: CertRequestFormat,
    ) -> Result<GeneratedCertRequestInfo, Error> {
        self.call(
            RpcOperation::RegenerateCertRequest,
            RegenerateCertRequestRequest {
                cert_request_id: cert_request_id.clone(), format
            }
        ).await
    }

    pub async fn delete_cert_request(
        &self, cert_request_id: &CertRequestId
    ) -> Result<(), Error> {
        self.call_empty(
            RpcOperation::DeleteCertRequest,
            CertRequestIdRequest { cert_request_id: cert_request_id.clone() }
        ).await
    }
}

/// # OCSP
impl SignerClient {
    pub async fn get_ocsp_responses(
        &self, cert_hashes: &[CertHash]
    ) -> Result<Vec<OcspResponseEntry>, Error> {
        self.call::<_, OcspResponsesResponse>(
            RpcOperation::GetOcspResponses,
            GetOcspResponsesRequest { cert_hashes: cert_hashes.to_vec() }
        ).await.map(|res| res.responses)
    }

    /// Stores responses, given as base64 DER, in the order of the hashes.
    pub async fn set_ocsp_responses(
        &self, cert_hashes: &[CertHash], responses: Vec<String>,
    ) -> Result<(), Error> {
        self.call_empty(
            RpcOperation::SetOcspResponses,
            SetOcspResponsesRequest {
                cert_hashes: cert_hashes.to_vec(), responses
            }
        ).await
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_uris() {
        let client = SignerClient::new(
            Url::parse("http://127.0.0.1:5558/").unwrap(), None
        );
        assert_eq!(
            client.uri(RpcOperation::Sign),
            "http://127.0.0.1:5558/rpc/v1/sign"
        );

        let client = SignerClient::new(
            Url::parse("http://signer.example/base").unwrap(), None
        );
        assert_eq!(
            client.uri(RpcOperation::ListTokens),
            "http://signer.example/base/rpc/v1/list-tokens"
        );
    }
}
