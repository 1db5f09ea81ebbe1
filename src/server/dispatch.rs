//! Dispatching requests to the service operations.

use log::{debug, trace};
use serde::Serialize;
use crate::api::rpc::{
    ActivateTokenRequest, AuthKeyRequest, BoolResponse,
    CertHashRequest, CertIdOrHashRequest, CertRequestIdRequest,
    CertificateBytes, CertificateChainResponse, CertificateResponse,
    DeleteKeyRequest, GenerateCertRequestRequest, GenerateKeyRequest,
    GenerateSelfSignedCertRequest, GetOcspResponsesRequest,
    ImportCertRequest, ImportCertResponse, InitSoftwareTokenRequest,
    KeyIdRequest, MemberIdRequest, NoParams, OcspResponsesResponse,
    RegenerateCertRequestRequest, RpcOperation, SetCertStatusRequest,
    SetFriendlyNameRequest, SetOcspResponsesRequest, SignCertificateRequest,
    SignMechanismResponse, SignRequest, SignResponse, TokenIdRequest,
    UpdateSoftwareTokenPinRequest,
};
use crate::api::ids::{KeyId, TokenId};
use crate::commons::error::Error;
use crate::constants::{RPC_PATH_PREFIX, RPC_VERSION};
use super::request::{PathIter, Request};
use super::response::HttpResponse;
use super::runtime::RunError;


//------------ DispatchError -------------------------------------------------

/// A response to be sent back early.
///
/// This type exists so you can use the question mark operator for all
/// sorts of things during dispatch to minimize clutter.
#[derive(Debug)]
pub struct DispatchError(pub HttpResponse);

impl From<HttpResponse> for DispatchError {
    fn from(src: HttpResponse) -> Self {
        DispatchError(src)
    }
}

impl From<Error> for DispatchError {
    fn from(src: Error) -> Self {
        DispatchError(HttpResponse::response_from_error(src))
    }
}

impl From<RunError> for DispatchError {
    fn from(src: RunError) -> Self {
        DispatchError(HttpResponse::response_from_error(src.into_error()))
    }
}


//------------ / -------------------------------------------------------------

pub async fn dispatch_request(
    request: Request<'_>,
    mut path: PathIter<'_>,
) -> Result<HttpResponse, DispatchError> {
    match path.next() {
        Some(RPC_PATH_PREFIX) => rpc(request, path).await,
        _ => Ok(HttpResponse::not_found())
    }
}

fn json<T: Serialize>(value: T) -> Result<HttpResponse, DispatchError> {
    Ok(HttpResponse::json(&value))
}

fn empty(_: ()) -> Result<HttpResponse, DispatchError> {
    Ok(HttpResponse::ok())
}


//------------ /rpc/v1/<operation> -------------------------------------------

async fn rpc(
    request: Request<'_>, mut path: PathIter<'_>
) -> Result<HttpResponse, DispatchError> {
    if path.next() != Some(RPC_VERSION) {
        return Ok(HttpResponse::not_found())
    }
    let op: RpcOperation = path.parse_next()?;
    path.check_exhausted()?;
    request.check_post()?;
    request.check_auth()?;
    let agent = request.user_agent().unwrap_or("unknown");
    if op.is_mutating() {
        debug!("RPC {op} from '{agent}'");
    }
    else {
        trace!("RPC {op} from '{agent}'");
    }

    match op {
        RpcOperation::ListTokens
        | RpcOperation::GetToken
        | RpcOperation::GetTokenForKey
        | RpcOperation::GetTokenForCertHash
        | RpcOperation::GetTokenForCertRequest
        | RpcOperation::ActivateToken
        | RpcOperation::DeactivateToken
        | RpcOperation::SetTokenFriendlyName
        | RpcOperation::InitSoftwareToken
        | RpcOperation::UpdateSoftwareTokenPin
        | RpcOperation::IsBatchSigningEnabled
        | RpcOperation::IsHsmOperational => token_op(request, op).await,

        RpcOperation::GenerateKey
        | RpcOperation::SetKeyFriendlyName
        | RpcOperation::DeleteKey
        | RpcOperation::GetSignMechanism
        | RpcOperation::Sign
        | RpcOperation::SignCertificate => key_op(request, op).await,

        RpcOperation::GetOcspResponses
        | RpcOperation::SetOcspResponses => ocsp_op(request, op).await,

        _ => cert_op(request, op).await,
    }
}


//------------ Token Operations ----------------------------------------------

async fn token_op(
    request: Request<'_>, op: RpcOperation
) -> Result<HttpResponse, DispatchError> {
    match op {
        RpcOperation::ListTokens => {
            let (server, NoParams {}) = request.read_json().await?;
            json(server.run(|service| service.list_tokens()).await?)
        }
        RpcOperation::GetToken => {
            let (server, req): (_, TokenIdRequest) = request.read_json().await?;
            json(server.run(move |service| {
                service.get_token(&req.token_id)
            }).await?)
        }
        RpcOperation::GetTokenForKey => {
            let (server, req): (_, KeyIdRequest) = request.read_json().await?;
            json(server.run(move |service| {
                service.get_token_for_key(&req.key_id)
            }).await?)
        }
        RpcOperation::GetTokenForCertHash => {
            let (server, req): (_, CertHashRequest) = request.read_json().await?;
            json(server.run(move |service| {
                service.get_token_for_cert_hash(&req.cert_hash)
            }).await?)
        }
        RpcOperation::GetTokenForCertRequest => {
            let (server, req): (_, CertRequestIdRequest)
                = request.read_json().await?;
            json(server.run(move |service| {
                service.get_token_for_cert_request(&req.cert_request_id)
            }).await?)
        }
        RpcOperation::ActivateToken => {
            let (server, req): (_, ActivateTokenRequest)
                = request.read_json().await?;
            empty(server.run(move |service| {
                service.activate_token(&req.token_id, &req.pin)
            }).await?)
        }
        RpcOperation::DeactivateToken => {
            let (server, req): (_, TokenIdRequest) = request.read_json().await?;
            empty(server.run(move |service| {
                service.deactivate_token(&req.token_id)
            }).await?)
        }
        RpcOperation::SetTokenFriendlyName => {
            let (server, req): (_, SetFriendlyNameRequest<TokenId>)
                = request.read_json().await?;
            empty(server.run(move |service| {
                service.set_token_friendly_name(&req.id, &req.friendly_name)
            }).await?)
        }
        RpcOperation::InitSoftwareToken => {
            let (server, req): (_, InitSoftwareTokenRequest)
                = request.read_json().await?;
            empty(server.run(move |service| {
                service.init_software_token(&req.pin)
            }).await?)
        }
        RpcOperation::UpdateSoftwareTokenPin => {
            let (server, req): (_, UpdateSoftwareTokenPinRequest)
                = request.read_json().await?;
            empty(server.run(move |service| {
                service.update_software_token_pin(
                    &req.token_id, &req.old_pin, &req.new_pin
                )
            }).await?)
        }
        RpcOperation::IsBatchSigningEnabled => {
            let (server, req): (_, KeyIdRequest) = request.read_json().await?;
            let value = server.run(move |service| {
                service.is_batch_signing_enabled(&req.key_id)
            }).await?;
            json(BoolResponse { value })
        }
        RpcOperation::IsHsmOperational => {
            let (server, NoParams {}) = request.read_json().await?;
            let value = server.run(|service| {
                service.is_hsm_operational()
            }).await?;
            json(BoolResponse { value })
        }
        _ => Ok(HttpResponse::not_found())
    }
}


//------------ Key Operations ------------------------------------------------

async fn key_op(
    request: Request<'_>, op: RpcOperation
) -> Result<HttpResponse, DispatchError> {
    match op {
        RpcOperation::GenerateKey => {
            let (server, req): (_, GenerateKeyRequest)
                = request.read_json().await?;
            json(server.run(move |service| {
                service.generate_key(&req.token_id, req.key_label.as_deref())
            }).await?)
        }
        RpcOperation::SetKeyFriendlyName => {
            let (server, req): (_, SetFriendlyNameRequest<KeyId>)
                = request.read_json().await?;
            empty(server.run(move |service| {
                service.set_key_friendly_name(&req.id, &req.friendly_name)
            }).await?)
        }
        RpcOperation::DeleteKey => {
            let (server, req): (_, DeleteKeyRequest)
                = request.read_json().await?;
            empty(server.run(move |service| {
                service.delete_key(&req.key_id, req.delete_from_device)
            }).await?)
        }
        RpcOperation::GetSignMechanism => {
            let (server, req): (_, KeyIdRequest) = request.read_json().await?;
            let sign_mechanism = server.run(move |service| {
                service.get_sign_mechanism(&req.key_id)
            }).await?;
            json(SignMechanismResponse { sign_mechanism })
        }
        RpcOperation::Sign => {
            let (server, req): (_, SignRequest) = request.read_json().await?;
            let signature = server.run(move |service| {
                service.sign(&req.key_id, req.signature_algorithm, &req.digest)
            }).await?;
            json(SignResponse { signature })
        }
        RpcOperation::SignCertificate => {
            let (server, req): (_, SignCertificateRequest)
                = request.read_json().await?;
            let chain = server.run(move |service| {
                service.sign_certificate(
                    &req.key_id, req.signature_algorithm,
                    &req.subject_name, &req.public_key,
                )
            }).await?;
            json(CertificateChainResponse {
                certificate_chain: chain.into_iter().map(
                    CertificateBytes
                ).collect()
            })
        }
        _ => Ok(HttpResponse::not_found())
    }
}


//------------ Certificate Operations ----------------------------------------

async fn cert_op(
    request: Request<'_>, op: RpcOperation
) -> Result<HttpResponse, DispatchError> {
    match op {
        RpcOperation::GenerateSelfSignedCert => {
            let (server, req): (_, GenerateSelfSignedCertRequest)
                = request.read_json().await?;
            let certificate = server.run(move |service| {
                service.generate_self_signed_cert(&req)
            }).await?;
            json(CertificateResponse { certificate })
        }
        RpcOperation::ImportCert => {
            let (server, req): (_, ImportCertRequest)
                = request.read_json().await?;
            let key_id = server.run(move |service| {
                service.import_cert(
                    &req.certificate, req.initial_status,
                    req.member_id.as_ref(),
                )
            }).await?;
            json(ImportCertResponse { key_id })
        }
        RpcOperation::ActivateCert => {
            let (server, req): (_, CertIdOrHashRequest)
                = request.read_json().await?;
            empty(server.run(move |service| {
                service.activate_cert(&req.cert_id_or_hash)
            }).await?)
        }
        RpcOperation::DeactivateCert => {
            let (server, req): (_, CertIdOrHashRequest)
                = request.read_json().await?;
            empty(server.run(move |service| {
                service.deactivate_cert(&req.cert_id_or_hash)
            }).await?)
        }
        RpcOperation::SetCertStatus => {
            let (server, req): (_, SetCertStatusRequest)
                = request.read_json().await?;
            empty(server.run(move |service| {
                service.set_cert_status(&req.cert_id_or_hash, req.status)
            }).await?)
        }
        RpcOperation::DeleteCert => {
            let (server, req): (_, CertIdOrHashRequest)
                = request.read_json().await?;
            empty(server.run(move |service| {
                service.delete_cert(&req.cert_id_or_hash)
            }).await?)
        }
        RpcOperation::GenerateCertRequest => {
            let (server, req): (_, GenerateCertRequestRequest)
                = request.read_json().await?;
            json(server.run(move |service| {
                service.generate_cert_request(
                    &req.key_id, req.member_id.as_ref(), req.key_usage,
                    &req.subject_name, req.format,
                )
            }).await?)
        }
        RpcOperation::RegenerateCertRequest => {
            let (server, req): (_, RegenerateCertRequestRequest)
                = request.read_json().await?;
            json(server.run(move |service| {
                service.regenerate_cert_request(
                    &req.cert_request_id, req.format
                )
            }).await?)
        }
        RpcOperation::DeleteCertRequest => {
            let (server, req): (_, CertRequestIdRequest)
                = request.read_json().await?;
            empty(server.run(move |service| {
                service.delete_cert_request(&req.cert_request_id)
            }).await?)
        }
        RpcOperation::GetCertForHash => {
            let (server, req): (_, CertHashRequest)
                = request.read_json().await?;
            json(server.run(move |service| {
                service.get_cert_for_hash(&req.cert_hash)
            }).await?)
        }
        RpcOperation::GetKeyIdForCertHash => {
            let (server, req): (_, CertHashRequest)
                = request.read_json().await?;
            json(server.run(move |service| {
                service.get_key_id_for_cert_hash(&req.cert_hash)
            }).await?)
        }
        RpcOperation::GetTokenAndKeyIdForCertHash => {
            let (server, req): (_, CertHashRequest)
                = request.read_json().await?;
            json(server.run(move |service| {
                service.get_token_and_key_id_for_cert_hash(&req.cert_hash)
            }).await?)
        }
        RpcOperation::GetTokenAndKeyIdForCertRequest => {
            let (server, req): (_, CertRequestIdRequest)
                = request.read_json().await?;
            json(server.run(move |service| {
                service.get_token_and_key_id_for_cert_request(
                    &req.cert_request_id
                )
            }).await?)
        }
        RpcOperation::GetMemberCerts => {
            let (server, req): (_, MemberIdRequest)
                = request.read_json().await?;
            json(server.run(move |service| {
                service.get_member_certs(&req.member_id)
            }).await?)
        }
        RpcOperation::GetMemberSigningInfo => {
            let (server, req): (_, MemberIdRequest)
                = request.read_json().await?;
            json(server.run(move |service| {
                service.get_member_signing_info(&req.member_id)
            }).await?)
        }
        RpcOperation::GetAuthKey => {
            let (server, req): (_, AuthKeyRequest)
                = request.read_json().await?;
            json(server.run(move |service| {
                service.get_auth_key(&req.security_server)
            }).await?)
        }
        _ => Ok(HttpResponse::not_found())
    }
}


//------------ OCSP Operations -----------------------------------------------

async fn ocsp_op(
    request: Request<'_>, op: RpcOperation
) -> Result<HttpResponse, DispatchError> {
    match op {
        RpcOperation::GetOcspResponses => {
            let (server, req): (_, GetOcspResponsesRequest)
                = request.read_json().await?;
            let responses = server.run(move |service| {
                service.get_ocsp_responses(&req.cert_hashes)
            }).await?;
            json(OcspResponsesResponse { responses })
        }
        RpcOperation::SetOcspResponses => {
            let (server, req): (_, SetOcspResponsesRequest)
                = request.read_json().await?;
            empty(server.run(move |service| {
                service.set_ocsp_responses(&req.cert_hashes, &req.responses)
            }).await?)
        }
        _ => Ok(HttpResponse::not_found())
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use reqwest::StatusCode;
    use serde_json::json;
    use tokio::net::TcpListener;
    use crate::api::fault::Fault;
    use crate::api::serde_ext::encode_base64;
    use crate::api::token::TokenInfo;
    use crate::commons::test::sha256;
    use crate::config::{Config, OcspConfig};
    use crate::device::DeviceModule;
    use crate::device::mock::{MockModule, MockState};
    use crate::manager::TokenManager;
    use crate::ocsp::cache::OcspCache;
    use crate::registry::TokenRegistry;
    use crate::registry::store::RegistryStore;
    use crate::server::HttpServer;
    use crate::server::start::serve_listener;
    use crate::service::SigningService;
    use super::*;

    struct TestServer {
        base: String,
        client: reqwest::Client,
        mock: Arc<MockState>,
    }

    impl TestServer {
        async fn start(config: Config) -> Self {
            let mock = MockState::new("1234");
            let registry = Arc::new(
                TokenRegistry::load(RegistryStore::memory()).unwrap()
            );
            let manager = Arc::new(TokenManager::new(
                registry,
                vec![DeviceModule::Mock(
                    MockModule::new("hsm", "1", mock.clone())
                )],
            ));
            manager.discover().unwrap();
            let service = Arc::new(SigningService::new(
                manager, Arc::new(OcspCache::new(&OcspConfig::default())),
                false,
            ));
            let server = Arc::new(HttpServer::new(service, &config));
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(serve_listener(listener, server));
            TestServer {
                base: format!("http://{addr}/rpc/v1"),
                client: reqwest::Client::new(),
                mock,
            }
        }

        async fn post(
            &self, op: &str, body: serde_json::Value
        ) -> reqwest::Response {
            self.client.post(format!("{}/{op}", self.base))
                .json(&body)
                .send().await.unwrap()
        }

        async fn fault(
            &self, op: &str, body: serde_json::Value
        ) -> (StatusCode, Fault) {
            let res = self.post(op, body).await;
            let status = res.status();
            (status, res.json().await.unwrap())
        }
    }

    fn config(dir: &std::path::Path) -> Config {
        Config::test(dir)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sign_through_the_front_end() {
        let dir = tempfile::tempdir().unwrap();
        let server = TestServer::start(config(dir.path())).await;

        let tokens: Vec<TokenInfo> = server.post(
            "list-tokens", json!({})
        ).await.json().await.unwrap();
        assert_eq!(tokens.len(), 1);
        let token_id = tokens[0].id.to_string();

        // Not active yet, so signing must fail with a structured fault.
        let (status, fault) = server.fault(
            "generate-key", json!({ "token_id": token_id })
        ).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(fault.is_kind("TokenNotActive"));

        let res = server.post(
            "activate-token", json!({ "token_id": token_id, "pin": "1234" })
        ).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.bytes().await.unwrap().is_empty());

        let key: serde_json::Value = server.post(
            "generate-key", json!({ "token_id": token_id, "key_label": "k" })
        ).await.json().await.unwrap();
        let key_id = key["id"].as_str().unwrap().to_string();

        let digest = encode_base64(&sha256(b"payload"));
        let res = server.post("sign", json!({
            "key_id": key_id,
            "signature_algorithm": "SHA256withRSA",
            "digest": digest,
        })).await;
        assert_eq!(res.status(), StatusCode::OK);
        let signed: SignResponse = res.json().await.unwrap();
        assert_eq!(signed.signature.len(), 256);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let server = TestServer::start(config(dir.path())).await;

        let res = server.client.get(
            format!("{}/list-tokens", server.base)
        ).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);

        let res = server.post("format-disk", json!({})).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let (status, fault) = server.fault(
            "get-token", json!({ "token": "x" })
        ).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(fault.is_kind("InvalidRequest"));

        let (status, fault) = server.fault(
            "get-token", json!({ "token_id": "nope" })
        ).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(fault.is_kind("TokenNotFound"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bearer_token_is_required_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.auth_token = Some("secret".into());
        let server = TestServer::start(config).await;

        let res = server.post("list-tokens", json!({})).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(res.headers()["www-authenticate"], "Bearer");

        let res = server.client.post(format!("{}/list-tokens", server.base))
            .bearer_auth("wrong").send().await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = server.client.post(format!("{}/list-tokens", server.base))
            .bearer_auth("secret").send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_devices_time_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.request_timeout_seconds = 1;
        let server = TestServer::start(config).await;
        server.mock.set_op_delay(Duration::from_secs(3));

        let (status, fault) = server.fault(
            "activate-token", json!({ "token_id": "hsm-1", "pin": "1234" })
        ).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert!(fault.is_kind("Timeout"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_bodies_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.post_limit = 16;
        let server = TestServer::start(config).await;
        let (status, fault) = server.fault(
            "get-token", json!({ "token_id": "a-rather-long-token-id" })
        ).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(fault.is_kind("InvalidRequest"));
    }
}
