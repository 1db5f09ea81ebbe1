//! Drives a running signer through its RPC interface.

mod common;

use std::str::FromStr;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Verifier;
use tokensigner::api::ids::{CertHash, TokenId};
use tokensigner::api::member::{ClientId, SecurityServerId};
use tokensigner::api::rpc::Pin;
use tokensigner::api::token::{
    CertRequestFormat, CertStatus, KeyUsage, TokenKind, TokenState,
};
use tokensigner::cli::SignerClient;
use tokensigner::device::mechanism::SignAlgorithm;
use self::common::{fault, issue_cert, sha256, start_signer, start_signer_with};


fn soft() -> TokenId {
    TokenId::from("0")
}

async fn activated(client: &SignerClient) {
    client.init_software_token(Pin::new("1234")).await.unwrap();
    client.activate_token(&soft(), Pin::new("1234")).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn software_token_lifecycle() {
    let signer = start_signer().await;
    let client = &signer.client;

    let tokens = client.list_tokens().await.unwrap();
    let token = tokens.iter().find(|token| token.id == soft()).unwrap();
    assert_eq!(token.kind, TokenKind::Software);

    client.init_software_token(Pin::new("1234")).await.unwrap();
    assert!(fault(
        client.init_software_token(Pin::new("5678")).await
    ).is_kind("TokenAlreadyInitialized"));
    assert_eq!(
        client.get_token(&soft()).await.unwrap().state,
        TokenState::PresentInactive
    );

    assert!(fault(
        client.activate_token(&soft(), Pin::new("4321")).await
    ).is_kind("AuthenticationFailure"));
    client.activate_token(&soft(), Pin::new("1234")).await.unwrap();
    assert_eq!(
        client.get_token(&soft()).await.unwrap().state, TokenState::Active
    );

    client.set_token_friendly_name(&soft(), "soft").await.unwrap();
    let key = client.generate_key(&soft(), Some("test key")).await.unwrap();
    assert_eq!(key.token_id, soft());
    let token = client.get_token_for_key(&key.id).await.unwrap();
    assert_eq!(token.friendly_name.as_deref(), Some("soft"));
    assert!(token.key(&key.id).is_some());

    let data = b"some message";
    let signature = client.sign(
        &key.id, SignAlgorithm::Sha256WithRsa, sha256(data)
    ).await.unwrap();
    let public_key = PKey::public_key_from_der(&key.public_key).unwrap();
    let mut verifier = Verifier::new(
        MessageDigest::sha256(), &public_key
    ).unwrap();
    assert!(verifier.verify_oneshot(&signature, data).unwrap());

    assert!(fault(client.sign(
        &key.id, SignAlgorithm::Sha256WithRsa, sha256(data).slice(..20)
    ).await).is_kind("SigningFailure"));

    client.deactivate_token(&soft()).await.unwrap();
    assert!(fault(client.sign(
        &key.id, SignAlgorithm::Sha256WithRsa, sha256(data)
    ).await).is_kind("TokenNotActive"));

    client.update_software_token_pin(
        &soft(), Pin::new("1234"), Pin::new("9999")
    ).await.unwrap();
    client.activate_token(&soft(), Pin::new("9999")).await.unwrap();
    client.sign(
        &key.id, SignAlgorithm::Sha512WithRsa,
        SignAlgorithm::Sha512WithRsa.digest(data).unwrap()
    ).await.unwrap();

    client.delete_key(&key.id, true).await.unwrap();
    assert!(fault(
        client.get_token_for_key(&key.id).await
    ).is_kind("KeyNotFound"));
}

#[tokio::test(flavor = "multi_thread")]
async fn member_certificates() {
    let signer = start_signer().await;
    let client = &signer.client;
    activated(client).await;

    let member = ClientId::from_str("EE/GOV/1234").unwrap();
    let key = client.generate_key(&soft(), None).await.unwrap();

    let req = client.generate_cert_request(
        &key.id, Some(&member), KeyUsage::Signing, "CN=1234",
        CertRequestFormat::Pem,
    ).await.unwrap();
    assert!(req.cert_request.starts_with(b"-----BEGIN CERTIFICATE REQUEST"));
    let found = client.get_token_and_key_id_for_cert_request(
        &req.cert_request_id
    ).await.unwrap();
    assert_eq!(found.key_id, key.id);

    let cert = issue_cert(&key.public_key, "1234");
    let hash = CertHash::of_der(&cert);
    let key_id = client.import_cert(
        cert.clone(), CertStatus::Registered, Some(&member)
    ).await.unwrap();
    assert_eq!(key_id, key.id);

    // The request was satisfied by the certificate.
    assert!(fault(client.get_token_for_cert_request(
        &req.cert_request_id
    ).await).is_kind("CertRequestNotFound"));

    assert!(fault(client.import_cert(
        cert.clone(), CertStatus::Registered, Some(&member)
    ).await).is_kind("CertExists"));

    let info = client.get_member_signing_info(
        &ClientId::from_str("EE/GOV/1234/subsystem").unwrap()
    ).await.unwrap();
    assert_eq!(info.key_id, key.id);
    assert_eq!(info.cert.hash, hash);

    let certs = client.get_member_certs(&member).await.unwrap();
    assert_eq!(certs.len(), 1);
    assert_eq!(
        client.get_key_id_for_cert_hash(&hash).await.unwrap().key_id, key.id
    );
    assert_eq!(
        client.get_token_for_cert_hash(&hash).await.unwrap().id, soft()
    );

    client.deactivate_cert(hash.as_str()).await.unwrap();
    assert!(fault(
        client.get_member_signing_info(&member).await
    ).is_kind("CertNotFound"));
    client.activate_cert(hash.as_str()).await.unwrap();
    client.get_member_signing_info(&member).await.unwrap();

    client.delete_cert(hash.as_str()).await.unwrap();
    assert!(fault(
        client.get_cert_for_hash(&hash).await
    ).is_kind("CertNotFound"));
}

#[tokio::test(flavor = "multi_thread")]
async fn authentication_keys() {
    let signer = start_signer().await;
    let client = &signer.client;
    activated(client).await;

    let owner = ClientId::from_str("EE/GOV/1234").unwrap();
    let key = client.generate_key(&soft(), None).await.unwrap();
    let cert = issue_cert(&key.public_key, "server1");
    client.import_cert(cert, CertStatus::Registered, None).await.unwrap();

    let auth = client.get_auth_key(
        &SecurityServerId::new(owner, "server1")
    ).await.unwrap();
    assert_eq!(auth.key_id, key.id);
    assert_eq!(auth.token_id, soft());

    // Authentication keys can't be used for member signing.
    assert!(fault(client.generate_cert_request(
        &key.id, None, KeyUsage::Signing, "CN=other",
        CertRequestFormat::Der,
    ).await).is_kind("KeyUsageConflict"));
}

#[tokio::test(flavor = "multi_thread")]
async fn ocsp_responses_from_clients() {
    let signer = start_signer().await;
    let client = &signer.client;

    let hash = CertHash::from_str("0a1b2c").unwrap();
    let other = CertHash::from_str("ffff").unwrap();
    client.set_ocsp_responses(
        &[hash.clone()], vec!["AAEC".into()]
    ).await.unwrap();

    let responses = client.get_ocsp_responses(
        &[hash.clone(), other.clone()]
    ).await.unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].cert_hash, hash);
    assert_eq!(responses[0].response.as_deref(), Some([0u8, 1, 2].as_ref()));
    assert_eq!(responses[1].cert_hash, other);
    assert!(responses[1].response.is_none());

    assert!(fault(client.set_ocsp_responses(
        &[hash, other], vec!["AAEC".into()]
    ).await).is_kind("InvalidRequest"));
}

#[tokio::test(flavor = "multi_thread")]
async fn bearer_token() {
    let signer = start_signer_with(|config| {
        config.auth_token = Some("secret".into());
    }).await;
    signer.client.list_tokens().await.unwrap();

    let anonymous = SignerClient::new(signer.client.base().clone(), None);
    assert!(fault(anonymous.list_tokens().await).is_kind("Unauthorized"));
}
