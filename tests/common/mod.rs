//! Helpers for running a signer in integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use bytes::Bytes;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509, X509NameBuilder};
use tempfile::TempDir;
use tokio::sync::oneshot;
use url::Url;
use tokensigner::api::fault::Fault;
use tokensigner::cli::{Error, SignerClient};
use tokensigner::config::Config;
use tokensigner::server::start::start_signer_daemon;


/// A signer running on a random local port.
pub struct TestSigner {
    pub client: SignerClient,
    pub dir: TempDir,
}

/// Starts a signer with the software token enabled.
pub async fn start_signer() -> TestSigner {
    start_signer_with(|_| { }).await
}

pub async fn start_signer_with(configure: impl FnOnce(&mut Config)) -> TestSigner {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::test(dir.path());
    config.port = 0;
    configure(&mut config);
    let token = config.auth_token.clone();

    let (tx, rx) = oneshot::channel();
    tokio::spawn(start_signer_daemon(Arc::new(config), Some(tx)));
    let addr = rx.await.unwrap();

    TestSigner {
        client: SignerClient::new(
            Url::parse(&format!("http://{addr}/")).unwrap(), token
        ),
        dir,
    }
}

/// Returns the fault of a failed call.
pub fn fault<T: std::fmt::Debug>(res: Result<T, Error>) -> Fault {
    res.unwrap_err().fault().cloned().expect("expected a fault")
}

pub fn sha256(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(&openssl::sha::sha256(data))
}

/// Issues a certificate for a DER encoded public key by a throw-away CA.
pub fn issue_cert(public_key_der: &[u8], common_name: &str) -> Bytes {
    let subject_key = PKey::public_key_from_der(public_key_der).unwrap();
    let ca_key: PKey<Private> = PKey::from_rsa(
        Rsa::generate(2048).unwrap()
    ).unwrap();

    let mut subject = X509NameBuilder::new().unwrap();
    subject.append_entry_by_text("CN", common_name).unwrap();
    let subject = subject.build();

    let mut issuer = X509NameBuilder::new().unwrap();
    issuer.append_entry_by_text("CN", "Test CA").unwrap();
    let issuer = issuer.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(rand::random::<u32>()).unwrap();
    builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
    builder.set_subject_name(&subject).unwrap();
    builder.set_issuer_name(&issuer).unwrap();
    builder.set_pubkey(&subject_key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(365).unwrap()).unwrap();
    builder.sign(&ca_key, MessageDigest::sha256()).unwrap();
    Bytes::from(builder.build().to_der().unwrap())
}
