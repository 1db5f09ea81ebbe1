//! Helper functions for testing the signer.

use std::path::PathBuf;
use bytes::Bytes;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509, X509NameBuilder};


/// Runs the test in the closure with a fresh temporary directory.
///
/// The directory is removed again afterwards.
pub fn test_under_tmp<F>(op: F)
where
    F: FnOnce(PathBuf),
{
    let dir = tempfile::tempdir().unwrap();
    op(dir.path().into());
}

/// Returns the SHA-256 digest of the given data.
pub fn sha256(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(&openssl::sha::sha256(data))
}

/// Creates a throw-away RSA key.
pub fn rsa_key() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
}

/// Issues a certificate for the DER encoded public key.
///
/// The certificate is signed by a throw-away CA key, which is fine for the
/// signer since it only matches certificates by public key.
pub fn issue_cert(public_key_der: &[u8], common_name: &str) -> Bytes {
    let subject_key = PKey::public_key_from_der(public_key_der).unwrap();
    let ca_key = rsa_key();

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
