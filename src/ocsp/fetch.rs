//! Fetching OCSP responses from responders.

use std::{fmt, fs};
use std::path::Path;
use std::time::Duration;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, warn};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::ocsp::{
    OcspCertId, OcspFlag, OcspRequest, OcspResponse, OcspResponseStatus,
};
use openssl::stack::Stack;
use openssl::x509::{X509, X509VerifyResult};
use openssl::x509::store::{X509Store, X509StoreBuilder};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderValue, USER_AGENT};
use crate::commons::error::IoError;
use crate::commons::file;
use crate::config::OcspConfig;
use crate::constants::{
    OCSP_CLOCK_SKEW_SECS, OCSP_REQUEST_CONTENT_TYPE, SIGNER_USER_AGENT,
};


//------------ FetchedResponse -----------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FetchedResponse {
    /// The DER encoded OCSP response.
    pub response: Bytes,

    /// The next update time the responder gave for our certificate.
    pub next_update: Option<DateTime<Utc>>,
}


//------------ OcspFetcher ---------------------------------------------------

/// Gets OCSP responses for certificates.
pub enum OcspFetcher {
    Http(HttpFetcher),

    #[cfg(test)]
    Mock(mock::MockFetcher),
}

impl OcspFetcher {
    /// Fetches a response for the DER encoded certificate.
    ///
    /// Transient failures are retried with exponential backoff for at most
    /// `retry_for`.
    pub async fn fetch(
        &self, cert: &[u8], retry_for: Duration
    ) -> Result<FetchedResponse, FetchError> {
        match self {
            OcspFetcher::Http(fetcher) => fetcher.fetch(cert, retry_for).await,
            #[cfg(test)]
            OcspFetcher::Mock(fetcher) => fetcher.fetch(cert),
        }
    }
}


//------------ HttpFetcher ---------------------------------------------------

/// Asks the responder named in a certificate over HTTP.
pub struct HttpFetcher {
    client: reqwest::Client,

    /// The certificates of the CAs whose certificates we may have to check.
    issuers: Vec<X509>,

    /// The same certificates as trust anchors for response signatures.
    trusted: X509Store,
}

impl HttpFetcher {
    pub fn new(config: &OcspConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout())
            .build()
            .map_err(FetchError::Http)?;
        let issuers = match config.ca_certs_dir.as_ref() {
            Some(dir) => Self::load_issuers(dir)?,
            None => Vec::new(),
        };
        let mut trusted = X509StoreBuilder::new()?;
        for issuer in &issuers {
            trusted.add_cert(issuer.clone())?;
        }
        Ok(HttpFetcher { client, issuers, trusted: trusted.build() })
    }

    /// Loads all PEM certificates from the given directory.
    fn load_issuers(dir: &Path) -> Result<Vec<X509>, FetchError> {
        let entries = fs::read_dir(dir).map_err(|e| {
            FetchError::Io(IoError::new(
                format!("Cannot read CA certificates dir '{}'", dir.display()),
                e,
            ))
        })?;
        let mut res = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue
            }
            let pem = file::read(&path).map_err(FetchError::Io)?;
            match X509::stack_from_pem(&pem) {
                Ok(certs) => res.extend(certs),
                Err(err) => {
                    warn!(
                        "Ignoring '{}', not a PEM certificate file: {err}",
                        path.display()
                    );
                }
            }
        }
        debug!(
            "Loaded {} CA certificates for OCSP from {}",
            res.len(), dir.display()
        );
        Ok(res)
    }

    async fn fetch(
        &self, cert: &[u8], retry_for: Duration
    ) -> Result<FetchedResponse, FetchError> {
        let (uri, request) = self.prepare(cert)?;

        let policy = ExponentialBackoff {
            max_elapsed_time: Some(retry_for),
            ..Default::default()
        };
        let notify = |err, next: Duration| {
            warn!(
                "OCSP request to {uri} failed, retrying in {} seconds: {err}",
                next.as_secs()
            );
        };
        let (uri_ref, request_ref) = (&uri, &request);
        let op = move || async move {
            self.post(uri_ref, request_ref.clone()).await.map_err(|err| {
                if err.is_transient() {
                    backoff::Error::transient(err)
                }
                else {
                    backoff::Error::permanent(err)
                }
            })
        };
        let body = backoff::future::retry_notify(policy, op, notify).await?;

        self.parse(cert, body)
    }

    /// Returns the responder URI and the encoded request.
    fn prepare(&self, cert: &[u8]) -> Result<(String, Bytes), FetchError> {
        let (cert, issuer) = self.cert_and_issuer(cert)?;
        let responders = cert.ocsp_responders()?;
        let uri = responders.iter().next().map(|uri| {
            uri.to_string()
        }).ok_or(FetchError::NoResponder)?;

        let mut request = OcspRequest::new()?;
        request.add_id(Self::cert_id(&cert, issuer)?)?;
        Ok((uri, Bytes::from(request.to_der()?)))
    }

    async fn post(&self, uri: &str, request: Bytes) -> Result<Bytes, FetchError> {
        let res = self.client.post(uri)
            .header(USER_AGENT, HeaderValue::from_static(SIGNER_USER_AGENT))
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static(OCSP_REQUEST_CONTENT_TYPE)
            )
            .body(request)
            .send()
            .await
            .map_err(FetchError::Http)?;
        match res.status() {
            StatusCode::OK => res.bytes().await.map_err(FetchError::Http),
            status => Err(FetchError::Status(status)),
        }
    }

    /// Checks the response and finds the next update for our certificate.
    ///
    /// The response must be signed by the issuer of the certificate or by
    /// a responder it delegated to, and must be current.
    fn parse(
        &self, cert: &[u8], body: Bytes
    ) -> Result<FetchedResponse, FetchError> {
        let response = OcspResponse::from_der(&body)?;
        if response.status() != OcspResponseStatus::SUCCESSFUL {
            return Err(FetchError::Responder(format!(
                "response status {}", response.status().as_raw()
            )))
        }
        let basic = response.basic()?;
        let (cert, issuer) = self.cert_and_issuer(cert)?;

        let mut certs = Stack::new()?;
        certs.push(issuer.clone())?;
        basic.verify(&certs, &self.trusted, OcspFlag::empty()).map_err(|err| {
            FetchError::Responder(format!("invalid signature: {err}"))
        })?;

        let cert_id = Self::cert_id(&cert, issuer)?;
        let status = basic.find_status(&cert_id).ok_or_else(|| {
            FetchError::Responder("no status for certificate".into())
        })?;
        status.check_validity(OCSP_CLOCK_SKEW_SECS, None).map_err(|err| {
            FetchError::Responder(format!("outdated response: {err}"))
        })?;
        let next_update = status.next_update().and_then(|time| {
            parse_asn1_time(&time.to_string())
        });
        Ok(FetchedResponse { response: body, next_update })
    }

    fn cert_and_issuer(&self, cert: &[u8]) -> Result<(X509, &X509), FetchError> {
        let cert = X509::from_der(cert)?;
        let issuer = self.issuers.iter().find(|issuer| {
            issuer.issued(&cert) == X509VerifyResult::OK
        }).ok_or_else(|| {
            FetchError::NoIssuer(format!("{:?}", cert.issuer_name()))
        })?;
        Ok((cert, issuer))
    }

    fn cert_id(cert: &X509, issuer: &X509) -> Result<OcspCertId, ErrorStack> {
        OcspCertId::from_cert(MessageDigest::sha1(), cert, issuer)
    }
}

/// Parses the text form OpenSSL prints ASN.1 times in.
fn parse_asn1_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&s, "%b %d %H:%M:%S %Y GMT")
        .ok()
        .map(|time| time.and_utc())
}


//------------ FetchError ----------------------------------------------------

#[derive(Debug)]
pub enum FetchError {
    /// No configured CA issued the certificate.
    NoIssuer(String),

    /// The certificate names no OCSP responder.
    NoResponder,

    Http(reqwest::Error),
    Status(StatusCode),

    /// The responder answered with something we cannot use.
    Responder(String),

    OpenSsl(ErrorStack),
    Io(IoError),
}

impl FetchError {
    /// Returns whether trying again may help.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(_) => true,
            FetchError::Status(status) => status.is_server_error(),
            _ => false,
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FetchError::NoIssuer(issuer) => {
                write!(f, "no CA certificate for issuer {issuer}")
            }
            FetchError::NoResponder => {
                f.write_str("certificate has no OCSP responder")
            }
            FetchError::Http(err) => write!(f, "HTTP request failed: {err}"),
            FetchError::Status(status) => {
                write!(f, "responder answered with {status}")
            }
            FetchError::Responder(msg) => {
                write!(f, "unusable OCSP response: {msg}")
            }
            FetchError::OpenSsl(err) => write!(f, "OpenSSL error: {err}"),
            FetchError::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for FetchError { }

impl From<ErrorStack> for FetchError {
    fn from(err: ErrorStack) -> Self {
        FetchError::OpenSsl(err)
    }
}


//------------ mock ----------------------------------------------------------

#[cfg(test)]
pub mod mock {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::api::ids::CertHash;
    use super::*;

    /// Hands out prepared responses per certificate.
    #[derive(Default)]
    pub struct MockFetcher {
        responses: Mutex<HashMap<CertHash, FetchedResponse>>,
        calls: AtomicUsize,
    }

    impl MockFetcher {
        pub fn set_response(&self, hash: CertHash, response: FetchedResponse) {
            self.responses.lock().unwrap().insert(hash, response);
        }

        /// Makes fetching for the certificate fail from now on.
        pub fn fail(&self, hash: &CertHash) {
            self.responses.lock().unwrap().remove(hash);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn fetch(&self, cert: &[u8]) -> Result<FetchedResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses.lock().unwrap()
                .get(&CertHash::of_der(cert))
                .cloned()
                .ok_or_else(|| FetchError::Responder("simulated failure".into()))
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::test::{issue_cert, rsa_key, test_under_tmp};

    #[test]
    fn openssl_time_format() {
        let time = parse_asn1_time("Mar  1 12:00:00 2024 GMT").unwrap();
        assert_eq!(time.to_rfc3339(), "2024-03-01T12:00:00+00:00");
        assert_eq!(
            parse_asn1_time("Dec 31 23:59:59 2049 GMT").unwrap().to_rfc3339(),
            "2049-12-31T23:59:59+00:00"
        );
        assert!(parse_asn1_time("yesterday").is_none());
    }

    #[test]
    fn transient_errors() {
        assert!(FetchError::Status(StatusCode::BAD_GATEWAY).is_transient());
        assert!(!FetchError::Status(StatusCode::NOT_FOUND).is_transient());
        assert!(!FetchError::NoResponder.is_transient());
    }

    #[test]
    fn unknown_issuer_fails_without_network() {
        test_under_tmp(|dir| {
            let key = rsa_key();
            let cert = issue_cert(&key.public_key_to_der().unwrap(), "member");
            let config = OcspConfig {
                ca_certs_dir: Some(dir),
                ..Default::default()
            };
            let fetcher = HttpFetcher::new(&config).unwrap();
            assert!(matches!(
                fetcher.prepare(&cert),
                Err(FetchError::NoIssuer(_))
            ));
        })
    }

    fn fixture_fetcher() -> HttpFetcher {
        HttpFetcher::new(&OcspConfig {
            ca_certs_dir: Some(
                Path::new(env!("CARGO_MANIFEST_DIR")).join("test/ocsp/ca")
            ),
            ..Default::default()
        }).unwrap()
    }

    fn leaf_der() -> Bytes {
        let leaf = X509::from_pem(
            include_bytes!("../../test/ocsp/leaf.pem")
        ).unwrap();
        Bytes::from(leaf.to_der().unwrap())
    }

    #[test]
    fn signed_response_is_accepted() {
        let fetcher = fixture_fetcher();
        let body = Bytes::from_static(
            include_bytes!("../../test/ocsp/good.der")
        );
        let fetched = fetcher.parse(&leaf_der(), body.clone()).unwrap();
        assert_eq!(fetched.response, body);
        assert!(fetched.next_update.unwrap() > Utc::now());

        let (uri, _) = fetcher.prepare(&leaf_der()).unwrap();
        assert_eq!(uri, "http://127.0.0.1:9/ocsp");
    }

    #[test]
    fn forged_response_is_rejected() {
        let fetcher = fixture_fetcher();
        assert!(matches!(
            fetcher.parse(
                &leaf_der(),
                Bytes::from_static(include_bytes!("../../test/ocsp/forged.der"))
            ),
            Err(FetchError::Responder(_))
        ));
        assert!(matches!(
            fetcher.parse(&leaf_der(), Bytes::from_static(b"junk")),
            Err(FetchError::OpenSsl(_))
        ));
    }

    #[tokio::test]
    async fn invalid_certificate_is_rejected() {
        let fetcher = OcspFetcher::Http(
            HttpFetcher::new(&OcspConfig::default()).unwrap()
        );
        let res = fetcher.fetch(b"not a certificate", Duration::ZERO).await;
        assert!(matches!(res, Err(FetchError::OpenSsl(_))));
    }
}
