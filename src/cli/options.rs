//! The options for the signer client.

use std::fs;
use std::path::{Path, PathBuf};
use bytes::Bytes;
use chrono::{Duration, Utc};
use clap::Parser;
use openssl::pkey::PKey;
use openssl::x509::X509;
use url::Url;
use crate::api::serde_ext::encode_base64;
use crate::api::ids::{CertHash, CertRequestId, KeyId, TokenId};
use crate::api::member::{ClientId, SecurityServerId};
use crate::api::rpc::{
    BoolResponse, CertificateBytes, CertificateChainResponse,
    CertificateResponse, ImportCertResponse, OcspResponsesResponse, Pin,
    SignMechanismResponse, SignResponse,
};
use crate::api::token::{CertRequestFormat, CertStatus, KeyUsage};
use crate::constants::{SIGNER_CLIENT_APP, SIGNER_ENV_AUTH_TOKEN};
use crate::device::mechanism::SignAlgorithm;
use super::client::SignerClient;
use super::report::{Report, ReportFormat};


//------------ Options -------------------------------------------------------

/// The command line options for the signer client.
#[derive(clap::Parser)]
#[command(
    version,
    about = SIGNER_CLIENT_APP,
)]
pub struct Options {
    #[command(flatten)]
    pub general: GeneralOptions,

    #[command(subcommand)]
    pub command: Command,
}

impl Options {
    /// Creates the options from the process arguments.
    ///
    /// If the arguments won't result in usable options, exits the process.
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn client(&self) -> SignerClient {
        SignerClient::new(
            self.general.server.clone(), self.general.token.clone()
        ).with_api_only(self.general.api)
    }
}


//------------ GeneralOptions ------------------------------------------------

/// The options common between all commands.
#[derive(clap::Args)]
pub struct GeneralOptions {
    /// The base URI of the signer.
    #[arg(
        short, long,
        env = "SIGNER_CLI_SERVER",
        default_value = "http://127.0.0.1:5558/"
    )]
    pub server: Url,

    /// The bearer token for the signer.
    #[arg(short, long, env = SIGNER_ENV_AUTH_TOKEN)]
    pub token: Option<String>,

    /// Report format
    #[arg(
        short, long,
        env = "SIGNER_CLI_FORMAT",
        default_value = "text",
    )]
    pub format: ReportFormat,

    /// Only show the API call and exit.
    #[arg(long)]
    pub api: bool,
}


//------------ Command -------------------------------------------------------

#[derive(clap::Subcommand)]
pub enum Command {
    /// Manage tokens
    #[command(subcommand)]
    Tokens(TokenCommand),

    /// Manage keys and sign with them
    #[command(subcommand)]
    Keys(KeyCommand),

    /// Manage certificates
    #[command(subcommand)]
    Certs(CertCommand),

    /// Manage certificate requests
    #[command(subcommand)]
    Csr(CsrCommand),

    /// Show and store cached OCSP responses
    #[command(subcommand)]
    Ocsp(OcspCommand),
}

impl Command {
    pub async fn run(self, client: &SignerClient) -> Report {
        match self {
            Self::Tokens(cmd) => cmd.run(client).await,
            Self::Keys(cmd) => cmd.run(client).await,
            Self::Certs(cmd) => cmd.run(client).await,
            Self::Csr(cmd) => cmd.run(client).await,
            Self::Ocsp(cmd) => cmd.run(client).await,
        }
    }
}


//------------ TokenCommand --------------------------------------------------

#[derive(clap::Subcommand)]
pub enum TokenCommand {
    /// List all known tokens
    List,

    /// Show a token with its keys
    Show {
        #[command(flatten)]
        target: TokenTarget,
    },

    /// Log in to a token
    Activate {
        token_id: TokenId,

        #[command(flatten)]
        pin: PinArg,
    },

    /// Log out of a token
    Deactivate {
        token_id: TokenId,
    },

    /// Set the friendly name of a token
    Rename {
        token_id: TokenId,
        friendly_name: String,
    },

    /// Initialize the software token with a PIN
    InitSoftware {
        #[command(flatten)]
        pin: PinArg,
    },

    /// Change the PIN of the software token
    UpdatePin {
        token_id: TokenId,

        /// The current PIN
        #[arg(long)]
        old_pin: String,

        /// The new PIN
        #[arg(long)]
        new_pin: String,
    },

    /// Show whether a HSM is configured and all HSM tokens are usable
    HsmStatus,
}

#[derive(clap::Args)]
#[group(required = true, multiple = false)]
pub struct TokenTarget {
    /// The token id
    #[arg(long)]
    id: Option<TokenId>,

    /// Find the token holding this key
    #[arg(long)]
    key: Option<KeyId>,

    /// Find the token holding the certificate with this hash
    #[arg(long)]
    cert_hash: Option<CertHash>,

    /// Find the token holding this certificate request
    #[arg(long)]
    cert_request: Option<CertRequestId>,
}

#[derive(clap::Args)]
pub struct PinArg {
    /// The token PIN
    #[arg(long, env = "SIGNER_TOKEN_PIN", hide_env_values = true)]
    pin: String,
}

impl PinArg {
    fn into_pin(self) -> Pin {
        Pin::new(self.pin)
    }
}

impl TokenCommand {
    pub async fn run(self, client: &SignerClient) -> Report {
        match self {
            Self::List => client.list_tokens().await.into(),
            Self::Show { target } => {
                if let Some(id) = target.id {
                    client.get_token(&id).await.into()
                }
                else if let Some(key) = target.key {
                    client.get_token_for_key(&key).await.into()
                }
                else if let Some(hash) = target.cert_hash {
                    client.get_token_for_cert_hash(&hash).await.into()
                }
                else if let Some(req) = target.cert_request {
                    client.get_token_for_cert_request(&req).await.into()
                }
                else {
                    Report::error("no token given")
                }
            }
            Self::Activate { token_id, pin } => {
                client.activate_token(&token_id, pin.into_pin()).await.into()
            }
            Self::Deactivate { token_id } => {
                client.deactivate_token(&token_id).await.into()
            }
            Self::Rename { token_id, friendly_name } => {
                client.set_token_friendly_name(
                    &token_id, &friendly_name
                ).await.into()
            }
            Self::InitSoftware { pin } => {
                client.init_software_token(pin.into_pin()).await.into()
            }
            Self::UpdatePin { token_id, old_pin, new_pin } => {
                client.update_software_token_pin(
                    &token_id, Pin::new(old_pin), Pin::new(new_pin)
                ).await.into()
            }
            Self::HsmStatus => {
                client.is_hsm_operational().await.map(|value| {
                    BoolResponse { value }
                }).into()
            }
        }
    }
}


//------------ KeyCommand ----------------------------------------------------

#[derive(clap::Subcommand)]
pub enum KeyCommand {
    /// Generate a new key on a token
    Generate {
        token_id: TokenId,

        /// The label to store with the key on the device
        #[arg(long)]
        label: Option<String>,
    },

    /// Set the friendly name of a key
    Rename {
        key_id: KeyId,
        friendly_name: String,
    },

    /// Delete a key
    Delete {
        key_id: KeyId,

        /// Also remove the key from its device
        #[arg(long)]
        from_device: bool,
    },

    /// Show the signing mechanism of a key
    Mechanism {
        key_id: KeyId,
    },

    /// Show whether a key's token supports batch signing
    BatchSigning {
        key_id: KeyId,
    },

    /// Sign a digest or the digest of a file
    Sign {
        key_id: KeyId,

        /// The signature algorithm
        #[arg(long, default_value = "SHA256withRSA")]
        algorithm: SignAlgorithm,

        #[command(flatten)]
        input: SignInput,
    },

    /// Issue a certificate for a public key signed by a key
    SignCert {
        key_id: KeyId,

        /// The signature algorithm
        #[arg(long, default_value = "SHA256withRSA")]
        algorithm: SignAlgorithm,

        /// The subject distinguished name, e.g. "CN=proxy"
        #[arg(long)]
        subject: String,

        /// File with the public key to certify, PEM or DER
        #[arg(long)]
        public_key: PathBuf,
    },
}

#[derive(clap::Args)]
#[group(required = true, multiple = false)]
pub struct SignInput {
    /// The digest to sign, hex encoded
    #[arg(long)]
    digest: Option<String>,

    /// A file whose digest should be signed
    #[arg(long)]
    file: Option<PathBuf>,
}

impl SignInput {
    fn digest(&self, algorithm: SignAlgorithm) -> Result<Bytes, String> {
        if let Some(digest) = &self.digest {
            hex::decode(digest.trim()).map(Bytes::from).map_err(|err| {
                format!("invalid digest: {err}")
            })
        }
        else if let Some(path) = &self.file {
            let data = read_file(path)?;
            algorithm.digest(&data).map_err(|err| err.to_string())
        }
        else {
            Err("no input given".into())
        }
    }
}

impl KeyCommand {
    pub async fn run(self, client: &SignerClient) -> Report {
        match self {
            Self::Generate { token_id, label } => {
                client.generate_key(&token_id, label.as_deref()).await.into()
            }
            Self::Rename { key_id, friendly_name } => {
                client.set_key_friendly_name(
                    &key_id, &friendly_name
                ).await.into()
            }
            Self::Delete { key_id, from_device } => {
                client.delete_key(&key_id, from_device).await.into()
            }
            Self::Mechanism { key_id } => {
                client.get_sign_mechanism(&key_id).await.map(|sign_mechanism| {
                    SignMechanismResponse { sign_mechanism }
                }).into()
            }
            Self::BatchSigning { key_id } => {
                client.is_batch_signing_enabled(&key_id).await.map(|value| {
                    BoolResponse { value }
                }).into()
            }
            Self::Sign { key_id, algorithm, input } => {
                let digest = match input.digest(algorithm) {
                    Ok(digest) => digest,
                    Err(err) => return Report::error(err),
                };
                client.sign(&key_id, algorithm, digest).await.map(|signature| {
                    SignResponse { signature }
                }).into()
            }
            Self::SignCert { key_id, algorithm, subject, public_key } => {
                let public_key = match read_public_key(&public_key) {
                    Ok(key) => key,
                    Err(err) => return Report::error(err),
                };
                client.sign_certificate(
                    &key_id, algorithm, &subject, public_key
                ).await.map(|chain| {
                    CertificateChainResponse {
                        certificate_chain: chain.into_iter().map(
                            CertificateBytes
                        ).collect()
                    }
                }).into()
            }
        }
    }
}


//------------ CertCommand ---------------------------------------------------

#[derive(clap::Subcommand)]
pub enum CertCommand {
    /// Create a self-signed certificate for a key
    SelfSigned {
        key_id: KeyId,

        /// The member the certificate is for
        #[arg(long)]
        member: Option<ClientId>,

        /// What the key is used for
        #[arg(long, default_value = "signing")]
        usage: KeyUsage,

        /// The common name of the certificate
        #[arg(long)]
        common_name: String,

        /// Validity in days from now
        #[arg(long, default_value = "365")]
        days: u32,
    },

    /// Import a certificate issued for one of our keys
    Import {
        /// The certificate, PEM or DER
        file: PathBuf,

        /// The initial status of the certificate
        #[arg(long, default_value = "registered")]
        status: CertStatus,

        /// The member the certificate belongs to
        #[arg(long)]
        member: Option<ClientId>,
    },

    /// Activate a certificate given by id or hash
    Activate {
        cert: String,
    },

    /// Deactivate a certificate given by id or hash
    Deactivate {
        cert: String,
    },

    /// Set the status of a certificate given by id or hash
    Status {
        cert: String,
        status: CertStatus,
    },

    /// Delete a certificate given by id or hash
    Delete {
        cert: String,
    },

    /// Show the certificate with the given hash
    Show {
        cert_hash: CertHash,
    },

    /// Show the key of the certificate with the given hash
    Key {
        cert_hash: CertHash,

        /// Also show the token holding the key
        #[arg(long)]
        with_token: bool,
    },

    /// Show the key and token of a certificate request
    RequestKey {
        cert_request_id: CertRequestId,
    },

    /// List the certificates of a member
    Member {
        member: ClientId,
    },

    /// Show the active signing key and certificate of a member
    SigningInfo {
        member: ClientId,
    },

    /// Show the authentication key of a security server
    AuthKey {
        /// The owner of the security server
        owner: ClientId,

        /// The server code
        server_code: String,
    },
}

impl CertCommand {
    pub async fn run(self, client: &SignerClient) -> Report {
        match self {
            Self::SelfSigned { key_id, member, usage, common_name, days } => {
                let not_before = Utc::now();
                let not_after = not_before + Duration::days(days.into());
                client.generate_self_signed_cert(
                    &key_id, member.as_ref(), usage, &common_name,
                    not_before, not_after,
                ).await.map(|certificate| {
                    CertificateResponse { certificate }
                }).into()
            }
            Self::Import { file, status, member } => {
                let certificate = match read_certificate(&file) {
                    Ok(cert) => cert,
                    Err(err) => return Report::error(err),
                };
                client.import_cert(
                    certificate, status, member.as_ref()
                ).await.map(|key_id| {
                    ImportCertResponse { key_id }
                }).into()
            }
            Self::Activate { cert } => {
                client.activate_cert(&cert).await.into()
            }
            Self::Deactivate { cert } => {
                client.deactivate_cert(&cert).await.into()
            }
            Self::Status { cert, status } => {
                client.set_cert_status(&cert, status).await.into()
            }
            Self::Delete { cert } => {
                client.delete_cert(&cert).await.into()
            }
            Self::Show { cert_hash } => {
                client.get_cert_for_hash(&cert_hash).await.into()
            }
            Self::Key { cert_hash, with_token } => {
                if with_token {
                    client.get_token_and_key_id_for_cert_hash(
                        &cert_hash
                    ).await.into()
                }
                else {
                    client.get_key_id_for_cert_hash(&cert_hash).await.into()
                }
            }
            Self::RequestKey { cert_request_id } => {
                client.get_token_and_key_id_for_cert_request(
                    &cert_request_id
                ).await.into()
            }
            Self::Member { member } => {
                client.get_member_certs(&member).await.into()
            }
            Self::SigningInfo { member } => {
                client.get_member_signing_info(&member).await.into()
            }
            Self::AuthKey { owner, server_code } => {
                client.get_auth_key(
                    &SecurityServerId::new(owner, server_code)
                ).await.into()
            }
        }
    }
}


//------------ CsrCommand ----------------------------------------------------

#[derive(clap::Subcommand)]
pub enum CsrCommand {
    /// Generate a certificate request for a key
    Generate {
        key_id: KeyId,

        /// The member the certificate is for
        #[arg(long)]
        member: Option<ClientId>,

        /// What the key is used for
        #[arg(long, default_value = "signing")]
        usage: KeyUsage,

        /// The subject distinguished name, e.g. "C=FI, O=Org, CN=member"
        #[arg(long)]
        subject: String,

        /// The format of the request
        #[arg(long, default_value = "PEM")]
        format: CertRequestFormat,
    },

    /// Produce a pending request again
    Regenerate {
        cert_request_id: CertRequestId,

        /// The format of the request
        #[arg(long, default_value = "PEM")]
        format: CertRequestFormat,
    },

    /// Delete a pending request
    Delete {
        cert_request_id: CertRequestId,
    },
}

impl CsrCommand {
    pub async fn run(self, client: &SignerClient) -> Report {
        match self {
            Self::Generate { key_id, member, usage, subject, format } => {
                client.generate_cert_request(
                    &key_id, member.as_ref(), usage, &subject, format
                ).await.into()
            }
            Self::Regenerate { cert_request_id, format } => {
                client.regenerate_cert_request(
                    &cert_request_id, format
                ).await.into()
            }
            Self::Delete { cert_request_id } => {
                client.delete_cert_request(&cert_request_id).await.into()
            }
        }
    }
}


//------------ OcspCommand ---------------------------------------------------

#[derive(clap::Subcommand)]
pub enum OcspCommand {
    /// Show the cached responses for certificate hashes
    Get {
        #[arg(required = true)]
        cert_hashes: Vec<CertHash>,
    },

    /// Store a DER encoded response for a certificate hash
    Set {
        cert_hash: CertHash,

        /// File with the DER encoded response
        response: PathBuf,
    },
}

impl OcspCommand {
    pub async fn run(self, client: &SignerClient) -> Report {
        match self {
            Self::Get { cert_hashes } => {
                client.get_ocsp_responses(&cert_hashes).await.map(|responses| {
                    OcspResponsesResponse { responses }
                }).into()
            }
            Self::Set { cert_hash, response } => {
                let response = match read_file(&response) {
                    Ok(response) => encode_base64(&response),
                    Err(err) => return Report::error(err),
                };
                client.set_ocsp_responses(
                    &[cert_hash], vec![response]
                ).await.into()
            }
        }
    }
}


//------------ Helpers -------------------------------------------------------

fn read_file(path: &Path) -> Result<Vec<u8>, String> {
    fs::read(path).map_err(|err| {
        format!("Cannot read file '{}': {err}", path.display())
    })
}

/// Reads a certificate, converting PEM to DER.
fn read_certificate(path: &Path) -> Result<Bytes, String> {
    let content = read_file(path)?;
    if !content.starts_with(b"-----BEGIN") {
        return Ok(content.into())
    }
    X509::from_pem(&content)
        .and_then(|cert| cert.to_der())
        .map(Bytes::from)
        .map_err(|err| {
            format!("Invalid certificate in '{}': {err}", path.display())
        })
}

/// Reads a public key, converting PEM to DER.
fn read_public_key(path: &Path) -> Result<Bytes, String> {
    let content = read_file(path)?;
    if !content.starts_with(b"-----BEGIN") {
        return Ok(content.into())
    }
    PKey::public_key_from_pem(&content)
        .and_then(|key| key.public_key_to_der())
        .map(Bytes::from)
        .map_err(|err| {
            format!("Invalid public key in '{}': {err}", path.display())
        })
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        Options::try_parse_from(
            std::iter::once("signerc").chain(args.iter().copied())
        ).unwrap()
    }

    #[test]
    fn parse_sign_command() {
        let options = parse(&[
            "--server", "http://localhost:5558/",
            "keys", "sign", "ABCD", "--digest", "00ff",
        ]);
        assert_eq!(options.general.format, ReportFormat::Text);
        match options.command {
            Command::Keys(KeyCommand::Sign { key_id, algorithm, input }) => {
                assert_eq!(key_id.as_str(), "ABCD");
                assert_eq!(algorithm, SignAlgorithm::Sha256WithRsa);
                assert!(input.digest(algorithm).is_ok());
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn sign_needs_one_input() {
        assert!(Options::try_parse_from([
            "signerc", "keys", "sign", "ABCD"
        ]).is_err());
        assert!(Options::try_parse_from([
            "signerc", "keys", "sign", "ABCD", "--digest", "00",
            "--file", "/tmp/data"
        ]).is_err());
    }

    #[test]
    fn parse_member_identifiers() {
        let options = parse(&[
            "-f", "json", "certs", "member", "EE/GOV/1234/sub"
        ]);
        assert_eq!(options.general.format, ReportFormat::Json);
        match options.command {
            Command::Certs(CertCommand::Member { member }) => {
                assert_eq!(member.subsystem_code(), Some("sub"));
            }
            _ => panic!("wrong command"),
        }
        assert!(Options::try_parse_from([
            "signerc", "certs", "member", "EE/GOV"
        ]).is_err());
    }

    #[test]
    fn show_token_by_key() {
        let options = parse(&["tokens", "show", "--key", "AB01"]);
        match options.command {
            Command::Tokens(TokenCommand::Show { target }) => {
                assert!(target.id.is_none());
                assert_eq!(target.key.unwrap().as_str(), "AB01");
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn digest_is_hex() {
        let input = SignInput { digest: Some("zz".into()), file: None };
        assert!(input.digest(SignAlgorithm::Sha256WithRsa).is_err());
    }
}
