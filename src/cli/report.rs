//! Rendering the results of client commands.

use std::fmt;
use std::fmt::Write;
use std::str::FromStr;
use serde::Serialize;
use crate::api::serde_ext::encode_base64;
use crate::api::rpc::{
    BoolResponse, CertificateChainResponse, CertificateResponse,
    ImportCertResponse, OcspResponsesResponse, SignMechanismResponse,
    SignResponse,
};
use crate::api::token::{
    AuthKeyInfo, CertificateInfo, GeneratedCertRequestInfo, KeyIdInfo,
    KeyInfo, MemberSigningInfo, TokenInfo, TokenInfoAndKeyId,
};
use super::httpcli;


//------------ ReportFormat --------------------------------------------------

/// This type defines the format to use when representing the api response
/// as a report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReportFormat {
    None,
    Json,
    Text,
}

impl FromStr for ReportFormat {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ReportFormat::None),
            "json" => Ok(ReportFormat::Json),
            "text" => Ok(ReportFormat::Text),
            _ => Err(ReportError::UnrecognizedFormat(s.to_string())),
        }
    }
}


//------------ ReportError ---------------------------------------------------

#[derive(Debug)]
pub enum ReportError {
    UnrecognizedFormat(String),
    Json(serde_json::Error),
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReportError::UnrecognizedFormat(s) => {
                write!(f, "This report format is not recognized: {s}")
            }
            ReportError::Json(err) => {
                write!(f, "Cannot produce JSON report: {err}")
            }
        }
    }
}

impl std::error::Error for ReportError { }


//------------ Report --------------------------------------------------------

/// The outcome of a client command.
pub struct Report {
    content: Result<Box<dyn ReportContent>, ReportFailure>,
}

enum ReportFailure {
    Client(httpcli::Error),
    Other(String),
}

impl Report {
    pub fn new(content: impl ReportContent + 'static) -> Self {
        Report { content: Ok(Box::new(content)) }
    }

    /// Creates a report for a command that failed before calling the signer.
    pub fn error(msg: impl fmt::Display) -> Self {
        Report { content: Err(ReportFailure::Other(msg.to_string())) }
    }

    /// Renders the report.
    ///
    /// Returns the text to print on success, the error message otherwise.
    pub fn render(&self, format: ReportFormat) -> Result<String, String> {
        match &self.content {
            Ok(content) => match format {
                ReportFormat::None => Ok(String::new()),
                ReportFormat::Json => {
                    content.json().map_err(|err| {
                        ReportError::Json(err).to_string()
                    })
                }
                ReportFormat::Text => {
                    let mut res = String::new();
                    content.write_text(&mut res).map_err(|err| {
                        err.to_string()
                    })?;
                    Ok(res)
                }
            }
            Err(ReportFailure::Client(err)) => {
                match (format, err.fault()) {
                    (ReportFormat::Json, Some(fault)) => {
                        Err(serde_json::to_string_pretty(fault).unwrap_or_else(
                            |_| fault.to_string()
                        ))
                    }
                    _ => Err(err.to_string())
                }
            }
            Err(ReportFailure::Other(msg)) => Err(msg.clone()),
        }
    }

    /// Prints the report and returns the process exit code.
    pub fn print(&self, format: ReportFormat) -> i32 {
        match self.render(format) {
            Ok(text) => {
                if !text.is_empty() {
                    println!("{}", text.trim_end());
                }
                0
            }
            Err(msg) => {
                eprintln!("{msg}");
                1
            }
        }
    }
}

impl<T: ReportContent + 'static> From<Result<T, httpcli::Error>> for Report {
    fn from(res: Result<T, httpcli::Error>) -> Self {
        match res {
            Ok(content) => Report::new(content),
            Err(err) => Report { content: Err(ReportFailure::Client(err)) },
        }
    }
}


//------------ ReportContent -------------------------------------------------

/// A type that can be shown to the user.
pub trait ReportContent {
    fn json(&self) -> Result<String, serde_json::Error>;

    fn write_text(&self, target: &mut String) -> fmt::Result;
}

fn json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(value)
}

impl ReportContent for () {
    fn json(&self) -> Result<String, serde_json::Error> {
        Ok(String::new())
    }

    fn write_text(&self, _target: &mut String) -> fmt::Result {
        Ok(())
    }
}

impl ReportContent for Vec<TokenInfo> {
    fn json(&self) -> Result<String, serde_json::Error> {
        json(self)
    }

    fn write_text(&self, target: &mut String) -> fmt::Result {
        writeln!(target, "{:<8} {:<18} {:<10} {:>5}  name", "id", "state", "kind", "keys")?;
        for token in self {
            writeln!(
                target, "{:<8} {:<18} {:<10} {:>5}  {}",
                token.id, token.state.to_string(), token.kind.to_string(),
                token.keys.len(),
                token.friendly_name.as_deref().unwrap_or("-"),
            )?;
        }
        Ok(())
    }
}

impl ReportContent for TokenInfo {
    fn json(&self) -> Result<String, serde_json::Error> {
        json(self)
    }

    fn write_text(&self, target: &mut String) -> fmt::Result {
        writeln!(target, "Token: {}", self.id)?;
        writeln!(target, "  kind:           {}", self.kind)?;
        writeln!(target, "  module:         {}", self.module)?;
        if let Some(name) = &self.friendly_name {
            writeln!(target, "  friendly name:  {name}")?;
        }
        if let Some(label) = &self.label {
            writeln!(target, "  label:          {label}")?;
        }
        if let Some(serial) = &self.serial_number {
            writeln!(target, "  serial number:  {serial}")?;
        }
        writeln!(target, "  state:          {}", self.state)?;
        writeln!(target, "  read only:      {}", self.read_only)?;
        writeln!(
            target, "  batch signing:  {}", self.batch_signing_enabled
        )?;
        for key in &self.keys {
            write_key(key, target)?;
        }
        Ok(())
    }
}

impl ReportContent for KeyInfo {
    fn json(&self) -> Result<String, serde_json::Error> {
        json(self)
    }

    fn write_text(&self, target: &mut String) -> fmt::Result {
        write_key(self, target)
    }
}

fn write_key(key: &KeyInfo, target: &mut String) -> fmt::Result {
    writeln!(target, "  Key: {}", key.id)?;
    if let Some(name) = &key.friendly_name {
        writeln!(target, "    friendly name:  {name}")?;
    }
    if let Some(usage) = key.usage {
        writeln!(target, "    usage:          {usage}")?;
    }
    writeln!(target, "    mechanism:      {}", key.sign_mechanism)?;
    writeln!(target, "    available:      {}", key.available)?;
    for cert in &key.certs {
        writeln!(
            target, "    cert {}  {}  {}{}",
            cert.id, cert.hash, cert.status,
            if cert.active { "  active" } else { "" }
        )?;
    }
    for req in &key.cert_requests {
        writeln!(
            target, "    request {}  {}  {}",
            req.id, req.usage, req.subject_name
        )?;
    }
    Ok(())
}

impl ReportContent for CertificateInfo {
    fn json(&self) -> Result<String, serde_json::Error> {
        json(self)
    }

    fn write_text(&self, target: &mut String) -> fmt::Result {
        writeln!(target, "Certificate: {}", self.id)?;
        writeln!(target, "  hash:    {}", self.hash)?;
        if let Some(member) = &self.member_id {
            writeln!(target, "  member:  {member}")?;
        }
        writeln!(target, "  status:  {}", self.status)?;
        writeln!(target, "  active:  {}", self.active)
    }
}

impl ReportContent for Vec<CertificateInfo> {
    fn json(&self) -> Result<String, serde_json::Error> {
        json(self)
    }

    fn write_text(&self, target: &mut String) -> fmt::Result {
        for cert in self {
            cert.write_text(target)?;
        }
        Ok(())
    }
}

impl ReportContent for GeneratedCertRequestInfo {
    fn json(&self) -> Result<String, serde_json::Error> {
        json(self)
    }

    fn write_text(&self, target: &mut String) -> fmt::Result {
        writeln!(target, "Certificate request: {}", self.cert_request_id)?;
        writeln!(target, "  key:     {}", self.key_id)?;
        writeln!(target, "  usage:   {}", self.usage)?;
        match std::str::from_utf8(&self.cert_request) {
            Ok(pem) if pem.starts_with("-----BEGIN") => {
                target.push_str(pem)
            }
            _ => {
                writeln!(
                    target, "  request: {}", encode_base64(&self.cert_request)
                )?;
            }
        }
        Ok(())
    }
}

impl ReportContent for KeyIdInfo {
    fn json(&self) -> Result<String, serde_json::Error> {
        json(self)
    }

    fn write_text(&self, target: &mut String) -> fmt::Result {
        writeln!(target, "{} {}", self.key_id, self.sign_mechanism)
    }
}

impl ReportContent for TokenInfoAndKeyId {
    fn json(&self) -> Result<String, serde_json::Error> {
        json(self)
    }

    fn write_text(&self, target: &mut String) -> fmt::Result {
        writeln!(target, "Key: {}", self.key_id)?;
        self.token.write_text(target)
    }
}

impl ReportContent for MemberSigningInfo {
    fn json(&self) -> Result<String, serde_json::Error> {
        json(self)
    }

    fn write_text(&self, target: &mut String) -> fmt::Result {
        writeln!(target, "Key: {} ({})", self.key_id, self.sign_mechanism)?;
        self.cert.write_text(target)
    }
}

impl ReportContent for AuthKeyInfo {
    fn json(&self) -> Result<String, serde_json::Error> {
        json(self)
    }

    fn write_text(&self, target: &mut String) -> fmt::Result {
        writeln!(
            target, "Key: {} on token {} ({})",
            self.key_id, self.token_id, self.sign_mechanism
        )?;
        self.cert.write_text(target)
    }
}

impl ReportContent for BoolResponse {
    fn json(&self) -> Result<String, serde_json::Error> {
        json(self)
    }

    fn write_text(&self, target: &mut String) -> fmt::Result {
        writeln!(target, "{}", self.value)
    }
}

impl ReportContent for SignMechanismResponse {
    fn json(&self) -> Result<String, serde_json::Error> {
        json(self)
    }

    fn write_text(&self, target: &mut String) -> fmt::Result {
        writeln!(target, "{}", self.sign_mechanism)
    }
}

impl ReportContent for SignResponse {
    fn json(&self) -> Result<String, serde_json::Error> {
        json(self)
    }

    fn write_text(&self, target: &mut String) -> fmt::Result {
        writeln!(target, "{}", encode_base64(&self.signature))
    }
}

impl ReportContent for CertificateResponse {
    fn json(&self) -> Result<String, serde_json::Error> {
        json(self)
    }

    fn write_text(&self, target: &mut String) -> fmt::Result {
        write_pem_cert(&self.certificate, target)
    }
}

impl ReportContent for CertificateChainResponse {
    fn json(&self) -> Result<String, serde_json::Error> {
        json(self)
    }

    fn write_text(&self, target: &mut String) -> fmt::Result {
        for cert in &self.certificate_chain {
            write_pem_cert(&cert.0, target)?;
        }
        Ok(())
    }
}

impl ReportContent for ImportCertResponse {
    fn json(&self) -> Result<String, serde_json::Error> {
        json(self)
    }

    fn write_text(&self, target: &mut String) -> fmt::Result {
        writeln!(target, "{}", self.key_id)
    }
}

impl ReportContent for OcspResponsesResponse {
    fn json(&self) -> Result<String, serde_json::Error> {
        json(self)
    }

    fn write_text(&self, target: &mut String) -> fmt::Result {
        for entry in &self.responses {
            match &entry.response {
                Some(response) => {
                    writeln!(
                        target, "{}  {}{}",
                        entry.cert_hash, encode_base64(response),
                        if entry.stale { "  (stale)" } else { "" }
                    )?;
                }
                None => writeln!(target, "{}  -", entry.cert_hash)?,
            }
        }
        Ok(())
    }
}

fn write_pem_cert(der: &[u8], target: &mut String) -> fmt::Result {
    writeln!(target, "-----BEGIN CERTIFICATE-----")?;
    let encoded = encode_base64(der);
    let mut rest = encoded.as_str();
    while !rest.is_empty() {
        let (line, tail) = rest.split_at(rest.len().min(64));
        writeln!(target, "{line}")?;
        rest = tail;
    }
    writeln!(target, "-----END CERTIFICATE-----")
}


//------------ Tests ---------------------------------------------------------
