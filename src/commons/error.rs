//! Defines all signer service errors.

use std::borrow::Cow;
use std::{fmt, io};
use hyper::StatusCode;
use log::{error, warn};
use crate::api::fault::Fault;
use crate::api::ids::{CertHash, CertRequestId, KeyId, TokenId};
use crate::constants::SOFTWARE_TOKEN_ID;
use crate::device::DeviceError;


//------------ IoError -------------------------------------------------------

/// An I/O error with some context of what we were doing.
#[derive(Debug)]
pub struct IoError {
    context: Cow<'static, str>,
    cause: io::Error,
}

impl IoError {
    pub fn new(context: impl Into<Cow<'static, str>>, cause: io::Error) -> Self {
        IoError { context: context.into(), cause }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.cause)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}


//------------ Error ---------------------------------------------------------

/// A failed service operation.
///
/// Each variant corresponds to one fault code on the RPC interface.
#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // Device Issues
    //-----------------------------------------------------------------

    /// The device is absent or unreachable. Retryable.
    DeviceUnavailable(String),

    /// The activation secret was rejected.
    AuthenticationFailure(String),

    /// The device rejected the digest or mechanism.
    SigningFailure(String),

    //-----------------------------------------------------------------
    // Token Issues
    //-----------------------------------------------------------------

    TokenNotActive(TokenId),
    TokenNotFound(TokenId),
    TokenNotInitialized(TokenId),
    TokenAlreadyInitialized(TokenId),
    TokenAlreadyActive(TokenId),

    //-----------------------------------------------------------------
    // Key and Certificate Issues
    //-----------------------------------------------------------------

    KeyNotFound(KeyId),

    /// The key is known but currently not present on its device.
    KeyNotAvailable(KeyId),

    CertNotFound(String),
    CertRequestNotFound(CertRequestId),

    /// An imported certificate matches none of the known keys.
    CertKeyMismatch(CertHash),

    CertExists(CertHash),
    KeyUsageConflict(String),

    //-----------------------------------------------------------------
    // OCSP Issues
    //-----------------------------------------------------------------

    RevocationDataUnavailable(CertHash),

    //-----------------------------------------------------------------
    // Request Issues
    //-----------------------------------------------------------------

    InvalidRequest(String),
    UnsupportedOperation(String),
    Unauthorized,
    Timeout,

    //-----------------------------------------------------------------
    // System Issues
    //-----------------------------------------------------------------

    Storage(String),
    Internal(String),
}

impl Error {
    pub fn invalid_request(msg: impl fmt::Display) -> Self {
        Error::InvalidRequest(msg.to_string())
    }

    pub fn unsupported(msg: impl fmt::Display) -> Self {
        Error::UnsupportedOperation(msg.to_string())
    }

    pub fn storage(msg: impl fmt::Display) -> Self {
        Error::Storage(msg.to_string())
    }

    pub fn internal(msg: impl fmt::Display) -> Self {
        Error::Internal(msg.to_string())
    }

    /// The error for a poisoned lock.
    pub fn poisoned(what: &str) -> Self {
        error!("Lock for {what} poisoned, a thread panicked");
        Error::Internal(format!("lock for {what} poisoned"))
    }

    /// Returns the fault kind, i.e., the fault code without prefix.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::DeviceUnavailable(_) => "DeviceUnavailable",
            Error::AuthenticationFailure(_) => "AuthenticationFailure",
            Error::SigningFailure(_) => "SigningFailure",
            Error::TokenNotActive(_) => "TokenNotActive",
            Error::TokenNotFound(_) => "TokenNotFound",
            Error::TokenNotInitialized(_) => "TokenNotInitialized",
            Error::TokenAlreadyInitialized(_) => "TokenAlreadyInitialized",
            Error::TokenAlreadyActive(_) => "TokenAlreadyActive",
            Error::KeyNotFound(_) => "KeyNotFound",
            Error::KeyNotAvailable(_) => "KeyNotAvailable",
            Error::CertNotFound(_) => "CertNotFound",
            Error::CertRequestNotFound(_) => "CertRequestNotFound",
            Error::CertKeyMismatch(_) => "CertKeyMismatch",
            Error::CertExists(_) => "CertExists",
            Error::KeyUsageConflict(_) => "KeyUsageConflict",
            Error::RevocationDataUnavailable(_) => "RevocationDataUnavailable",
            Error::InvalidRequest(_) => "InvalidRequest",
            Error::UnsupportedOperation(_) => "UnsupportedOperation",
            Error::Unauthorized => "Unauthorized",
            Error::Timeout => "Timeout",
            Error::Storage(_) => "Storage",
            Error::Internal(_) => "Internal",
        }
    }

    /// Returns the localisation key for the error.
    pub fn translation_code(&self) -> String {
        let kind = self.kind();
        let mut res = String::with_capacity(kind.len() + 4);
        for (idx, ch) in kind.char_indices() {
            if ch.is_ascii_uppercase() {
                if idx > 0 {
                    res.push('_');
                }
                res.push(ch.to_ascii_lowercase());
            } else {
                res.push(ch);
            }
        }
        res
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::DeviceUnavailable(_)
            | Error::RevocationDataUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::AuthenticationFailure(_) => StatusCode::FORBIDDEN,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::SigningFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::TokenNotFound(_)
            | Error::KeyNotFound(_)
            | Error::CertNotFound(_)
            | Error::CertRequestNotFound(_) => StatusCode::NOT_FOUND,
            Error::TokenNotActive(_)
            | Error::TokenNotInitialized(_)
            | Error::TokenAlreadyInitialized(_)
            | Error::TokenAlreadyActive(_)
            | Error::KeyNotAvailable(_)
            | Error::CertExists(_)
            | Error::KeyUsageConflict(_) => StatusCode::CONFLICT,
            Error::CertKeyMismatch(_)
            | Error::InvalidRequest(_)
            | Error::UnsupportedOperation(_) => StatusCode::BAD_REQUEST,
            Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Error::Storage(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn to_fault(&self) -> Fault {
        Fault::new(self.kind(), self)
            .with_translation_code(self.translation_code())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::DeviceUnavailable(msg) => {
                write!(f, "Device unavailable: {msg}")
            }
            Error::AuthenticationFailure(msg) => {
                write!(f, "Authentication failed: {msg}")
            }
            Error::SigningFailure(msg) => {
                write!(f, "Signing failed: {msg}")
            }
            Error::TokenNotActive(id) => {
                write!(f, "Token '{id}' not active")
            }
            Error::TokenNotFound(id) => {
                write!(f, "Token '{id}' not found")
            }
            Error::TokenNotInitialized(id) => {
                write!(f, "Token '{id}' not initialized")
            }
            Error::TokenAlreadyInitialized(id) => {
                write!(f, "Token '{id}' already initialized")
            }
            Error::TokenAlreadyActive(id) => {
                write!(f, "Token '{id}' already active")
            }
            Error::KeyNotFound(id) => write!(f, "Key '{id}' not found"),
            Error::KeyNotAvailable(id) => {
                write!(f, "Key '{id}' not available on its device")
            }
            Error::CertNotFound(id) => {
                write!(f, "Certificate '{id}' not found")
            }
            Error::CertRequestNotFound(id) => {
                write!(f, "Certificate request '{id}' not found")
            }
            Error::CertKeyMismatch(hash) => {
                write!(f, "Certificate '{hash}' matches no known key")
            }
            Error::CertExists(hash) => {
                write!(f, "Certificate '{hash}' already exists")
            }
            Error::KeyUsageConflict(msg) => {
                write!(f, "Key usage conflict: {msg}")
            }
            Error::RevocationDataUnavailable(hash) => {
                write!(
                    f,
                    "No usable OCSP response for certificate '{hash}'"
                )
            }
            Error::InvalidRequest(msg) => write!(f, "Invalid request: {msg}"),
            Error::UnsupportedOperation(msg) => {
                write!(f, "Unsupported operation: {msg}")
            }
            Error::Unauthorized => f.write_str("Missing or invalid token"),
            Error::Timeout => f.write_str("Operation timed out"),
            Error::Storage(msg) => write!(f, "Storage error: {msg}"),
            Error::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error { }

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<DeviceError> for Error {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::PinIncorrect => {
                Error::AuthenticationFailure("incorrect PIN".into())
            }
            DeviceError::PinLocked => {
                Error::AuthenticationFailure("PIN locked".into())
            }
            DeviceError::NotLoggedIn => {
                Error::AuthenticationFailure(
                    "not logged in to device".into()
                )
            }
            DeviceError::NotInitialized => {
                Error::TokenNotInitialized(TokenId::from(SOFTWARE_TOKEN_ID))
            }
            DeviceError::AlreadyInitialized => {
                Error::TokenAlreadyInitialized(
                    TokenId::from(SOFTWARE_TOKEN_ID)
                )
            }
            DeviceError::KeyNotFound(key) => Error::KeyNotAvailable(key),
            DeviceError::Removed => {
                Error::DeviceUnavailable("device removed".into())
            }
            DeviceError::Unavailable(msg) => Error::DeviceUnavailable(msg),
            DeviceError::UnsupportedMechanism(_)
            | DeviceError::DigestLength { .. }
            | DeviceError::Rejected(_) => {
                Error::SigningFailure(err.to_string())
            }
            DeviceError::ReadOnly => {
                Error::UnsupportedOperation("device is read-only".into())
            }
            DeviceError::Io(err) => Error::Storage(err.to_string()),
            DeviceError::Json(err) => Error::Storage(err.to_string()),
            other => {
                warn!("Unexpected device error: {other}");
                Error::Internal(other.to_string())
            }
        }
    }
}


//------------ Tests ---------------------------------------------------------
