//! Errors reported by crypto devices.

use std::fmt;
use openssl::error::ErrorStack;
use crate::api::ids::KeyId;
use crate::commons::error::IoError;


//------------ DeviceError ---------------------------------------------------

/// A failure inside a crypto device.
///
/// These never cross the service boundary, they are translated into
/// [`Error`][crate::commons::error::Error] first.
#[derive(Debug)]
pub enum DeviceError {
    /// The PIN was not accepted.
    PinIncorrect,

    /// Too many wrong PINs, the device refuses to try again.
    PinLocked,

    /// The operation needs a logged in session.
    NotLoggedIn,

    /// The device has not been initialised with a PIN.
    NotInitialized,

    /// The device has already been initialised.
    AlreadyInitialized,

    /// The device has no key with the given id.
    KeyNotFound(KeyId),

    /// The device went away while we were using it.
    Removed,

    /// The device or its library cannot be reached right now.
    Unavailable(String),

    /// The device does not offer the requested mechanism.
    UnsupportedMechanism(String),

    /// The digest does not fit the signature algorithm.
    DigestLength { expected: usize, actual: usize },

    /// The device refused to sign.
    Rejected(String),

    /// The device does not allow changes.
    ReadOnly,

    Io(IoError),
    Json(serde_json::Error),
    OpenSsl(ErrorStack),

    #[cfg(feature = "hsm")]
    Pkcs11(String),

    Other(String),
}

impl DeviceError {
    pub fn other(msg: impl fmt::Display) -> Self {
        DeviceError::Other(msg.to_string())
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceError::PinIncorrect => f.write_str("incorrect PIN"),
            DeviceError::PinLocked => f.write_str("PIN locked"),
            DeviceError::NotLoggedIn => f.write_str("not logged in"),
            DeviceError::NotInitialized => {
                f.write_str("device not initialized")
            }
            DeviceError::AlreadyInitialized => {
                f.write_str("device already initialized")
            }
            DeviceError::KeyNotFound(key) => {
                write!(f, "key '{key}' not found on device")
            }
            DeviceError::Removed => f.write_str("device removed"),
            DeviceError::Unavailable(msg) => {
                write!(f, "device unavailable: {msg}")
            }
            DeviceError::UnsupportedMechanism(mechanism) => {
                write!(f, "unsupported mechanism: {mechanism}")
            }
            DeviceError::DigestLength { expected, actual } => {
                write!(
                    f,
                    "digest length {actual} does not match expected \
                     length {expected}"
                )
            }
            DeviceError::Rejected(msg) => {
                write!(f, "device rejected signing request: {msg}")
            }
            DeviceError::ReadOnly => f.write_str("device is read-only"),
            DeviceError::Io(err) => err.fmt(f),
            DeviceError::Json(err) => write!(f, "invalid JSON: {err}"),
            DeviceError::OpenSsl(err) => write!(f, "OpenSSL error: {err}"),
            #[cfg(feature = "hsm")]
            DeviceError::Pkcs11(msg) => write!(f, "PKCS#11 error: {msg}"),
            DeviceError::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for DeviceError { }

impl From<IoError> for DeviceError {
    fn from(err: IoError) -> Self {
        DeviceError::Io(err)
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::Json(err)
    }
}

impl From<ErrorStack> for DeviceError {
    fn from(err: ErrorStack) -> Self {
        DeviceError::OpenSsl(err)
    }
}
