//! Crypto devices.
//!
//! The set of device kinds is closed: the software token, PKCS#11 hardware
//! tokens, and in tests an in-memory mock device. A [`DeviceModule`] finds
//! devices, a [`CryptoDevice`] is an opened device performing the actual
//! cryptographic operations. Devices are not thread safe and must only be
//! used by one operation at a time.

pub mod error;
pub mod mechanism;
pub mod softtoken;
pub mod x509;

#[cfg(feature = "hsm")]
pub mod pkcs11;

#[cfg(feature = "hsm")]
pub mod probe;

#[cfg(test)]
pub mod mock;

pub use self::error::DeviceError;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::trace;
use crate::api::ids::{KeyId, TokenId};
use crate::api::rpc::Pin;
use crate::api::token::{CertRequestFormat, KeyUsage, TokenKind};
use self::mechanism::{SignAlgorithm, SignMechanism};
use self::softtoken::{SoftToken, SoftTokenModule};
use self::x509::{CertRequest, DistinguishedName, TbsCertificate};


//------------ DeviceInfo ----------------------------------------------------

/// A device found during discovery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceInfo {
    pub token_id: TokenId,
    pub kind: TokenKind,
    pub module: String,
    pub label: String,
    pub serial_number: Option<String>,
    pub read_only: bool,
    pub batch_signing: bool,

    /// Whether the device has a PIN set up and can be logged in to.
    pub initialized: bool,
}

/// Returns the token id of a hardware device.
pub fn hardware_token_id(module: &str, serial: &str) -> TokenId {
    TokenId::new(format!("{module}-{serial}"))
}


//------------ GeneratedKey --------------------------------------------------

#[derive(Clone, Debug)]
pub struct GeneratedKey {
    pub id: KeyId,

    /// The DER encoded subject public key info.
    pub public_key: Bytes,
}


//------------ DeviceModule --------------------------------------------------

/// A source of devices.
pub enum DeviceModule {
    Software(SoftTokenModule),

    #[cfg(feature = "hsm")]
    Pkcs11(pkcs11::Pkcs11Module),

    #[cfg(test)]
    Mock(mock::MockModule),
}

impl DeviceModule {
    pub fn name(&self) -> &str {
        match self {
            DeviceModule::Software(module) => module.name(),
            #[cfg(feature = "hsm")]
            DeviceModule::Pkcs11(module) => module.name(),
            #[cfg(test)]
            DeviceModule::Mock(module) => module.name(),
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, DeviceModule::Software(_))
    }

    /// Returns whether the module's library could be used the last time.
    pub fn is_usable(&self) -> bool {
        match self {
            DeviceModule::Software(_) => true,
            #[cfg(feature = "hsm")]
            DeviceModule::Pkcs11(module) => module.is_usable(),
            #[cfg(test)]
            DeviceModule::Mock(module) => module.is_usable(),
        }
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        match self {
            DeviceModule::Software(module) => module.list_devices(),
            #[cfg(feature = "hsm")]
            DeviceModule::Pkcs11(module) => module.list_devices(),
            #[cfg(test)]
            DeviceModule::Mock(module) => module.list_devices(),
        }
    }

    pub fn open(&self, info: &DeviceInfo) -> Result<CryptoDevice, DeviceError> {
        trace!("Opening device for token '{}'", info.token_id);
        match self {
            DeviceModule::Software(module) => {
                module.open().map(CryptoDevice::Software)
            }
            #[cfg(feature = "hsm")]
            DeviceModule::Pkcs11(module) => {
                module.open(&info.token_id).map(CryptoDevice::Pkcs11)
            }
            #[cfg(test)]
            DeviceModule::Mock(module) => {
                module.open().map(CryptoDevice::Mock)
            }
        }
    }

    /// Initialises the software token with its first PIN.
    pub fn initialize_software_token(
        &self, pin: &Pin
    ) -> Result<(), DeviceError> {
        match self {
            DeviceModule::Software(module) => module.initialize(pin),
            #[allow(unreachable_patterns)]
            _ => Err(DeviceError::other("not a software token module")),
        }
    }
}


//------------ CryptoDevice --------------------------------------------------

/// An opened device.
pub enum CryptoDevice {
    Software(SoftToken),

    #[cfg(feature = "hsm")]
    Pkcs11(pkcs11::Pkcs11Device),

    #[cfg(test)]
    Mock(mock::MockDevice),
}

macro_rules! with_device {
    ( $self:expr, $device:ident => $call:expr ) => {
        match $self {
            CryptoDevice::Software($device) => $call,
            #[cfg(feature = "hsm")]
            CryptoDevice::Pkcs11($device) => $call,
            #[cfg(test)]
            CryptoDevice::Mock($device) => $call,
        }
    }
}

impl CryptoDevice {
    pub fn login(&mut self, pin: &Pin) -> Result<(), DeviceError> {
        with_device!(self, device => device.login(pin))
    }

    pub fn logout(&mut self) -> Result<(), DeviceError> {
        with_device!(self, device => device.logout())
    }

    pub fn is_logged_in(&self) -> bool {
        with_device!(self, device => device.is_logged_in())
    }

    pub fn generate_key_pair(
        &mut self, label: &str
    ) -> Result<GeneratedKey, DeviceError> {
        with_device!(self, device => device.generate_key_pair(label))
    }

    /// Signs a digest.
    ///
    /// The digest length is checked against the algorithm before the
    /// device is involved.
    pub fn sign(
        &self, key: &KeyId, algorithm: SignAlgorithm, digest: &[u8]
    ) -> Result<Bytes, DeviceError> {
        let digest_info = algorithm.digest_info(digest)?;
        if !self.list_mechanisms()?.contains(&algorithm.mechanism()) {
            return Err(DeviceError::UnsupportedMechanism(
                algorithm.mechanism().to_string()
            ))
        }
        with_device!(self, device => {
            device.sign_digest_info(key, &digest_info)
        })
    }

    /// Signs arbitrary data by hashing it first.
    pub fn sign_data(
        &self, key: &KeyId, algorithm: SignAlgorithm, data: &[u8]
    ) -> Result<Bytes, DeviceError> {
        self.sign(key, algorithm, &algorithm.digest(data)?)
    }

    /// Issues a certificate for an external public key.
    ///
    /// The certificate is signed by the device key, the issuer name is
    /// taken from the given issuer certificate.
    #[allow(clippy::too_many_arguments)]
    pub fn sign_certificate(
        &self,
        key: &KeyId,
        algorithm: SignAlgorithm,
        issuer_cert: &[u8],
        subject: &DistinguishedName,
        public_key: &[u8],
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<Bytes, DeviceError> {
        let tbs = TbsCertificate::new(
            algorithm,
            x509::certificate_subject(issuer_cert)?,
            subject,
            public_key,
            not_before,
            not_after,
        )?;
        tbs.sign(|data| self.sign_data(key, algorithm, data))
    }

    /// Creates a certificate for a device key signed by itself.
    #[allow(clippy::too_many_arguments)]
    pub fn self_signed_certificate(
        &self,
        key: &KeyId,
        public_key: &[u8],
        algorithm: SignAlgorithm,
        subject: &DistinguishedName,
        usage: KeyUsage,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<Bytes, DeviceError> {
        let tbs = TbsCertificate::new(
            algorithm,
            subject.encode(),
            subject,
            public_key,
            not_before,
            not_after,
        )?.with_key_usage(usage);
        tbs.sign(|data| self.sign_data(key, algorithm, data))
    }

    /// Creates a PKCS#10 certificate request for a device key.
    pub fn cert_request(
        &self,
        key: &KeyId,
        public_key: &[u8],
        algorithm: SignAlgorithm,
        subject: &DistinguishedName,
        format: CertRequestFormat,
    ) -> Result<Bytes, DeviceError> {
        CertRequest::new(subject.clone(), public_key)?.sign(
            algorithm, format, |data| self.sign_data(key, algorithm, data)
        )
    }

    pub fn delete_key(&mut self, key: &KeyId) -> Result<(), DeviceError> {
        with_device!(self, device => device.delete_key(key))
    }

    pub fn list_mechanisms(&self) -> Result<Vec<SignMechanism>, DeviceError> {
        match self {
            CryptoDevice::Software(device) => Ok(device.list_mechanisms()),
            #[cfg(feature = "hsm")]
            CryptoDevice::Pkcs11(device) => device.list_mechanisms(),
            #[cfg(test)]
            CryptoDevice::Mock(device) => Ok(device.list_mechanisms()),
        }
    }

    /// Asks the device whether it supports signing in batches.
    pub fn supports_batch_signing(&self) -> Result<bool, DeviceError> {
        match self {
            CryptoDevice::Software(_) => Ok(true),
            #[cfg(feature = "hsm")]
            CryptoDevice::Pkcs11(device) => device.supports_batch_signing(),
            #[cfg(test)]
            CryptoDevice::Mock(device) => device.supports_batch_signing(),
        }
    }

    /// Lists the ids of all keys on the device.
    pub fn list_keys(&self) -> Result<Vec<KeyId>, DeviceError> {
        with_device!(self, device => device.list_keys())
    }

    pub fn public_key(&self, key: &KeyId) -> Result<Bytes, DeviceError> {
        with_device!(self, device => device.public_key(key))
    }

    /// Changes the PIN of the software token.
    pub fn change_pin(
        &mut self, old_pin: &Pin, new_pin: &Pin
    ) -> Result<(), DeviceError> {
        match self {
            CryptoDevice::Software(device) => {
                device.change_pin(old_pin, new_pin)
            }
            #[allow(unreachable_patterns)]
            _ => Err(DeviceError::other("PIN change not supported")),
        }
    }
}
