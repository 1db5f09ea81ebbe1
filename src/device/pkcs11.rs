//! Hardware tokens accessed through a PKCS#11 library.
//!
//! Every slot with a token of a configured library becomes a token. The
//! token id is derived from the module name and the token serial number so
//! that it survives restarts and slot renumbering.

use std::time::Duration;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as CryptokiError, RvError};
use cryptoki::mechanism::{Mechanism, MechanismType};
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::{AuthPin, Ulong};
use log::{debug, error, info, trace, warn};
use openssl::bn::BigNum;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use crate::api::ids::{KeyId, TokenId};
use crate::api::rpc::Pin;
use crate::api::token::TokenKind;
use crate::config::HsmModuleConfig;
use crate::constants::{HSM_PROBE_INTERVAL, RSA_KEY_BITS};
use super::{hardware_token_id, DeviceInfo, GeneratedKey};
use super::error::DeviceError;
use super::mechanism::SignMechanism;
use super::probe::{ProbeError, StatefulProbe};


//------------ Constants -----------------------------------------------------

/// The time to wait before retrying a failed device call.
const RETRY_REQ_AFTER: Duration = Duration::from_millis(500);

/// How much longer to wait for each following retry.
const RETRY_REQ_AFTER_MULTIPLIER: f64 = 1.5;

/// The maximum amount of time to keep retrying a failed device call.
const RETRY_REQ_UNTIL_MAX: Duration = Duration::from_secs(10);


//------------ Pkcs11Module --------------------------------------------------

/// A configured PKCS#11 library.
///
/// The library is loaded and initialised on first use.
pub struct Pkcs11Module {
    probe: StatefulProbe<HsmModuleConfig, Pkcs11>,
}

impl Pkcs11Module {
    pub fn new(config: HsmModuleConfig) -> Self {
        Pkcs11Module {
            probe: StatefulProbe::new(
                &config.name.clone(), config, HSM_PROBE_INTERVAL
            ),
        }
    }

    pub fn name(&self) -> &str {
        &self.probe.config().name
    }

    pub fn is_usable(&self) -> bool {
        self.probe.is_usable()
    }

    fn context(&self) -> Result<Pkcs11, DeviceError> {
        let ctx = self.probe.status(Self::load_library)?;
        Ok(Pkcs11::clone(&ctx))
    }

    fn load_library(config: &HsmModuleConfig) -> Result<Pkcs11, ProbeError> {
        debug!(
            "[{}] Loading PKCS#11 library '{}'",
            config.name, config.library.display()
        );
        let ctx = Pkcs11::new(&config.library).map_err(|err| {
            error!(
                "[{}] Unable to load PKCS#11 library '{}': {err}",
                config.name, config.library.display()
            );
            ProbeError::CompletedUnusable
        })?;
        ctx.initialize(CInitializeArgs::OsThreads).map_err(|err| {
            error!(
                "[{}] Unable to initialize PKCS#11 library '{}': {err}",
                config.name, config.library.display()
            );
            ProbeError::CallbackFailed(device_error(err))
        })?;
        info!(
            "[{}] Using PKCS#11 library '{}'",
            config.name, config.library.display()
        );
        Ok(ctx)
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let ctx = self.context()?;
        let config = self.probe.config();
        let slots = ctx.get_slots_with_token().map_err(|err| {
            warn!("[{}] Failed to enumerate slots: {err}", config.name);
            self.probe.reset();
            DeviceError::Unavailable(err.to_string())
        })?;

        let mut res = Vec::new();
        for slot in slots {
            let info = match ctx.get_token_info(slot) {
                Ok(info) => info,
                Err(err) => {
                    warn!(
                        "[{}] Failed to read token info for slot {}: {err}",
                        config.name, slot.id()
                    );
                    continue
                }
            };
            let serial = info.serial_number().trim_end().to_string();
            trace!("[{}] Found token '{serial}' in slot {}", config.name, slot.id());
            res.push(DeviceInfo {
                token_id: hardware_token_id(&config.name, &serial),
                kind: TokenKind::Hardware,
                module: config.name.clone(),
                label: info.label().trim_end().to_string(),
                serial_number: Some(serial),
                read_only: config.read_only,
                batch_signing: config.batch_signing_enabled,
                initialized: true,
            });
        }
        Ok(res)
    }

    pub fn open(&self, token_id: &TokenId) -> Result<Pkcs11Device, DeviceError> {
        let ctx = self.context()?;
        let config = self.probe.config();
        let slots = ctx.get_slots_with_token().map_err(device_error)?;
        for slot in slots {
            let info = ctx.get_token_info(slot).map_err(device_error)?;
            let serial = info.serial_number().trim_end();
            if &hardware_token_id(&config.name, serial) == token_id {
                return Ok(Pkcs11Device {
                    module: config.name.clone(),
                    ctx,
                    slot,
                    session: None,
                    read_only: config.read_only,
                    batch_signing_enabled: config.batch_signing_enabled,
                })
            }
        }
        Err(DeviceError::Removed)
    }
}


//------------ Pkcs11Device --------------------------------------------------

/// A token in a slot of a PKCS#11 library.
///
/// Logging in opens the session used for all further operations. All
/// sessions of an application share the login state, so one is enough.
pub struct Pkcs11Device {
    module: String,
    ctx: Pkcs11,
    slot: Slot,
    session: Option<Session>,
    read_only: bool,
    batch_signing_enabled: bool,
}

impl Pkcs11Device {
    pub fn login(&mut self, pin: &Pin) -> Result<(), DeviceError> {
        let session = if self.read_only {
            self.ctx.open_ro_session(self.slot)
        }
        else {
            self.ctx.open_rw_session(self.slot)
        }.map_err(device_error)?;

        let pin = AuthPin::from(pin.expose().to_string());
        match session.login(UserType::User, Some(&pin)) {
            Ok(()) | Err(CryptokiError::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => {
                debug!("[{}] Logged in to slot {}", self.module, self.slot.id());
                self.session = Some(session);
                Ok(())
            }
            Err(err) => Err(device_error(err)),
        }
    }

    pub fn logout(&mut self) -> Result<(), DeviceError> {
        if let Some(session) = self.session.take() {
            match session.logout() {
                Ok(()) | Err(CryptokiError::Pkcs11(RvError::UserNotLoggedIn, _)) => { }
                Err(err) => {
                    // The session is closed on drop regardless.
                    warn!("[{}] Logout failed: {err}", self.module);
                }
            }
        }
        Ok(())
    }

    pub fn is_logged_in(&self) -> bool {
        self.session.is_some()
    }

    fn session(&self) -> Result<&Session, DeviceError> {
        self.session.as_ref().ok_or(DeviceError::NotLoggedIn)
    }

    pub fn generate_key_pair(
        &mut self, label: &str
    ) -> Result<GeneratedKey, DeviceError> {
        if self.read_only {
            return Err(DeviceError::ReadOnly)
        }
        let session = self.session()?;
        let id = KeyId::random();
        let raw_id = id.to_device_id();

        let public_template = vec![
            Attribute::Token(true),
            Attribute::Private(false),
            Attribute::Verify(true),
            Attribute::ModulusBits(Ulong::from(u64::from(RSA_KEY_BITS))),
            Attribute::PublicExponent(vec![0x01, 0x00, 0x01]),
            Attribute::Label(label.as_bytes().to_vec()),
            Attribute::Id(raw_id.clone()),
        ];
        let private_template = vec![
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Extractable(false),
            Attribute::Sign(true),
            Attribute::Label(label.as_bytes().to_vec()),
            Attribute::Id(raw_id),
        ];
        let (public_handle, _) = session.generate_key_pair(
            &Mechanism::RsaPkcsKeyPairGen, &public_template, &private_template
        ).map_err(device_error)?;
        let public_key = public_key_info(session, public_handle)?;
        info!("[{}] Generated key '{id}' with label '{label}'", self.module);
        Ok(GeneratedKey { id, public_key })
    }

    /// Signs a DER encoded DigestInfo using `CKM_RSA_PKCS`.
    pub fn sign_digest_info(
        &self, key: &KeyId, digest_info: &[u8]
    ) -> Result<Bytes, DeviceError> {
        let session = self.session()?;
        let handle = self.find_key(session, key, ObjectClass::PRIVATE_KEY)?;
        let signature = self.with_retry("sign", || {
            session.sign(&Mechanism::RsaPkcs, handle, digest_info)
        })?;
        Ok(Bytes::from(signature))
    }

    pub fn delete_key(&mut self, key: &KeyId) -> Result<(), DeviceError> {
        if self.read_only {
            return Err(DeviceError::ReadOnly)
        }
        let session = self.session()?;
        let template = [Attribute::Id(key.to_device_id())];
        let handles = session.find_objects(&template).map_err(device_error)?;
        if handles.is_empty() {
            return Err(DeviceError::KeyNotFound(key.clone()))
        }
        let mut objects = Vec::with_capacity(handles.len());
        for handle in handles {
            let class = session.get_attributes(
                handle, &[AttributeType::Class]
            ).map_err(device_error)?.into_iter().find_map(|attr| match attr {
                Attribute::Class(class) => Some(class),
                _ => None,
            });
            objects.push((handle, class));
        }
        order_for_deletion(&mut objects);

        let total = objects.len();
        for (done, (handle, _)) in objects.into_iter().enumerate() {
            if let Err(err) = session.destroy_object(handle) {
                let err = device_error(err);
                if done == 0 || matches!(err, DeviceError::Removed) {
                    return Err(err)
                }
                warn!(
                    "[{}] Key '{key}' partially deleted, {done} of {total} \
                     objects destroyed: {err}",
                    self.module
                );
                return Err(DeviceError::Pkcs11(format!(
                    "key '{key}' partially deleted: {err}"
                )))
            }
        }
        info!("[{}] Deleted key '{key}'", self.module);
        Ok(())
    }

    pub fn list_mechanisms(&self) -> Result<Vec<SignMechanism>, DeviceError> {
        let mechanisms = self.ctx.get_mechanism_list(self.slot)
            .map_err(device_error)?;
        if mechanisms.contains(&MechanismType::RSA_PKCS) {
            Ok(vec![SignMechanism::RsaPkcs])
        }
        else {
            Ok(Vec::new())
        }
    }

    /// Returns whether the token may sign in batches.
    ///
    /// Asking for the token info doubles as a presence check.
    pub fn supports_batch_signing(&self) -> Result<bool, DeviceError> {
        self.ctx.get_token_info(self.slot).map_err(device_error)?;
        Ok(self.batch_signing_enabled)
    }

    pub fn list_keys(&self) -> Result<Vec<KeyId>, DeviceError> {
        let session = self.session()?;
        let handles = session.find_objects(
            &[Attribute::Class(ObjectClass::PRIVATE_KEY)]
        ).map_err(device_error)?;
        let mut res = Vec::new();
        for handle in handles {
            let attrs = session.get_attributes(handle, &[AttributeType::Id])
                .map_err(device_error)?;
            for attr in attrs {
                if let Attribute::Id(id) = attr {
                    res.push(KeyId::from_device_id(&id));
                }
            }
        }
        res.sort();
        Ok(res)
    }

    pub fn public_key(&self, key: &KeyId) -> Result<Bytes, DeviceError> {
        let session = self.session()?;
        let handle = self.find_key(session, key, ObjectClass::PUBLIC_KEY)?;
        public_key_info(session, handle)
    }

    fn find_key(
        &self, session: &Session, key: &KeyId, class: ObjectClass
    ) -> Result<ObjectHandle, DeviceError> {
        let template = [
            Attribute::Class(class),
            Attribute::Id(key.to_device_id()),
        ];
        session.find_objects(&template)
            .map_err(device_error)?
            .into_iter()
            .next()
            .ok_or_else(|| DeviceError::KeyNotFound(key.clone()))
    }

    /// Runs a device call, retrying with backoff on transient failures.
    fn with_retry<T, F>(&self, desc: &str, mut op: F) -> Result<T, DeviceError>
    where
        F: FnMut() -> Result<T, CryptokiError>,
    {
        let backoff_policy = ExponentialBackoff {
            initial_interval: RETRY_REQ_AFTER,
            multiplier: RETRY_REQ_AFTER_MULTIPLIER,
            max_elapsed_time: Some(RETRY_REQ_UNTIL_MAX),
            ..Default::default()
        };
        let notify = |err: CryptokiError, next: Duration| {
            warn!(
                "[{}] {desc} failed, retrying in {} ms: {err}",
                self.module, next.as_millis()
            );
        };
        backoff::retry_notify(
            backoff_policy,
            || op().map_err(|err| {
                if is_transient_error(&err) {
                    backoff::Error::transient(err)
                }
                else {
                    backoff::Error::permanent(err)
                }
            }),
            notify,
        ).map_err(|err| {
            let err = match err {
                backoff::Error::Permanent(err) => err,
                backoff::Error::Transient { err, .. } => err,
            };
            error!("[{}] {desc} failed: {err}", self.module);
            device_error(err)
        })
    }
}

impl Drop for Pkcs11Device {
    fn drop(&mut self) {
        let _ = self.logout();
    }
}


//------------ Helpers -------------------------------------------------------

/// Builds the DER subject public key info of an RSA public key object.
fn public_key_info(
    session: &Session, handle: ObjectHandle
) -> Result<Bytes, DeviceError> {
    let attrs = session.get_attributes(
        handle, &[AttributeType::Modulus, AttributeType::PublicExponent]
    ).map_err(device_error)?;
    let mut modulus = None;
    let mut exponent = None;
    for attr in attrs {
        match attr {
            Attribute::Modulus(value) => modulus = Some(value),
            Attribute::PublicExponent(value) => exponent = Some(value),
            _ => { }
        }
    }
    let (Some(modulus), Some(exponent)) = (modulus, exponent) else {
        return Err(DeviceError::other("public key lacks RSA components"))
    };
    let rsa = Rsa::from_public_components(
        BigNum::from_slice(&modulus)?, BigNum::from_slice(&exponent)?
    )?;
    Ok(Bytes::from(PKey::from_rsa(rsa)?.public_key_to_der()?))
}

fn is_transient_error(err: &CryptokiError) -> bool {
    matches!(
        err,
        CryptokiError::Pkcs11(
            RvError::DeviceError
            | RvError::DeviceMemory
            | RvError::FunctionFailed
            | RvError::OperationActive
            | RvError::SessionCount,
            _
        )
    )
}

/// Puts private keys last.
///
/// As long as the private key is there, the key is still listed and
/// usable, so a deletion failing halfway leaves a key the registry knows.
fn order_for_deletion<T>(objects: &mut [(T, Option<ObjectClass>)]) {
    objects.sort_by_key(|(_, class)| {
        class.as_ref() == Some(&ObjectClass::PRIVATE_KEY)
    });
}

fn device_error(err: CryptokiError) -> DeviceError {
    match err {
        CryptokiError::Pkcs11(rv, _) => match rv {
            RvError::PinIncorrect
            | RvError::PinInvalid
            | RvError::PinLenRange => DeviceError::PinIncorrect,
            RvError::PinLocked => DeviceError::PinLocked,
            RvError::UserNotLoggedIn => DeviceError::NotLoggedIn,
            RvError::DeviceRemoved
            | RvError::TokenNotPresent
            | RvError::TokenNotRecognized
            | RvError::SessionClosed
            | RvError::SessionHandleInvalid
            | RvError::SlotIdInvalid => DeviceError::Removed,
            RvError::MechanismInvalid
            | RvError::MechanismParamInvalid => {
                DeviceError::UnsupportedMechanism(rv.to_string())
            }
            RvError::DataInvalid
            | RvError::DataLenRange
            | RvError::KeyFunctionNotPermitted
            | RvError::KeyTypeInconsistent => {
                DeviceError::Rejected(rv.to_string())
            }
            RvError::TokenWriteProtected => DeviceError::ReadOnly,
            other => DeviceError::Pkcs11(other.to_string()),
        },
        other => DeviceError::Pkcs11(other.to_string()),
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_keys_are_deleted_last() {
        let mut objects = vec![
            (1, Some(ObjectClass::PRIVATE_KEY)),
            (2, Some(ObjectClass::PUBLIC_KEY)),
            (3, None),
            (4, Some(ObjectClass::CERTIFICATE)),
        ];
        order_for_deletion(&mut objects);
        let order: Vec<_> = objects.iter().map(|(handle, _)| *handle).collect();
        assert_eq!(order, vec![2, 3, 4, 1]);
    }
}
