//! An in-memory hardware device for testing.
//!
//! The device can be unplugged and plugged back in, counts calls, and
//! records whether two operations ever ran on it at the same time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use bytes::Bytes;
use openssl::pkey::{PKey, Private};
use openssl::rsa::{Padding, Rsa};
use crate::api::ids::{KeyId, TokenId};
use crate::api::rpc::Pin;
use crate::api::token::TokenKind;
use super::{hardware_token_id, DeviceInfo, GeneratedKey};
use super::error::DeviceError;
use super::mechanism::SignMechanism;


//------------ FnIdx ---------------------------------------------------------

pub enum FnIdx {
    Login,
    Logout,
    GenerateKeyPair,
    Sign,
    DeleteKey,
    ListKeys,
    Count,
}

#[derive(Debug)]
pub struct MockCallCounts {
    call_counts: RwLock<Vec<u32>>,
}

impl MockCallCounts {
    fn new() -> Self {
        MockCallCounts {
            call_counts: RwLock::new(vec![0; FnIdx::Count as usize]),
        }
    }

    pub fn get(&self, fn_idx: FnIdx) -> u32 {
        self.call_counts.read().unwrap()[fn_idx as usize]
    }

    fn inc(&self, fn_idx: FnIdx) {
        self.call_counts.write().unwrap()[fn_idx as usize] += 1;
    }

    pub fn total(&self) -> u32 {
        self.call_counts.read().unwrap().iter().sum()
    }
}


//------------ MockState -----------------------------------------------------

/// The state of the simulated hardware, shared between module and devices.
#[derive(Debug)]
pub struct MockState {
    pin: Mutex<String>,
    present: AtomicBool,
    usable: AtomicBool,
    batch_signing: AtomicBool,
    fail_delete: AtomicBool,
    keys: Mutex<HashMap<KeyId, PKey<Private>>>,
    op_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    overlapped: AtomicBool,
    pub counts: MockCallCounts,
}

impl MockState {
    pub fn new(pin: &str) -> Arc<Self> {
        Arc::new(MockState {
            pin: Mutex::new(pin.to_string()),
            present: AtomicBool::new(true),
            usable: AtomicBool::new(true),
            batch_signing: AtomicBool::new(true),
            fail_delete: AtomicBool::new(false),
            keys: Mutex::new(HashMap::new()),
            op_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
            counts: MockCallCounts::new(),
        })
    }

    /// Changes the PIN as if done by another application.
    pub fn set_pin(&self, pin: &str) {
        *self.pin.lock().unwrap() = pin.to_string();
    }

    pub fn unplug(&self) {
        self.present.store(false, Ordering::SeqCst);
    }

    pub fn plug_in(&self) {
        self.present.store(true, Ordering::SeqCst);
    }

    pub fn set_usable(&self, usable: bool) {
        self.usable.store(usable, Ordering::SeqCst);
    }

    pub fn set_batch_signing(&self, enabled: bool) {
        self.batch_signing.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    /// Makes every device operation take at least this long.
    pub fn set_op_delay(&self, delay: Duration) {
        *self.op_delay.lock().unwrap() = delay;
    }

    /// Returns whether two operations ever ran at the same time.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn has_key(&self, key: &KeyId) -> bool {
        self.keys.lock().unwrap().contains_key(key)
    }

    /// Adds a key as if created by another application.
    pub fn add_foreign_key(&self) -> KeyId {
        let key_id = KeyId::random();
        let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        self.keys.lock().unwrap().insert(key_id.clone(), pkey);
        key_id
    }

    fn operation<T>(
        &self,
        fn_idx: FnIdx,
        op: impl FnOnce() -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        self.counts.inc(fn_idx);
        if !self.present.load(Ordering::SeqCst) {
            return Err(DeviceError::Removed)
        }
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let delay = *self.op_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let res = op();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        res
    }
}


//------------ MockModule ----------------------------------------------------

#[derive(Clone, Debug)]
pub struct MockModule {
    name: String,
    serial: String,
    state: Arc<MockState>,
}

impl MockModule {
    pub fn new(name: &str, serial: &str, state: Arc<MockState>) -> Self {
        MockModule {
            name: name.to_string(),
            serial: serial.to_string(),
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token_id(&self) -> TokenId {
        hardware_token_id(&self.name, &self.serial)
    }

    pub fn is_usable(&self) -> bool {
        self.state.usable.load(Ordering::SeqCst)
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        if !self.is_usable() {
            return Err(DeviceError::Unavailable("module unusable".into()))
        }
        if !self.state.present.load(Ordering::SeqCst) {
            return Ok(Vec::new())
        }
        Ok(vec![DeviceInfo {
            token_id: self.token_id(),
            kind: TokenKind::Hardware,
            module: self.name.clone(),
            label: format!("{} token", self.name),
            serial_number: Some(self.serial.clone()),
            read_only: false,
            batch_signing: self.state.batch_signing.load(Ordering::SeqCst),
            initialized: true,
        }])
    }

    pub fn open(&self) -> Result<MockDevice, DeviceError> {
        if !self.state.present.load(Ordering::SeqCst) {
            return Err(DeviceError::Removed)
        }
        Ok(MockDevice { state: self.state.clone(), logged_in: false })
    }
}


//------------ MockDevice ----------------------------------------------------

#[derive(Debug)]
pub struct MockDevice {
    state: Arc<MockState>,
    logged_in: bool,
}

impl MockDevice {
    pub fn login(&mut self, pin: &Pin) -> Result<(), DeviceError> {
        let state = self.state.clone();
        state.operation(FnIdx::Login, || {
            if pin.expose() == *state.pin.lock().unwrap() {
                Ok(())
            }
            else {
                Err(DeviceError::PinIncorrect)
            }
        })?;
        self.logged_in = true;
        Ok(())
    }

    pub fn logout(&mut self) -> Result<(), DeviceError> {
        self.logged_in = false;
        self.state.operation(FnIdx::Logout, || Ok(()))
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    fn check_login(&self) -> Result<(), DeviceError> {
        if self.logged_in {
            Ok(())
        }
        else {
            Err(DeviceError::NotLoggedIn)
        }
    }

    pub fn generate_key_pair(
        &mut self, _label: &str
    ) -> Result<GeneratedKey, DeviceError> {
        self.check_login()?;
        self.state.operation(FnIdx::GenerateKeyPair, || {
            let pkey = PKey::from_rsa(Rsa::generate(2048)?)?;
            let id = KeyId::random();
            let public_key = Bytes::from(pkey.public_key_to_der()?);
            self.state.keys.lock().unwrap().insert(id.clone(), pkey);
            Ok(GeneratedKey { id, public_key })
        })
    }

    pub fn sign_digest_info(
        &self, key: &KeyId, digest_info: &[u8]
    ) -> Result<Bytes, DeviceError> {
        self.check_login()?;
        self.state.operation(FnIdx::Sign, || {
            let keys = self.state.keys.lock().unwrap();
            let pkey = keys.get(key).ok_or_else(|| {
                DeviceError::KeyNotFound(key.clone())
            })?;
            let rsa = pkey.rsa()?;
            let mut signature = vec![0; rsa.size() as usize];
            let len = rsa.private_encrypt(
                digest_info, &mut signature, Padding::PKCS1
            )?;
            signature.truncate(len);
            Ok(Bytes::from(signature))
        })
    }

    pub fn delete_key(&mut self, key: &KeyId) -> Result<(), DeviceError> {
        self.check_login()?;
        self.state.operation(FnIdx::DeleteKey, || {
            if self.state.fail_delete.load(Ordering::SeqCst) {
                return Err(DeviceError::other("simulated delete failure"))
            }
            match self.state.keys.lock().unwrap().remove(key) {
                Some(_) => Ok(()),
                None => Err(DeviceError::KeyNotFound(key.clone())),
            }
        })
    }

    pub fn list_mechanisms(&self) -> Vec<SignMechanism> {
        vec![SignMechanism::RsaPkcs]
    }

    pub fn supports_batch_signing(&self) -> Result<bool, DeviceError> {
        if !self.state.present.load(Ordering::SeqCst) {
            return Err(DeviceError::Removed)
        }
        Ok(self.state.batch_signing.load(Ordering::SeqCst))
    }

    pub fn list_keys(&self) -> Result<Vec<KeyId>, DeviceError> {
        self.state.operation(FnIdx::ListKeys, || {
            let mut res: Vec<_> = self.state.keys.lock().unwrap()
                .keys().cloned().collect();
            res.sort();
            Ok(res)
        })
    }

    pub fn public_key(&self, key: &KeyId) -> Result<Bytes, DeviceError> {
        let keys = self.state.keys.lock().unwrap();
        let pkey = keys.get(key).ok_or_else(|| {
            DeviceError::KeyNotFound(key.clone())
        })?;
        Ok(Bytes::from(pkey.public_key_to_der()?))
    }
}
