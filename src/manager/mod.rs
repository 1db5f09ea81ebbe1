//! Token discovery, activation and exclusive device access.
//!
//! Every token found on a device module gets a slot holding the opened
//! device. The slot's lock is held for the whole of any operation talking
//! to the device, so a device is only ever used by one operation at a
//! time while different tokens work in parallel.

pub mod credentials;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use log::{debug, info, trace, warn};
use crate::api::ids::TokenId;
use crate::api::rpc::Pin;
use crate::api::token::TokenState;
use crate::commons::SignerResult;
use crate::commons::error::Error;
use crate::config::Config;
use crate::device::{CryptoDevice, DeviceInfo, DeviceModule};
use crate::device::softtoken::SoftTokenModule;
use crate::registry::TokenRegistry;
use self::credentials::CredentialCache;


//------------ TokenSlot -----------------------------------------------------

struct TokenSlot {
    /// Index of the module the token was found on.
    module: usize,
    inner: Mutex<SlotInner>,
}

struct SlotInner {
    info: DeviceInfo,

    /// The opened device while the token is active.
    device: Option<CryptoDevice>,
}

impl TokenSlot {
    fn lock(&self) -> SignerResult<MutexGuard<'_, SlotInner>> {
        self.inner.lock().map_err(|_| Error::poisoned("token slot"))
    }
}


//------------ TokenManager --------------------------------------------------

pub struct TokenManager {
    registry: Arc<TokenRegistry>,
    modules: Vec<DeviceModule>,
    slots: RwLock<HashMap<TokenId, Arc<TokenSlot>>>,
    credentials: CredentialCache,
}

impl TokenManager {
    pub fn new(registry: Arc<TokenRegistry>, modules: Vec<DeviceModule>) -> Self {
        TokenManager {
            registry,
            modules,
            slots: RwLock::new(HashMap::new()),
            credentials: CredentialCache::new(),
        }
    }

    /// Creates the device modules enabled in the config.
    pub fn modules_from_config(config: &Config) -> Vec<DeviceModule> {
        let mut modules = Vec::new();
        if config.software_token {
            modules.push(DeviceModule::Software(
                SoftTokenModule::new(&config.data_dir)
            ));
        }

        #[cfg(feature = "hsm")]
        for module in &config.hsm_modules {
            modules.push(DeviceModule::Pkcs11(
                crate::device::pkcs11::Pkcs11Module::new(module.clone())
            ));
        }

        #[cfg(not(feature = "hsm"))]
        if !config.hsm_modules.is_empty() {
            warn!(
                "Built without HSM support, ignoring {} configured modules",
                config.hsm_modules.len()
            );
        }

        modules
    }

    pub fn registry(&self) -> &Arc<TokenRegistry> {
        &self.registry
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.credentials
    }

    /// Returns the current state of a token.
    pub fn token_state(&self, token_id: &TokenId) -> SignerResult<TokenState> {
        Ok(self.registry.snapshot()?.token(token_id)?.state)
    }
}

/// # Discovery
impl TokenManager {
    /// Runs one discovery cycle over all modules.
    ///
    /// Failures of single modules or tokens are logged and do not stop the
    /// cycle.
    pub fn discover(&self) -> SignerResult<()> {
        for idx in 0..self.modules.len() {
            self.discover_module(idx)?;
        }
        Ok(())
    }

    fn discover_module(&self, idx: usize) -> SignerResult<()> {
        let module = &self.modules[idx];
        let devices = match module.list_devices() {
            Ok(devices) => devices,
            Err(err) => {
                debug!("Cannot list devices of module '{}': {err}", module.name());
                Vec::new()
            }
        };

        for info in &devices {
            if let Err(err) = self.device_present(idx, info) {
                warn!(
                    "Failed to update token '{}' on module '{}': {err}",
                    info.token_id, module.name()
                );
            }
        }

        let missing: Vec<TokenId> = self.registry.snapshot()?.tokens()
            .filter(|token| {
                token.module == module.name()
                    && token.state.is_present()
                    && !devices.iter().any(|info| info.token_id == token.id)
            })
            .map(|token| token.id.clone())
            .collect();
        for token_id in missing {
            if let Some(slot) = self.find_slot(&token_id)? {
                self.mark_absent(&mut *slot.lock()?)?;
            }
        }
        Ok(())
    }

    fn device_present(&self, idx: usize, info: &DeviceInfo) -> SignerResult<()> {
        let token_id = &info.token_id;
        if self.registry.snapshot()?.updated_token(info).is_some() {
            self.registry.update(|state| {
                state.add_or_update_token(info);
                Ok(())
            })?;
            info!("Registered token '{token_id}'");
        }

        let slot = self.slot_for(idx, info)?;
        let mut inner = slot.lock()?;
        inner.info = info.clone();

        match self.token_state(token_id)? {
            TokenState::Absent => {
                self.registry.update_runtime(|state| {
                    state.set_token_state(token_id, TokenState::PresentInactive)
                })?;
                info!("Token '{token_id}' is present");
                self.reactivate(&slot, &mut inner)
            }
            TokenState::PresentInactive => self.reactivate(&slot, &mut inner),
            TokenState::Active if inner.device.is_none() => {
                self.registry.update_runtime(|state| {
                    state.set_token_state(token_id, TokenState::PresentInactive)
                })?;
                warn!("Token '{token_id}' was active without an open device");
                self.reactivate(&slot, &mut inner)
            }
            TokenState::Active => {
                // Listing the keys also tells us whether the session is
                // still alive.
                self.reconcile_keys(&mut inner)
            }
        }
    }

    /// Logs in again with a cached PIN, if there is one.
    fn reactivate(
        &self, slot: &TokenSlot, inner: &mut SlotInner
    ) -> SignerResult<()> {
        let token_id = inner.info.token_id.clone();
        let Some(pin) = self.credentials.get(&token_id) else {
            return Ok(())
        };
        match self.login(slot, inner, &pin) {
            Ok(()) => {
                info!("Token '{token_id}' reactivated with cached PIN");
                Ok(())
            }
            Err(Error::AuthenticationFailure(msg)) => {
                self.credentials.remove(&token_id);
                warn!(
                    "Cached PIN for token '{token_id}' was rejected ({msg}), \
                     token must be activated manually"
                );
                Ok(())
            }
            Err(err) => {
                warn!("Failed to reactivate token '{token_id}': {err}");
                Ok(())
            }
        }
    }

    /// Marks registry keys present or absent, adds unknown device keys.
    fn reconcile_keys(&self, inner: &mut SlotInner) -> SignerResult<()> {
        let token_id = inner.info.token_id.clone();
        let Some(device) = inner.device.as_ref() else {
            return Ok(())
        };
        let on_device = match device.list_keys() {
            Ok(keys) => keys,
            Err(err) => {
                let err = Error::from(err);
                if matches!(err, Error::DeviceUnavailable(_)) {
                    self.mark_absent(inner)?;
                }
                return Err(err)
            }
        };

        let unknown = self.registry.update_runtime(|state| {
            state.set_keys_available(&token_id, &on_device)
        })?;
        if unknown.is_empty() {
            return Ok(())
        }

        let mut found = Vec::new();
        for key_id in unknown {
            match device.public_key(&key_id) {
                Ok(public_key) => found.push((key_id, public_key)),
                Err(err) => {
                    warn!(
                        "Cannot read public key of '{key_id}' on token \
                         '{token_id}': {err}"
                    );
                }
            }
        }
        let count = found.len();
        self.registry.update(|state| {
            for (key_id, public_key) in found {
                state.add_key(&token_id, key_id, public_key, None)?;
            }
            Ok(())
        })?;
        info!("Added {count} keys found on token '{token_id}'");
        Ok(())
    }

    fn mark_absent(&self, inner: &mut SlotInner) -> SignerResult<()> {
        let token_id = inner.info.token_id.clone();
        inner.device = None;
        self.registry.update_runtime(|state| {
            state.set_token_state(&token_id, TokenState::Absent)?;
            state.set_keys_unavailable(&token_id);
            Ok(())
        })?;
        info!("Token '{token_id}' is absent");
        Ok(())
    }

    fn slot_for(
        &self, module: usize, info: &DeviceInfo
    ) -> SignerResult<Arc<TokenSlot>> {
        if let Some(slot) = self.find_slot(&info.token_id)? {
            return Ok(slot)
        }
        let mut slots = self.slots.write().map_err(|_| {
            Error::poisoned("token slots")
        })?;
        Ok(slots.entry(info.token_id.clone()).or_insert_with(|| {
            Arc::new(TokenSlot {
                module,
                inner: Mutex::new(SlotInner {
                    info: info.clone(),
                    device: None,
                }),
            })
        }).clone())
    }

    fn find_slot(
        &self, token_id: &TokenId
    ) -> SignerResult<Option<Arc<TokenSlot>>> {
        Ok(self.slots.read().map_err(|_| {
            Error::poisoned("token slots")
        })?.get(token_id).cloned())
    }
}

/// # Activation
impl TokenManager {
    /// Logs in to a present token.
    pub fn activate(&self, token_id: &TokenId, pin: &Pin) -> SignerResult<()> {
        Self::check_activatable(token_id, self.token_state(token_id)?)?;
        let slot = self.find_slot(token_id)?.ok_or_else(|| {
            Error::DeviceUnavailable(format!("token '{token_id}' not present"))
        })?;
        let mut inner = slot.lock()?;
        Self::check_activatable(token_id, self.token_state(token_id)?)?;
        self.login(&slot, &mut inner, pin)?;
        info!("Token '{token_id}' activated");
        Ok(())
    }

    fn check_activatable(
        token_id: &TokenId, state: TokenState
    ) -> SignerResult<()> {
        match state {
            TokenState::PresentInactive => Ok(()),
            TokenState::Active => Err(Error::TokenAlreadyActive(token_id.clone())),
            TokenState::Absent => Err(Error::DeviceUnavailable(
                format!("token '{token_id}' not present")
            )),
        }
    }

    /// Opens the device if needed, logs in and makes the token active.
    fn login(
        &self, slot: &TokenSlot, inner: &mut SlotInner, pin: &Pin
    ) -> SignerResult<()> {
        let token_id = inner.info.token_id.clone();
        if !inner.info.initialized {
            return Err(Error::TokenNotInitialized(token_id))
        }
        let mut device = match inner.device.take() {
            Some(device) => device,
            None => self.modules[slot.module].open(&inner.info)?,
        };
        if let Err(err) = device.login(pin) {
            let err = Error::from(err);
            if !matches!(err, Error::DeviceUnavailable(_)) {
                inner.device = Some(device);
            }
            return Err(err)
        }
        inner.device = Some(device);
        self.registry.update_runtime(|state| {
            state.set_token_state(&token_id, TokenState::Active)
        })?;
        self.credentials.set(&token_id, pin);
        if let Err(err) = self.reconcile_keys(inner) {
            warn!("Failed to list keys of token '{token_id}': {err}");
        }
        Ok(())
    }

    /// Logs out of a token and forgets its PIN.
    ///
    /// Deactivating a token that is not active is not an error.
    pub fn deactivate(&self, token_id: &TokenId) -> SignerResult<()> {
        let Some(slot) = self.find_slot(token_id)? else {
            self.token_state(token_id)?;
            self.credentials.remove(token_id);
            return Ok(())
        };
        // The state must be read under the lock, an activation may still
        // be running.
        let mut inner = slot.lock()?;
        self.credentials.remove(token_id);
        if let Some(mut device) = inner.device.take() {
            if let Err(err) = device.logout() {
                debug!("Logout from token '{token_id}' failed: {err}");
            }
        }
        let state = self.token_state(token_id)?;
        if state.is_present() {
            self.registry.update_runtime(|registry| {
                registry.set_token_state(token_id, TokenState::PresentInactive)
            })?;
            if state.is_active() {
                info!("Token '{token_id}' deactivated");
            }
        }
        Ok(())
    }

    /// Logs out of all tokens and forgets all PINs.
    pub fn shutdown(&self) {
        self.credentials.clear();
        let slots: Vec<_> = match self.slots.read() {
            Ok(slots) => slots.values().cloned().collect(),
            Err(_) => return,
        };
        for slot in slots {
            if let Ok(mut inner) = slot.lock() {
                if let Some(mut device) = inner.device.take() {
                    let _ = device.logout();
                }
            }
        }
    }
}

/// # Device access
impl TokenManager {
    /// Runs an operation on the device of an active token.
    ///
    /// The token's slot is locked for the duration of the operation. If the
    /// token is not active, the operation is not run. If the device turns
    /// out to be gone, the token is marked absent.
    pub fn with_active_device<F, T>(
        &self, token_id: &TokenId, op: F
    ) -> SignerResult<T>
    where
        F: FnOnce(&mut CryptoDevice) -> SignerResult<T>,
    {
        if !self.token_state(token_id)?.is_active() {
            return Err(Error::TokenNotActive(token_id.clone()))
        }
        let slot = self.find_slot(token_id)?.ok_or_else(|| {
            Error::TokenNotActive(token_id.clone())
        })?;
        let mut inner = slot.lock()?;
        if !self.token_state(token_id)?.is_active() {
            return Err(Error::TokenNotActive(token_id.clone()))
        }
        let device = inner.device.as_mut().ok_or_else(|| {
            Error::TokenNotActive(token_id.clone())
        })?;
        trace!("Running operation on token '{token_id}'");
        match op(device) {
            Err(Error::DeviceUnavailable(msg)) => {
                self.mark_absent(&mut inner)?;
                Err(Error::DeviceUnavailable(msg))
            }
            res => res,
        }
    }

    /// Asks the device of an active token whether it can sign in batches.
    ///
    /// For inactive tokens the last known answer is returned. The registry
    /// is updated if the device changed its mind.
    pub fn batch_signing_enabled(
        &self, token_id: &TokenId
    ) -> SignerResult<bool> {
        let token = self.registry.snapshot()?.token(token_id)?.clone();
        if !token.state.is_active() {
            return Ok(token.batch_signing_enabled)
        }
        self.with_active_device(token_id, |device| {
            let enabled = device.supports_batch_signing()?;
            self.update_batch_signing(token_id, enabled)?;
            Ok(enabled)
        })
    }

    /// Records the batch signing capability reported by a device.
    pub fn update_batch_signing(
        &self, token_id: &TokenId, enabled: bool
    ) -> SignerResult<()> {
        let current = self.registry.snapshot()?.token(token_id)?
            .batch_signing_enabled;
        if current != enabled {
            self.registry.update(|state| {
                state.set_batch_signing(token_id, enabled).map(|_| ())
            })?;
            info!(
                "Batch signing on token '{token_id}' is now {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        Ok(())
    }

    /// Returns whether all hardware modules and their tokens are usable.
    pub fn is_hsm_operational(&self) -> SignerResult<bool> {
        let hardware: Vec<_> = self.modules.iter().filter(|module| {
            module.is_hardware()
        }).collect();
        if !hardware.iter().all(|module| module.is_usable()) {
            return Ok(false)
        }
        let snapshot = self.registry.snapshot()?;
        Ok(snapshot.tokens().filter(|token| {
            !token.kind.is_software()
                && hardware.iter().any(|module| module.name() == token.module)
        }).all(|token| token.state.is_present()))
    }
}

/// # Software token
impl TokenManager {
    /// Sets up the software token with its first PIN.
    pub fn init_software_token(&self, pin: &Pin) -> SignerResult<()> {
        let idx = self.modules.iter().position(|module| {
            matches!(module, DeviceModule::Software(_))
        }).ok_or_else(|| Error::unsupported("software token is disabled"))?;
        self.modules[idx].initialize_software_token(pin)?;
        info!("Software token initialized");
        self.discover_module(idx)
    }

    /// Changes the PIN of the software token.
    ///
    /// Works whether the token is active or not. The cached PIN of an
    /// active token is replaced.
    pub fn change_software_token_pin(
        &self, token_id: &TokenId, old_pin: &Pin, new_pin: &Pin
    ) -> SignerResult<()> {
        let token = self.registry.snapshot()?.token(token_id)?.clone();
        if !token.kind.is_software() {
            return Err(Error::unsupported(
                "PIN can only be changed for the software token"
            ))
        }
        let slot = self.find_slot(token_id)?.ok_or_else(|| {
            Error::DeviceUnavailable(format!("token '{token_id}' not present"))
        })?;
        let mut inner = slot.lock()?;
        match inner.device.as_mut() {
            Some(device) => device.change_pin(old_pin, new_pin)?,
            None => {
                self.modules[slot.module].open(&inner.info)?
                    .change_pin(old_pin, new_pin)?
            }
        }
        if self.credentials.contains(token_id) {
            self.credentials.set(token_id, new_pin);
        }
        info!("PIN of token '{token_id}' changed");
        Ok(())
    }
}


//------------ Tests ---------------------------------------------------------
