//! The data kept by the token registry.
//!
//! Tokens, keys, certificates and certificate requests live in separate
//! maps keyed by their identifiers. Owners refer to the things they own by
//! id only, so there are no back references to keep in sync.

use std::collections::BTreeMap;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use crate::api::ids::{CertHash, CertId, CertRequestId, KeyId, TokenId};
use crate::api::member::ClientId;
use crate::api::serde_ext::base64_bytes;
use crate::api::token::{
    CertRequestFormat, CertRequestInfo, CertStatus, CertificateInfo,
    KeyInfo, KeyUsage, TokenInfo, TokenKind, TokenState,
};
use crate::commons::SignerResult;
use crate::commons::error::Error;
use crate::device::DeviceInfo;
use crate::device::mechanism::SignMechanism;


//------------ TokenRecord ---------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TokenRecord {
    pub id: TokenId,
    pub kind: TokenKind,
    pub module: String,
    pub friendly_name: Option<String>,
    pub label: Option<String>,
    pub serial_number: Option<String>,
    pub read_only: bool,

    /// The last batch signing capability reported by the device.
    pub batch_signing_enabled: bool,

    /// The keys of the token in creation order.
    pub keys: Vec<KeyId>,

    #[serde(skip)]
    pub state: TokenState,
}

impl TokenRecord {
    fn new(info: &DeviceInfo) -> Self {
        TokenRecord {
            id: info.token_id.clone(),
            kind: info.kind,
            module: info.module.clone(),
            friendly_name: Some(info.label.clone()),
            label: Some(info.label.clone()),
            serial_number: info.serial_number.clone(),
            read_only: info.read_only,
            batch_signing_enabled: info.batch_signing,
            keys: Vec::new(),
            state: TokenState::Absent,
        }
    }
}


//------------ KeyRecord -----------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeyRecord {
    pub id: KeyId,
    pub token_id: TokenId,
    pub friendly_name: Option<String>,
    pub label: Option<String>,

    /// Unset until the first certificate or certificate request.
    pub usage: Option<KeyUsage>,

    #[serde(with = "base64_bytes")]
    pub public_key: Bytes,

    pub sign_mechanism: SignMechanism,
    pub certs: Vec<CertId>,
    pub cert_requests: Vec<CertRequestId>,

    #[serde(skip)]
    pub available: bool,
}


//------------ CertRecord ----------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertRecord {
    pub id: CertId,
    pub key_id: KeyId,
    pub member_id: Option<ClientId>,
    pub active: bool,
    pub status: CertStatus,
    pub hash: CertHash,

    #[serde(with = "base64_bytes")]
    pub certificate: Bytes,
}

impl CertRecord {
    pub fn new(
        key_id: KeyId,
        certificate: Bytes,
        member_id: Option<ClientId>,
        status: CertStatus,
    ) -> Self {
        CertRecord {
            id: CertId::random(),
            key_id,
            member_id,
            active: true,
            status,
            hash: CertHash::of_der(&certificate),
            certificate,
        }
    }

    pub fn info(&self) -> CertificateInfo {
        CertificateInfo {
            id: self.id.clone(),
            member_id: self.member_id.clone(),
            active: self.active,
            status: self.status,
            hash: self.hash.clone(),
            certificate: self.certificate.clone(),
        }
    }
}


//------------ CertRequestRecord ---------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertRequestRecord {
    pub id: CertRequestId,
    pub key_id: KeyId,
    pub member_id: Option<ClientId>,
    pub subject_name: String,
    pub format: CertRequestFormat,
    pub usage: KeyUsage,
}

impl CertRequestRecord {
    pub fn info(&self) -> CertRequestInfo {
        CertRequestInfo {
            id: self.id.clone(),
            member_id: self.member_id.clone(),
            subject_name: self.subject_name.clone(),
            format: self.format,
            usage: self.usage,
        }
    }
}


//------------ RegistryState -------------------------------------------------

/// All registry content.
///
/// Mutating functions either apply their change completely or return an
/// error without touching anything.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RegistryState {
    tokens: BTreeMap<TokenId, TokenRecord>,
    keys: BTreeMap<KeyId, KeyRecord>,
    certs: BTreeMap<CertId, CertRecord>,
    cert_requests: BTreeMap<CertRequestId, CertRequestRecord>,
}

/// # Lookups
impl RegistryState {
    pub fn token(&self, id: &TokenId) -> SignerResult<&TokenRecord> {
        self.tokens.get(id).ok_or_else(|| Error::TokenNotFound(id.clone()))
    }

    pub fn tokens(&self) -> impl Iterator<Item = &TokenRecord> {
        self.tokens.values()
    }

    pub fn key(&self, id: &KeyId) -> SignerResult<&KeyRecord> {
        self.keys.get(id).ok_or_else(|| Error::KeyNotFound(id.clone()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &KeyRecord> {
        self.keys.values()
    }

    /// Returns the token owning the given key.
    pub fn token_for_key(&self, id: &KeyId) -> SignerResult<&TokenRecord> {
        self.token(&self.key(id)?.token_id)
    }

    pub fn cert(&self, id: &CertId) -> SignerResult<&CertRecord> {
        self.certs.get(id).ok_or_else(|| Error::CertNotFound(id.to_string()))
    }

    pub fn certs(&self) -> impl Iterator<Item = &CertRecord> {
        self.certs.values()
    }

    pub fn cert_by_hash(&self, hash: &CertHash) -> SignerResult<&CertRecord> {
        self.certs.values().find(|cert| &cert.hash == hash).ok_or_else(|| {
            Error::CertNotFound(hash.to_string())
        })
    }

    /// Finds a certificate given either its record id or its hash.
    pub fn cert_by_id_or_hash(&self, id: &str) -> SignerResult<&CertRecord> {
        if let Some(cert) = self.certs.get(&CertId::from(id)) {
            return Ok(cert)
        }
        match id.parse::<CertHash>() {
            Ok(hash) => self.cert_by_hash(&hash),
            Err(_) => Err(Error::CertNotFound(id.to_string())),
        }
    }

    pub fn cert_request(
        &self, id: &CertRequestId
    ) -> SignerResult<&CertRequestRecord> {
        self.cert_requests.get(id).ok_or_else(|| {
            Error::CertRequestNotFound(id.clone())
        })
    }

    /// Returns the certificates of a key.
    pub fn key_certs<'a>(
        &'a self, key: &'a KeyRecord
    ) -> impl Iterator<Item = &'a CertRecord> + 'a {
        key.certs.iter().filter_map(|id| self.certs.get(id))
    }

    /// Returns the key with the given DER encoded public key.
    pub fn key_for_public_key(&self, public_key: &[u8]) -> Option<&KeyRecord> {
        self.keys.values().find(|key| key.public_key.as_ref() == public_key)
    }
}

/// # Conversion into client information
impl RegistryState {
    pub fn token_info(&self, token: &TokenRecord) -> TokenInfo {
        TokenInfo {
            id: token.id.clone(),
            kind: token.kind,
            module: token.module.clone(),
            friendly_name: token.friendly_name.clone(),
            label: token.label.clone(),
            serial_number: token.serial_number.clone(),
            state: token.state,
            read_only: token.read_only,
            batch_signing_enabled: token.batch_signing_enabled,
            keys: token.keys.iter().filter_map(|id| {
                self.keys.get(id).map(|key| self.key_info(key))
            }).collect(),
        }
    }

    pub fn key_info(&self, key: &KeyRecord) -> KeyInfo {
        KeyInfo {
            id: key.id.clone(),
            token_id: key.token_id.clone(),
            friendly_name: key.friendly_name.clone(),
            label: key.label.clone(),
            usage: key.usage,
            public_key: key.public_key.clone(),
            sign_mechanism: key.sign_mechanism,
            available: key.available,
            certs: self.key_certs(key).map(CertRecord::info).collect(),
            cert_requests: key.cert_requests.iter().filter_map(|id| {
                self.cert_requests.get(id).map(CertRequestRecord::info)
            }).collect(),
        }
    }
}

/// # Tokens
impl RegistryState {
    /// Returns the record for a discovered device if it differs from ours.
    ///
    /// The friendly name is left alone for known tokens.
    pub fn updated_token(&self, info: &DeviceInfo) -> Option<TokenRecord> {
        match self.tokens.get(&info.token_id) {
            None => Some(TokenRecord::new(info)),
            Some(token) => {
                let updated = TokenRecord {
                    module: info.module.clone(),
                    label: Some(info.label.clone()),
                    serial_number: info.serial_number.clone(),
                    read_only: info.read_only,
                    ..token.clone()
                };
                (&updated != token).then_some(updated)
            }
        }
    }

    /// Adds a discovered device or refreshes what we know about it.
    ///
    /// Returns whether anything changed.
    pub fn add_or_update_token(&mut self, info: &DeviceInfo) -> bool {
        match self.updated_token(info) {
            Some(token) => {
                self.tokens.insert(token.id.clone(), token);
                true
            }
            None => false,
        }
    }

    pub fn set_token_state(
        &mut self, id: &TokenId, state: TokenState
    ) -> SignerResult<()> {
        self.token_mut(id)?.state = state;
        Ok(())
    }

    pub fn set_token_friendly_name(
        &mut self, id: &TokenId, name: &str
    ) -> SignerResult<()> {
        self.token_mut(id)?.friendly_name = Some(name.to_string());
        Ok(())
    }

    /// Records the batch signing capability. Returns whether it changed.
    pub fn set_batch_signing(
        &mut self, id: &TokenId, enabled: bool
    ) -> SignerResult<bool> {
        let token = self.token_mut(id)?;
        if token.batch_signing_enabled == enabled {
            Ok(false)
        } else {
            token.batch_signing_enabled = enabled;
            Ok(true)
        }
    }

    fn token_mut(&mut self, id: &TokenId) -> SignerResult<&mut TokenRecord> {
        self.tokens.get_mut(id).ok_or_else(|| Error::TokenNotFound(id.clone()))
    }
}

/// # Keys
impl RegistryState {
    pub fn add_key(
        &mut self,
        token_id: &TokenId,
        key_id: KeyId,
        public_key: Bytes,
        label: Option<String>,
    ) -> SignerResult<&KeyRecord> {
        if self.keys.contains_key(&key_id) {
            return Err(Error::internal(format!("duplicate key id {key_id}")))
        }
        self.token_mut(token_id)?.keys.push(key_id.clone());
        let key = KeyRecord {
            id: key_id.clone(),
            token_id: token_id.clone(),
            friendly_name: label.clone(),
            label,
            usage: None,
            public_key,
            sign_mechanism: SignMechanism::default(),
            certs: Vec::new(),
            cert_requests: Vec::new(),
            available: true,
        };
        Ok(&*self.keys.entry(key_id).or_insert(key))
    }

    pub fn set_key_friendly_name(
        &mut self, id: &KeyId, name: &str
    ) -> SignerResult<()> {
        self.key_mut(id)?.friendly_name = Some(name.to_string());
        Ok(())
    }

    /// Fixes the usage of a key.
    ///
    /// Fails if the key already has a different usage.
    pub fn set_key_usage(
        &mut self, id: &KeyId, usage: KeyUsage
    ) -> SignerResult<()> {
        let key = self.key_mut(id)?;
        match key.usage {
            None => {
                key.usage = Some(usage);
                Ok(())
            }
            Some(current) if current == usage => Ok(()),
            Some(current) => Err(Error::KeyUsageConflict(format!(
                "key '{id}' is already used for {current}"
            ))),
        }
    }

    /// Marks which keys of a token are on its device.
    ///
    /// Returns the ids of device keys the registry does not know yet.
    pub fn set_keys_available(
        &mut self, token_id: &TokenId, on_device: &[KeyId]
    ) -> SignerResult<Vec<KeyId>> {
        let known = self.token(token_id)?.keys.clone();
        for id in &known {
            if let Some(key) = self.keys.get_mut(id) {
                key.available = on_device.contains(id);
            }
        }
        Ok(on_device.iter().filter(|id| {
            !self.keys.contains_key(id)
        }).cloned().collect())
    }

    /// Marks all keys of a token as unavailable.
    pub fn set_keys_unavailable(&mut self, token_id: &TokenId) {
        for key in self.keys.values_mut() {
            if &key.token_id == token_id {
                key.available = false;
            }
        }
    }

    /// Removes a key together with its certificates and requests.
    pub fn remove_key(&mut self, id: &KeyId) -> SignerResult<KeyRecord> {
        let key = self.keys.remove(id).ok_or_else(|| {
            Error::KeyNotFound(id.clone())
        })?;
        for cert in &key.certs {
            self.certs.remove(cert);
        }
        for req in &key.cert_requests {
            self.cert_requests.remove(req);
        }
        if let Some(token) = self.tokens.get_mut(&key.token_id) {
            token.keys.retain(|key_id| key_id != id);
        }
        Ok(key)
    }

    fn key_mut(&mut self, id: &KeyId) -> SignerResult<&mut KeyRecord> {
        self.keys.get_mut(id).ok_or_else(|| Error::KeyNotFound(id.clone()))
    }
}

/// # Certificates
impl RegistryState {
    /// Adds a certificate to its key.
    ///
    /// Fails if a certificate with the same hash exists anywhere. The new
    /// certificate is inactive if the key already has an active one and
    /// multiple active certificates are not allowed.
    pub fn add_cert(
        &mut self, mut cert: CertRecord, multiple_active: bool
    ) -> SignerResult<&CertRecord> {
        if self.certs.values().any(|existing| existing.hash == cert.hash) {
            return Err(Error::CertExists(cert.hash))
        }
        let key = self.key(&cert.key_id)?;
        if cert.active && !multiple_active
            && self.key_certs(key).any(|existing| existing.active)
        {
            cert.active = false;
        }
        let key_id = cert.key_id.clone();
        let cert_id = cert.id.clone();
        self.key_mut(&key_id)?.certs.push(cert_id.clone());
        Ok(&*self.certs.entry(cert_id).or_insert(cert))
    }

    /// Sets the active flag of a certificate.
    ///
    /// Activating deactivates the other certificates of the key unless
    /// multiple active certificates are allowed.
    pub fn set_cert_active(
        &mut self, id: &CertId, active: bool, multiple_active: bool
    ) -> SignerResult<()> {
        let key_id = self.cert(id)?.key_id.clone();
        if active && !multiple_active {
            let others = self.key(&key_id)?.certs.clone();
            for other in others {
                if let Some(cert) = self.certs.get_mut(&other) {
                    cert.active = false;
                }
            }
        }
        self.cert_mut(id)?.active = active;
        Ok(())
    }

    pub fn set_cert_status(
        &mut self, id: &CertId, status: CertStatus
    ) -> SignerResult<()> {
        self.cert_mut(id)?.status = status;
        Ok(())
    }

    pub fn remove_cert(&mut self, id: &CertId) -> SignerResult<CertRecord> {
        let cert = self.certs.remove(id).ok_or_else(|| {
            Error::CertNotFound(id.to_string())
        })?;
        if let Some(key) = self.keys.get_mut(&cert.key_id) {
            key.certs.retain(|cert_id| cert_id != id);
        }
        Ok(cert)
    }

    fn cert_mut(&mut self, id: &CertId) -> SignerResult<&mut CertRecord> {
        self.certs.get_mut(id).ok_or_else(|| {
            Error::CertNotFound(id.to_string())
        })
    }
}

/// # Certificate requests
impl RegistryState {
    /// Adds a certificate request, or returns the existing one.
    ///
    /// A key has at most one request per member and usage. Asking for
    /// another returns the existing one with the subject updated.
    pub fn add_cert_request(
        &mut self,
        key_id: &KeyId,
        member_id: Option<ClientId>,
        usage: KeyUsage,
        subject_name: &str,
        format: CertRequestFormat,
    ) -> SignerResult<&CertRequestRecord> {
        let existing = self.key(key_id)?.cert_requests.iter().find(|id| {
            self.cert_requests.get(id).is_some_and(|req| {
                req.member_id == member_id && req.usage == usage
            })
        }).cloned();

        if let Some(id) = existing {
            let req = self.cert_request_mut(&id)?;
            req.subject_name = subject_name.to_string();
            req.format = format;
            return self.cert_request(&id)
        }

        let req = CertRequestRecord {
            id: CertRequestId::random(),
            key_id: key_id.clone(),
            member_id,
            subject_name: subject_name.to_string(),
            format,
            usage,
        };
        let id = req.id.clone();
        self.key_mut(key_id)?.cert_requests.push(id.clone());
        Ok(&*self.cert_requests.entry(id).or_insert(req))
    }

    pub fn set_cert_request_format(
        &mut self, id: &CertRequestId, format: CertRequestFormat
    ) -> SignerResult<()> {
        self.cert_request_mut(id)?.format = format;
        Ok(())
    }

    pub fn remove_cert_request(
        &mut self, id: &CertRequestId
    ) -> SignerResult<CertRequestRecord> {
        let req = self.cert_requests.remove(id).ok_or_else(|| {
            Error::CertRequestNotFound(id.clone())
        })?;
        if let Some(key) = self.keys.get_mut(&req.key_id) {
            key.cert_requests.retain(|req_id| req_id != id);
        }
        Ok(req)
    }

    /// Removes the request a freshly imported certificate satisfies.
    ///
    /// This is the request of the key for the same member. Returns the id
    /// of the removed request, if any.
    pub fn consume_cert_request(
        &mut self, key_id: &KeyId, member_id: Option<&ClientId>
    ) -> SignerResult<Option<CertRequestId>> {
        let found = self.key(key_id)?.cert_requests.iter().find(|id| {
            self.cert_requests.get(id).is_some_and(|req| {
                req.member_id.as_ref() == member_id
            })
        }).cloned();
        match found {
            Some(id) => {
                self.remove_cert_request(&id)?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    fn cert_request_mut(
        &mut self, id: &CertRequestId
    ) -> SignerResult<&mut CertRequestRecord> {
        self.cert_requests.get_mut(id).ok_or_else(|| {
            Error::CertRequestNotFound(id.clone())
        })
    }
}


//------------ Tests ---------------------------------------------------------
