//! The signing service.
//!
//! Implements all operations offered to clients on top of the token
//! manager, the registry and the OCSP cache. Identifiers are resolved
//! against a registry snapshot, operations that need a device run under
//! the token's lock, and registry changes depending on a device call are
//! only made after the call succeeded.

use std::sync::Arc;
use bytes::Bytes;
use chrono::{Duration, Utc};
use log::{debug, info, trace, warn};
use openssl::pkey::PKey;
use crate::api::ids::{CertHash, CertRequestId, KeyId, TokenId};
use crate::api::member::{ClientId, SecurityServerId};
use crate::api::serde_ext::decode_base64;
use crate::api::rpc::{GenerateSelfSignedCertRequest, OcspResponseEntry, Pin};
use crate::api::token::{
    AuthKeyInfo, CertRequestFormat, CertStatus, CertificateInfo,
    GeneratedCertRequestInfo, KeyIdInfo, KeyInfo, KeyUsage,
    MemberSigningInfo, TokenInfo, TokenInfoAndKeyId,
};
use crate::commons::{SignerEmptyResult, SignerResult};
use crate::commons::error::Error;
use crate::constants::SIGNED_CERT_VALIDITY_DAYS;
use crate::device::DeviceError;
use crate::device::mechanism::{SignAlgorithm, SignMechanism};
use crate::device::x509::{self, DistinguishedName};
use crate::manager::TokenManager;
use crate::ocsp::cache::OcspCache;
use crate::registry::TokenRegistry;
use crate::registry::model::{CertRecord, KeyRecord, RegistryState, TokenRecord};


/// The algorithm for certificate requests and self-signed certificates.
const REQUEST_ALGORITHM: SignAlgorithm = SignAlgorithm::Sha256WithRsa;


//------------ SigningService ------------------------------------------------

pub struct SigningService {
    manager: Arc<TokenManager>,
    ocsp: Arc<OcspCache>,

    /// Whether a key may have more than one active certificate.
    multiple_active_certs: bool,
}

impl SigningService {
    pub fn new(
        manager: Arc<TokenManager>,
        ocsp: Arc<OcspCache>,
        multiple_active_certs: bool,
    ) -> Self {
        SigningService { manager, ocsp, multiple_active_certs }
    }

    pub fn manager(&self) -> &Arc<TokenManager> {
        &self.manager
    }

    pub fn ocsp(&self) -> &Arc<OcspCache> {
        &self.ocsp
    }

    fn registry(&self) -> &TokenRegistry {
        self.manager.registry()
    }
}

/// # Tokens
impl SigningService {
    pub fn list_tokens(&self) -> SignerResult<Vec<TokenInfo>> {
        let snapshot = self.registry().snapshot()?;
        Ok(snapshot.tokens().map(|token| snapshot.token_info(token)).collect())
    }

    pub fn get_token(&self, token_id: &TokenId) -> SignerResult<TokenInfo> {
        let snapshot = self.registry().snapshot()?;
        Ok(snapshot.token_info(snapshot.token(token_id)?))
    }

    pub fn get_token_for_key(&self, key_id: &KeyId) -> SignerResult<TokenInfo> {
        let snapshot = self.registry().snapshot()?;
        Ok(snapshot.token_info(snapshot.token_for_key(key_id)?))
    }

    pub fn get_token_for_cert_hash(
        &self, hash: &CertHash
    ) -> SignerResult<TokenInfo> {
        let snapshot = self.registry().snapshot()?;
        let cert = snapshot.cert_by_hash(hash)?;
        Ok(snapshot.token_info(snapshot.token_for_key(&cert.key_id)?))
    }

    pub fn get_token_for_cert_request(
        &self, id: &CertRequestId
    ) -> SignerResult<TokenInfo> {
        let snapshot = self.registry().snapshot()?;
        let req = snapshot.cert_request(id)?;
        Ok(snapshot.token_info(snapshot.token_for_key(&req.key_id)?))
    }

    pub fn activate_token(
        &self, token_id: &TokenId, pin: &Pin
    ) -> SignerEmptyResult {
        if pin.is_empty() {
            return Err(Error::invalid_request("empty PIN"))
        }
        self.manager.activate(token_id, pin)
    }

    pub fn deactivate_token(&self, token_id: &TokenId) -> SignerEmptyResult {
        self.manager.deactivate(token_id)
    }

    pub fn set_token_friendly_name(
        &self, token_id: &TokenId, name: &str
    ) -> SignerEmptyResult {
        self.registry().update(|state| {
            state.set_token_friendly_name(token_id, name)
        })?;
        info!("Friendly name of token '{token_id}' set to '{name}'");
        Ok(())
    }

    pub fn init_software_token(&self, pin: &Pin) -> SignerEmptyResult {
        if pin.is_empty() {
            return Err(Error::invalid_request("empty PIN"))
        }
        self.manager.init_software_token(pin)
    }

    pub fn update_software_token_pin(
        &self, token_id: &TokenId, old_pin: &Pin, new_pin: &Pin
    ) -> SignerEmptyResult {
        if new_pin.is_empty() {
            return Err(Error::invalid_request("empty PIN"))
        }
        self.manager.change_software_token_pin(token_id, old_pin, new_pin)
    }

    /// Returns whether the token holding the key can sign in batches.
    pub fn is_batch_signing_enabled(&self, key_id: &KeyId) -> SignerResult<bool> {
        let token_id = self.registry().snapshot()?.key(key_id)?.token_id.clone();
        self.manager.batch_signing_enabled(&token_id)
    }

    pub fn is_hsm_operational(&self) -> SignerResult<bool> {
        self.manager.is_hsm_operational()
    }
}

/// # Keys
impl SigningService {
    /// Creates a new key pair on an active token.
    pub fn generate_key(
        &self, token_id: &TokenId, label: Option<&str>
    ) -> SignerResult<KeyInfo> {
        Self::check_writable(self.registry().snapshot()?.token(token_id)?)?;
        let label = label.map(str::trim).filter(|label| !label.is_empty());
        self.manager.with_active_device(token_id, |device| {
            let generated = device.generate_key_pair(label.unwrap_or(""))?;
            let res = self.registry().update(|state| {
                state.add_key(
                    token_id,
                    generated.id.clone(),
                    generated.public_key.clone(),
                    label.map(String::from),
                )?;
                Ok(state.key_info(state.key(&generated.id)?))
            });
            match res {
                Ok(key) => {
                    info!(
                        "Generated key '{}' on token '{token_id}'", key.id
                    );
                    Ok(key)
                }
                Err(err) => {
                    if let Err(del) = device.delete_key(&generated.id) {
                        warn!(
                            "Cannot remove unregistered key '{}' from \
                             token '{token_id}': {del}",
                            generated.id
                        );
                    }
                    Err(err)
                }
            }
        })
    }

    pub fn set_key_friendly_name(
        &self, key_id: &KeyId, name: &str
    ) -> SignerEmptyResult {
        self.registry().update(|state| {
            state.set_key_friendly_name(key_id, name)
        })?;
        info!("Friendly name of key '{key_id}' set to '{name}'");
        Ok(())
    }

    /// Removes a key with its certificates and requests.
    ///
    /// With `from_device` the key is deleted from its device first and the
    /// registry is only changed if that worked.
    pub fn delete_key(&self, key_id: &KeyId, from_device: bool) -> SignerEmptyResult {
        let snapshot = self.registry().snapshot()?;
        let key = snapshot.key(key_id)?;
        if from_device {
            Self::check_writable(snapshot.token(&key.token_id)?)?;
            self.manager.with_active_device(&key.token_id, |device| {
                match device.delete_key(key_id) {
                    Ok(()) => { }
                    Err(DeviceError::KeyNotFound(_)) => {
                        warn!("Key '{key_id}' was already gone from its device");
                    }
                    Err(err) => return Err(err.into()),
                }
                self.remove_key(key_id)
            })?;
        }
        else {
            self.remove_key(key_id)?;
        }
        info!(
            "Deleted key '{key_id}'{}",
            if from_device { " from registry and device" } else { "" }
        );
        Ok(())
    }

    fn remove_key(&self, key_id: &KeyId) -> SignerEmptyResult {
        self.registry().update(|state| state.remove_key(key_id).map(|_| ()))
    }

    pub fn get_sign_mechanism(
        &self, key_id: &KeyId
    ) -> SignerResult<SignMechanism> {
        Ok(self.registry().snapshot()?.key(key_id)?.sign_mechanism)
    }

    /// Signs a digest with a key.
    ///
    /// The batch signing capability of the device is re-read first, its
    /// answer replaces what the registry remembers.
    pub fn sign(
        &self, key_id: &KeyId, algorithm: SignAlgorithm, digest: &[u8]
    ) -> SignerResult<Bytes> {
        let token_id = self.registry().snapshot()?.key(key_id)?.token_id.clone();
        self.manager.with_active_device(&token_id, |device| {
            if !self.registry().snapshot()?.key(key_id)?.available {
                return Err(Error::KeyNotAvailable(key_id.clone()))
            }
            let batch = device.supports_batch_signing()?;
            self.manager.update_batch_signing(&token_id, batch)?;
            let signature = device.sign(key_id, algorithm, digest)?;
            trace!("Signed {} byte digest with key '{key_id}'", digest.len());
            Ok(signature)
        })
    }

    /// Issues a certificate for an external public key.
    ///
    /// Returns the new certificate followed by the issuing certificate.
    pub fn sign_certificate(
        &self,
        key_id: &KeyId,
        algorithm: SignAlgorithm,
        subject_name: &str,
        public_key: &[u8],
    ) -> SignerResult<Vec<Bytes>> {
        let subject = Self::parse_subject(subject_name)?;
        PKey::public_key_from_der(public_key).map_err(|err| {
            Error::invalid_request(format!("invalid public key: {err}"))
        })?;
        let snapshot = self.registry().snapshot()?;
        let key = snapshot.key(key_id)?;
        let issuer = Self::issuer_cert(&snapshot, key)?;
        let now = Utc::now();
        let cert = self.manager.with_active_device(&key.token_id, |device| {
            Ok(device.sign_certificate(
                key_id,
                algorithm,
                &issuer,
                &subject,
                public_key,
                now,
                now + Duration::days(SIGNED_CERT_VALIDITY_DAYS),
            )?)
        })?;
        info!("Key '{key_id}' issued a certificate for '{subject}'");
        Ok(vec![cert, issuer])
    }

    /// Returns the certificate of a key to use as issuer.
    ///
    /// An active certificate is preferred.
    fn issuer_cert(
        snapshot: &RegistryState, key: &KeyRecord
    ) -> SignerResult<Bytes> {
        snapshot.key_certs(key)
            .find(|cert| cert.active)
            .or_else(|| snapshot.key_certs(key).next())
            .map(|cert| cert.certificate.clone())
            .ok_or_else(|| Error::CertNotFound(
                format!("no certificate for key '{}'", key.id)
            ))
    }

    fn check_writable(token: &TokenRecord) -> SignerEmptyResult {
        if token.read_only {
            Err(Error::unsupported(format!(
                "token '{}' is read-only", token.id
            )))
        }
        else {
            Ok(())
        }
    }
}

/// # Certificates
impl SigningService {
    /// Creates a certificate for a key signed by the key itself.
    ///
    /// The certificate is imported with status `saved`.
    pub fn generate_self_signed_cert(
        &self, req: &GenerateSelfSignedCertRequest
    ) -> SignerResult<Bytes> {
        if req.not_after <= req.not_before {
            return Err(Error::invalid_request(
                "certificate must not expire before it becomes valid"
            ))
        }
        if req.common_name.trim().is_empty() {
            return Err(Error::invalid_request("empty common name"))
        }
        let subject = DistinguishedName::common_name(req.common_name.trim());
        let snapshot = self.registry().snapshot()?;
        let key = snapshot.key(&req.key_id)?;
        let token = snapshot.token(&key.token_id)?;
        Self::check_usage(token, key, req.key_usage)?;

        let cert = self.manager.with_active_device(&token.id, |device| {
            let cert = device.self_signed_certificate(
                &key.id,
                &key.public_key,
                REQUEST_ALGORITHM,
                &subject,
                req.key_usage,
                req.not_before,
                req.not_after,
            )?;
            self.registry().update(|state| {
                state.set_key_usage(&key.id, req.key_usage)?;
                state.add_cert(
                    CertRecord::new(
                        key.id.clone(),
                        cert.clone(),
                        req.member_id.clone(),
                        CertStatus::Saved,
                    ),
                    self.multiple_active_certs,
                ).map(|_| ())
            })?;
            Ok(cert)
        })?;
        info!(
            "Created self-signed certificate '{}' for key '{}'",
            CertHash::of_der(&cert), key.id
        );
        Ok(cert)
    }

    /// Adds a certificate for one of our keys.
    ///
    /// The key is found by the certificate's public key. A pending
    /// certificate request of the key for the same member is removed.
    /// Returns the id of the key.
    pub fn import_cert(
        &self,
        cert: &Bytes,
        initial_status: CertStatus,
        member_id: Option<&ClientId>,
    ) -> SignerResult<KeyId> {
        let public_key = x509::certificate_public_key(cert).map_err(|err| {
            Error::invalid_request(format!("cannot parse certificate: {err}"))
        })?;
        let hash = CertHash::of_der(cert);
        let (key_id, consumed) = self.registry().update(|state| {
            let key = state.key_for_public_key(&public_key).ok_or_else(|| {
                Error::CertKeyMismatch(hash.clone())
            })?;
            let key_id = key.id.clone();
            let usage = Self::import_usage(state, key, member_id);
            Self::check_usage(state.token(&key.token_id)?, key, usage)?;
            state.set_key_usage(&key_id, usage)?;
            state.add_cert(
                CertRecord::new(
                    key_id.clone(), cert.clone(), member_id.cloned(),
                    initial_status,
                ),
                self.multiple_active_certs,
            )?;
            let consumed = state.consume_cert_request(&key_id, member_id)?;
            Ok((key_id, consumed))
        })?;
        info!("Imported certificate '{hash}' for key '{key_id}'");
        if let Some(req) = consumed {
            debug!("Certificate '{hash}' satisfied certificate request '{req}'");
        }
        Ok(key_id)
    }

    /// Decides what an imported certificate is used for.
    ///
    /// A pending request for the member decides, then the key's usage.
    /// Otherwise certificates for members sign and those without one
    /// authenticate.
    fn import_usage(
        state: &RegistryState, key: &KeyRecord, member_id: Option<&ClientId>
    ) -> KeyUsage {
        let requested = key.cert_requests.iter().filter_map(|id| {
            state.cert_request(id).ok()
        }).find(|req| req.member_id.as_ref() == member_id);
        match (requested, key.usage) {
            (Some(req), _) => req.usage,
            (None, Some(usage)) => usage,
            (None, None) if member_id.is_some() => KeyUsage::Signing,
            (None, None) => KeyUsage::Authentication,
        }
    }

    /// Checks that a key may be used for the given purpose.
    fn check_usage(
        token: &TokenRecord, key: &KeyRecord, usage: KeyUsage
    ) -> SignerEmptyResult {
        if usage == KeyUsage::Authentication && !token.kind.is_software() {
            return Err(Error::unsupported(
                "authentication keys must live on the software token"
            ))
        }
        match key.usage {
            Some(current) if current != usage => {
                Err(Error::KeyUsageConflict(format!(
                    "key '{}' is already used for {current}", key.id
                )))
            }
            _ => Ok(())
        }
    }

    pub fn activate_cert(&self, id_or_hash: &str) -> SignerEmptyResult {
        self.set_cert_active(id_or_hash, true)
    }

    pub fn deactivate_cert(&self, id_or_hash: &str) -> SignerEmptyResult {
        self.set_cert_active(id_or_hash, false)
    }

    fn set_cert_active(&self, id_or_hash: &str, active: bool) -> SignerEmptyResult {
        let id = self.registry().update(|state| {
            let id = state.cert_by_id_or_hash(id_or_hash)?.id.clone();
            state.set_cert_active(&id, active, self.multiple_active_certs)?;
            Ok(id)
        })?;
        info!(
            "Certificate '{id}' {}",
            if active { "activated" } else { "deactivated" }
        );
        Ok(())
    }

    pub fn set_cert_status(
        &self, id_or_hash: &str, status: CertStatus
    ) -> SignerEmptyResult {
        let id = self.registry().update(|state| {
            let id = state.cert_by_id_or_hash(id_or_hash)?.id.clone();
            state.set_cert_status(&id, status)?;
            Ok(id)
        })?;
        info!("Status of certificate '{id}' set to {status}");
        Ok(())
    }

    pub fn delete_cert(&self, id_or_hash: &str) -> SignerEmptyResult {
        let cert = self.registry().update(|state| {
            let id = state.cert_by_id_or_hash(id_or_hash)?.id.clone();
            state.remove_cert(&id)
        })?;
        info!("Deleted certificate '{}' of key '{}'", cert.id, cert.key_id);
        Ok(())
    }

    /// Creates a PKCS#10 request for a key.
    ///
    /// Asking again for the same member and usage replaces the subject of
    /// the existing request and keeps its id.
    pub fn generate_cert_request(
        &self,
        key_id: &KeyId,
        member_id: Option<&ClientId>,
        usage: KeyUsage,
        subject_name: &str,
        format: CertRequestFormat,
    ) -> SignerResult<GeneratedCertRequestInfo> {
        let subject = Self::parse_subject(subject_name)?;
        if usage == KeyUsage::Signing && member_id.is_none() {
            return Err(Error::invalid_request(
                "signing certificate requests need a member"
            ))
        }
        let snapshot = self.registry().snapshot()?;
        let key = snapshot.key(key_id)?;
        let token = snapshot.token(&key.token_id)?;
        Self::check_usage(token, key, usage)?;

        let info = self.manager.with_active_device(&token.id, |device| {
            let cert_request = device.cert_request(
                key_id, &key.public_key, REQUEST_ALGORITHM, &subject, format
            )?;
            let cert_request_id = self.registry().update(|state| {
                state.set_key_usage(key_id, usage)?;
                Ok(state.add_cert_request(
                    key_id,
                    member_id.cloned(),
                    usage,
                    &subject.to_string(),
                    format,
                )?.id.clone())
            })?;
            Ok(GeneratedCertRequestInfo {
                cert_request_id,
                key_id: key_id.clone(),
                member_id: member_id.cloned(),
                usage,
                format,
                cert_request,
            })
        })?;
        info!(
            "Generated certificate request '{}' for key '{key_id}'",
            info.cert_request_id
        );
        Ok(info)
    }

    /// Creates the request again, possibly in a different format.
    pub fn regenerate_cert_request(
        &self, id: &CertRequestId, format: CertRequestFormat
    ) -> SignerResult<GeneratedCertRequestInfo> {
        let snapshot = self.registry().snapshot()?;
        let req = snapshot.cert_request(id)?;
        let key = snapshot.key(&req.key_id)?;
        let subject = DistinguishedName::parse(&req.subject_name).map_err(|err| {
            Error::internal(format!("stored subject of request '{id}': {err}"))
        })?;
        let cert_request = self.manager.with_active_device(
            &key.token_id, |device| {
                let der = device.cert_request(
                    &key.id, &key.public_key, REQUEST_ALGORITHM, &subject,
                    format,
                )?;
                self.registry().update(|state| {
                    state.set_cert_request_format(id, format)
                })?;
                Ok(der)
            }
        )?;
        debug!("Regenerated certificate request '{id}' as {format}");
        Ok(GeneratedCertRequestInfo {
            cert_request_id: req.id.clone(),
            key_id: key.id.clone(),
            member_id: req.member_id.clone(),
            usage: req.usage,
            format,
            cert_request,
        })
    }

    pub fn delete_cert_request(&self, id: &CertRequestId) -> SignerEmptyResult {
        self.registry().update(|state| {
            state.remove_cert_request(id).map(|_| ())
        })?;
        info!("Deleted certificate request '{id}'");
        Ok(())
    }

    fn parse_subject(subject_name: &str) -> SignerResult<DistinguishedName> {
        DistinguishedName::parse(subject_name).map_err(|err| {
            Error::invalid_request(format!("invalid subject name: {err}"))
        })
    }
}

/// # Lookups by certificate
impl SigningService {
    pub fn get_cert_for_hash(
        &self, hash: &CertHash
    ) -> SignerResult<CertificateInfo> {
        Ok(self.registry().snapshot()?.cert_by_hash(hash)?.info())
    }

    pub fn get_key_id_for_cert_hash(
        &self, hash: &CertHash
    ) -> SignerResult<KeyIdInfo> {
        let snapshot = self.registry().snapshot()?;
        let key = snapshot.key(&snapshot.cert_by_hash(hash)?.key_id)?;
        Ok(KeyIdInfo {
            key_id: key.id.clone(),
            sign_mechanism: key.sign_mechanism,
        })
    }

    pub fn get_token_and_key_id_for_cert_hash(
        &self, hash: &CertHash
    ) -> SignerResult<TokenInfoAndKeyId> {
        let snapshot = self.registry().snapshot()?;
        let key_id = &snapshot.cert_by_hash(hash)?.key_id;
        Ok(TokenInfoAndKeyId {
            token: snapshot.token_info(snapshot.token_for_key(key_id)?),
            key_id: key_id.clone(),
        })
    }

    pub fn get_token_and_key_id_for_cert_request(
        &self, id: &CertRequestId
    ) -> SignerResult<TokenInfoAndKeyId> {
        let snapshot = self.registry().snapshot()?;
        let key_id = &snapshot.cert_request(id)?.key_id;
        Ok(TokenInfoAndKeyId {
            token: snapshot.token_info(snapshot.token_for_key(key_id)?),
            key_id: key_id.clone(),
        })
    }
}

/// # Members and security servers
impl SigningService {
    /// Returns all certificates issued to a member.
    pub fn get_member_certs(
        &self, member_id: &ClientId
    ) -> SignerResult<Vec<CertificateInfo>> {
        Ok(self.registry().snapshot()?.certs().filter(|cert| {
            cert.member_id.as_ref() == Some(member_id)
        }).map(CertRecord::info).collect())
    }

    /// Returns the key and certificate a client signs messages with.
    ///
    /// This is an active, registered signing certificate of the client's
    /// member on an available key of an active token.
    pub fn get_member_signing_info(
        &self, client_id: &ClientId
    ) -> SignerResult<MemberSigningInfo> {
        let snapshot = self.registry().snapshot()?;
        let found = Self::usable_certs(&snapshot, KeyUsage::Signing).find(
            |(_, cert)| {
                cert.member_id.as_ref().is_some_and(|member| {
                    member.same_member(client_id)
                })
            }
        );
        match found {
            Some((key, cert)) => Ok(MemberSigningInfo {
                key_id: key.id.clone(),
                cert: cert.info(),
                sign_mechanism: key.sign_mechanism,
            }),
            None => Err(Error::CertNotFound(format!(
                "no usable signing certificate for member '{client_id}'"
            ))),
        }
    }

    /// Returns the authentication key of a security server.
    ///
    /// The certificate is matched by its common name against the server
    /// code. Failing that, any authentication certificate of the owner
    /// does.
    pub fn get_auth_key(
        &self, server: &SecurityServerId
    ) -> SignerResult<AuthKeyInfo> {
        let snapshot = self.registry().snapshot()?;
        let candidates: Vec<_> = Self::usable_certs(
            &snapshot, KeyUsage::Authentication
        ).collect();
        let by_name = candidates.iter().find(|(_, cert)| {
            matches!(
                x509::certificate_common_name(&cert.certificate),
                Ok(Some(cn)) if cn == server.server_code
            )
        });
        let by_owner = || candidates.iter().find(|(_, cert)| {
            cert.member_id.as_ref().is_some_and(|member| {
                member.same_member(&server.owner)
            })
        });
        match by_name.or_else(by_owner) {
            Some((key, cert)) => Ok(AuthKeyInfo {
                token_id: key.token_id.clone(),
                key_id: key.id.clone(),
                sign_mechanism: key.sign_mechanism,
                cert: cert.info(),
            }),
            None => Err(Error::CertNotFound(format!(
                "no usable authentication certificate for {server}"
            ))),
        }
    }

    /// Returns the active, registered certificates of available keys with
    /// the given usage on active tokens.
    fn usable_certs(
        snapshot: &RegistryState, usage: KeyUsage
    ) -> impl Iterator<Item = (&KeyRecord, &CertRecord)> {
        snapshot.tokens()
            .filter(|token| token.state.is_active())
            .flat_map(|token| token.keys.iter())
            .filter_map(move |key_id| snapshot.key(key_id).ok())
            .filter(move |key| key.available && key.usage == Some(usage))
            .flat_map(move |key| {
                snapshot.key_certs(key).map(move |cert| (key, cert))
            })
            .filter(|(_, cert)| {
                cert.active && cert.status == CertStatus::Registered
            })
    }
}

/// # OCSP responses
impl SigningService {
    pub fn get_ocsp_responses(
        &self, hashes: &[CertHash]
    ) -> SignerResult<Vec<OcspResponseEntry>> {
        self.ocsp.responses(hashes)
    }

    /// Stores base64 encoded responses for the given certificates.
    pub fn set_ocsp_responses(
        &self, hashes: &[CertHash], responses: &[String]
    ) -> SignerEmptyResult {
        if hashes.len() != responses.len() {
            return Err(Error::invalid_request(format!(
                "{} certificate hashes but {} responses",
                hashes.len(), responses.len()
            )))
        }
        let decoded = responses.iter().map(|response| {
            decode_base64(response).map_err(|err| {
                Error::invalid_request(format!("invalid OCSP response: {err}"))
            })
        }).collect::<SignerResult<Vec<_>>>()?;
        for (hash, response) in hashes.iter().zip(decoded) {
            self.ocsp.insert_supplied(hash.clone(), response)?;
        }
        debug!("Stored {} OCSP responses from client", hashes.len());
        Ok(())
    }
}


//------------ Tests ---------------------------------------------------------
