//! The software token: keys in encrypted files on disk.
//!
//! Each key is stored as a PKCS#8 PEM file encrypted under the token PIN.
//! The PIN itself is never stored, only a PBKDF2 verifier used to reject
//! wrong PINs before trying to decrypt any key.
//!
//! Changing the PIN rewrites every key file and the verifier. The new files
//! are staged next to the old ones first. Writing a marker listing them
//! commits the change, after which they are renamed into place. If that is
//! interrupted, the next open or login completes it. Staged files without a
//! marker are discarded.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use bytes::Bytes;
use log::{debug, info, trace, warn};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::{Padding, Rsa};
use openssl::symm::Cipher;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use crate::api::ids::{KeyId, TokenId};
use crate::api::rpc::Pin;
use crate::api::token::TokenKind;
use crate::commons::error::IoError;
use crate::commons::file;
use crate::constants::{
    KEYS_DIR, PIN_VERIFIER_ITERATIONS, RSA_KEY_BITS, SOFTWARE_MODULE_NAME,
    SOFTWARE_TOKEN_ID, SOFTWARE_TOKEN_LABEL, SOFT_TOKEN_DIR,
};
use super::{DeviceInfo, GeneratedKey};
use super::error::DeviceError;
use super::mechanism::SignMechanism;

const PIN_FILE: &str = "pin.json";
const PIN_CHANGE_FILE: &str = "pin-change.json";
const KEY_FILE_EXT: &str = "pem";
const STAGED_EXT: &str = "new";
const SALT_LEN: usize = 16;
const VERIFIER_LEN: usize = 32;


//------------ SoftTokenModule -----------------------------------------------

/// The module offering the single software token.
#[derive(Clone, Debug)]
pub struct SoftTokenModule {
    dir: PathBuf,
}

impl SoftTokenModule {
    pub fn new(data_dir: &Path) -> Self {
        SoftTokenModule { dir: data_dir.join(SOFT_TOKEN_DIR) }
    }

    pub fn name(&self) -> &str {
        SOFTWARE_MODULE_NAME
    }

    /// The software token is always present, initialised or not.
    pub fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        Ok(vec![DeviceInfo {
            token_id: TokenId::from(SOFTWARE_TOKEN_ID),
            kind: TokenKind::Software,
            module: SOFTWARE_MODULE_NAME.to_string(),
            label: SOFTWARE_TOKEN_LABEL.to_string(),
            serial_number: None,
            read_only: false,
            batch_signing: true,
            initialized: self.is_initialized(),
        }])
    }

    pub fn is_initialized(&self) -> bool {
        self.pin_path().is_file()
    }

    pub fn open(&self) -> Result<SoftToken, DeviceError> {
        file::create_dir_all(&self.keys_dir())?;
        recover_pin_change(&self.dir)?;
        Ok(SoftToken {
            dir: self.dir.clone(),
            pin: None,
            keys: Mutex::new(HashMap::new()),
            info: format!(
                "OpenSSL soft token [version: {}, keys dir: {}]",
                openssl::version::version(),
                self.keys_dir().display()
            ),
        })
    }

    /// Sets the PIN of a fresh software token.
    pub fn initialize(&self, pin: &Pin) -> Result<(), DeviceError> {
        if self.is_initialized() {
            return Err(DeviceError::AlreadyInitialized)
        }
        file::create_dir_all(&self.keys_dir())?;
        file::save_json(&PinVerifier::create(pin.expose())?, &self.pin_path())?;
        info!("Initialized software token in {}", self.dir.display());
        Ok(())
    }

    fn pin_path(&self) -> PathBuf {
        self.dir.join(PIN_FILE)
    }

    fn keys_dir(&self) -> PathBuf {
        self.dir.join(KEYS_DIR)
    }
}


//------------ PinVerifier ---------------------------------------------------

/// A PBKDF2-HMAC-SHA256 hash of the PIN.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct PinVerifier {
    salt: String,
    iterations: usize,
    hash: String,
}

impl PinVerifier {
    fn create(pin: &str) -> Result<Self, DeviceError> {
        let mut salt = [0u8; SALT_LEN];
        openssl::rand::rand_bytes(&mut salt)?;
        let hash = Self::derive(pin, &salt, PIN_VERIFIER_ITERATIONS)?;
        Ok(PinVerifier {
            salt: hex::encode(salt),
            iterations: PIN_VERIFIER_ITERATIONS,
            hash: hex::encode(hash),
        })
    }

    fn derive(
        pin: &str, salt: &[u8], iterations: usize
    ) -> Result<[u8; VERIFIER_LEN], DeviceError> {
        let mut res = [0u8; VERIFIER_LEN];
        openssl::pkcs5::pbkdf2_hmac(
            pin.as_bytes(), salt, iterations, MessageDigest::sha256(), &mut res
        )?;
        Ok(res)
    }

    fn verify(&self, pin: &str) -> Result<(), DeviceError> {
        let salt = hex::decode(&self.salt).map_err(DeviceError::other)?;
        let expected = hex::decode(&self.hash).map_err(DeviceError::other)?;
        let actual = Self::derive(pin, &salt, self.iterations)?;
        if expected.len() == actual.len()
            && openssl::memcmp::eq(&expected, &actual)
        {
            Ok(())
        }
        else {
            Err(DeviceError::PinIncorrect)
        }
    }
}


//------------ PinChange -----------------------------------------------------

/// The marker committing a PIN change.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct PinChange {
    /// The files to replace by their staged version, relative to the
    /// token directory.
    files: Vec<PathBuf>,
}

fn staged_path(path: &Path) -> PathBuf {
    let mut staged = path.as_os_str().to_owned();
    staged.push(".");
    staged.push(STAGED_EXT);
    PathBuf::from(staged)
}

/// Completes a committed PIN change or discards an uncommitted one.
fn recover_pin_change(dir: &Path) -> Result<(), DeviceError> {
    let marker = dir.join(PIN_CHANGE_FILE);
    if !marker.is_file() {
        discard_staged(dir);
        return Ok(())
    }
    let change: PinChange = file::load_json(&marker)?;
    for name in &change.files {
        let target = dir.join(name);
        let staged = staged_path(&target);
        if staged.is_file() {
            file::rename(&staged, &target)?;
        }
    }
    file::delete_file(&marker)?;
    info!("Completed software token PIN change");
    Ok(())
}

/// Removes staged files left by a failed PIN change.
fn discard_staged(dir: &Path) {
    let mut staged = vec![staged_path(&dir.join(PIN_FILE))];
    if let Ok(entries) = fs::read_dir(dir.join(KEYS_DIR)) {
        staged.extend(entries.filter_map(|entry| {
            entry.ok().map(|entry| entry.path())
        }).filter(|path| {
            path.extension().is_some_and(|ext| ext == STAGED_EXT)
        }));
    }
    for path in staged.into_iter().filter(|path| path.is_file()) {
        match file::delete_file(&path) {
            Ok(()) => debug!("Discarded staged file {}", path.display()),
            Err(err) => warn!("{err}"),
        }
    }
}


//------------ SoftToken -----------------------------------------------------

/// An opened software token.
///
/// While logged in the token keeps the PIN in memory to decrypt keys and
/// keeps keys it has decrypted.
#[derive(Debug)]
pub struct SoftToken {
    dir: PathBuf,
    pin: Option<SecretString>,
    keys: Mutex<HashMap<KeyId, PKey<Private>>>,
    info: String,
}

impl SoftToken {
    pub fn info(&self) -> &str {
        &self.info
    }

    pub fn login(&mut self, pin: &Pin) -> Result<(), DeviceError> {
        recover_pin_change(&self.dir)?;
        self.verifier()?.verify(pin.expose())?;
        self.key_cache()?.clear();
        self.pin = Some(SecretString::from(pin.expose().to_string()));
        debug!("Logged in to software token");
        Ok(())
    }

    pub fn logout(&mut self) -> Result<(), DeviceError> {
        self.pin = None;
        self.key_cache()?.clear();
        Ok(())
    }

    pub fn is_logged_in(&self) -> bool {
        self.pin.is_some()
    }

    pub fn generate_key_pair(
        &mut self, label: &str
    ) -> Result<GeneratedKey, DeviceError> {
        let pin = self.pin()?;
        let pkey = PKey::from_rsa(Rsa::generate(RSA_KEY_BITS)?)?;
        let key_id = KeyId::random();
        let pem = pkey.private_key_to_pem_pkcs8_passphrase(
            Cipher::aes_256_cbc(), pin.expose_secret().as_bytes()
        )?;
        file::save(&pem, &self.key_path(&key_id))?;
        debug!("Generated software key '{key_id}' with label '{label}'");
        let public_key = Bytes::from(pkey.public_key_to_der()?);
        self.key_cache()?.insert(key_id.clone(), pkey);
        Ok(GeneratedKey { id: key_id, public_key })
    }

    /// Signs a DER encoded DigestInfo with PKCS#1 v1.5 padding.
    pub fn sign_digest_info(
        &self, key: &KeyId, digest_info: &[u8]
    ) -> Result<Bytes, DeviceError> {
        let rsa = self.load_key(key)?.rsa()?;
        let mut signature = vec![0; rsa.size() as usize];
        let len = rsa.private_encrypt(
            digest_info, &mut signature, Padding::PKCS1
        ).map_err(|err| DeviceError::Rejected(err.to_string()))?;
        signature.truncate(len);
        trace!("Signed with software key '{key}'");
        Ok(Bytes::from(signature))
    }

    pub fn delete_key(&mut self, key: &KeyId) -> Result<(), DeviceError> {
        self.pin()?;
        let path = self.key_path(key);
        if !path.is_file() {
            return Err(DeviceError::KeyNotFound(key.clone()))
        }
        file::delete_file(&path)?;
        self.key_cache()?.remove(key);
        info!("Deleted software key '{key}'");
        Ok(())
    }

    pub fn list_mechanisms(&self) -> Vec<SignMechanism> {
        vec![SignMechanism::RsaPkcs]
    }

    pub fn list_keys(&self) -> Result<Vec<KeyId>, DeviceError> {
        let dir = self.dir.join(KEYS_DIR);
        let entries = fs::read_dir(&dir).map_err(|e| {
            IoError::new(
                format!("could not read keys dir '{}'", dir.display()), e
            )
        })?;
        let mut res = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| {
                IoError::new("could not read keys dir entry", e)
            })?.path();
            if path.extension().is_some_and(|ext| ext == KEY_FILE_EXT) {
                if let Some(stem) = path.file_stem() {
                    res.push(KeyId::new(stem.to_string_lossy()));
                }
            }
        }
        res.sort();
        Ok(res)
    }

    pub fn public_key(&self, key: &KeyId) -> Result<Bytes, DeviceError> {
        Ok(Bytes::from(self.load_key(key)?.public_key_to_der()?))
    }

    /// Changes the PIN and re-encrypts all keys under the new PIN.
    ///
    /// Either all files are replaced or none. All keys are decrypted before
    /// anything is written, so a wrong old PIN or a broken key file leaves
    /// the token untouched.
    pub fn change_pin(
        &mut self, old_pin: &Pin, new_pin: &Pin
    ) -> Result<(), DeviceError> {
        self.prepare_pin_change(old_pin, new_pin)?;
        recover_pin_change(&self.dir)?;
        if self.pin.is_some() {
            self.pin = Some(SecretString::from(new_pin.expose().to_string()));
        }
        info!("Changed software token PIN");
        Ok(())
    }

    /// Stages all files for a PIN change and commits it.
    ///
    /// After this returns successfully, the change is completed by
    /// [`recover_pin_change`] even if the process dies.
    fn prepare_pin_change(
        &self, old_pin: &Pin, new_pin: &Pin
    ) -> Result<(), DeviceError> {
        recover_pin_change(&self.dir)?;
        self.verifier()?.verify(old_pin.expose())?;

        let mut keys = Vec::new();
        for key_id in self.list_keys()? {
            let pkey = self.decrypt_key(&key_id, old_pin.expose())?;
            keys.push((key_id, pkey));
        }
        let res = self.stage_pin_change(&keys, new_pin).and_then(|change| {
            file::save_json(&change, &self.dir.join(PIN_CHANGE_FILE))
                .map_err(DeviceError::from)
        });
        if res.is_err() {
            discard_staged(&self.dir);
        }
        res
    }

    fn stage_pin_change(
        &self, keys: &[(KeyId, PKey<Private>)], new_pin: &Pin
    ) -> Result<PinChange, DeviceError> {
        let mut change = PinChange::default();
        for (key_id, pkey) in keys {
            let pem = pkey.private_key_to_pem_pkcs8_passphrase(
                Cipher::aes_256_cbc(), new_pin.expose().as_bytes()
            )?;
            file::save(&pem, &staged_path(&self.key_path(key_id)))?;
            change.files.push(
                Path::new(KEYS_DIR).join(Self::key_file_name(key_id))
            );
        }
        file::save_json(
            &PinVerifier::create(new_pin.expose())?,
            &staged_path(&self.dir.join(PIN_FILE))
        )?;
        change.files.push(PathBuf::from(PIN_FILE));
        Ok(change)
    }

    fn pin(&self) -> Result<&SecretString, DeviceError> {
        self.pin.as_ref().ok_or(DeviceError::NotLoggedIn)
    }

    fn verifier(&self) -> Result<PinVerifier, DeviceError> {
        let path = self.dir.join(PIN_FILE);
        if !path.is_file() {
            return Err(DeviceError::NotInitialized)
        }
        Ok(file::load_json(&path)?)
    }

    fn key_file_name(key: &KeyId) -> String {
        format!("{}.{}", key, KEY_FILE_EXT)
    }

    fn key_path(&self, key: &KeyId) -> PathBuf {
        self.dir.join(KEYS_DIR).join(Self::key_file_name(key))
    }

    fn key_cache(
        &self
    ) -> Result<MutexGuard<'_, HashMap<KeyId, PKey<Private>>>, DeviceError> {
        self.keys.lock().map_err(|_| DeviceError::other("key cache poisoned"))
    }

    fn load_key(&self, key: &KeyId) -> Result<PKey<Private>, DeviceError> {
        let pin = self.pin()?;
        let mut keys = self.key_cache()?;
        if let Some(pkey) = keys.get(key) {
            return Ok(pkey.clone())
        }
        let pkey = self.decrypt_key(key, pin.expose_secret())?;
        keys.insert(key.clone(), pkey.clone());
        Ok(pkey)
    }

    fn decrypt_key(
        &self, key: &KeyId, pin: &str
    ) -> Result<PKey<Private>, DeviceError> {
        let path = self.key_path(key);
        if !path.is_file() {
            return Err(DeviceError::KeyNotFound(key.clone()))
        }
        let pem = file::read(&path)?;
        Ok(PKey::private_key_from_pem_passphrase(&pem, pin.as_bytes())?)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::sign::Verifier;
    use crate::commons::test::{sha256, test_under_tmp};
    use crate::device::mechanism::SignAlgorithm;

    fn init_and_login(dir: &Path, pin: &str) -> SoftToken {
        let module = SoftTokenModule::new(dir);
        module.initialize(&Pin::new(pin)).unwrap();
        let mut token = module.open().unwrap();
        token.login(&Pin::new(pin)).unwrap();
        token
    }

    #[test]
    fn uninitialized_token_is_listed() {
        test_under_tmp(|dir| {
            let module = SoftTokenModule::new(&dir);
            let devices = module.list_devices().unwrap();
            assert_eq!(devices.len(), 1);
            assert_eq!(devices[0].token_id.as_str(), SOFTWARE_TOKEN_ID);
            assert!(!devices[0].initialized);

            let mut token = module.open().unwrap();
            assert!(matches!(
                token.login(&Pin::new("1234")),
                Err(DeviceError::NotInitialized)
            ));
        })
    }

    #[test]
    fn initialize_twice_fails() {
        test_under_tmp(|dir| {
            let module = SoftTokenModule::new(&dir);
            module.initialize(&Pin::new("1234")).unwrap();
            assert!(matches!(
                module.initialize(&Pin::new("1234")),
                Err(DeviceError::AlreadyInitialized)
            ));
        })
    }

    #[test]
    fn wrong_pin_is_rejected() {
        test_under_tmp(|dir| {
            let module = SoftTokenModule::new(&dir);
            module.initialize(&Pin::new("1234")).unwrap();
            let mut token = module.open().unwrap();
            assert!(matches!(
                token.login(&Pin::new("4321")),
                Err(DeviceError::PinIncorrect)
            ));
            assert!(!token.is_logged_in());
        })
    }

    #[test]
    fn generate_sign_verify() {
        test_under_tmp(|dir| {
            let mut token = init_and_login(&dir, "1234");
            let key = token.generate_key_pair("test").unwrap();
            assert_eq!(token.list_keys().unwrap(), vec![key.id.clone()]);
            assert_eq!(token.public_key(&key.id).unwrap(), key.public_key);

            let digest = sha256(b"message");
            let info = SignAlgorithm::Sha256WithRsa.digest_info(&digest)
                .unwrap();
            let signature = token.sign_digest_info(&key.id, &info).unwrap();

            let public = PKey::public_key_from_der(&key.public_key).unwrap();
            let mut verifier = Verifier::new(
                MessageDigest::sha256(), &public
            ).unwrap();
            verifier.update(b"message").unwrap();
            assert!(verifier.verify(&signature).unwrap());
        })
    }

    #[test]
    fn operations_need_login() {
        test_under_tmp(|dir| {
            let mut token = init_and_login(&dir, "1234");
            let key = token.generate_key_pair("test").unwrap();
            token.logout().unwrap();
            assert!(matches!(
                token.generate_key_pair("other"),
                Err(DeviceError::NotLoggedIn)
            ));
            assert!(matches!(
                token.sign_digest_info(&key.id, b"x"),
                Err(DeviceError::NotLoggedIn)
            ));
        })
    }

    #[test]
    fn delete_missing_key() {
        test_under_tmp(|dir| {
            let mut token = init_and_login(&dir, "1234");
            let missing = KeyId::random();
            assert!(matches!(
                token.delete_key(&missing),
                Err(DeviceError::KeyNotFound(_))
            ));
        })
    }

    #[test]
    fn change_pin_reencrypts_keys() {
        test_under_tmp(|dir| {
            let mut token = init_and_login(&dir, "1234");
            let key = token.generate_key_pair("test").unwrap();

            assert!(matches!(
                token.change_pin(&Pin::new("0000"), &Pin::new("5678")),
                Err(DeviceError::PinIncorrect)
            ));
            token.change_pin(&Pin::new("1234"), &Pin::new("5678")).unwrap();

            let module = SoftTokenModule::new(&dir);
            let mut reopened = module.open().unwrap();
            assert!(reopened.login(&Pin::new("1234")).is_err());
            reopened.login(&Pin::new("5678")).unwrap();
            assert_eq!(reopened.public_key(&key.id).unwrap(), key.public_key);
        })
    }

    #[test]
    fn failed_pin_change_keeps_old_pin() {
        test_under_tmp(|dir| {
            let mut token = init_and_login(&dir, "1234");
            let first = token.generate_key_pair("first").unwrap();
            let second = token.generate_key_pair("second").unwrap();

            // Staging one of the keys fails.
            let blocker = staged_path(&token.key_path(&second.id));
            fs::create_dir(&blocker).unwrap();
            assert!(
                token.change_pin(&Pin::new("1234"), &Pin::new("5678"))
                    .is_err()
            );
            fs::remove_dir(&blocker).unwrap();
            assert!(!staged_path(&token.key_path(&first.id)).exists());
            assert!(!dir.join(SOFT_TOKEN_DIR).join(PIN_CHANGE_FILE).exists());

            let module = SoftTokenModule::new(&dir);
            let mut reopened = module.open().unwrap();
            assert!(reopened.login(&Pin::new("5678")).is_err());
            reopened.login(&Pin::new("1234")).unwrap();
            for key in [&first, &second] {
                assert_eq!(
                    reopened.public_key(&key.id).unwrap(), key.public_key
                );
            }

            reopened.change_pin(&Pin::new("1234"), &Pin::new("5678"))
                .unwrap();
        })
    }

    #[test]
    fn committed_pin_change_is_completed_on_open() {
        test_under_tmp(|dir| {
            let mut token = init_and_login(&dir, "1234");
            let key = token.generate_key_pair("test").unwrap();

            // Committed but none of the files moved into place yet.
            token.prepare_pin_change(&Pin::new("1234"), &Pin::new("5678"))
                .unwrap();
            drop(token);

            let module = SoftTokenModule::new(&dir);
            let mut reopened = module.open().unwrap();
            assert!(!dir.join(SOFT_TOKEN_DIR).join(PIN_CHANGE_FILE).exists());
            assert!(reopened.login(&Pin::new("1234")).is_err());
            reopened.login(&Pin::new("5678")).unwrap();
            assert_eq!(reopened.public_key(&key.id).unwrap(), key.public_key);
            assert_eq!(reopened.list_keys().unwrap(), vec![key.id]);
        })
    }

    #[test]
    fn decrypted_keys_are_kept_until_logout() {
        test_under_tmp(|dir| {
            let mut token = init_and_login(&dir, "1234");
            let key = token.generate_key_pair("test").unwrap();
            let info = SignAlgorithm::Sha256WithRsa
                .digest_info(&sha256(b"message")).unwrap();
            token.sign_digest_info(&key.id, &info).unwrap();

            // Signing no longer reads the key file.
            fs::remove_file(token.key_path(&key.id)).unwrap();
            token.sign_digest_info(&key.id, &info).unwrap();

            token.logout().unwrap();
            token.login(&Pin::new("1234")).unwrap();
            assert!(matches!(
                token.sign_digest_info(&key.id, &info),
                Err(DeviceError::KeyNotFound(_))
            ));
        })
    }
}
