//! Persistence of the registry content.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use log::{debug, info};
use crate::commons::SignerResult;
use crate::commons::error::Error;
use crate::commons::file::{self, FileLock};
use crate::constants::{LOCK_FILE_NAME, REGISTRY_DIR, REGISTRY_FILE};
use super::model::RegistryState;


//------------ RegistryStore -------------------------------------------------

/// Where the registry content is kept.
pub enum RegistryStore {
    /// A JSON file in the data directory.
    Disk {
        path: PathBuf,
        lock: Mutex<FileLock>,
    },

    /// Nothing persisted, for tests.
    Memory {
        saved: Mutex<Option<RegistryState>>,
        fail_writes: bool,
    },
}

impl RegistryStore {
    /// Creates a store in the registry sub directory of `data_dir`.
    pub fn disk(data_dir: &Path) -> SignerResult<Self> {
        let dir = file::sub_dir(data_dir, REGISTRY_DIR)?;
        let lock = FileLock::create(&dir.join(LOCK_FILE_NAME))?;
        Ok(RegistryStore::Disk {
            path: dir.join(REGISTRY_FILE),
            lock: Mutex::new(lock),
        })
    }

    pub fn memory() -> Self {
        RegistryStore::Memory { saved: Mutex::new(None), fail_writes: false }
    }

    /// A memory store that refuses every write.
    pub fn failing() -> Self {
        RegistryStore::Memory { saved: Mutex::new(None), fail_writes: true }
    }

    /// Loads the stored state, or an empty state if nothing was stored yet.
    pub fn load(&self) -> SignerResult<RegistryState> {
        match self {
            RegistryStore::Disk { path, .. } => {
                if path.exists() {
                    let state = file::load_json(path)?;
                    info!("Loaded token registry from {}", path.display());
                    Ok(state)
                } else {
                    info!(
                        "No token registry at {}, starting empty",
                        path.display()
                    );
                    Ok(RegistryState::default())
                }
            }
            RegistryStore::Memory { saved, .. } => {
                Ok(saved.lock().map_err(|_| {
                    Error::poisoned("memory store")
                })?.clone().unwrap_or_default())
            }
        }
    }

    pub fn save(&self, state: &RegistryState) -> SignerResult<()> {
        match self {
            RegistryStore::Disk { path, lock } => {
                let mut lock = lock.lock().map_err(|_| {
                    Error::poisoned("registry file lock")
                })?;
                let _guard = lock.write()?;
                file::save_json(state, path)?;
                debug!("Saved token registry to {}", path.display());
                Ok(())
            }
            RegistryStore::Memory { saved, fail_writes } => {
                if *fail_writes {
                    return Err(Error::storage("memory store refuses writes"))
                }
                *saved.lock().map_err(|_| {
                    Error::poisoned("memory store")
                })? = Some(state.clone());
                Ok(())
            }
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ids::TokenId;
    use crate::commons::test::test_under_tmp;

    #[test]
    fn disk_store_round_trip() {
        test_under_tmp(|dir| {
            let store = RegistryStore::disk(&dir).unwrap();
            assert_eq!(store.load().unwrap(), RegistryState::default());

            let mut state = RegistryState::default();
            state.add_or_update_token(&crate::device::DeviceInfo {
                token_id: TokenId::from("0"),
                kind: crate::api::token::TokenKind::Software,
                module: "softToken".into(),
                label: "softToken-0".into(),
                serial_number: None,
                read_only: false,
                batch_signing: true,
                initialized: true,
            });
            store.save(&state).unwrap();

            let reopened = RegistryStore::disk(&dir).unwrap();
            assert_eq!(reopened.load().unwrap(), state);
            assert!(dir.join(REGISTRY_DIR).join(REGISTRY_FILE).exists());
        })
    }

    #[test]
    fn failing_store_refuses() {
        let store = RegistryStore::failing();
        assert!(store.save(&RegistryState::default()).is_err());
    }
}
