//! The token registry.
//!
//! Holds the metadata of all tokens, keys, certificates and certificate
//! requests. Readers get a cheap snapshot of the current content. Writers
//! change a copy, persist it and only then make it current, so a failed
//! write leaves the registry as it was.

pub mod model;
pub mod store;

use std::sync::{Arc, Mutex, RwLock};
use log::trace;
use crate::commons::SignerResult;
use crate::commons::error::Error;
use self::model::RegistryState;
use self::store::RegistryStore;


//------------ TokenRegistry -------------------------------------------------

pub struct TokenRegistry {
    current: RwLock<Arc<RegistryState>>,

    /// Serializes writers.
    write_lock: Mutex<()>,

    store: RegistryStore,
}

impl TokenRegistry {
    /// Creates the registry with the content of the store.
    pub fn load(store: RegistryStore) -> SignerResult<Self> {
        let state = store.load()?;
        Ok(TokenRegistry {
            current: RwLock::new(Arc::new(state)),
            write_lock: Mutex::new(()),
            store,
        })
    }

    /// Returns the current content.
    ///
    /// The snapshot does not see later changes.
    pub fn snapshot(&self) -> SignerResult<Arc<RegistryState>> {
        self.current.read().map(|state| state.clone()).map_err(|_| {
            Error::poisoned("registry")
        })
    }

    /// Runs a read-only closure over the current content.
    pub fn read<F, T>(&self, op: F) -> SignerResult<T>
    where
        F: FnOnce(&RegistryState) -> SignerResult<T>,
    {
        op(&*self.snapshot()?)
    }

    /// Applies a change and persists the result.
    ///
    /// Nothing changes if either the closure or persisting fails.
    pub fn update<F, T>(&self, op: F) -> SignerResult<T>
    where
        F: FnOnce(&mut RegistryState) -> SignerResult<T>,
    {
        self.apply(op, true)
    }

    /// Applies a change to runtime state only.
    ///
    /// Used for token states and key availability which are never
    /// persisted.
    pub fn update_runtime<F, T>(&self, op: F) -> SignerResult<T>
    where
        F: FnOnce(&mut RegistryState) -> SignerResult<T>,
    {
        self.apply(op, false)
    }

    fn apply<F, T>(&self, op: F, persist: bool) -> SignerResult<T>
    where
        F: FnOnce(&mut RegistryState) -> SignerResult<T>,
    {
        let _write = self.write_lock.lock().map_err(|_| {
            Error::poisoned("registry writer")
        })?;
        let mut state = RegistryState::clone(&*self.snapshot()?);
        let res = op(&mut state)?;
        if persist {
            self.store.save(&state)?;
            trace!("Registry change persisted");
        }
        *self.current.write().map_err(|_| {
            Error::poisoned("registry")
        })? = Arc::new(state);
        Ok(res)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ids::TokenId;
    use crate::api::token::{TokenKind, TokenState};
    use crate::commons::test::test_under_tmp;
    use crate::device::DeviceInfo;

    fn device() -> DeviceInfo {
        DeviceInfo {
            token_id: TokenId::from("0"),
            kind: TokenKind::Software,
            module: "softToken".into(),
            label: "softToken-0".into(),
            serial_number: None,
            read_only: false,
            batch_signing: true,
            initialized: true,
        }
    }

    #[test]
    fn failed_write_leaves_registry_unchanged() {
        let registry = TokenRegistry::load(RegistryStore::failing()).unwrap();
        let res = registry.update(|state| {
            state.add_or_update_token(&device());
            Ok(())
        });
        assert!(matches!(res, Err(Error::Storage(_))));
        assert_eq!(registry.snapshot().unwrap().tokens().count(), 0);
    }

    #[test]
    fn failed_change_leaves_registry_unchanged() {
        let registry = TokenRegistry::load(RegistryStore::memory()).unwrap();
        registry.update(|state| {
            state.add_or_update_token(&device());
            Ok(())
        }).unwrap();
        let res = registry.update(|state| {
            state.set_token_friendly_name(&TokenId::from("0"), "changed")?;
            state.set_token_friendly_name(&TokenId::from("9"), "missing")
        });
        assert!(matches!(res, Err(Error::TokenNotFound(_))));
        let snapshot = registry.snapshot().unwrap();
        let token = snapshot.token(&TokenId::from("0")).unwrap();
        assert_eq!(token.friendly_name.as_deref(), Some("softToken-0"));
    }

    #[test]
    fn snapshot_is_isolated_from_later_changes() {
        let registry = TokenRegistry::load(RegistryStore::memory()).unwrap();
        let before = registry.snapshot().unwrap();
        registry.update(|state| {
            state.add_or_update_token(&device());
            Ok(())
        }).unwrap();
        assert_eq!(before.tokens().count(), 0);
        assert_eq!(registry.snapshot().unwrap().tokens().count(), 1);
    }

    #[test]
    fn registry_survives_restart_without_runtime_state() {
        test_under_tmp(|dir| {
            let registry = TokenRegistry::load(
                RegistryStore::disk(&dir).unwrap()
            ).unwrap();
            registry.update(|state| {
                state.add_or_update_token(&device());
                Ok(())
            }).unwrap();
            registry.update_runtime(|state| {
                state.set_token_state(&TokenId::from("0"), TokenState::Active)
            }).unwrap();
            drop(registry);

            let registry = TokenRegistry::load(
                RegistryStore::disk(&dir).unwrap()
            ).unwrap();
            let snapshot = registry.snapshot().unwrap();
            let token = snapshot.token(&TokenId::from("0")).unwrap();
            assert_eq!(token.state, TokenState::Absent);
        })
    }
}
