//! Activation secrets kept in memory for automatic reactivation.

use std::collections::HashMap;
use std::sync::RwLock;
use secrecy::{ExposeSecret, SecretString};
use crate::api::ids::TokenId;
use crate::api::rpc::Pin;


//------------ CredentialCache -----------------------------------------------

/// The PINs of activated tokens.
///
/// Secrets live only in this process and are zeroized when removed. They
/// are never written anywhere.
#[derive(Default)]
pub struct CredentialCache {
    pins: RwLock<HashMap<TokenId, SecretString>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token_id: &TokenId, pin: &Pin) {
        if let Ok(mut pins) = self.pins.write() {
            pins.insert(token_id.clone(), pin.clone().into_secret());
        }
    }

    pub fn get(&self, token_id: &TokenId) -> Option<Pin> {
        self.pins.read().ok()?.get(token_id).map(|secret| {
            Pin::new(secret.expose_secret())
        })
    }

    pub fn contains(&self, token_id: &TokenId) -> bool {
        self.pins.read().is_ok_and(|pins| pins.contains_key(token_id))
    }

    /// Forgets the secret of a token. Returns whether there was one.
    pub fn remove(&self, token_id: &TokenId) -> bool {
        match self.pins.write() {
            Ok(mut pins) => pins.remove(token_id).is_some(),
            Err(_) => false,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut pins) = self.pins.write() {
            pins.clear();
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove() {
        let cache = CredentialCache::new();
        let token = TokenId::from("1");
        assert!(cache.get(&token).is_none());

        cache.set(&token, &Pin::new("1234"));
        assert!(cache.contains(&token));
        assert_eq!(cache.get(&token).unwrap().expose(), "1234");

        cache.set(&token, &Pin::new("5678"));
        assert_eq!(cache.get(&token).unwrap().expose(), "5678");

        assert!(cache.remove(&token));
        assert!(!cache.remove(&token));
        assert!(cache.get(&token).is_none());
    }

    #[test]
    fn clear_forgets_everything() {
        let cache = CredentialCache::new();
        cache.set(&TokenId::from("1"), &Pin::new("a"));
        cache.set(&TokenId::from("2"), &Pin::new("b"));
        cache.clear();
        assert!(!cache.contains(&TokenId::from("1")));
        assert!(!cache.contains(&TokenId::from("2")));
    }
}
