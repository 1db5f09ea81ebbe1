//! OCSP responses for the certificates of active tokens.
//!
//! The refresh cycle runs in the background. It fetches new responses for
//! the active certificates of all active tokens shortly before the cached
//! response expires. Clients only ever read the cache.

pub mod cache;
pub mod fetch;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use chrono::Utc;
use log::{debug, info, warn};
use crate::api::ids::CertHash;
use crate::commons::SignerResult;
use crate::registry::TokenRegistry;
use self::cache::OcspCache;
use self::fetch::OcspFetcher;


//------------ RefreshSummary ------------------------------------------------

/// What a refresh cycle did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pruned: usize,
}


//------------ OcspRefresher -------------------------------------------------

pub struct OcspRefresher {
    cache: Arc<OcspCache>,
    registry: Arc<TokenRegistry>,
    fetcher: OcspFetcher,

    /// How long to retry a single certificate within one cycle.
    retry_for: Duration,
}

impl OcspRefresher {
    pub fn new(
        cache: Arc<OcspCache>,
        registry: Arc<TokenRegistry>,
        fetcher: OcspFetcher,
        retry_for: Duration,
    ) -> Self {
        OcspRefresher { cache, registry, fetcher, retry_for }
    }

    pub fn cache(&self) -> &Arc<OcspCache> {
        &self.cache
    }

    /// Returns the certificates whose status we keep track of.
    ///
    /// These are the active certificates of available keys on active
    /// tokens.
    fn tracked_certs(&self) -> SignerResult<Vec<(CertHash, Bytes)>> {
        let snapshot = self.registry.snapshot()?;
        Ok(snapshot.tokens()
            .filter(|token| token.state.is_active())
            .flat_map(|token| token.keys.iter())
            .filter_map(|key_id| snapshot.key(key_id).ok())
            .filter(|key| key.available)
            .flat_map(|key| snapshot.key_certs(key))
            .filter(|cert| cert.active)
            .map(|cert| (cert.hash.clone(), cert.certificate.clone()))
            .collect())
    }

    /// Runs one refresh cycle.
    ///
    /// Failures for single certificates are logged and keep the previous
    /// response.
    pub async fn refresh(&self) -> SignerResult<RefreshSummary> {
        let mut summary = RefreshSummary::default();
        let now = Utc::now();
        let tracked = self.tracked_certs()?;
        summary.pruned = self.cache.prune_at(
            &tracked.iter().map(|(hash, _)| hash.clone()).collect::<HashSet<_>>(),
            now,
        )?;
        if summary.pruned > 0 {
            debug!("Dropped {} unused OCSP responses", summary.pruned);
        }
        for (hash, cert) in tracked {
            if !self.cache.needs_refresh(&hash, now)? {
                summary.skipped += 1;
                continue
            }
            match self.fetcher.fetch(&cert, self.retry_for).await {
                Ok(fetched) => {
                    self.cache.insert(
                        hash, fetched.response, fetched.next_update
                    )?;
                    summary.refreshed += 1;
                }
                Err(err) => {
                    warn!(
                        "Failed to refresh OCSP response for certificate \
                         '{hash}': {err}"
                    );
                    self.cache.mark_failed(&hash)?;
                    summary.failed += 1;
                }
            }
        }
        if summary.refreshed > 0 || summary.failed > 0 {
            info!(
                "OCSP refresh: {} refreshed, {} failed",
                summary.refreshed, summary.failed
            );
        }
        else {
            debug!("OCSP refresh: nothing to do");
        }
        Ok(summary)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use chrono::Duration as TimeDelta;
    use super::*;
    use crate::api::ids::{KeyId, TokenId};
    use crate::api::token::{CertStatus, TokenKind, TokenState};
    use crate::api::rpc::OcspResponseEntry;
    use crate::commons::error::Error;
    use crate::commons::test::{issue_cert, rsa_key};
    use crate::config::OcspConfig;
    use crate::device::DeviceInfo;
    use crate::registry::model::CertRecord;
    use crate::registry::store::RegistryStore;
    use super::fetch::FetchedResponse;
    use super::fetch::mock::MockFetcher;

    struct Setup {
        refresher: OcspRefresher,
        registry: Arc<TokenRegistry>,
        hash: CertHash,
    }

    fn setup(fetcher: MockFetcher, config: &OcspConfig) -> Setup {
        let registry = Arc::new(
            TokenRegistry::load(RegistryStore::memory()).unwrap()
        );
        let token_id = TokenId::from("hsm-1");
        let key_id = KeyId::random();
        let key = rsa_key();
        let public_key = Bytes::from(key.public_key_to_der().unwrap());
        let cert = issue_cert(&public_key, "member");
        let hash = CertHash::of_der(&cert);
        registry.update(|state| {
            state.add_or_update_token(&DeviceInfo {
                token_id: token_id.clone(),
                kind: TokenKind::Hardware,
                module: "hsm".into(),
                label: "hsm".into(),
                serial_number: Some("1".into()),
                read_only: false,
                batch_signing: true,
                initialized: true,
            });
            state.add_key(&token_id, key_id.clone(), public_key, None)?;
            state.add_cert(
                CertRecord::new(key_id, cert, None, CertStatus::Registered),
                false
            )?;
            state.set_token_state(&token_id, TokenState::Active)
        }).unwrap();

        let refresher = OcspRefresher::new(
            Arc::new(OcspCache::new(config)),
            registry.clone(),
            OcspFetcher::Mock(fetcher),
            Duration::ZERO,
        );
        Setup { refresher, registry, hash }
    }

    fn fetcher(setup: &Setup) -> &MockFetcher {
        match &setup.refresher.fetcher {
            OcspFetcher::Mock(fetcher) => fetcher,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn refreshes_active_certificates() {
        let setup = setup(MockFetcher::default(), &OcspConfig::default());
        fetcher(&setup).set_response(setup.hash.clone(), FetchedResponse {
            response: Bytes::from_static(b"good"),
            next_update: Some(Utc::now() + TimeDelta::hours(1)),
        });

        let summary = setup.refresher.refresh().await.unwrap();
        assert_eq!(summary.refreshed, 1);
        let responses = setup.refresher.cache()
            .responses(&[setup.hash.clone()]).unwrap();
        assert_eq!(responses, vec![OcspResponseEntry {
            cert_hash: setup.hash.clone(),
            response: Some(Bytes::from_static(b"good")),
            stale: false,
        }]);

        // Still fresh, so not fetched again.
        let summary = setup.refresher.refresh().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(fetcher(&setup).calls(), 1);
    }

    #[tokio::test]
    async fn inactive_tokens_are_skipped() {
        let setup = setup(MockFetcher::default(), &OcspConfig::default());
        setup.registry.update_runtime(|state| {
            state.set_token_state(
                &TokenId::from("hsm-1"), TokenState::PresentInactive
            )
        }).unwrap();
        let summary = setup.refresher.refresh().await.unwrap();
        assert_eq!(summary, RefreshSummary::default());
        assert_eq!(fetcher(&setup).calls(), 0);
    }

    #[tokio::test]
    async fn responses_of_deleted_certificates_are_dropped() {
        let setup = setup(MockFetcher::default(), &OcspConfig::default());
        fetcher(&setup).set_response(setup.hash.clone(), FetchedResponse {
            response: Bytes::from_static(b"good"),
            next_update: Some(Utc::now() + TimeDelta::hours(1)),
        });
        setup.refresher.refresh().await.unwrap();

        let supplied = CertHash::from_str("0a1b2c").unwrap();
        let cache = setup.refresher.cache();
        cache.insert_supplied(
            supplied.clone(), Bytes::from_static(b"client")
        ).unwrap();

        setup.registry.update(|state| {
            let id = state.cert_by_hash(&setup.hash)?.id.clone();
            state.remove_cert(&id).map(|_| ())
        }).unwrap();
        let summary = setup.refresher.refresh().await.unwrap();
        assert_eq!(summary.pruned, 1);
        assert_eq!(cache.entry(&setup.hash).unwrap(), None);
        assert!(cache.entry(&supplied).unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_refreshes_keep_previous_response() {
        // A zero staleness ceiling makes the response unusable as soon as
        // its next update has passed.
        let config = OcspConfig {
            staleness_ceiling_seconds: 0,
            ..Default::default()
        };
        let setup = setup(MockFetcher::default(), &config);
        fetcher(&setup).set_response(setup.hash.clone(), FetchedResponse {
            response: Bytes::from_static(b"good"),
            next_update: Some(Utc::now() + TimeDelta::seconds(1)),
        });
        setup.refresher.refresh().await.unwrap();

        fetcher(&setup).fail(&setup.hash);
        for _ in 0..2 {
            let summary = setup.refresher.refresh().await.unwrap();
            assert_eq!(summary.failed, 1);
        }
        let cache = setup.refresher.cache();
        let responses = cache.responses(&[setup.hash.clone()]).unwrap();
        assert_eq!(
            responses[0].response,
            Some(Bytes::from_static(b"good"))
        );
        assert!(responses[0].stale);

        let later = Utc::now() + TimeDelta::seconds(5);
        assert!(matches!(
            cache.responses_at(&[setup.hash.clone()], later),
            Err(Error::RevocationDataUnavailable(_))
        ));
    }
}
