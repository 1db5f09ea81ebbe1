//! The in-memory OCSP response cache.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use log::debug;
use crate::api::ids::CertHash;
use crate::api::rpc::OcspResponseEntry;
use crate::commons::SignerResult;
use crate::commons::error::Error;
use crate::config::OcspConfig;


//------------ OcspEntry -----------------------------------------------------

/// The last good response for a certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OcspEntry {
    /// The DER encoded OCSP response.
    pub response: Bytes,

    /// When the response was received.
    pub fetched_at: DateTime<Utc>,

    /// When the responder wants to be asked again.
    pub next_update: DateTime<Utc>,

    /// Whether the last attempt to replace the response failed.
    pub refresh_failed: bool,

    /// Whether a client provided the response.
    ///
    /// These are kept until they pass the staleness ceiling even if the
    /// certificate is not ours.
    pub supplied: bool,
}


//------------ OcspLookup ----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OcspLookup {
    /// The response is within its validity and was refreshed on time.
    Fresh(Bytes),

    /// The response is past its next update or a refresh failed, but it is
    /// still within the staleness ceiling.
    Stale(Bytes),

    /// The response is too old to be served.
    Unavailable,
}


//------------ OcspCache -----------------------------------------------------

type EntryMap = HashMap<CertHash, OcspEntry>;

/// Maps certificate hashes to their latest OCSP response.
///
/// Entries are only ever replaced as a whole.
pub struct OcspCache {
    entries: RwLock<EntryMap>,
    staleness_ceiling: Duration,
    default_validity: Duration,
    refresh_ahead: Duration,
}

impl OcspCache {
    pub fn new(config: &OcspConfig) -> Self {
        OcspCache {
            entries: RwLock::new(HashMap::new()),
            staleness_ceiling: config.staleness_ceiling(),
            default_validity: config.default_validity(),
            refresh_ahead: config.refresh_ahead(),
        }
    }

    /// Stores a new response for a certificate.
    ///
    /// Without a next update time the response is considered valid for the
    /// configured default validity.
    pub fn insert(
        &self,
        hash: CertHash,
        response: Bytes,
        next_update: Option<DateTime<Utc>>,
    ) -> SignerResult<()> {
        self.insert_at(hash, response, next_update, Utc::now())
    }

    pub fn insert_at(
        &self,
        hash: CertHash,
        response: Bytes,
        next_update: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SignerResult<()> {
        self.store(hash, response, next_update, now, false)
    }

    /// Stores a response handed to us by a client.
    pub fn insert_supplied(
        &self, hash: CertHash, response: Bytes
    ) -> SignerResult<()> {
        self.store(hash, response, None, Utc::now(), true)
    }

    fn store(
        &self,
        hash: CertHash,
        response: Bytes,
        next_update: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        supplied: bool,
    ) -> SignerResult<()> {
        let entry = OcspEntry {
            response,
            fetched_at: now,
            next_update: next_update.unwrap_or(now + self.default_validity),
            refresh_failed: false,
            supplied,
        };
        debug!(
            "Cached OCSP response for certificate '{hash}' until {}",
            entry.next_update
        );
        self.write()?.insert(hash, entry);
        Ok(())
    }

    /// Drops entries that are of no more use.
    ///
    /// Responses we fetched are dropped once their certificate is no
    /// longer in `tracked`. Any response is dropped once it is too old to
    /// be served. Returns the number of removed entries.
    pub fn prune_at(
        &self, tracked: &HashSet<CertHash>, now: DateTime<Utc>
    ) -> SignerResult<usize> {
        let mut entries = self.write()?;
        let before = entries.len();
        entries.retain(|hash, entry| {
            (entry.supplied || tracked.contains(hash))
                && self.classify(entry, now) != OcspLookup::Unavailable
        });
        Ok(before - entries.len())
    }

    /// Records that fetching a new response failed.
    ///
    /// The previous response is kept.
    pub fn mark_failed(&self, hash: &CertHash) -> SignerResult<()> {
        if let Some(entry) = self.write()?.get_mut(hash) {
            entry.refresh_failed = true;
        }
        Ok(())
    }

    pub fn entry(&self, hash: &CertHash) -> SignerResult<Option<OcspEntry>> {
        Ok(self.read()?.get(hash).cloned())
    }

    /// Looks up the response for a certificate.
    ///
    /// Returns `None` for certificates we know nothing about.
    pub fn get(&self, hash: &CertHash) -> SignerResult<Option<OcspLookup>> {
        self.get_at(hash, Utc::now())
    }

    pub fn get_at(
        &self, hash: &CertHash, now: DateTime<Utc>
    ) -> SignerResult<Option<OcspLookup>> {
        Ok(self.read()?.get(hash).map(|entry| self.classify(entry, now)))
    }

    fn classify(&self, entry: &OcspEntry, now: DateTime<Utc>) -> OcspLookup {
        let ceiling = entry.fetched_at + self.staleness_ceiling;
        if now >= entry.next_update.max(ceiling) {
            OcspLookup::Unavailable
        }
        else if entry.refresh_failed || now >= entry.next_update {
            OcspLookup::Stale(entry.response.clone())
        }
        else {
            OcspLookup::Fresh(entry.response.clone())
        }
    }

    /// Returns whether a certificate's response should be fetched again.
    pub fn needs_refresh(
        &self, hash: &CertHash, now: DateTime<Utc>
    ) -> SignerResult<bool> {
        Ok(match self.read()?.get(hash) {
            None => true,
            Some(entry) => {
                entry.refresh_failed
                    || now >= entry.next_update - self.refresh_ahead
            }
        })
    }

    /// Looks up the responses for a list of certificates.
    ///
    /// Fails if any of the responses is too old to be served.
    pub fn responses(
        &self, hashes: &[CertHash]
    ) -> SignerResult<Vec<OcspResponseEntry>> {
        self.responses_at(hashes, Utc::now())
    }

    pub fn responses_at(
        &self, hashes: &[CertHash], now: DateTime<Utc>
    ) -> SignerResult<Vec<OcspResponseEntry>> {
        hashes.iter().map(|hash| {
            let (response, stale) = match self.get_at(hash, now)? {
                None => (None, false),
                Some(OcspLookup::Fresh(response)) => (Some(response), false),
                Some(OcspLookup::Stale(response)) => (Some(response), true),
                Some(OcspLookup::Unavailable) => {
                    return Err(Error::RevocationDataUnavailable(hash.clone()))
                }
            };
            Ok(OcspResponseEntry { cert_hash: hash.clone(), response, stale })
        }).collect()
    }

    fn read(&self) -> SignerResult<RwLockReadGuard<'_, EntryMap>> {
        self.entries.read().map_err(|_| Error::poisoned("OCSP cache"))
    }

    fn write(&self) -> SignerResult<RwLockWriteGuard<'_, EntryMap>> {
        self.entries.write().map_err(|_| Error::poisoned("OCSP cache"))
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use super::*;

    fn cache() -> OcspCache {
        // Defaults: ceiling two hours, default validity one hour, refresh
        // ten minutes ahead.
        OcspCache::new(&OcspConfig::default())
    }

    fn hash() -> CertHash {
        CertHash::from_str("AB12").unwrap()
    }

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z").unwrap().into()
    }

    #[test]
    fn unknown_hash_has_no_entry() {
        let cache = cache();
        assert_eq!(cache.get(&hash()).unwrap(), None);
        let responses = cache.responses(&[hash()]).unwrap();
        assert_eq!(responses[0].response, None);
        assert!(!responses[0].stale);
    }

    #[test]
    fn response_ages() {
        let cache = cache();
        let response = Bytes::from_static(b"ocsp");
        cache.insert_at(
            hash(), response.clone(),
            Some(start() + Duration::minutes(30)), start()
        ).unwrap();

        assert_eq!(
            cache.get_at(&hash(), start() + Duration::minutes(10)).unwrap(),
            Some(OcspLookup::Fresh(response.clone()))
        );
        assert_eq!(
            cache.get_at(&hash(), start() + Duration::minutes(40)).unwrap(),
            Some(OcspLookup::Stale(response.clone()))
        );
        assert_eq!(
            cache.get_at(&hash(), start() + Duration::hours(2)).unwrap(),
            Some(OcspLookup::Unavailable)
        );
    }

    #[test]
    fn failed_refreshes_serve_stale_until_ceiling() {
        let cache = cache();
        let response = Bytes::from_static(b"ocsp");
        cache.insert_at(
            hash(), response.clone(),
            Some(start() + Duration::hours(1)), start()
        ).unwrap();

        cache.mark_failed(&hash()).unwrap();
        cache.mark_failed(&hash()).unwrap();
        let responses = cache.responses_at(
            &[hash()], start() + Duration::minutes(5)
        ).unwrap();
        assert_eq!(responses[0].response.as_ref(), Some(&response));
        assert!(responses[0].stale);

        assert!(matches!(
            cache.responses_at(&[hash()], start() + Duration::hours(3)),
            Err(Error::RevocationDataUnavailable(_))
        ));
    }

    #[test]
    fn long_next_update_outlives_ceiling() {
        let cache = cache();
        cache.insert_at(
            hash(), Bytes::from_static(b"ocsp"),
            Some(start() + Duration::days(1)), start()
        ).unwrap();
        assert!(matches!(
            cache.get_at(&hash(), start() + Duration::hours(5)).unwrap(),
            Some(OcspLookup::Fresh(_))
        ));
    }

    #[test]
    fn default_validity_applies() {
        let cache = cache();
        cache.insert_at(
            hash(), Bytes::from_static(b"ocsp"), None, start()
        ).unwrap();
        let entry = cache.entry(&hash()).unwrap().unwrap();
        assert_eq!(entry.next_update, start() + Duration::hours(1));
    }

    #[test]
    fn refresh_ahead_of_next_update() {
        let cache = cache();
        assert!(cache.needs_refresh(&hash(), start()).unwrap());
        cache.insert_at(
            hash(), Bytes::from_static(b"ocsp"),
            Some(start() + Duration::hours(1)), start()
        ).unwrap();
        assert!(!cache.needs_refresh(
            &hash(), start() + Duration::minutes(30)
        ).unwrap());
        assert!(cache.needs_refresh(
            &hash(), start() + Duration::minutes(55)
        ).unwrap());
        cache.mark_failed(&hash()).unwrap();
        assert!(cache.needs_refresh(&hash(), start()).unwrap());
    }

    #[test]
    fn prune_drops_untracked_and_expired() {
        let cache = cache();
        let tracked = hash();
        let untracked = CertHash::from_str("ffff").unwrap();
        let supplied = CertHash::from_str("0a0a").unwrap();
        for hash in [&tracked, &untracked] {
            cache.insert_at(
                hash.clone(), Bytes::from_static(b"r"),
                Some(start() + Duration::hours(1)), start()
            ).unwrap();
        }
        cache.insert_supplied(supplied.clone(), Bytes::from_static(b"c"))
            .unwrap();

        let keep: HashSet<_> = [tracked.clone()].into_iter().collect();
        assert_eq!(cache.prune_at(&keep, start()).unwrap(), 1);
        assert!(cache.entry(&tracked).unwrap().is_some());
        assert!(cache.entry(&untracked).unwrap().is_none());
        assert!(cache.entry(&supplied).unwrap().is_some());

        // Far beyond every ceiling, nothing is worth keeping.
        let much_later = Utc::now() + Duration::days(30);
        assert_eq!(cache.prune_at(&keep, much_later).unwrap(), 2);
    }

    #[test]
    fn lookups_ignore_case() {
        let cache = cache();
        cache.insert(
            CertHash::from_str("ab12").unwrap(),
            Bytes::from_static(b"ocsp"),
            None,
        ).unwrap();
        assert!(cache.get(&CertHash::from_str("AB12").unwrap()).unwrap().is_some());
    }
}
