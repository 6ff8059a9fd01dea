use std::collections::BTreeMap;
use std::net::IpAddr;

use tokio::time::Instant;

use super::mapping::{EidKey, EidPrefix, LocatorState, Mapping};
use super::StoreError;

/// The local EID database: the mappings this device registers and answers
/// for. Ordered by (iid, family, prefix, mask) so registration batches walk
/// it deterministically.
#[derive(Debug, Default)]
pub struct LocalDb {
    entries: BTreeMap<EidKey, Mapping>,
}

impl LocalDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Replacing keeps the probe state of locators whose
    /// address is unchanged; locators new to the mapping start `Unknown`.
    pub fn add_local(&mut self, mut mapping: Mapping) -> Result<(), StoreError> {
        let key = EidKey::of(&mapping.eid);
        if let Some(old) = self.entries.get(&key) {
            for locator in mapping.locators_mut() {
                if let Some(previous) = old.locator(&locator.addr) {
                    locator.state = previous.state;
                    locator.probing = previous.probing.clone();
                } else {
                    locator.state = LocatorState::Unknown;
                }
            }
        }
        self.entries.insert(key, mapping);
        Ok(())
    }

    pub fn remove(&mut self, prefix: &EidPrefix) -> Result<Mapping, StoreError> {
        self.entries.remove(&EidKey::of(prefix)).ok_or(StoreError::NotFound)
    }

    pub fn lookup_exact(&self, prefix: &EidPrefix) -> Option<&Mapping> {
        self.entries.get(&EidKey::of(prefix))
    }

    pub fn lookup_exact_mut(&mut self, prefix: &EidPrefix) -> Option<&mut Mapping> {
        self.entries.get_mut(&EidKey::of(prefix))
    }

    pub fn lookup_longest(&self, ip: IpAddr, iid: Option<u32>) -> Option<&Mapping> {
        lookup_longest(&self.entries, ip, iid).map(|(_, m)| m)
    }

    pub fn iter_local(&self) -> impl Iterator<Item = &Mapping> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One remote mapping learned through a map-reply, with its lease.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub mapping: Mapping,
    pub expires_at: Instant,
    /// True while a map-request for this prefix is outstanding.
    pub active: bool,
    /// The outstanding request's nonce, when `active`.
    pub nonce: Option<u64>,
}

/// The map-cache: remote EID to RLOC-set bindings with TTL expiry.
#[derive(Debug, Default)]
pub struct MapCache {
    entries: BTreeMap<EidKey, CacheEntry>,
}

impl MapCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a remote entry. An existing entry is only displaced by a
    /// mapping with a non-zero TTL; a 0-TTL mapping marks a negative lookup
    /// pending retry and never overwrites live state.
    pub fn add_cache(&mut self, mapping: Mapping, expires_at: Instant) -> Result<(), StoreError> {
        let key = EidKey::of(&mapping.eid);
        if self.entries.contains_key(&key) && mapping.ttl_minutes == 0 {
            return Err(StoreError::Exists);
        }
        self.entries.insert(key, CacheEntry { mapping, expires_at, active: false, nonce: None });
        Ok(())
    }

    pub fn remove(&mut self, prefix: &EidPrefix) -> Result<CacheEntry, StoreError> {
        self.entries.remove(&EidKey::of(prefix)).ok_or(StoreError::NotFound)
    }

    pub fn lookup_exact(&self, prefix: &EidPrefix) -> Option<&CacheEntry> {
        self.entries.get(&EidKey::of(prefix))
    }

    pub fn lookup_exact_mut(&mut self, prefix: &EidPrefix) -> Option<&mut CacheEntry> {
        self.entries.get_mut(&EidKey::of(prefix))
    }

    pub fn lookup_longest(&self, ip: IpAddr, iid: Option<u32>) -> Option<&CacheEntry> {
        lookup_longest(&self.entries, ip, iid).map(|(_, e)| e)
    }

    pub fn lookup_longest_mut(&mut self, ip: IpAddr, iid: Option<u32>) -> Option<&mut CacheEntry> {
        let key = lookup_longest(&self.entries, ip, iid).map(|(k, _)| k.clone())?;
        self.entries.get_mut(&key)
    }

    /// Drop every entry whose lease has run out, reporting each removal so
    /// outstanding request state can be cleared with it.
    pub fn expire<F>(&mut self, now: Instant, mut on_expired: F)
    where
        F: FnMut(&EidPrefix, Option<u64>),
    {
        let dead: Vec<EidKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in dead {
            if let Some(entry) = self.entries.remove(&key) {
                on_expired(&entry.mapping.eid, entry.nonce);
            }
        }
    }

    pub fn iter_cache(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn iter_cache_mut(&mut self) -> impl Iterator<Item = &mut CacheEntry> {
        self.entries.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

trait HasMapping {
    fn mapping(&self) -> &Mapping;
}

impl HasMapping for Mapping {
    fn mapping(&self) -> &Mapping {
        self
    }
}

impl HasMapping for CacheEntry {
    fn mapping(&self) -> &Mapping {
        &self.mapping
    }
}

/// Longest-prefix match within the (iid, family) slice of a table.
fn lookup_longest<V: HasMapping>(
    entries: &BTreeMap<EidKey, V>,
    ip: IpAddr,
    iid: Option<u32>,
) -> Option<(&EidKey, &V)> {
    let (lo, hi) = EidKey::family_range(iid, ip.is_ipv6());
    entries
        .range(lo..=hi)
        .filter(|(_, v)| v.mapping().eid.contains(ip, iid))
        .max_by_key(|(_, v)| v.mapping().eid.mask_len())
}
