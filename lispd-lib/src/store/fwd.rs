use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::msg::Address;

use super::mapping::EidPrefix;

/// One memoized encap decision for a destination EID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwdEntry {
    /// `None` records "no usable path" so the data plane is not asked to
    /// retry every packet.
    pub rloc: Option<Address>,
}

/// Per-destination cache of encap decisions handed to the data plane.
/// Entries are computed from the map-cache on demand and thrown away
/// whenever the mapping or a locator state underneath them changes.
#[derive(Debug, Default)]
pub struct FwdCache {
    entries: BTreeMap<(Option<u32>, IpAddr), FwdEntry>,
}

impl FwdCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, iid: Option<u32>, dst: IpAddr) -> Option<&FwdEntry> {
        self.entries.get(&(iid, dst))
    }

    pub fn insert(&mut self, iid: Option<u32>, dst: IpAddr, entry: FwdEntry) {
        self.entries.insert((iid, dst), entry);
    }

    /// Drop every decision for destinations covered by `prefix`.
    pub fn invalidate_prefix(&mut self, prefix: &EidPrefix) {
        self.entries.retain(|(iid, dst), _| !prefix.contains(*dst, *iid));
    }

    /// Drop every decision that chose `rloc`.
    pub fn invalidate_rloc(&mut self, rloc: &Address) {
        self.entries.retain(|_, e| e.rloc.as_ref() != Some(rloc));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::Address;
    use std::net::Ipv4Addr;

    fn prefix(s: &str, len: u8) -> EidPrefix {
        let addr: Ipv4Addr = s.parse().unwrap();
        EidPrefix::new(Address::Ipv4(addr), len, None).unwrap()
    }

    #[test]
    fn invalidate_by_prefix_only_touches_covered_destinations() {
        let mut cache = FwdCache::new();
        let rloc = Address::Ipv4(Ipv4Addr::new(198, 51, 100, 1));
        cache.insert(None, "10.1.0.5".parse().unwrap(), FwdEntry { rloc: Some(rloc.clone()) });
        cache.insert(None, "10.2.0.5".parse().unwrap(), FwdEntry { rloc: Some(rloc) });

        cache.invalidate_prefix(&prefix("10.1.0.0", 16));
        assert!(cache.lookup(None, "10.1.0.5".parse().unwrap()).is_none());
        assert!(cache.lookup(None, "10.2.0.5".parse().unwrap()).is_some());
    }

    #[test]
    fn invalidate_by_rloc_drops_negative_entries_only_on_match() {
        let mut cache = FwdCache::new();
        let rloc = Address::Ipv4(Ipv4Addr::new(198, 51, 100, 1));
        cache.insert(None, "10.1.0.5".parse().unwrap(), FwdEntry { rloc: Some(rloc.clone()) });
        cache.insert(None, "10.2.0.5".parse().unwrap(), FwdEntry { rloc: None });

        cache.invalidate_rloc(&rloc);
        assert!(cache.lookup(None, "10.1.0.5".parse().unwrap()).is_none());
        assert!(cache.lookup(None, "10.2.0.5".parse().unwrap()).is_some());
    }

    #[test]
    fn iid_keys_do_not_collide() {
        let mut cache = FwdCache::new();
        let dst: IpAddr = "10.1.0.5".parse().unwrap();
        cache.insert(Some(7), dst, FwdEntry { rloc: None });
        assert!(cache.lookup(None, dst).is_none());
        assert!(cache.lookup(Some(7), dst).is_some());
    }
}
