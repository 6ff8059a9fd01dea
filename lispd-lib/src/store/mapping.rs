use std::fmt;
use std::net::IpAddr;

use ahash::RandomState;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use tokio::time::Instant;

use crate::msg::{Address, LocatorRecord, MapReplyAction, MappingRecord};

use super::StoreError;

/// An EID prefix: address, mask length and optional instance id. Host bits
/// beyond the mask are zeroed on construction so two spellings of the same
/// prefix compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EidPrefix {
    address: Address,
    mask_len: u8,
    iid: Option<u32>,
}

impl EidPrefix {
    pub fn new(address: Address, mask_len: u8, iid: Option<u32>) -> Result<Self, StoreError> {
        let ip = address.ip().ok_or(StoreError::InvalidPrefix)?;
        let net = match ip {
            IpAddr::V4(a) => {
                IpNet::V4(Ipv4Net::new(a, mask_len).map_err(|_| StoreError::InvalidPrefix)?)
            }
            IpAddr::V6(a) => {
                IpNet::V6(Ipv6Net::new(a, mask_len).map_err(|_| StoreError::InvalidPrefix)?)
            }
        };
        Ok(EidPrefix { address: Address::from(net.network()), mask_len, iid })
    }

    pub fn from_net(net: IpNet, iid: Option<u32>) -> Self {
        EidPrefix {
            address: Address::from(net.trunc().addr()),
            mask_len: net.prefix_len(),
            iid,
        }
    }

    /// The /32 or /128 prefix covering a single address.
    pub fn host(ip: IpAddr, iid: Option<u32>) -> Self {
        let mask_len = if ip.is_ipv4() { 32 } else { 128 };
        EidPrefix { address: Address::from(ip), mask_len, iid }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn mask_len(&self) -> u8 {
        self.mask_len
    }

    pub fn iid(&self) -> Option<u32> {
        self.iid
    }

    pub fn contains(&self, ip: IpAddr, iid: Option<u32>) -> bool {
        if self.iid != iid {
            return false;
        }
        match (self.address.ip(), ip) {
            (Some(IpAddr::V4(net)), IpAddr::V4(addr)) => Ipv4Net::new(net, self.mask_len)
                .map(|n| n.contains(&addr))
                .unwrap_or(false),
            (Some(IpAddr::V6(net)), IpAddr::V6(addr)) => Ipv6Net::new(net, self.mask_len)
                .map(|n| n.contains(&addr))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// The wire form: the address, instance-id wrapped when an iid is set.
    pub fn to_wire_address(&self) -> Address {
        self.address.clone().with_iid(self.iid)
    }
}

impl fmt::Display for EidPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.iid {
            Some(iid) => write!(f, "[{}]{}/{}", iid, self.address, self.mask_len),
            None => write!(f, "{}/{}", self.address, self.mask_len),
        }
    }
}

/// Ordered key for the mapping tables: (iid, family, network bytes, mask).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct EidKey {
    iid: Option<u32>,
    v6: bool,
    addr: [u8; 16],
    mask_len: u8,
}

impl EidKey {
    pub fn of(prefix: &EidPrefix) -> Self {
        let mut addr = [0u8; 16];
        let v6 = match prefix.address.ip() {
            Some(IpAddr::V4(a)) => {
                addr[..4].copy_from_slice(&a.octets());
                false
            }
            Some(IpAddr::V6(a)) => {
                addr.copy_from_slice(&a.octets());
                true
            }
            None => false,
        };
        EidKey { iid: prefix.iid, v6, addr, mask_len: prefix.mask_len }
    }

    /// Range bounds covering every prefix under (iid, family), for the
    /// longest-prefix scan.
    pub fn family_range(iid: Option<u32>, v6: bool) -> (Self, Self) {
        (
            EidKey { iid, v6, addr: [0u8; 16], mask_len: 0 },
            EidKey { iid, v6, addr: [0xff; 16], mask_len: 0xff },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocatorState {
    Up,
    Down,
    #[default]
    Unknown,
}

/// Probe bookkeeping per remote locator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbingState {
    pub last_reply: Option<Instant>,
    pub failures: u8,
    pub nonce: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub addr: Address,
    pub priority: u8,
    pub weight: u8,
    pub mpriority: u8,
    pub mweight: u8,
    pub state: LocatorState,
    pub probing: ProbingState,
    /// RTRs to register through, attached after NAT discovery.
    pub rtrs: Vec<Address>,
}

/// Priority 255 means the locator must not be used for forwarding.
pub const LOCATOR_PRIORITY_UNUSABLE: u8 = 255;

impl Locator {
    pub fn new(addr: Address, priority: u8, weight: u8) -> Self {
        Locator {
            addr,
            priority,
            weight,
            mpriority: LOCATOR_PRIORITY_UNUSABLE,
            mweight: 0,
            state: LocatorState::Unknown,
            probing: ProbingState::default(),
            rtrs: Vec::new(),
        }
    }

    pub fn usable(&self) -> bool {
        self.priority != LOCATOR_PRIORITY_UNUSABLE && self.state != LocatorState::Down
    }

    fn from_record(record: LocatorRecord) -> Self {
        Locator {
            addr: record.address,
            priority: record.priority,
            weight: record.weight,
            mpriority: record.mpriority,
            mweight: record.mweight,
            state: if record.reachable { LocatorState::Up } else { LocatorState::Down },
            probing: ProbingState::default(),
            rtrs: Vec::new(),
        }
    }

    fn to_record(&self, local: bool) -> LocatorRecord {
        LocatorRecord {
            priority: self.priority,
            weight: self.weight,
            mpriority: self.mpriority,
            mweight: self.mweight,
            local,
            probed: false,
            reachable: self.state != LocatorState::Down,
            address: self.addr.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub eid: EidPrefix,
    pub ttl_minutes: u32,
    pub action: MapReplyAction,
    pub authoritative: bool,
    locators: Vec<Locator>,
}

impl Mapping {
    pub fn new(eid: EidPrefix, ttl_minutes: u32) -> Self {
        Mapping {
            eid,
            ttl_minutes,
            action: MapReplyAction::NoAction,
            authoritative: false,
            locators: Vec::new(),
        }
    }

    /// A mapping with no locators and an action, e.g. the negative entry
    /// installed when a map-request times out.
    pub fn negative(eid: EidPrefix, ttl_minutes: u32, action: MapReplyAction) -> Self {
        Mapping { eid, ttl_minutes, action, authoritative: false, locators: Vec::new() }
    }

    pub fn locators(&self) -> &[Locator] {
        &self.locators
    }

    pub fn locators_mut(&mut self) -> &mut [Locator] {
        &mut self.locators
    }

    pub fn locator_count(&self) -> usize {
        self.locators.len()
    }

    /// Locator addresses within a mapping are pairwise distinct.
    pub fn add_locator(&mut self, locator: Locator) -> Result<(), StoreError> {
        if self.locators.iter().any(|l| l.addr == locator.addr) {
            return Err(StoreError::Exists);
        }
        self.locators.push(locator);
        Ok(())
    }

    pub fn locator(&self, addr: &Address) -> Option<&Locator> {
        self.locators.iter().find(|l| &l.addr == addr)
    }

    pub fn locator_mut(&mut self, addr: &Address) -> Option<&mut Locator> {
        self.locators.iter_mut().find(|l| &l.addr == addr)
    }

    pub fn from_record(record: MappingRecord) -> Result<Self, StoreError> {
        let (iid, address) = record.eid.split_iid();
        let eid = EidPrefix::new(address, record.mask_len, iid)?;
        let mut mapping = Mapping {
            eid,
            ttl_minutes: record.ttl_minutes,
            action: record.action,
            authoritative: record.authoritative,
            locators: Vec::with_capacity(record.locators.len()),
        };
        for locator in record.locators {
            mapping.add_locator(Locator::from_record(locator))?;
        }
        Ok(mapping)
    }

    pub fn to_record(&self) -> MappingRecord {
        self.to_record_with(false)
    }

    /// As `to_record`, with the L bit set on every locator; used when the
    /// mapping being emitted is our own (map-register).
    pub fn to_record_local(&self) -> MappingRecord {
        self.to_record_with(true)
    }

    fn to_record_with(&self, local: bool) -> MappingRecord {
        MappingRecord {
            ttl_minutes: self.ttl_minutes,
            mask_len: self.eid.mask_len(),
            action: self.action,
            authoritative: self.authoritative,
            map_version: 0,
            eid: self.eid.to_wire_address(),
            locators: self.locators.iter().map(|l| l.to_record(local)).collect(),
        }
    }

    /// Pick the forwarding locator for `dst`: lowest usable priority class,
    /// weight-balanced within the class. The choice is stable per
    /// destination (keyed by a hash of the address) so flows do not flap
    /// between equal-weight locators.
    pub fn select_rloc(&self, dst: IpAddr) -> Option<&Locator> {
        let best = self.locators.iter().filter(|l| l.usable()).map(|l| l.priority).min()?;
        let class: Vec<&Locator> =
            self.locators.iter().filter(|l| l.usable() && l.priority == best).collect();
        let total: u32 = class.iter().map(|l| l.weight as u32).sum();
        if total == 0 {
            return class.first().copied();
        }
        let state = RandomState::with_seeds(0x6c69, 0x7370, 0x6421, 0x0);
        let mut point = (state.hash_one(dst) % total as u64) as u32;
        for locator in &class {
            let w = locator.weight as u32;
            if point < w {
                return Some(locator);
            }
            point -= w;
        }
        class.last().copied()
    }
}
