use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::address::Address;
use super::{need, DecodeError};

/// Action carried in a mapping record with zero usable locators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapReplyAction {
    #[default]
    NoAction,
    NativelyForward,
    SendMapRequest,
    Drop,
}

impl MapReplyAction {
    pub fn from_wire(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(MapReplyAction::NoAction),
            1 => Ok(MapReplyAction::NativelyForward),
            2 => Ok(MapReplyAction::SendMapRequest),
            3 => Ok(MapReplyAction::Drop),
            _ => Err(DecodeError::MalformedAddress),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            MapReplyAction::NoAction => 0,
            MapReplyAction::NativelyForward => 1,
            MapReplyAction::SendMapRequest => 2,
            MapReplyAction::Drop => 3,
        }
    }
}

//
// Locator record, one per RLOC in a mapping record:
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |    Priority   |    Weight     |  M Priority   |   M Weight    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |        Unused Flags     |L|p|R|           Loc-AFI             |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                             Locator                           |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorRecord {
    pub priority: u8,
    pub weight: u8,
    pub mpriority: u8,
    pub mweight: u8,
    pub local: bool,
    pub probed: bool,
    pub reachable: bool,
    pub address: Address,
}

const LOC_FLAG_LOCAL: u16 = 0x0004;
const LOC_FLAG_PROBED: u16 = 0x0002;
const LOC_FLAG_REACHABLE: u16 = 0x0001;

impl LocatorRecord {
    pub fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 6)?;
        let priority = buf.get_u8();
        let weight = buf.get_u8();
        let mpriority = buf.get_u8();
        let mweight = buf.get_u8();
        let flags = buf.get_u16();
        let address = Address::decode(buf)?;
        Ok(LocatorRecord {
            priority,
            weight,
            mpriority,
            mweight,
            local: flags & LOC_FLAG_LOCAL != 0,
            probed: flags & LOC_FLAG_PROBED != 0,
            reachable: flags & LOC_FLAG_REACHABLE != 0,
            address,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.priority);
        buf.put_u8(self.weight);
        buf.put_u8(self.mpriority);
        buf.put_u8(self.mweight);
        let mut flags = 0u16;
        if self.local {
            flags |= LOC_FLAG_LOCAL;
        }
        if self.probed {
            flags |= LOC_FLAG_PROBED;
        }
        if self.reachable {
            flags |= LOC_FLAG_REACHABLE;
        }
        buf.put_u16(flags);
        self.address.encode(buf);
    }
}

//
// Mapping record, shared by map-reply, map-register, map-notify and the
// map-data section of a map-request:
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                          Record TTL                           |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | Locator Count | EID mask-len  | ACT |A|      Reserved         |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | Rsvd  |  Map-Version Number   |            EID-AFI            |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                          EID-prefix                           |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                      Locator records ...                      |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRecord {
    pub ttl_minutes: u32,
    pub mask_len: u8,
    pub action: MapReplyAction,
    pub authoritative: bool,
    pub map_version: u16,
    /// Possibly instance-id wrapped.
    pub eid: Address,
    pub locators: Vec<LocatorRecord>,
}

impl MappingRecord {
    pub fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 10)?;
        let ttl_minutes = buf.get_u32();
        let locator_count = buf.get_u8();
        let mask_len = buf.get_u8();
        let act_auth = buf.get_u8();
        let _rsvd = buf.get_u8();
        let map_version = buf.get_u16() & 0x0fff;
        let action = MapReplyAction::from_wire(act_auth >> 5)?;
        let authoritative = act_auth & 0x10 != 0;
        let eid = Address::decode(buf)?;

        let mut locators = Vec::with_capacity(locator_count as usize);
        for _ in 0..locator_count {
            // The locator count promised more bytes than the record bound
            // supplies: that is an overflow, not a plain truncation.
            let locator = LocatorRecord::decode(buf).map_err(|e| match e {
                DecodeError::TruncatedRecord => DecodeError::LocatorOverflow,
                other => other,
            })?;
            locators.push(locator);
        }
        Ok(MappingRecord {
            ttl_minutes,
            mask_len,
            action,
            authoritative,
            map_version,
            eid,
            locators,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ttl_minutes);
        buf.put_u8(self.locators.len() as u8);
        buf.put_u8(self.mask_len);
        let mut act_auth = self.action.to_wire() << 5;
        if self.authoritative {
            act_auth |= 0x10;
        }
        buf.put_u8(act_auth);
        buf.put_u8(0);
        buf.put_u16(self.map_version & 0x0fff);
        self.eid.encode(buf);
        for locator in &self.locators {
            locator.encode(buf);
        }
    }
}

//
// EID-prefix record, one per requested prefix in a map-request:
//
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |   Reserved    | EID mask-len  |        EID-prefix-AFI         |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                          EID-prefix                           |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EidPrefixRecord {
    pub mask_len: u8,
    /// Possibly instance-id wrapped.
    pub eid: Address,
}

impl EidPrefixRecord {
    pub fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 2)?;
        let _rsvd = buf.get_u8();
        let mask_len = buf.get_u8();
        let eid = Address::decode(buf)?;
        Ok(EidPrefixRecord { mask_len, eid })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(0);
        buf.put_u8(self.mask_len);
        self.eid.encode(buf);
    }
}

/// Authentication field of map-register, map-notify and the info messages.
/// The auth data bytes are zeroed while the HMAC is computed over the whole
/// message, then filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthField {
    pub key_id: u16,
    pub data: Vec<u8>,
}

impl AuthField {
    /// A zero-filled field sized for the algorithm selected by `key_id`,
    /// ready to be overwritten after HMAC computation.
    pub fn placeholder(key_id: u16, mac_len: usize) -> Self {
        AuthField { key_id, data: vec![0; mac_len] }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 4)?;
        let key_id = buf.get_u16();
        let len = buf.get_u16() as usize;
        need(buf, len)?;
        let data = buf.split_to(len).to_vec();
        Ok(AuthField { key_id, data })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.key_id);
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
    }

    pub fn wire_len(&self) -> usize {
        4 + self.data.len()
    }
}

/// Only RTR auth data is understood.
pub const RTR_AUTH_DATA: u8 = 1;

//
// RTR authentication field appended to an encapsulated control message when
// its S bit is set (LISP NAT-traversal):
//
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |    AD Type    |                   Reserved                    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |         MS-RTR Key ID         |   MS-RTR Auth. Data Length    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// ~                  MS-RTR Authentication Data                   ~
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtrAuthField {
    pub key_id: u16,
    pub data: Vec<u8>,
}

impl RtrAuthField {
    pub fn placeholder(key_id: u16, mac_len: usize) -> Self {
        RtrAuthField { key_id, data: vec![0; mac_len] }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 8)?;
        let ad_type = buf.get_u8();
        if ad_type != RTR_AUTH_DATA {
            return Err(DecodeError::MalformedAddress);
        }
        buf.advance(3);
        let key_id = buf.get_u16();
        let len = buf.get_u16() as usize;
        need(buf, len)?;
        let data = buf.split_to(len).to_vec();
        Ok(RtrAuthField { key_id, data })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(RTR_AUTH_DATA);
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_u16(self.key_id);
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
    }

    pub fn wire_len(&self) -> usize {
        8 + self.data.len()
    }
}
