use std::net::{IpAddr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use etherparse::{IpNumber, Ipv4Header, Ipv6Header, UdpHeader};

use super::address::Address;
use super::records::{AuthField, EidPrefixRecord, MappingRecord, RtrAuthField};
use super::{need, DecodeError};

pub const TYPE_MAP_REQUEST: u8 = 1;
pub const TYPE_MAP_REPLY: u8 = 2;
pub const TYPE_MAP_REGISTER: u8 = 3;
pub const TYPE_MAP_NOTIFY: u8 = 4;
pub const TYPE_MAP_REFERRAL: u8 = 6;
pub const TYPE_INFO: u8 = 7;
pub const TYPE_ENCAPSULATED: u8 = 8;

/// A parsed LISP control message. The first nibble of the first byte
/// selects the kind; info-request and info-reply share type 7 and are told
/// apart by the R bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    MapRequest(MapRequest),
    MapReply(MapReply),
    MapRegister(MapRegister),
    MapNotify(MapNotify),
    MapReferral(MapReferral),
    InfoRequest(Info),
    InfoReply(Info),
    Encapsulated(Ecm),
}

impl Message {
    pub fn parse(bytes: &[u8]) -> Result<Message, DecodeError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        need(&buf, 4)?;
        let msg_type = bytes[0] >> 4;
        let msg = match msg_type {
            TYPE_MAP_REQUEST => Message::MapRequest(MapRequest::decode(&mut buf)?),
            TYPE_MAP_REPLY => Message::MapReply(MapReply::decode(&mut buf)?),
            TYPE_MAP_REGISTER => Message::MapRegister(MapRegister::decode(&mut buf)?),
            TYPE_MAP_NOTIFY => Message::MapNotify(MapNotify::decode(&mut buf)?),
            TYPE_MAP_REFERRAL => Message::MapReferral(MapReferral::decode(&mut buf)?),
            TYPE_INFO => {
                let info = Info::decode(&mut buf)?;
                if info.reply() {
                    Message::InfoReply(info)
                } else {
                    Message::InfoRequest(info)
                }
            }
            TYPE_ENCAPSULATED => Message::Encapsulated(Ecm::decode(&mut buf)?),
            other => return Err(DecodeError::UnknownType(other)),
        };
        if buf.has_remaining() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(msg)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            Message::MapRequest(m) => m.encode(&mut buf),
            Message::MapReply(m) => m.encode(&mut buf),
            Message::MapRegister(m) => m.encode(&mut buf),
            Message::MapNotify(m) => m.encode(&mut buf),
            Message::MapReferral(m) => m.encode(&mut buf),
            Message::InfoRequest(m) => m.encode(&mut buf, false),
            Message::InfoReply(m) => m.encode(&mut buf, true),
            Message::Encapsulated(m) => m.encode(&mut buf),
        }
        buf.to_vec()
    }

    pub fn nonce(&self) -> Option<u64> {
        match self {
            Message::MapRequest(m) => Some(m.nonce),
            Message::MapReply(m) => Some(m.nonce),
            Message::MapRegister(m) => Some(m.nonce),
            Message::MapNotify(m) => Some(m.nonce),
            Message::MapReferral(m) => Some(m.nonce),
            Message::InfoRequest(m) | Message::InfoReply(m) => Some(m.nonce),
            Message::Encapsulated(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::MapRequest(_) => "map-request",
            Message::MapReply(_) => "map-reply",
            Message::MapRegister(_) => "map-register",
            Message::MapNotify(_) => "map-notify",
            Message::MapReferral(_) => "map-referral",
            Message::InfoRequest(_) => "info-request",
            Message::InfoReply(_) => "info-reply",
            Message::Encapsulated(_) => "encapsulated-control-message",
        }
    }
}

//
// Map-Request (RFC 6830):
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |Type=1 |A|M|P|S|p|s|    Reserved     |   IRC   | Record Count  |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                         Nonce . . .                           |
// |                         . . . Nonce                           |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |         Source-EID-AFI        |   Source EID Address  ...     |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |         ITR-RLOC-AFI 1        |    ITR-RLOC Address 1  ...    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                   EID-prefix records ...                      |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                Map-Reply Record (when M=1) ...                |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRequest {
    pub authoritative: bool,
    pub probe: bool,
    pub smr: bool,
    pub pitr: bool,
    pub smr_invoked: bool,
    pub nonce: u64,
    pub source_eid: Address,
    pub itr_rlocs: Vec<Address>,
    pub records: Vec<EidPrefixRecord>,
    /// Present when the M bit is set.
    pub map_reply: Option<MappingRecord>,
}

impl MapRequest {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 4)?;
        let b0 = buf.get_u8();
        let b1 = buf.get_u8();
        let b2 = buf.get_u8();
        let record_count = buf.get_u8();
        let authoritative = b0 & 0x08 != 0;
        let map_data = b0 & 0x04 != 0;
        let probe = b0 & 0x02 != 0;
        let smr = b0 & 0x01 != 0;
        let pitr = b1 & 0x80 != 0;
        let smr_invoked = b1 & 0x40 != 0;
        let itr_count = (b2 & 0x1f) as usize + 1;
        need(buf, 8)?;
        let nonce = buf.get_u64();
        let source_eid = Address::decode(buf)?;
        let mut itr_rlocs = Vec::with_capacity(itr_count);
        for _ in 0..itr_count {
            itr_rlocs.push(Address::decode(buf)?);
        }
        let mut records = Vec::with_capacity(record_count as usize);
        for _ in 0..record_count {
            records.push(EidPrefixRecord::decode(buf)?);
        }
        let map_reply = if map_data { Some(MappingRecord::decode(buf)?) } else { None };
        Ok(MapRequest {
            authoritative,
            probe,
            smr,
            pitr,
            smr_invoked,
            nonce,
            source_eid,
            itr_rlocs,
            records,
            map_reply,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut b0 = TYPE_MAP_REQUEST << 4;
        if self.authoritative {
            b0 |= 0x08;
        }
        if self.map_reply.is_some() {
            b0 |= 0x04;
        }
        if self.probe {
            b0 |= 0x02;
        }
        if self.smr {
            b0 |= 0x01;
        }
        buf.put_u8(b0);
        let mut b1 = 0u8;
        if self.pitr {
            b1 |= 0x80;
        }
        if self.smr_invoked {
            b1 |= 0x40;
        }
        buf.put_u8(b1);
        buf.put_u8((self.itr_rlocs.len().saturating_sub(1) as u8) & 0x1f);
        buf.put_u8(self.records.len() as u8);
        buf.put_u64(self.nonce);
        self.source_eid.encode(buf);
        for rloc in &self.itr_rlocs {
            rloc.encode(buf);
        }
        for record in &self.records {
            record.encode(buf);
        }
        if let Some(map_reply) = &self.map_reply {
            map_reply.encode(buf);
        }
    }
}

//
// Map-Reply (RFC 6830):
//
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |Type=2 |P|E|S|          Reserved               | Record Count  |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                         Nonce . . .                           |
// |                         . . . Nonce                           |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                     Mapping records ...                       |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapReply {
    pub probe: bool,
    pub echo_nonce: bool,
    pub security: bool,
    pub nonce: u64,
    pub records: Vec<MappingRecord>,
}

impl MapReply {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 4)?;
        let b0 = buf.get_u8();
        buf.advance(2);
        let record_count = buf.get_u8();
        need(buf, 8)?;
        let nonce = buf.get_u64();
        let mut records = Vec::with_capacity(record_count as usize);
        for _ in 0..record_count {
            records.push(MappingRecord::decode(buf)?);
        }
        Ok(MapReply {
            probe: b0 & 0x08 != 0,
            echo_nonce: b0 & 0x04 != 0,
            security: b0 & 0x02 != 0,
            nonce,
            records,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut b0 = TYPE_MAP_REPLY << 4;
        if self.probe {
            b0 |= 0x08;
        }
        if self.echo_nonce {
            b0 |= 0x04;
        }
        if self.security {
            b0 |= 0x02;
        }
        buf.put_u8(b0);
        buf.put_u16(0);
        buf.put_u8(self.records.len() as u8);
        buf.put_u64(self.nonce);
        for record in &self.records {
            record.encode(buf);
        }
    }
}

//
// Map-Register (RFC 6833, xTR-ID extension from the NAT-traversal draft):
//
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |Type=3 |P|S|I|R|          Reserved           |M| Record Count  |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                         Nonce . . .                           |
// |                         . . . Nonce                           |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |            Key ID             |  Authentication Data Length   |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// ~                     Authentication Data                       ~
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                     Mapping records ...                       |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |        xTR-ID (128 bits) + site-ID (64 bits) when I=1         |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRegister {
    pub proxy_reply: bool,
    pub security: bool,
    pub rtr_relayed: bool,
    pub want_map_notify: bool,
    pub nonce: u64,
    pub auth: AuthField,
    pub records: Vec<MappingRecord>,
    /// Present when the I bit is set.
    pub xtr_id: Option<XtrId>,
}

/// Offset of the auth-data bytes within the encoded message; the HMAC is
/// computed with these bytes zeroed.
pub const REGISTER_AUTH_DATA_OFFSET: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XtrId {
    pub xtr_id: [u8; 16],
    pub site_id: u64,
}

impl MapRegister {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 4)?;
        let b0 = buf.get_u8();
        buf.advance(1);
        let b2 = buf.get_u8();
        let record_count = buf.get_u8();
        need(buf, 8)?;
        let nonce = buf.get_u64();
        let auth = AuthField::decode(buf)?;
        let mut records = Vec::with_capacity(record_count as usize);
        for _ in 0..record_count {
            records.push(MappingRecord::decode(buf)?);
        }
        let xtr_id_present = b0 & 0x02 != 0;
        let xtr_id = if xtr_id_present {
            need(buf, 24)?;
            let mut id = [0u8; 16];
            buf.copy_to_slice(&mut id);
            let site_id = buf.get_u64();
            Some(XtrId { xtr_id: id, site_id })
        } else {
            None
        };
        Ok(MapRegister {
            proxy_reply: b0 & 0x08 != 0,
            security: b0 & 0x04 != 0,
            rtr_relayed: b0 & 0x01 != 0,
            want_map_notify: b2 & 0x01 != 0,
            nonce,
            auth,
            records,
            xtr_id,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut b0 = TYPE_MAP_REGISTER << 4;
        if self.proxy_reply {
            b0 |= 0x08;
        }
        if self.security {
            b0 |= 0x04;
        }
        if self.xtr_id.is_some() {
            b0 |= 0x02;
        }
        if self.rtr_relayed {
            b0 |= 0x01;
        }
        buf.put_u8(b0);
        buf.put_u8(0);
        buf.put_u8(if self.want_map_notify { 0x01 } else { 0x00 });
        buf.put_u8(self.records.len() as u8);
        buf.put_u64(self.nonce);
        self.auth.encode(buf);
        for record in &self.records {
            record.encode(buf);
        }
        if let Some(xtr_id) = &self.xtr_id {
            buf.put_slice(&xtr_id.xtr_id);
            buf.put_u64(xtr_id.site_id);
        }
    }
}

//
// Map-Notify (RFC 6833), the acknowledged mirror of a map-register:
//
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |Type=4 |              Reserved               | Record Count    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                         Nonce / Key ID / Auth ...             |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapNotify {
    pub nonce: u64,
    pub auth: AuthField,
    pub records: Vec<MappingRecord>,
}

pub const NOTIFY_AUTH_DATA_OFFSET: usize = 16;

impl MapNotify {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 4)?;
        buf.advance(3);
        let record_count = buf.get_u8();
        need(buf, 8)?;
        let nonce = buf.get_u64();
        let auth = AuthField::decode(buf)?;
        let mut records = Vec::with_capacity(record_count as usize);
        for _ in 0..record_count {
            records.push(MappingRecord::decode(buf)?);
        }
        Ok(MapNotify { nonce, auth, records })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(TYPE_MAP_NOTIFY << 4);
        buf.put_u16(0);
        buf.put_u8(self.records.len() as u8);
        buf.put_u64(self.nonce);
        self.auth.encode(buf);
        for record in &self.records {
            record.encode(buf);
        }
    }
}

/// Map-Referral (type 6): carries mapping records pointing the requester at
/// a better map-server, same record layout as a map-reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapReferral {
    pub nonce: u64,
    pub records: Vec<MappingRecord>,
}

impl MapReferral {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 4)?;
        buf.advance(3);
        let record_count = buf.get_u8();
        need(buf, 8)?;
        let nonce = buf.get_u64();
        let mut records = Vec::with_capacity(record_count as usize);
        for _ in 0..record_count {
            records.push(MappingRecord::decode(buf)?);
        }
        Ok(MapReferral { nonce, records })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(TYPE_MAP_REFERRAL << 4);
        buf.put_u16(0);
        buf.put_u8(self.records.len() as u8);
        buf.put_u64(self.nonce);
        for record in &self.records {
            record.encode(buf);
        }
    }
}

//
// Info-Request / Info-Reply (LISP NAT-traversal). The R bit tells them
// apart; the body after the EID prefix is AFI 0 in a request and a
// NAT-traversal LCAF in a reply.
//
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |Type=7 |R|               Reserved                              |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                         Nonce . . .                           |
// |                         . . . Nonce                           |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |            Key ID             |  Authentication Data Length   |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// ~                     Authentication Data                       ~
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                              TTL                              |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |   Reserved    | EID mask-len  |        EID-prefix-AFI         |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                          EID-prefix                           |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |            AFI = 0 (request) / NAT LCAF (reply)               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub nonce: u64,
    pub auth: AuthField,
    pub ttl_minutes: u32,
    pub mask_len: u8,
    pub eid: Address,
    /// `NoAddress` in a request, a NAT-traversal LCAF in a reply.
    pub body: Address,
}

pub const INFO_AUTH_DATA_OFFSET: usize = 16;

impl Info {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 4)?;
        let b0 = buf.get_u8();
        buf.advance(3);
        let reply = b0 & 0x08 != 0;
        need(buf, 8)?;
        let nonce = buf.get_u64();
        let auth = AuthField::decode(buf)?;
        need(buf, 6)?;
        let ttl_minutes = buf.get_u32();
        let _rsvd = buf.get_u8();
        let mask_len = buf.get_u8();
        let eid = Address::decode(buf)?;
        let body = Address::decode(buf)?;
        let info = Info { nonce, auth, ttl_minutes, mask_len, eid, body };
        // The body must agree with the R bit.
        if reply != info.reply() {
            return Err(DecodeError::MalformedAddress);
        }
        Ok(info)
    }

    fn encode(&self, buf: &mut BytesMut, reply: bool) {
        let mut b0 = TYPE_INFO << 4;
        if reply {
            b0 |= 0x08;
        }
        buf.put_u8(b0);
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_u64(self.nonce);
        self.auth.encode(buf);
        buf.put_u32(self.ttl_minutes);
        buf.put_u8(0);
        buf.put_u8(self.mask_len);
        self.eid.encode(buf);
        self.body.encode(buf);
    }

    pub fn reply(&self) -> bool {
        !matches!(self.body, Address::NoAddress)
    }
}

//
// Encapsulated Control Message (type 8): a LISP header in front of a full
// inner IP + UDP + LISP control packet. With S=1 an RTR auth field sits
// between the ECM header and the inner packet (NAT-traversal).
//
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |Type=8 |S|                  Reserved                           |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// ~                 RTR auth field (when S=1)                     ~
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                 inner IP + UDP + LISP message                 |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ecm {
    pub rtr_auth: Option<RtrAuthField>,
    pub inner: InnerPacket,
}

/// The decapsulated addressing of the inner packet plus the raw bytes of
/// the inner LISP message. Kept as bytes so a relay can re-emit them
/// untouched and an endpoint can run `Message::parse` on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerPacket {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub ttl: u8,
    pub ip_id: u16,
    pub payload: Vec<u8>,
}

impl Ecm {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 4)?;
        let b0 = buf.get_u8();
        buf.advance(3);
        let security = b0 & 0x08 != 0;
        let rtr_auth = if security { Some(RtrAuthField::decode(buf)?) } else { None };
        let inner = InnerPacket::decode(buf)?;
        Ok(Ecm { rtr_auth, inner })
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut b0 = TYPE_ENCAPSULATED << 4;
        if self.rtr_auth.is_some() {
            b0 |= 0x08;
        }
        buf.put_u8(b0);
        buf.put_u8(0);
        buf.put_u16(0);
        if let Some(rtr_auth) = &self.rtr_auth {
            rtr_auth.encode(buf);
        }
        self.inner.encode(buf);
    }
}

impl InnerPacket {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        if !buf.has_remaining() {
            return Err(DecodeError::TruncatedRecord);
        }
        let bytes = buf.split_off(0);
        let version = bytes[0] >> 4;
        let (src_ip, dst_ip, ttl, ip_id, after_ip): (IpAddr, IpAddr, u8, u16, &[u8]) =
            match version {
                4 => {
                    let (hdr, rest) = Ipv4Header::from_slice(&bytes)
                        .map_err(|e| DecodeError::BadInnerPacket(e.to_string()))?;
                    if hdr.protocol != IpNumber::UDP {
                        return Err(DecodeError::BadInnerPacket("not UDP".into()));
                    }
                    (
                        IpAddr::from(hdr.source),
                        IpAddr::from(hdr.destination),
                        hdr.time_to_live,
                        hdr.identification,
                        rest,
                    )
                }
                6 => {
                    let (hdr, rest) = Ipv6Header::from_slice(&bytes)
                        .map_err(|e| DecodeError::BadInnerPacket(e.to_string()))?;
                    if hdr.next_header != IpNumber::UDP {
                        return Err(DecodeError::BadInnerPacket("not UDP".into()));
                    }
                    (IpAddr::from(hdr.source), IpAddr::from(hdr.destination), hdr.hop_limit, 0, rest)
                }
                other => {
                    return Err(DecodeError::BadInnerPacket(format!("IP version {other}")));
                }
            };
        let (udp, payload) = UdpHeader::from_slice(after_ip)
            .map_err(|e| DecodeError::BadInnerPacket(e.to_string()))?;
        let udp_payload_len = (udp.length as usize)
            .checked_sub(UdpHeader::LEN)
            .ok_or_else(|| DecodeError::BadInnerPacket("bad UDP length".into()))?;
        if payload.len() < udp_payload_len {
            return Err(DecodeError::TruncatedRecord);
        }
        Ok(InnerPacket {
            src: SocketAddr::new(src_ip, udp.source_port),
            dst: SocketAddr::new(dst_ip, udp.destination_port),
            ttl,
            ip_id,
            payload: payload[..udp_payload_len].to_vec(),
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        match (self.src.ip(), self.dst.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                let udp_len = UdpHeader::LEN + self.payload.len();
                // A control message never approaches the u16 length cap;
                // if it somehow did, emit nothing rather than a bad header.
                let Ok(mut ip) = Ipv4Header::new(
                    udp_len as u16,
                    self.ttl,
                    IpNumber::UDP,
                    src.octets(),
                    dst.octets(),
                ) else {
                    return;
                };
                ip.identification = self.ip_id;
                ip.header_checksum = ip.calc_header_checksum();
                buf.put_slice(&ip.to_bytes());
                // Checksum 0 is legal for UDP over IPv4.
                let udp = UdpHeader {
                    source_port: self.src.port(),
                    destination_port: self.dst.port(),
                    length: udp_len as u16,
                    checksum: 0,
                };
                buf.put_slice(&udp.to_bytes());
                buf.put_slice(&self.payload);
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                let udp_len = UdpHeader::LEN + self.payload.len();
                let ip = Ipv6Header {
                    traffic_class: 0,
                    flow_label: Default::default(),
                    payload_length: udp_len as u16,
                    next_header: IpNumber::UDP,
                    hop_limit: self.ttl,
                    source: src.octets(),
                    destination: dst.octets(),
                };
                let mut ip_bytes = Vec::with_capacity(Ipv6Header::LEN);
                if ip.write(&mut ip_bytes).is_err() {
                    return;
                }
                let Ok(udp) = UdpHeader::with_ipv6_checksum(
                    self.src.port(),
                    self.dst.port(),
                    &ip,
                    &self.payload,
                ) else {
                    return;
                };
                buf.put_slice(&ip_bytes);
                buf.put_slice(&udp.to_bytes());
                buf.put_slice(&self.payload);
            }
            // Mixed families cannot be encapsulated; emit nothing rather
            // than a malformed inner packet.
            _ => {}
        }
    }
}
