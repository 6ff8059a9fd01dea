use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{need, DecodeError};

pub const AFI_NO_ADDR: u16 = 0;
pub const AFI_IPV4: u16 = 1;
pub const AFI_IPV6: u16 = 2;
pub const AFI_LCAF: u16 = 16387;

pub const LCAF_INSTANCE_ID: u8 = 2;
pub const LCAF_NAT_TRAVERSAL: u8 = 7;

/// A LISP address as it appears on the wire: a 16-bit AFI followed by the
/// address payload. LCAF-wrapped addresses carry extra semantics (instance
/// id, NAT-traversal info) around an inner address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    NoAddress,
    Lcaf(LcafAddress),
}

//
// The LCAF wrapper format is (RFC 8060):
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |           AFI = 16387         |     Rsvd1     |     Flags     |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |    Type       |     Rsvd2     |            Length             |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
// Length counts the bytes that follow it.
//
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LcafAddress {
    /// Type 2: a 32-bit instance id qualifying the inner address.
    InstanceId { iid: u32, address: Box<Address> },
    /// Type 7: NAT-traversal info carried in an info-reply.
    NatTraversal {
        ms_port: u16,
        etr_port: u16,
        global_etr: Box<Address>,
        ms: Box<Address>,
        private_etr: Box<Address>,
        rtrs: Vec<Address>,
    },
}

impl Address {
    pub fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 2)?;
        let afi = buf.get_u16();
        Self::decode_after_afi(afi, buf)
    }

    /// Decode the address payload once the AFI has already been consumed.
    pub fn decode_after_afi(afi: u16, buf: &mut Bytes) -> Result<Self, DecodeError> {
        match afi {
            AFI_NO_ADDR => Ok(Address::NoAddress),
            AFI_IPV4 => {
                need(buf, 4)?;
                Ok(Address::Ipv4(Ipv4Addr::from(buf.get_u32())))
            }
            AFI_IPV6 => {
                need(buf, 16)?;
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                Ok(Address::Ipv6(Ipv6Addr::from(octets)))
            }
            AFI_LCAF => LcafAddress::decode(buf).map(Address::Lcaf),
            other => Err(DecodeError::UnknownAfi(other)),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Address::Ipv4(a) => {
                buf.put_u16(AFI_IPV4);
                buf.put_slice(&a.octets());
            }
            Address::Ipv6(a) => {
                buf.put_u16(AFI_IPV6);
                buf.put_slice(&a.octets());
            }
            Address::NoAddress => buf.put_u16(AFI_NO_ADDR),
            Address::Lcaf(lcaf) => {
                buf.put_u16(AFI_LCAF);
                lcaf.encode(buf);
            }
        }
    }

    /// Encoded size including the leading AFI.
    pub fn wire_len(&self) -> usize {
        match self {
            Address::Ipv4(_) => 2 + 4,
            Address::Ipv6(_) => 2 + 16,
            Address::NoAddress => 2,
            Address::Lcaf(lcaf) => 2 + 6 + lcaf.payload_len(),
        }
    }

    pub fn afi(&self) -> u16 {
        match self {
            Address::Ipv4(_) => AFI_IPV4,
            Address::Ipv6(_) => AFI_IPV6,
            Address::NoAddress => AFI_NO_ADDR,
            Address::Lcaf(_) => AFI_LCAF,
        }
    }

    /// The concrete IP address, looking through an instance-id wrapper.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(a) => Some(IpAddr::V4(*a)),
            Address::Ipv6(a) => Some(IpAddr::V6(*a)),
            Address::Lcaf(LcafAddress::InstanceId { address, .. }) => address.ip(),
            _ => None,
        }
    }

    pub fn is_ip(&self) -> bool {
        self.ip().is_some()
    }

    /// Split an instance-id wrapper into its id and inner address. Plain
    /// addresses come back unchanged with no id.
    pub fn split_iid(self) -> (Option<u32>, Address) {
        match self {
            Address::Lcaf(LcafAddress::InstanceId { iid, address }) => (Some(iid), *address),
            other => (None, other),
        }
    }

    /// Wrap in an instance-id LCAF when an iid is present.
    pub fn with_iid(self, iid: Option<u32>) -> Address {
        match iid {
            Some(iid) => Address::Lcaf(LcafAddress::InstanceId { iid, address: Box::new(self) }),
            None => self,
        }
    }

    /// True when both addresses are IP addresses of the same family.
    pub fn same_family(&self, other: &Address) -> bool {
        match (self.ip(), other.ip()) {
            (Some(a), Some(b)) => a.is_ipv4() == b.is_ipv4(),
            _ => false,
        }
    }
}

impl LcafAddress {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 6)?;
        let _rsvd1 = buf.get_u8();
        let _flags = buf.get_u8();
        let lcaf_type = buf.get_u8();
        let _rsvd2 = buf.get_u8();
        let len = buf.get_u16() as usize;
        need(buf, len)?;
        let mut inner = buf.split_to(len);

        match lcaf_type {
            LCAF_INSTANCE_ID => {
                if inner.remaining() < 4 {
                    return Err(DecodeError::MalformedAddress);
                }
                let iid = inner.get_u32();
                let address = Address::decode(&mut inner)?;
                if inner.has_remaining() {
                    return Err(DecodeError::MalformedAddress);
                }
                Ok(LcafAddress::InstanceId { iid, address: Box::new(address) })
            }
            LCAF_NAT_TRAVERSAL => {
                if inner.remaining() < 4 {
                    return Err(DecodeError::MalformedAddress);
                }
                let ms_port = inner.get_u16();
                let etr_port = inner.get_u16();
                let global_etr = Address::decode(&mut inner)?;
                let ms = Address::decode(&mut inner)?;
                let private_etr = Address::decode(&mut inner)?;
                let mut rtrs = Vec::new();
                while inner.has_remaining() {
                    rtrs.push(Address::decode(&mut inner)?);
                }
                Ok(LcafAddress::NatTraversal {
                    ms_port,
                    etr_port,
                    global_etr: Box::new(global_etr),
                    ms: Box::new(ms),
                    private_etr: Box::new(private_etr),
                    rtrs,
                })
            }
            // The header length still lets the caller skip the whole
            // address: AFI + LCAF header + payload.
            other => Err(DecodeError::UnknownLcafType { lcaf_type: other, skip: 8 + len }),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(self.lcaf_type());
        buf.put_u8(0);
        buf.put_u16(self.payload_len() as u16);
        match self {
            LcafAddress::InstanceId { iid, address } => {
                buf.put_u32(*iid);
                address.encode(buf);
            }
            LcafAddress::NatTraversal { ms_port, etr_port, global_etr, ms, private_etr, rtrs } => {
                buf.put_u16(*ms_port);
                buf.put_u16(*etr_port);
                global_etr.encode(buf);
                ms.encode(buf);
                private_etr.encode(buf);
                for rtr in rtrs {
                    rtr.encode(buf);
                }
            }
        }
    }

    pub fn lcaf_type(&self) -> u8 {
        match self {
            LcafAddress::InstanceId { .. } => LCAF_INSTANCE_ID,
            LcafAddress::NatTraversal { .. } => LCAF_NAT_TRAVERSAL,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            LcafAddress::InstanceId { address, .. } => 4 + address.wire_len(),
            LcafAddress::NatTraversal { global_etr, ms, private_etr, rtrs, .. } => {
                4 + global_etr.wire_len()
                    + ms.wire_len()
                    + private_etr.wire_len()
                    + rtrs.iter().map(Address::wire_len).sum::<usize>()
            }
        }
    }
}

impl From<Ipv4Addr> for Address {
    fn from(a: Ipv4Addr) -> Self {
        Address::Ipv4(a)
    }
}

impl From<Ipv6Addr> for Address {
    fn from(a: Ipv6Addr) -> Self {
        Address::Ipv6(a)
    }
}

impl From<IpAddr> for Address {
    fn from(a: IpAddr) -> Self {
        match a {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(a) => write!(f, "{a}"),
            Address::Ipv6(a) => write!(f, "{a}"),
            Address::NoAddress => write!(f, "-"),
            Address::Lcaf(LcafAddress::InstanceId { iid, address }) => {
                write!(f, "[{iid}]{address}")
            }
            Address::Lcaf(LcafAddress::NatTraversal { global_etr, rtrs, .. }) => {
                write!(f, "nat({global_etr}, {} rtrs)", rtrs.len())
            }
        }
    }
}
