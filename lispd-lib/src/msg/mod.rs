mod address;
mod control;
mod records;

use bytes::Buf;
use thiserror::Error;

pub use address::{
    Address, LcafAddress, AFI_IPV4, AFI_IPV6, AFI_LCAF, AFI_NO_ADDR, LCAF_INSTANCE_ID,
    LCAF_NAT_TRAVERSAL,
};
pub use control::{
    Ecm, Info, InnerPacket, MapNotify, MapReferral, MapRegister, MapReply, MapRequest, Message,
    XtrId, INFO_AUTH_DATA_OFFSET, NOTIFY_AUTH_DATA_OFFSET, REGISTER_AUTH_DATA_OFFSET,
    TYPE_ENCAPSULATED, TYPE_INFO, TYPE_MAP_NOTIFY, TYPE_MAP_REFERRAL, TYPE_MAP_REGISTER,
    TYPE_MAP_REPLY, TYPE_MAP_REQUEST,
};
pub use records::{
    AuthField, EidPrefixRecord, LocatorRecord, MapReplyAction, MappingRecord, RtrAuthField,
    RTR_AUTH_DATA,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed address")]
    MalformedAddress,

    #[error("unknown address family {0}")]
    UnknownAfi(u16),

    /// `skip` is the full encoded size of the address (AFI included), so a
    /// caller that knows the enclosing record bound can step over it.
    #[error("unknown LCAF type {lcaf_type} ({skip} bytes)")]
    UnknownLcafType { lcaf_type: u8, skip: usize },

    #[error("message truncated mid-record")]
    TruncatedRecord,

    #[error("locator records overrun the record bound")]
    LocatorOverflow,

    #[error("unknown control message type {0}")]
    UnknownType(u8),

    #[error("trailing bytes after message")]
    TrailingBytes,

    #[error("bad inner packet in encapsulated message: {0}")]
    BadInnerPacket(String),
}

/// Bounds-check a read against the remaining buffer.
fn need(buf: &impl Buf, len: usize) -> Result<(), DecodeError> {
    if buf.remaining() < len {
        Err(DecodeError::TruncatedRecord)
    } else {
        Ok(())
    }
}
