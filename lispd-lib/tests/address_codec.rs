use bytes::{Bytes, BytesMut};
use lispd_lib::msg::{Address, DecodeError, LcafAddress, AFI_LCAF};
use std::net::{Ipv4Addr, Ipv6Addr};

fn round_trip(address: Address) {
    let mut buf = BytesMut::new();
    address.encode(&mut buf);
    assert_eq!(buf.len(), address.wire_len(), "wire_len must match the encoding");
    let mut bytes = Bytes::from(buf.to_vec());
    let decoded = Address::decode(&mut bytes).expect("decode");
    assert!(bytes.is_empty(), "decode must consume the whole encoding");
    assert_eq!(decoded, address);
}

#[test]
fn plain_addresses_round_trip() {
    round_trip(Address::Ipv4(Ipv4Addr::new(192, 0, 2, 1)));
    round_trip(Address::Ipv6("2001:db8::1".parse::<Ipv6Addr>().unwrap()));
    round_trip(Address::NoAddress);
}

#[test]
fn instance_id_lcaf_round_trips() {
    round_trip(Address::Lcaf(LcafAddress::InstanceId {
        iid: 27,
        address: Box::new(Address::Ipv4(Ipv4Addr::new(10, 0, 0, 0))),
    }));
    // Nested v6 inner address.
    round_trip(Address::Lcaf(LcafAddress::InstanceId {
        iid: u32::MAX,
        address: Box::new(Address::Ipv6("2001:db8::2".parse::<Ipv6Addr>().unwrap())),
    }));
}

#[test]
fn nat_traversal_lcaf_round_trips() {
    round_trip(Address::Lcaf(LcafAddress::NatTraversal {
        ms_port: 4342,
        etr_port: 61001,
        global_etr: Box::new(Address::Ipv4(Ipv4Addr::new(203, 0, 113, 1))),
        ms: Box::new(Address::Ipv4(Ipv4Addr::new(192, 0, 2, 2))),
        private_etr: Box::new(Address::Ipv4(Ipv4Addr::new(10, 0, 0, 9))),
        rtrs: vec![
            Address::Ipv4(Ipv4Addr::new(198, 51, 100, 7)),
            Address::Ipv6("2001:db8::7".parse::<Ipv6Addr>().unwrap()),
        ],
    }));
}

#[test]
fn nat_traversal_with_empty_rtr_list_round_trips() {
    round_trip(Address::Lcaf(LcafAddress::NatTraversal {
        ms_port: 4342,
        etr_port: 4342,
        global_etr: Box::new(Address::Ipv4(Ipv4Addr::new(203, 0, 113, 1))),
        ms: Box::new(Address::NoAddress),
        private_etr: Box::new(Address::NoAddress),
        rtrs: Vec::new(),
    }));
}

#[test]
fn unknown_afi_is_reported() {
    let mut bytes = Bytes::from_static(&[0x00, 0x03, 0xde, 0xad]);
    assert_eq!(Address::decode(&mut bytes), Err(DecodeError::UnknownAfi(3)));
}

#[test]
fn unknown_lcaf_type_reports_skippable_length() {
    // AFI 16387, LCAF type 9, 4 payload bytes.
    let mut raw = Vec::new();
    raw.extend_from_slice(&AFI_LCAF.to_be_bytes());
    raw.extend_from_slice(&[0, 0, 9, 0, 0, 4, 1, 2, 3, 4]);
    let total = raw.len();
    let mut bytes = Bytes::from(raw);
    assert_eq!(
        Address::decode(&mut bytes),
        Err(DecodeError::UnknownLcafType { lcaf_type: 9, skip: total })
    );
}

#[test]
fn truncated_addresses_fail_cleanly() {
    // AFI says IPv4 but only two payload bytes follow.
    let mut bytes = Bytes::from_static(&[0x00, 0x01, 10, 0]);
    assert_eq!(Address::decode(&mut bytes), Err(DecodeError::TruncatedRecord));

    // LCAF header length larger than the remaining buffer.
    let mut raw = Vec::new();
    raw.extend_from_slice(&AFI_LCAF.to_be_bytes());
    raw.extend_from_slice(&[0, 0, 2, 0, 0, 50, 0, 0]);
    let mut bytes = Bytes::from(raw);
    assert_eq!(Address::decode(&mut bytes), Err(DecodeError::TruncatedRecord));
}

#[test]
fn lcaf_length_must_cover_exactly_its_payload() {
    // Instance-id LCAF whose length claims two extra bytes of payload.
    let inner = Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1));
    let mut buf = BytesMut::new();
    Address::Lcaf(LcafAddress::InstanceId { iid: 1, address: Box::new(inner) }).encode(&mut buf);
    let mut raw = buf.to_vec();
    raw[7] += 2; // low byte of the LCAF length
    raw.extend_from_slice(&[0, 0]);
    let mut bytes = Bytes::from(raw);
    assert_eq!(Address::decode(&mut bytes), Err(DecodeError::MalformedAddress));
}

#[test]
fn iid_wrapping_helpers_are_inverses() {
    let plain = Address::Ipv4(Ipv4Addr::new(10, 1, 2, 3));
    let wrapped = plain.clone().with_iid(Some(7));
    assert!(matches!(wrapped, Address::Lcaf(_)));
    let (iid, inner) = wrapped.split_iid();
    assert_eq!(iid, Some(7));
    assert_eq!(inner, plain);
    assert_eq!(plain.clone().with_iid(None), plain);
}
