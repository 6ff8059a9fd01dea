use lispd_lib::msg::{
    Address, AuthField, DecodeError, Ecm, EidPrefixRecord, Info, InnerPacket, LcafAddress,
    LocatorRecord, MapNotify, MapReferral, MapRegister, MapReply, MapReplyAction, MapRequest,
    MappingRecord, Message, RtrAuthField, XtrId,
};
use lispd_lib::store::{EidPrefix, Locator, LocatorState, Mapping};
use std::net::Ipv4Addr;

fn v4(a: u8, b: u8, c: u8, d: u8) -> Address {
    Address::Ipv4(Ipv4Addr::new(a, b, c, d))
}

fn locator(addr: Address, priority: u8, weight: u8) -> LocatorRecord {
    LocatorRecord {
        priority,
        weight,
        mpriority: 255,
        mweight: 0,
        local: false,
        probed: false,
        reachable: true,
        address: addr,
    }
}

fn sample_record() -> MappingRecord {
    MappingRecord {
        ttl_minutes: 10,
        mask_len: 24,
        action: MapReplyAction::NoAction,
        authoritative: true,
        map_version: 0,
        eid: v4(10, 0, 0, 0),
        locators: vec![
            locator(v4(198, 51, 100, 1), 1, 100),
            locator(v4(198, 51, 100, 2), 2, 50),
        ],
    }
}

fn round_trip(message: Message) -> Vec<u8> {
    let bytes = message.encode();
    let parsed = Message::parse(&bytes).expect("parse");
    assert_eq!(parsed, message);
    bytes
}

#[test]
fn map_request_round_trips_with_all_flags() {
    round_trip(Message::MapRequest(MapRequest {
        authoritative: true,
        probe: true,
        smr: true,
        pitr: true,
        smr_invoked: true,
        nonce: 0xdead_beef_cafe_f00d,
        source_eid: v4(10, 0, 0, 1).with_iid(Some(27)),
        itr_rlocs: vec![v4(203, 0, 113, 1), v4(203, 0, 113, 2)],
        records: vec![EidPrefixRecord { mask_len: 32, eid: v4(10, 1, 2, 3) }],
        map_reply: Some(sample_record()),
    }));
}

#[test]
fn map_request_flag_bits_land_where_the_spec_says() {
    let bytes = Message::MapRequest(MapRequest {
        authoritative: false,
        probe: true,
        smr: false,
        pitr: false,
        smr_invoked: true,
        nonce: 1,
        source_eid: Address::NoAddress,
        itr_rlocs: vec![v4(203, 0, 113, 1)],
        records: vec![],
        map_reply: None,
    })
    .encode();
    assert_eq!(bytes[0] >> 4, 1, "type nibble");
    assert_eq!(bytes[0] & 0x02, 0x02, "P bit");
    assert_eq!(bytes[0] & 0x0d, 0, "A, M, S clear");
    assert_eq!(bytes[1] & 0x40, 0x40, "s bit");
    assert_eq!(bytes[2] & 0x1f, 0, "IRC = itr count - 1");
}

#[test]
fn map_reply_round_trips_and_preserves_locator_count() {
    let record = sample_record();
    let bytes = round_trip(Message::MapReply(MapReply {
        probe: false,
        echo_nonce: false,
        security: false,
        nonce: 42,
        records: vec![record.clone()],
    }));
    // Wire locator count byte equals the number of locator records.
    // Offset: 4 header + 8 nonce + 4 TTL.
    assert_eq!(bytes[16], record.locators.len() as u8);
}

#[test]
fn map_register_round_trips_with_xtr_id() {
    round_trip(Message::MapRegister(MapRegister {
        proxy_reply: true,
        security: false,
        rtr_relayed: true,
        want_map_notify: true,
        nonce: 0,
        auth: AuthField { key_id: 1, data: vec![0u8; 20] },
        records: vec![sample_record()],
        xtr_id: Some(XtrId { xtr_id: [0xab; 16], site_id: 7 }),
    }));
}

#[test]
fn map_notify_and_referral_round_trip() {
    round_trip(Message::MapNotify(MapNotify {
        nonce: 9,
        auth: AuthField { key_id: 2, data: vec![0u8; 32] },
        records: vec![sample_record()],
    }));
    round_trip(Message::MapReferral(MapReferral { nonce: 11, records: vec![sample_record()] }));
}

#[test]
fn info_request_and_reply_round_trip_and_split_on_r_bit() {
    let request = Info {
        nonce: 77,
        auth: AuthField { key_id: 1, data: vec![0u8; 20] },
        ttl_minutes: 0,
        mask_len: 24,
        eid: v4(10, 0, 0, 0),
        body: Address::NoAddress,
    };
    let bytes = round_trip(Message::InfoRequest(request.clone()));
    assert_eq!(bytes[0] & 0x08, 0, "R clear on a request");

    let reply = Info {
        body: Address::Lcaf(LcafAddress::NatTraversal {
            ms_port: 4342,
            etr_port: 50000,
            global_etr: Box::new(v4(203, 0, 113, 9)),
            ms: Box::new(v4(192, 0, 2, 2)),
            private_etr: Box::new(v4(10, 0, 0, 9)),
            rtrs: vec![v4(198, 51, 100, 7)],
        }),
        ..request
    };
    let bytes = round_trip(Message::InfoReply(reply));
    assert_eq!(bytes[0] & 0x08, 0x08, "R set on a reply");
}

#[test]
fn ecm_round_trips_with_inner_v4_packet() {
    let inner_message = Message::MapRequest(MapRequest {
        authoritative: false,
        probe: false,
        smr: false,
        pitr: false,
        smr_invoked: false,
        nonce: 0x1234,
        source_eid: Address::NoAddress,
        itr_rlocs: vec![v4(203, 0, 113, 1)],
        records: vec![EidPrefixRecord { mask_len: 32, eid: v4(10, 1, 2, 3) }],
        map_reply: None,
    });
    let ecm = Message::Encapsulated(Ecm {
        rtr_auth: None,
        inner: InnerPacket {
            src: "203.0.113.1:61234".parse().unwrap(),
            dst: "192.0.2.1:4342".parse().unwrap(),
            ttl: 32,
            ip_id: 99,
            payload: inner_message.encode(),
        },
    });
    let bytes = round_trip(ecm.clone());
    assert_eq!(bytes[0] >> 4, 8);

    let Message::Encapsulated(decoded) = Message::parse(&bytes).unwrap() else {
        panic!("expected ECM");
    };
    assert_eq!(Message::parse(&decoded.inner.payload).unwrap(), inner_message);
    assert_eq!(decoded.inner.ttl, 32);
    assert_eq!(decoded.inner.ip_id, 99);
}

#[test]
fn ecm_with_rtr_auth_round_trips_and_sets_s_bit() {
    let ecm = Message::Encapsulated(Ecm {
        rtr_auth: Some(RtrAuthField { key_id: 1, data: vec![0x5a; 20] }),
        inner: InnerPacket {
            src: "10.0.0.9:4342".parse().unwrap(),
            dst: "192.0.2.2:4342".parse().unwrap(),
            ttl: 32,
            ip_id: 0,
            payload: Message::MapReferral(MapReferral { nonce: 1, records: vec![] }).encode(),
        },
    });
    let bytes = round_trip(ecm);
    assert_eq!(bytes[0] & 0x08, 0x08, "S bit");
}

#[test]
fn truncated_mapping_record_fails_as_truncated() {
    let bytes = Message::MapReply(MapReply {
        probe: false,
        echo_nonce: false,
        security: false,
        nonce: 1,
        records: vec![sample_record()],
    })
    .encode();
    // Cut inside the mapping record header.
    assert_eq!(Message::parse(&bytes[..14]), Err(DecodeError::TruncatedRecord));
}

#[test]
fn locator_count_beyond_the_bound_is_an_overflow() {
    let mut bytes = Message::MapReply(MapReply {
        probe: false,
        echo_nonce: false,
        security: false,
        nonce: 1,
        records: vec![sample_record()],
    })
    .encode();
    // Locator count byte sits after 4 header + 8 nonce + 4 TTL.
    bytes[16] = 5;
    assert_eq!(Message::parse(&bytes), Err(DecodeError::LocatorOverflow));
}

#[test]
fn trailing_bytes_are_rejected() {
    let mut bytes = Message::MapReply(MapReply {
        probe: false,
        echo_nonce: false,
        security: false,
        nonce: 1,
        records: vec![],
    })
    .encode();
    bytes.push(0);
    assert_eq!(Message::parse(&bytes), Err(DecodeError::TrailingBytes));
}

#[test]
fn unknown_message_type_is_rejected() {
    let bytes = [0x50, 0, 0, 0];
    assert_eq!(Message::parse(&bytes), Err(DecodeError::UnknownType(5)));
}

#[test]
fn store_mapping_survives_the_wire() {
    let eid = EidPrefix::new(v4(10, 0, 0, 0), 24, Some(5)).unwrap();
    let mut mapping = Mapping::new(eid, 30);
    mapping.authoritative = true;
    let mut up = Locator::new(v4(198, 51, 100, 1), 1, 100);
    up.state = LocatorState::Up;
    mapping.add_locator(up).unwrap();
    let mut down = Locator::new(v4(198, 51, 100, 2), 1, 50);
    down.state = LocatorState::Down;
    mapping.add_locator(down).unwrap();

    let bytes = Message::MapReply(MapReply {
        probe: false,
        echo_nonce: false,
        security: false,
        nonce: 3,
        records: vec![mapping.to_record()],
    })
    .encode();
    let Message::MapReply(reply) = Message::parse(&bytes).unwrap() else {
        panic!("expected map-reply");
    };
    let restored = Mapping::from_record(reply.records.into_iter().next().unwrap()).unwrap();
    assert_eq!(restored, mapping);
    assert_eq!(restored.locator_count(), 2);
    assert_eq!(restored.eid.iid(), Some(5));
}
