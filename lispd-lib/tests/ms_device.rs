//! Map-server scenarios: authenticated registration, map-notify echo,
//! answering and forwarding map-requests, and site expiry.

use lispd_lib::auth;
use lispd_lib::config::{Config, DeviceMode, SiteConfig};
use lispd_lib::ctrl::device::Device;
use lispd_lib::ctrl::{ms, Daemon};
use lispd_lib::msg::{
    Address, AuthField, Ecm, EidPrefixRecord, InnerPacket, MapRegister, MapRequest, Message,
    REGISTER_AUTH_DATA_OFFSET,
};
use lispd_lib::store::{EidPrefix, Locator, LocatorState, Mapping};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

const ETR: &str = "203.0.113.9:4342";

fn ms_config() -> Arc<Config> {
    Arc::new(Config {
        mode: DeviceMode::Ms,
        mtu: 1500,
        debug: 0,
        log_file: None,
        status_socket: None,
        eids: vec![],
        map_resolvers: vec![],
        map_servers: vec![],
        rtrs: vec![],
        interfaces: vec![],
        sites: vec![SiteConfig {
            prefix: "10.0.0.0/16".parse().unwrap(),
            iid: None,
            key: "secret".into(),
            key_id: 1,
            proxy_reply: false,
        }],
    })
}

fn v4(a: u8, b: u8, c: u8, d: u8) -> Address {
    Address::Ipv4(Ipv4Addr::new(a, b, c, d))
}

fn registered_mapping() -> Mapping {
    let eid = EidPrefix::new(v4(10, 0, 1, 0), 24, None).unwrap();
    let mut mapping = Mapping::new(eid, 1440);
    mapping.authoritative = true;
    let mut locator = Locator::new(v4(203, 0, 113, 9), 1, 100);
    locator.state = LocatorState::Up;
    mapping.add_locator(locator).unwrap();
    mapping
}

fn signed_register(key: &[u8], proxy_reply: bool, want_map_notify: bool) -> Vec<u8> {
    let register = MapRegister {
        proxy_reply,
        security: false,
        rtr_relayed: false,
        want_map_notify,
        nonce: 0x7777,
        auth: AuthField::placeholder(1, 20),
        records: vec![registered_mapping().to_record_local()],
        xtr_id: None,
    };
    let mut bytes = Message::MapRegister(register).encode();
    auth::sign(&mut bytes, REGISTER_AUTH_DATA_OFFSET, key, 1).unwrap();
    bytes
}

fn registration_count(daemon: &Daemon) -> usize {
    match &daemon.device {
        Device::Ms(state) => state.registrations.len(),
        _ => panic!("not a map-server"),
    }
}

fn plain_request(eid: Address, mask_len: u8, nonce: u64) -> Vec<u8> {
    Message::MapRequest(MapRequest {
        authoritative: false,
        probe: false,
        smr: false,
        pitr: false,
        smr_invoked: false,
        nonce,
        source_eid: Address::NoAddress,
        itr_rlocs: vec![v4(198, 51, 100, 1)],
        records: vec![EidPrefixRecord { mask_len, eid }],
        map_reply: None,
    })
    .encode()
}

#[tokio::test(start_paused = true)]
async fn valid_register_is_stored_and_notify_echoed() {
    let mut daemon = Daemon::new(ms_config(), None).unwrap();
    daemon.handle_datagram(&signed_register(b"secret", true, true), ETR.parse().unwrap());

    assert_eq!(registration_count(&daemon), 1);
    let notify = daemon
        .out
        .iter()
        .find(|o| matches!(Message::parse(&o.bytes), Ok(Message::MapNotify(_))))
        .expect("map-notify echoed for M=1");
    assert_eq!(notify.dst, ETR.parse::<SocketAddr>().unwrap());

    // The echoed notify authenticates with the site key.
    let Ok(Message::MapNotify(parsed)) = Message::parse(&notify.bytes) else {
        unreachable!();
    };
    assert_eq!(parsed.nonce, 0x7777);
    auth::verify(
        &notify.bytes,
        lispd_lib::msg::NOTIFY_AUTH_DATA_OFFSET,
        &parsed.auth.data,
        b"secret",
        1,
    )
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn register_with_bad_key_changes_nothing() {
    let mut daemon = Daemon::new(ms_config(), None).unwrap();
    daemon.handle_datagram(&signed_register(b"wrong", true, true), ETR.parse().unwrap());

    assert_eq!(daemon.counters.auth_failures, 1);
    assert_eq!(registration_count(&daemon), 0);
    assert!(daemon.out.is_empty(), "no notify for a rejected register");
}

#[tokio::test(start_paused = true)]
async fn proxied_site_is_answered_from_the_registration() {
    let mut daemon = Daemon::new(ms_config(), None).unwrap();
    daemon.handle_datagram(&signed_register(b"secret", true, false), ETR.parse().unwrap());
    daemon.out.clear();

    // The request arrives encapsulated through the resolver path; the
    // reply must go to the inner source.
    let itr_inner: SocketAddr = "198.51.100.1:61234".parse().unwrap();
    let ecm = Message::Encapsulated(Ecm {
        rtr_auth: None,
        inner: InnerPacket {
            src: itr_inner,
            dst: "192.0.2.2:4342".parse().unwrap(),
            ttl: 32,
            ip_id: 1,
            payload: plain_request(v4(10, 0, 1, 77), 32, 0x99),
        },
    });
    daemon.handle_datagram(&ecm.encode(), "198.51.100.1:4342".parse().unwrap());

    let reply = daemon.out.first().expect("map-reply queued");
    assert_eq!(reply.dst, itr_inner, "reply lands on the inner source port");
    let Ok(Message::MapReply(reply)) = Message::parse(&reply.bytes) else {
        panic!("expected map-reply");
    };
    assert_eq!(reply.nonce, 0x99);
    assert_eq!(reply.records.len(), 1);
    assert_eq!(reply.records[0].locators.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unproxied_site_forwards_the_request_to_the_etr() {
    let mut daemon = Daemon::new(ms_config(), None).unwrap();
    daemon.handle_datagram(&signed_register(b"secret", false, false), ETR.parse().unwrap());
    daemon.out.clear();

    daemon.handle_datagram(
        &plain_request(v4(10, 0, 1, 77), 32, 0x55),
        "198.51.100.1:4342".parse().unwrap(),
    );
    let forwarded = daemon.out.first().expect("request forwarded");
    assert_eq!(forwarded.dst, ETR.parse::<SocketAddr>().unwrap());
    assert!(matches!(Message::parse(&forwarded.bytes), Ok(Message::MapRequest(_))));
}

#[tokio::test(start_paused = true)]
async fn unknown_eid_gets_a_negative_reply() {
    let mut daemon = Daemon::new(ms_config(), None).unwrap();
    daemon.handle_datagram(
        &plain_request(v4(10, 0, 9, 9), 32, 0x77),
        "198.51.100.1:4342".parse().unwrap(),
    );
    let Ok(Message::MapReply(reply)) = Message::parse(&daemon.out.first().unwrap().bytes) else {
        panic!("expected map-reply");
    };
    assert_eq!(reply.records.len(), 1);
    assert_eq!(reply.records[0].locators.len(), 0, "negative record");
    assert_eq!(reply.records[0].ttl_minutes, 15);
}

#[tokio::test(start_paused = true)]
async fn registrations_lapse_after_the_site_expiration() {
    let mut daemon = Daemon::new(ms_config(), None).unwrap();
    daemon.handle_datagram(&signed_register(b"secret", true, false), ETR.parse().unwrap());
    assert_eq!(registration_count(&daemon), 1);

    tokio::time::advance(Duration::from_secs(181)).await;
    ms::expiry_sweep(&mut daemon);
    assert_eq!(registration_count(&daemon), 0);
}

#[tokio::test(start_paused = true)]
async fn info_request_is_answered_with_observed_addressing() {
    let mut daemon = Daemon::new(ms_config(), None).unwrap();
    let info = lispd_lib::msg::Info {
        nonce: 0x31,
        auth: AuthField::placeholder(1, 20),
        ttl_minutes: 0,
        mask_len: 24,
        eid: v4(10, 0, 1, 0),
        body: Address::NoAddress,
    };
    let mut bytes = Message::InfoRequest(info).encode();
    auth::sign(&mut bytes, lispd_lib::msg::INFO_AUTH_DATA_OFFSET, b"secret", 1).unwrap();
    let src: SocketAddr = "198.51.100.42:56001".parse().unwrap();
    daemon.handle_datagram(&bytes, src);

    let out = daemon.out.first().expect("info-reply queued");
    let Ok(Message::InfoReply(reply)) = Message::parse(&out.bytes) else {
        panic!("expected info-reply");
    };
    assert_eq!(reply.nonce, 0x31);
    let Address::Lcaf(lispd_lib::msg::LcafAddress::NatTraversal {
        etr_port,
        global_etr,
        ..
    }) = reply.body
    else {
        panic!("reply must carry a NAT-traversal LCAF");
    };
    assert_eq!(etr_port, 56001, "observed source port echoed");
    assert_eq!(*global_etr, v4(198, 51, 100, 42), "observed source address echoed");
}
