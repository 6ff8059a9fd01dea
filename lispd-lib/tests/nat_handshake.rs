//! Info-request/info-reply scenarios: NAT detection verdicts, the status
//! lattice, RTR attachment and the failure semantics around bad replies.

use lispd_lib::auth;
use lispd_lib::config::{
    Config, DeviceMode, EidConfig, MapResolverConfig, MapServerConfig,
};
use lispd_lib::ctrl::device::Device;
use lispd_lib::ctrl::nat::NatStatus;
use lispd_lib::ctrl::{xtr, Daemon};
use lispd_lib::msg::{
    Address, AuthField, Info, LcafAddress, Message, INFO_AUTH_DATA_OFFSET,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

const LOCAL_RLOC: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 9);
const MS_ADDR: &str = "192.0.2.2:4342";

fn config() -> Arc<Config> {
    Arc::new(Config {
        mode: DeviceMode::Mn,
        mtu: 1500,
        debug: 0,
        log_file: None,
        status_socket: None,
        eids: vec![EidConfig { prefix: "10.0.0.0/24".parse().unwrap(), iid: None }],
        map_resolvers: vec![MapResolverConfig { address: "192.0.2.1".parse().unwrap() }],
        map_servers: vec![MapServerConfig {
            address: "192.0.2.2".parse().unwrap(),
            key: "secret".into(),
            key_id: 1,
            proxy_reply: false,
            want_map_notify: false,
        }],
        rtrs: vec![],
        interfaces: vec![],
        sites: vec![],
    })
}

fn v4(a: u8, b: u8, c: u8, d: u8) -> Address {
    Address::Ipv4(Ipv4Addr::new(a, b, c, d))
}

/// Bring an interface up and fish the issued info-request nonce out of
/// the outbound queue.
fn daemon_with_pending_info_request() -> (Daemon, u64) {
    let mut daemon = Daemon::new(config(), None).unwrap();
    xtr::on_interface_up(&mut daemon, IpAddr::V4(LOCAL_RLOC));
    let nonce = daemon
        .out
        .iter()
        .find_map(|o| match Message::parse(&o.bytes) {
            Ok(Message::InfoRequest(info)) => Some(info.nonce),
            _ => None,
        })
        .expect("interface up must issue an info-request");
    daemon.out.clear();
    (daemon, nonce)
}

fn nat_body(global_etr: Address, rtrs: Vec<Address>) -> Address {
    Address::Lcaf(LcafAddress::NatTraversal {
        ms_port: 4342,
        etr_port: 56000,
        global_etr: Box::new(global_etr),
        ms: Box::new(v4(192, 0, 2, 2)),
        private_etr: Box::new(Address::Ipv4(LOCAL_RLOC)),
        rtrs,
    })
}

fn signed_info_reply(nonce: u64, ttl_minutes: u32, body: Address) -> Vec<u8> {
    let reply = Info {
        nonce,
        auth: AuthField::placeholder(1, 20),
        ttl_minutes,
        mask_len: 24,
        eid: v4(10, 0, 0, 0),
        body,
    };
    let mut bytes = Message::InfoReply(reply).encode();
    auth::sign(&mut bytes, INFO_AUTH_DATA_OFFSET, b"secret", 1).unwrap();
    bytes
}

fn nat_status(daemon: &Daemon) -> NatStatus {
    match &daemon.device {
        Device::Xtr(state) | Device::Mn(state) => state.nat_status,
        _ => panic!("not a tunnel router"),
    }
}

fn info_timer_armed(daemon: &Daemon) -> bool {
    match &daemon.device {
        Device::Xtr(state) | Device::Mn(state) => state.info_timer.is_some(),
        _ => false,
    }
}

#[tokio::test(start_paused = true)]
async fn matching_global_rloc_means_not_behind_nat() {
    let (mut daemon, nonce) = daemon_with_pending_info_request();
    let bytes = signed_info_reply(nonce, 5, nat_body(Address::Ipv4(LOCAL_RLOC), vec![]));
    daemon.handle_datagram(&bytes, MS_ADDR.parse().unwrap());

    assert_eq!(nat_status(&daemon), NatStatus::NoNat);
    assert!(!info_timer_armed(&daemon), "no reschedule in the open");
    assert!(daemon.nonces.find_info_request().is_none(), "nonce consumed");
    // The refreshed state still goes to the map-server.
    let registers = daemon
        .out
        .iter()
        .filter(|o| matches!(Message::parse(&o.bytes), Ok(Message::MapRegister(_))))
        .count();
    assert_eq!(registers, 1, "map-register emitted after the verdict");
}

#[tokio::test(start_paused = true)]
async fn differing_global_rloc_means_behind_nat_with_rtr_attached() {
    let (mut daemon, nonce) = daemon_with_pending_info_request();
    let rtr = v4(198, 51, 100, 7);
    // One matching-family RTR and one v6 RTR that must be filtered out.
    let rtrs = vec![rtr.clone(), Address::Ipv6("2001:db8::7".parse().unwrap())];
    let bytes = signed_info_reply(nonce, 5, nat_body(v4(198, 51, 100, 99), rtrs));
    daemon.handle_datagram(&bytes, MS_ADDR.parse().unwrap());

    assert_eq!(nat_status(&daemon), NatStatus::Full);
    assert!(info_timer_armed(&daemon), "info-request rearmed for the lease");

    let local_mapping = daemon.local_db.iter_local().next().unwrap();
    let locator = local_mapping.locator(&Address::Ipv4(LOCAL_RLOC)).unwrap();
    assert_eq!(locator.rtrs, vec![rtr.clone()], "matching-family RTR attached");

    // Behind a NAT the register rides an ECM to the RTR.
    let relayed = daemon
        .out
        .iter()
        .find_map(|o| match Message::parse(&o.bytes) {
            Ok(Message::Encapsulated(ecm)) => Some((o.dst, ecm)),
            _ => None,
        })
        .expect("register must be relayed through the RTR");
    assert_eq!(relayed.0, "198.51.100.7:4342".parse::<SocketAddr>().unwrap());
    assert_eq!(relayed.1.inner.dst, MS_ADDR.parse::<SocketAddr>().unwrap());
    assert!(matches!(
        Message::parse(&relayed.1.inner.payload),
        Ok(Message::MapRegister(_))
    ));

    // The rearm fires after ttl minutes and issues a fresh info-request.
    tokio::time::advance(Duration::from_secs(5 * 60)).await;
    let now = tokio::time::Instant::now();
    while let Some(callback) = daemon.timers.pop_due(now) {
        callback(&mut daemon);
    }
    assert!(daemon.nonces.find_info_request().is_some(), "handshake restarted");
}

#[tokio::test(start_paused = true)]
async fn malformed_lcaf_discards_without_touching_state() {
    let (mut daemon, nonce) = daemon_with_pending_info_request();
    let pending_before = daemon.nonces.len();

    // An IP body flips the R bit but is not a NAT-traversal LCAF.
    let bytes = signed_info_reply(nonce, 5, v4(198, 51, 100, 99));
    daemon.handle_datagram(&bytes, MS_ADDR.parse().unwrap());

    assert_eq!(daemon.counters.malformed_records, 1);
    assert_eq!(nat_status(&daemon), NatStatus::Unknown, "no state change");
    assert_eq!(daemon.nonces.len(), pending_before, "nonce still outstanding");
    assert!(!info_timer_armed(&daemon), "no timers modified");
    assert!(daemon.out.is_empty(), "no register emitted");
}

#[tokio::test(start_paused = true)]
async fn bad_hmac_discards_and_leaves_the_nonce_live() {
    let (mut daemon, nonce) = daemon_with_pending_info_request();
    let mut bytes = signed_info_reply(nonce, 5, nat_body(Address::Ipv4(LOCAL_RLOC), vec![]));
    // Re-sign with the wrong key.
    bytes[INFO_AUTH_DATA_OFFSET..INFO_AUTH_DATA_OFFSET + 20].fill(0);
    auth::sign(&mut bytes, INFO_AUTH_DATA_OFFSET, b"wrong", 1).unwrap();
    daemon.handle_datagram(&bytes, MS_ADDR.parse().unwrap());

    assert_eq!(daemon.counters.auth_failures, 1);
    assert_eq!(nat_status(&daemon), NatStatus::Unknown);
    assert!(daemon.nonces.find_info_request().is_some(), "nonce survives auth failure");
}

#[tokio::test(start_paused = true)]
async fn open_then_natted_interface_reports_partial() {
    let (mut daemon, nonce) = daemon_with_pending_info_request();
    let bytes = signed_info_reply(nonce, 5, nat_body(Address::Ipv4(LOCAL_RLOC), vec![]));
    daemon.handle_datagram(&bytes, MS_ADDR.parse().unwrap());
    assert_eq!(nat_status(&daemon), NatStatus::NoNat);
    daemon.out.clear();

    // A second interface comes up and this one sits behind a NAT.
    xtr::on_interface_up(&mut daemon, "203.0.113.10".parse().unwrap());
    let nonce = daemon
        .out
        .iter()
        .find_map(|o| match Message::parse(&o.bytes) {
            Ok(Message::InfoRequest(info)) => Some(info.nonce),
            _ => None,
        })
        .expect("second info-request");
    let rtrs = vec![v4(198, 51, 100, 7)];
    let bytes = signed_info_reply(nonce, 5, nat_body(v4(198, 51, 100, 99), rtrs));
    daemon.handle_datagram(&bytes, MS_ADDR.parse().unwrap());

    assert_eq!(nat_status(&daemon), NatStatus::Partial);
}
