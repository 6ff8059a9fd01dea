//! Tunnel-router (xTR/MN) state machines: map-request retransmission,
//! solicit-map-request, RLOC probing and the map-register keepalive.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::auth;
use crate::msg::{
    Address, AuthField, Ecm, EidPrefixRecord, InnerPacket, MapNotify, MapRegister, MapReply,
    MapRequest, MappingRecord, Message, XtrId, NOTIFY_AUTH_DATA_OFFSET, REGISTER_AUTH_DATA_OFFSET,
};
use crate::nonce::{RequestContext, RequestKind};
use crate::store::{EidPrefix, Locator, LocatorState, MapReplyAction, Mapping};
use tokio::time::Instant;

use super::device::{xtr_state, Device};
use super::nat::{self, NatStatus};
use super::{
    map_request_source_port, Daemon, DataPlaneIntent, CONTROL_PORT, ENCAP_TTL,
    INITIAL_MRQ_TIMEOUT, INITIAL_SMR_TIMEOUT, MAP_NOTIFY_WAIT, MAP_REGISTER_INTERVAL,
    MAP_REQUEST_RETRIES, MAX_ITR_RLOCS, MAX_SMR_RETRANSMIT, NEGATIVE_CACHE_TTL_MINUTES,
    RLOC_PROBING_INTERVAL, RLOC_PROBING_RETRIES, RLOC_PROBING_RETRY_INTERVAL, SMR_HOLDOFF,
};

/// The data plane missed on `dst`: start (or coalesce into) a map-request.
pub fn handle_cache_miss(daemon: &mut Daemon, dst: IpAddr, iid: Option<u32>) {
    if let Some(entry) = daemon.map_cache.lookup_longest(dst, iid) {
        if entry.active {
            // A request for this destination is already in flight.
            return;
        }
        if entry.mapping.locator_count() > 0
            || entry.mapping.action != MapReplyAction::SendMapRequest
        {
            // The cache can answer; refresh the forwarding decision.
            fill_fwd_entry(daemon, dst, iid);
            return;
        }
        // Negative entry asking for a retry: fall through to a new request.
    }
    let eid = EidPrefix::host(dst, iid);
    request_mapping(daemon, eid, false);
}

/// Issue a map-request for `eid` unless one is already outstanding.
pub fn request_mapping(daemon: &mut Daemon, eid: EidPrefix, smr_invoked: bool) {
    if daemon.nonces.find_map_request(&eid).is_some() {
        debug!(%eid, "map-request coalesced into outstanding one");
        return;
    }
    let Some(resolver) = daemon.cfg.map_resolvers.first() else {
        warn!("no map-resolver configured, dropping lookup");
        return;
    };
    let resolver = SocketAddr::new(resolver.address, CONTROL_PORT);
    let nonce = daemon.issue_request(
        RequestKind::MapRequest,
        RequestContext::MapRequest { eid: eid.clone(), resolver, smr_invoked },
        INITIAL_MRQ_TIMEOUT,
        MAP_REQUEST_RETRIES,
    );

    let _ = daemon.map_cache.remove(&eid);
    let placeholder = Mapping::negative(eid.clone(), 0, MapReplyAction::SendMapRequest);
    let _ = daemon
        .map_cache
        .add_cache(placeholder, Instant::now() + Duration::from_secs(90));
    if let Some(entry) = daemon.map_cache.lookup_exact_mut(&eid) {
        entry.active = true;
        entry.nonce = Some(nonce);
    }

    debug!(%eid, nonce, %resolver, "map-request issued");
    send_encap_request(daemon, nonce, &eid, resolver, smr_invoked);
}

/// Rebuild and resend the message belonging to an outstanding nonce.
pub fn retransmit(daemon: &mut Daemon, nonce: u64, context: &RequestContext) {
    match context {
        RequestContext::MapRequest { eid, resolver, smr_invoked } => {
            debug!(%eid, nonce, "retransmitting map-request");
            send_encap_request(daemon, nonce, eid, *resolver, *smr_invoked);
        }
        RequestContext::Smr { eid, dst } => {
            debug!(%eid, nonce, "retransmitting SMR");
            send_smr_packet(daemon, nonce, eid, *dst);
        }
        RequestContext::RlocProbe { eid, rloc } => {
            debug!(%eid, nonce, "retransmitting RLOC probe");
            send_probe_packet(daemon, nonce, eid, rloc);
        }
        RequestContext::InfoRequest { ms } => {
            debug!(nonce, "retransmitting info-request");
            nat::send_info_packet(daemon, nonce, *ms);
        }
    }
}

/// An outstanding request ran out of retries.
pub fn on_request_expired(daemon: &mut Daemon, context: RequestContext) {
    match context {
        RequestContext::MapRequest { eid, .. } => {
            debug!(%eid, "map-request timed out, installing negative entry");
            let _ = daemon.map_cache.remove(&eid);
            let negative = Mapping::negative(
                eid.clone(),
                NEGATIVE_CACHE_TTL_MINUTES,
                MapReplyAction::SendMapRequest,
            );
            let expires =
                Instant::now() + Duration::from_secs(NEGATIVE_CACHE_TTL_MINUTES as u64 * 60);
            let _ = daemon.map_cache.add_cache(negative, expires);
            daemon.fwd_cache.invalidate_prefix(&eid);
        }
        RequestContext::Smr { eid, dst } => {
            debug!(%eid, %dst, "SMR went unanswered, giving up");
        }
        RequestContext::RlocProbe { eid, rloc } => {
            info!(%eid, %rloc, "RLOC probing exhausted, marking locator down");
            if let Some(entry) = daemon.map_cache.lookup_exact_mut(&eid) {
                if let Some(locator) = entry.mapping.locator_mut(&rloc) {
                    locator.state = LocatorState::Down;
                    locator.probing.failures = locator.probing.failures.saturating_add(1);
                    locator.probing.nonce = None;
                }
            }
            daemon.fwd_cache.invalidate_rloc(&rloc);
            daemon.intent(DataPlaneIntent::DrainRloc { rloc });
        }
        RequestContext::InfoRequest { ms } => {
            debug!(%ms, "info-request timed out; next interface change retries");
        }
    }
}

/// A map-reply either answers an outstanding map-request/SMR or a probe.
pub fn on_map_reply(daemon: &mut Daemon, reply: MapReply) {
    let Some(pending) = daemon.nonces.get(reply.nonce) else {
        daemon.counters.nonce_mismatches += 1;
        debug!(nonce = reply.nonce, "map-reply with unknown nonce dropped");
        return;
    };
    match pending.purpose {
        RequestKind::MapRequest | RequestKind::Smr => {
            let Some(entry) = daemon.take_nonce(reply.nonce) else { return };
            if let RequestContext::MapRequest { eid, .. } = &entry.context {
                // The host-prefix placeholder makes way for the real,
                // possibly wider, prefix from the reply.
                let eid = eid.clone();
                let _ = daemon.map_cache.remove(&eid);
                install_records(daemon, reply.records);
            }
        }
        RequestKind::RlocProbe => {
            if !reply.probe {
                debug!(nonce = reply.nonce, "probe nonce answered without P bit, ignoring");
                return;
            }
            let Some(entry) = daemon.take_nonce(reply.nonce) else { return };
            if let RequestContext::RlocProbe { eid, rloc } = entry.context {
                on_probe_reply(daemon, eid, rloc);
            }
        }
        RequestKind::InfoRequest => {
            debug!(nonce = reply.nonce, "map-reply on an info nonce, dropping");
        }
    }
}

fn install_records(daemon: &mut Daemon, records: Vec<MappingRecord>) {
    for record in records {
        let mapping = match Mapping::from_record(record) {
            Ok(mapping) => mapping,
            Err(e) => {
                daemon.counters.malformed_records += 1;
                debug!(error = %e, "discarding unusable mapping record");
                continue;
            }
        };
        let prefix = mapping.eid.clone();
        let expires = Instant::now() + Duration::from_secs(mapping.ttl_minutes as u64 * 60);
        daemon.fwd_cache.invalidate_prefix(&prefix);
        match daemon.map_cache.add_cache(mapping, expires) {
            Ok(()) => {
                debug!(%prefix, "map-cache entry installed");
                daemon.intent(DataPlaneIntent::CacheFilled { prefix });
            }
            Err(e) => debug!(%prefix, error = %e, "map-cache insert rejected"),
        }
    }
}

fn on_probe_reply(daemon: &mut Daemon, eid: EidPrefix, rloc: Address) {
    let mut revived = false;
    if let Some(entry) = daemon.map_cache.lookup_exact_mut(&eid) {
        if let Some(locator) = entry.mapping.locator_mut(&rloc) {
            revived = locator.state == LocatorState::Down;
            locator.state = LocatorState::Up;
            locator.probing.last_reply = Some(Instant::now());
            locator.probing.failures = 0;
            locator.probing.nonce = None;
        }
    }
    debug!(%eid, %rloc, revived, "RLOC probe answered");
    if revived {
        daemon.fwd_cache.invalidate_prefix(&eid);
    }
}

/// Map-requests reaching a tunnel router are probes, SMRs or SMR answers.
pub fn on_map_request(daemon: &mut Daemon, request: MapRequest, src: SocketAddr) {
    if request.smr_invoked {
        // The peer re-resolved after our SMR; retire the outstanding nonce.
        if daemon
            .nonces
            .get(request.nonce)
            .is_some_and(|e| e.purpose == RequestKind::Smr)
        {
            daemon.take_nonce(request.nonce);
            debug!(nonce = request.nonce, "SMR acknowledged by smr-invoked map-request");
        }
    }
    if request.smr {
        // The peer changed; re-resolve every prefix it solicits.
        for record in &request.records {
            let (iid, address) = record.eid.clone().split_iid();
            match EidPrefix::new(address, record.mask_len, iid) {
                Ok(eid) => {
                    if daemon.map_cache.lookup_exact(&eid).is_some() {
                        request_mapping(daemon, eid, true);
                    }
                }
                Err(_) => daemon.counters.malformed_records += 1,
            }
        }
        return;
    }
    answer_request(daemon, &request, src);
}

/// Answer a probe or a map-request the map-server forwarded to us, from
/// the local database. Probes are answered to their sender; forwarded
/// requests go back to the ITR-RLOC named in the request.
fn answer_request(daemon: &mut Daemon, request: &MapRequest, src: SocketAddr) {
    let mut records = Vec::new();
    for record in &request.records {
        let (iid, address) = record.eid.clone().split_iid();
        let Some(ip) = address.ip() else { continue };
        if let Some(mapping) = daemon.local_db.lookup_longest(ip, iid) {
            records.push(mapping.to_record_local());
        }
    }
    if records.is_empty() && !request.probe {
        debug!(%src, nonce = request.nonce, "map-request for an EID we do not own");
        return;
    }
    let dst = if request.probe {
        src
    } else {
        request
            .itr_rlocs
            .iter()
            .find_map(|a| a.ip())
            .map(|ip| SocketAddr::new(ip, CONTROL_PORT))
            .unwrap_or(src)
    };
    let reply = MapReply {
        probe: request.probe,
        echo_nonce: false,
        security: false,
        nonce: request.nonce,
        records,
    };
    debug!(%dst, nonce = request.nonce, probe = request.probe, "map-reply sent");
    daemon.queue_send(dst, Message::MapReply(reply).encode());
}

/// Map-notify acknowledges a registration; the HMAC must check out against
/// the map-server's key before any state is touched.
pub fn on_map_notify(daemon: &mut Daemon, notify: MapNotify, raw: &[u8], src: SocketAddr) {
    let Some(ms) = daemon.cfg.map_servers.iter().find(|ms| ms.address == src.ip()) else {
        debug!(%src, "map-notify from unknown map-server dropped");
        return;
    };
    if let Err(e) = auth::verify(
        raw,
        NOTIFY_AUTH_DATA_OFFSET,
        &notify.auth.data,
        ms.key.as_bytes(),
        notify.auth.key_id,
    ) {
        daemon.counters.auth_failures += 1;
        warn!(%src, error = %e, "map-notify failed authentication");
        return;
    }
    let timer = {
        let state = xtr_state!(daemon);
        state.notify_wait.remove(&src.ip())
    };
    if let Some(timer) = timer {
        daemon.timers.cancel(timer);
    }
    debug!(%src, records = notify.records.len(), "registration acknowledged");
}

/// Interface came up: announce the RLOC, rediscover NAT state and make the
/// mapping system converge on the new locator set.
pub fn on_interface_up(daemon: &mut Daemon, rloc: IpAddr) {
    if !daemon.local_rlocs.contains(&rloc) {
        daemon.local_rlocs.push(rloc);
    }
    info!(%rloc, "interface up");
    let prefixes: Vec<EidPrefix> =
        daemon.local_db.iter_local().map(|m| m.eid.clone()).collect();
    for prefix in prefixes {
        if let Some(mapping) = daemon.local_db.lookup_exact_mut(&prefix) {
            let mut locator = Locator::new(Address::from(rloc), 1, 100);
            locator.state = LocatorState::Up;
            let _ = mapping.add_locator(locator);
        }
    }
    schedule_smr_round(daemon);
    send_registers(daemon);
    nat::send_info_request(daemon);
}

pub fn on_interface_down(daemon: &mut Daemon, rloc: IpAddr) {
    daemon.local_rlocs.retain(|r| *r != rloc);
    info!(%rloc, "interface down");
    let address = Address::from(rloc);
    let prefixes: Vec<EidPrefix> =
        daemon.local_db.iter_local().map(|m| m.eid.clone()).collect();
    for prefix in prefixes {
        if let Some(mapping) = daemon.local_db.lookup_exact_mut(&prefix) {
            if let Some(locator) = mapping.locator_mut(&address) {
                locator.state = LocatorState::Down;
            }
        }
    }
    schedule_smr_round(daemon);
    send_registers(daemon);
}

/// Coalesce local changes: the first change arms the holdoff timer, later
/// ones within the window ride along.
pub fn schedule_smr_round(daemon: &mut Daemon) {
    let armed = match &daemon.device {
        Device::Xtr(state) | Device::Mn(state) => state.smr_timer.is_some(),
        _ => return,
    };
    if armed {
        debug!("SMR round already pending, change subsumed");
        return;
    }
    let timer = daemon.timers.schedule(SMR_HOLDOFF, fire_smr_round);
    let state = xtr_state!(daemon);
    state.smr_timer = Some(timer);
}

/// Send one SMR per map-cache entry so every peer that may hold our old
/// mapping re-resolves it.
pub fn fire_smr_round(daemon: &mut Daemon) {
    {
        let state = xtr_state!(daemon);
        state.smr_timer = None;
    }
    let Some(local_eid) = daemon.local_db.iter_local().next().map(|m| m.eid.clone()) else {
        return;
    };
    let mut targets = Vec::new();
    for entry in daemon.map_cache.iter_cache() {
        if entry.active {
            continue;
        }
        if let Some(locator) =
            entry.mapping.locators().iter().find(|l| l.usable() && l.addr.is_ip())
        {
            if let Some(ip) = locator.addr.ip() {
                targets.push(SocketAddr::new(ip, CONTROL_PORT));
            }
        }
    }
    info!(peers = targets.len(), "soliciting map-requests after local change");
    for dst in targets {
        let nonce = daemon.issue_request(
            RequestKind::Smr,
            RequestContext::Smr { eid: local_eid.clone(), dst },
            INITIAL_SMR_TIMEOUT,
            MAX_SMR_RETRANSMIT,
        );
        send_smr_packet(daemon, nonce, &local_eid, dst);
    }
}

/// Periodic registration of every local mapping with every map-server.
pub fn register_cycle(daemon: &mut Daemon) {
    send_registers(daemon);
    daemon.timers.schedule(MAP_REGISTER_INTERVAL, register_cycle);
}

pub fn send_registers(daemon: &mut Daemon) {
    let records: Vec<MappingRecord> =
        daemon.local_db.iter_local().map(|m| m.to_record_local()).collect();
    if records.is_empty() {
        return;
    }
    let (nat_status, xtr_id, site_id) = match &daemon.device {
        Device::Xtr(state) | Device::Mn(state) => {
            (state.nat_status, state.xtr_id, state.site_id)
        }
        _ => return,
    };
    let behind_nat = matches!(nat_status, NatStatus::Partial | NatStatus::Full);
    // First RTR attached to a local locator during NAT discovery.
    let rtr: Option<IpAddr> = daemon
        .local_db
        .iter_local()
        .flat_map(|m| m.locators())
        .flat_map(|l| l.rtrs.iter())
        .find_map(|a| a.ip());

    let cfg = daemon.cfg.clone();
    for ms in &cfg.map_servers {
        let Ok(mac_len) = auth::mac_len(ms.key_id) else {
            warn!(ms = %ms.address, key_id = ms.key_id, "unknown key id, skipping register");
            continue;
        };
        let register = MapRegister {
            proxy_reply: ms.proxy_reply,
            security: false,
            rtr_relayed: behind_nat,
            want_map_notify: ms.want_map_notify,
            nonce: 0,
            auth: AuthField::placeholder(ms.key_id, mac_len),
            records: records.clone(),
            xtr_id: behind_nat.then(|| XtrId { xtr_id, site_id }),
        };
        let mut bytes = Message::MapRegister(register).encode();
        if let Err(e) =
            auth::sign(&mut bytes, REGISTER_AUTH_DATA_OFFSET, ms.key.as_bytes(), ms.key_id)
        {
            warn!(ms = %ms.address, error = %e, "could not sign map-register");
            continue;
        }
        let ms_addr = SocketAddr::new(ms.address, CONTROL_PORT);
        match (behind_nat, rtr) {
            (true, Some(rtr_ip)) => {
                // Behind a NAT registrations travel through the RTR.
                let bytes = encapsulate(daemon, bytes, CONTROL_PORT, ms_addr);
                daemon.queue_send(SocketAddr::new(rtr_ip, CONTROL_PORT), bytes);
            }
            _ => daemon.queue_send(ms_addr, bytes),
        }
        daemon.counters.registrations_sent += 1;

        if ms.want_map_notify {
            arm_notify_wait(daemon, ms.address);
        }
    }
}

fn arm_notify_wait(daemon: &mut Daemon, ms: IpAddr) {
    let waiting = match &daemon.device {
        Device::Xtr(state) | Device::Mn(state) => state.notify_wait.contains_key(&ms),
        _ => return,
    };
    if waiting {
        return;
    }
    let timer = daemon.timers.schedule(MAP_NOTIFY_WAIT, move |d: &mut Daemon| {
        let state = xtr_state!(d);
        if state.notify_wait.remove(&ms).is_some() {
            // No backoff: the register period already bounds the load.
            warn!(%ms, "no map-notify within the wait window");
        }
    });
    let state = xtr_state!(daemon);
    state.notify_wait.insert(ms, timer);
}

/// Periodic probe of every Up-or-Unknown remote locator.
pub fn probe_cycle(daemon: &mut Daemon) {
    let mut targets = Vec::new();
    for entry in daemon.map_cache.iter_cache() {
        if entry.active {
            continue;
        }
        for locator in entry.mapping.locators() {
            let probe_worthy = matches!(
                locator.state,
                LocatorState::Up | LocatorState::Unknown
            ) && locator.probing.nonce.is_none()
                && locator.addr.is_ip();
            if probe_worthy {
                targets.push((entry.mapping.eid.clone(), locator.addr.clone()));
            }
        }
    }
    for (eid, rloc) in targets {
        send_probe(daemon, eid, rloc);
    }
    daemon.timers.schedule(RLOC_PROBING_INTERVAL, probe_cycle);
}

fn send_probe(daemon: &mut Daemon, eid: EidPrefix, rloc: Address) {
    let nonce = daemon.issue_request(
        RequestKind::RlocProbe,
        RequestContext::RlocProbe { eid: eid.clone(), rloc: rloc.clone() },
        RLOC_PROBING_RETRY_INTERVAL,
        RLOC_PROBING_RETRIES,
    );
    if let Some(entry) = daemon.map_cache.lookup_exact_mut(&eid) {
        if let Some(locator) = entry.mapping.locator_mut(&rloc) {
            locator.probing.nonce = Some(nonce);
        }
    }
    send_probe_packet(daemon, nonce, &eid, &rloc);
    daemon.counters.probes_sent += 1;
}

fn send_probe_packet(daemon: &mut Daemon, nonce: u64, eid: &EidPrefix, rloc: &Address) {
    let Some(ip) = rloc.ip() else { return };
    let mut request = build_map_request(daemon, nonce, eid);
    request.probe = true;
    daemon.queue_send(SocketAddr::new(ip, CONTROL_PORT), Message::MapRequest(request).encode());
}

fn send_smr_packet(daemon: &mut Daemon, nonce: u64, local_eid: &EidPrefix, dst: SocketAddr) {
    let mut request = build_map_request(daemon, nonce, local_eid);
    request.smr = true;
    daemon.queue_send(dst, Message::MapRequest(request).encode());
}

fn send_encap_request(
    daemon: &mut Daemon,
    nonce: u64,
    eid: &EidPrefix,
    resolver: SocketAddr,
    smr_invoked: bool,
) {
    let mut request = build_map_request(daemon, nonce, eid);
    request.smr_invoked = smr_invoked;
    let payload = Message::MapRequest(request).encode();
    let bytes = encapsulate(daemon, payload, map_request_source_port(nonce), resolver);
    daemon.queue_send(resolver, bytes);
}

fn build_map_request(daemon: &Daemon, nonce: u64, eid: &EidPrefix) -> MapRequest {
    let source_eid = daemon
        .local_db
        .iter_local()
        .next()
        .map(|m| m.eid.to_wire_address())
        .unwrap_or(Address::NoAddress);
    let mut itr_rlocs: Vec<Address> =
        daemon.local_rlocs.iter().take(MAX_ITR_RLOCS).map(|ip| Address::from(*ip)).collect();
    if itr_rlocs.is_empty() {
        itr_rlocs.push(Address::NoAddress);
    }
    MapRequest {
        authoritative: false,
        probe: false,
        smr: false,
        pitr: false,
        smr_invoked: false,
        nonce,
        source_eid,
        itr_rlocs,
        records: vec![EidPrefixRecord {
            mask_len: eid.mask_len(),
            eid: eid.to_wire_address(),
        }],
        map_reply: None,
    }
}

/// Wrap a control message in an ECM bound for `dst`, sourcing the inner
/// header from a local RLOC of the matching family.
pub(crate) fn encapsulate(
    daemon: &mut Daemon,
    payload: Vec<u8>,
    inner_src_port: u16,
    dst: SocketAddr,
) -> Vec<u8> {
    let src_ip = daemon.local_rloc_for(dst.ip()).unwrap_or(match dst.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    });
    let ip_id = if dst.is_ipv4() { daemon.next_ip_id() } else { 0 };
    let inner = InnerPacket {
        src: SocketAddr::new(src_ip, inner_src_port),
        dst,
        ttl: ENCAP_TTL,
        ip_id,
        payload,
    };
    Message::Encapsulated(Ecm { rtr_auth: None, inner }).encode()
}

/// Recompute the memoized forwarding decision for one destination.
pub fn fill_fwd_entry(daemon: &mut Daemon, dst: IpAddr, iid: Option<u32>) {
    let entry = daemon.map_cache.lookup_longest(dst, iid);
    let (prefix, rloc) = match entry {
        Some(entry) if !entry.active => (
            entry.mapping.eid.clone(),
            entry.mapping.select_rloc(dst).map(|l| l.addr.clone()),
        ),
        _ => return,
    };
    daemon.fwd_cache.insert(iid, dst, crate::store::FwdEntry { rloc });
    daemon.intent(DataPlaneIntent::CacheFilled { prefix });
}
