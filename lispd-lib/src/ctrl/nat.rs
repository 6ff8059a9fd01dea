//! NAT traversal: the info-request/info-reply handshake with the
//! map-server and the process-wide NAT status it feeds.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::auth;
use crate::msg::{
    Address, AuthField, Info, LcafAddress, Message, INFO_AUTH_DATA_OFFSET,
};
use crate::nonce::{RequestContext, RequestKind};
use crate::store::EidPrefix;

use super::device::{xtr_state, Device};
use super::{xtr, Daemon, CONTROL_PORT, INFO_REQUEST_RETRIES, INITIAL_INFO_TIMEOUT};

/// Process-wide NAT status. Reports from individual interfaces join
/// upward: one NATted interface among open ones makes `Partial`, further
/// NATted reports make `Full`. A later open report does not walk the
/// status back down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NatStatus {
    Unknown,
    NoNat,
    Partial,
    Full,
}

/// One interface's verdict from a single info-reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatReport {
    NotBehindNat,
    BehindNat,
    Unknown,
}

impl NatStatus {
    pub fn join(self, report: NatReport) -> NatStatus {
        match (self, report) {
            (current, NatReport::Unknown) => current,
            (NatStatus::Unknown, NatReport::NotBehindNat) => NatStatus::NoNat,
            (NatStatus::Unknown, NatReport::BehindNat) => NatStatus::Full,
            (NatStatus::NoNat, NatReport::BehindNat) => NatStatus::Partial,
            (NatStatus::Partial, NatReport::BehindNat) => NatStatus::Full,
            (NatStatus::Full, NatReport::BehindNat) => NatStatus::Full,
            (current, NatReport::NotBehindNat) => current,
        }
    }
}

/// Ask the map-server how it sees us. One outstanding info-request at a
/// time; interface churn while one is in flight rides on its retransmits.
pub fn send_info_request(daemon: &mut Daemon) {
    if !matches!(daemon.device, Device::Xtr(_) | Device::Mn(_)) {
        return;
    }
    if daemon.nonces.find_info_request().is_some() {
        debug!("info-request already outstanding");
        return;
    }
    let Some(ms) = daemon.cfg.map_servers.first() else {
        return;
    };
    let ms = SocketAddr::new(ms.address, CONTROL_PORT);
    let nonce = daemon.issue_request(
        RequestKind::InfoRequest,
        RequestContext::InfoRequest { ms },
        INITIAL_INFO_TIMEOUT,
        INFO_REQUEST_RETRIES,
    );
    debug!(%ms, nonce, "info-request issued");
    send_info_packet(daemon, nonce, ms);
}

pub fn send_info_packet(daemon: &mut Daemon, nonce: u64, ms: SocketAddr) {
    let Some(ms_cfg) = daemon.cfg.map_servers.iter().find(|m| m.address == ms.ip()) else {
        return;
    };
    let Ok(mac_len) = auth::mac_len(ms_cfg.key_id) else {
        return;
    };
    let (key, key_id) = (ms_cfg.key.clone(), ms_cfg.key_id);
    let (eid, mask_len) = daemon
        .local_db
        .iter_local()
        .next()
        .map(|m| (m.eid.to_wire_address(), m.eid.mask_len()))
        .unwrap_or((Address::NoAddress, 0));
    let request = Info {
        nonce,
        auth: AuthField::placeholder(key_id, mac_len),
        ttl_minutes: 0,
        mask_len,
        eid,
        body: Address::NoAddress,
    };
    let mut bytes = Message::InfoRequest(request).encode();
    if let Err(e) = auth::sign(&mut bytes, INFO_AUTH_DATA_OFFSET, key.as_bytes(), key_id) {
        warn!(%ms, error = %e, "could not sign info-request");
        return;
    }
    daemon.queue_send(ms, bytes);
}

/// Process an info-reply. Checks run strictly before state changes: an
/// unknown nonce, a bad HMAC or a malformed LCAF drops the message with
/// the outstanding request (and its retransmit timer) untouched.
pub fn on_info_reply(daemon: &mut Daemon, reply: Info, raw: &[u8], src: SocketAddr) {
    let Some(pending) = daemon.nonces.get(reply.nonce) else {
        daemon.counters.nonce_mismatches += 1;
        debug!(%src, nonce = reply.nonce, "info-reply with unknown nonce dropped");
        return;
    };
    if pending.purpose != RequestKind::InfoRequest {
        daemon.counters.nonce_mismatches += 1;
        debug!(%src, nonce = reply.nonce, "nonce outstanding for a different purpose");
        return;
    }
    let RequestContext::InfoRequest { ms } = pending.context else {
        return;
    };

    let Some(ms_cfg) = daemon.cfg.map_servers.iter().find(|m| m.address == ms.ip()) else {
        debug!(%src, "info-reply for an unconfigured map-server dropped");
        return;
    };
    if let Err(e) = auth::verify(
        raw,
        INFO_AUTH_DATA_OFFSET,
        &reply.auth.data,
        ms_cfg.key.as_bytes(),
        reply.auth.key_id,
    ) {
        daemon.counters.auth_failures += 1;
        warn!(%src, error = %e, "info-reply failed authentication");
        return;
    }

    let Address::Lcaf(LcafAddress::NatTraversal {
        ms_port,
        etr_port,
        global_etr,
        private_etr,
        rtrs,
        ..
    }) = reply.body.clone()
    else {
        daemon.counters.malformed_records += 1;
        debug!(%src, "info-reply without a NAT-traversal LCAF dropped");
        return;
    };

    // All checks passed; the nonce is spent from here on.
    let Some(entry) = daemon.take_nonce(reply.nonce) else { return };
    debug!(nonce = entry.value, ms_port, etr_port, "info-reply accepted");

    let local_rloc = daemon.local_rloc_for(ms.ip());

    // Only RTRs we can actually reach from the receiving RLOC matter.
    let usable_rtrs: Vec<Address> = match local_rloc {
        Some(local) => rtrs
            .into_iter()
            .filter(|r| r.ip().map(|ip| ip.is_ipv4() == local.is_ipv4()).unwrap_or(false))
            .collect(),
        None => Vec::new(),
    };

    let report = match (global_etr.ip(), local_rloc) {
        (Some(seen), Some(local)) if seen == local => NatReport::NotBehindNat,
        (Some(_), Some(_)) => NatReport::BehindNat,
        _ => NatReport::Unknown,
    };
    info!(?report, global = %global_etr, private = %private_etr, "NAT detection verdict");

    if report == NatReport::BehindNat {
        if let Some(rtr) = usable_rtrs.first() {
            debug!(%rtr, "registering through RTR");
        }
        attach_rtrs(daemon, local_rloc, &usable_rtrs);
    }

    {
        let state = xtr_state!(daemon);
        state.nat_status = state.nat_status.join(report);
    }

    // Behind a NAT the binding must be refreshed before the map-server's
    // lease lapses; in the open the rearm timer has no job.
    let old_timer = {
        let state = xtr_state!(daemon);
        state.info_timer.take()
    };
    if let Some(timer) = old_timer {
        daemon.timers.cancel(timer);
    }
    if report == NatReport::BehindNat {
        let lease = Duration::from_secs(reply.ttl_minutes.max(1) as u64 * 60);
        let timer = daemon.timers.schedule(lease, |d: &mut Daemon| {
            {
                let state = xtr_state!(d);
                state.info_timer = None;
            }
            send_info_request(d);
        });
        let state = xtr_state!(daemon);
        state.info_timer = Some(timer);
    }

    // Either way the map-server needs to see the refreshed locator state.
    xtr::send_registers(daemon);
}

/// Attach the RTR list to the locator the reply was about, on every local
/// mapping carrying it. Selection among several candidates is the listed
/// order, deterministically.
fn attach_rtrs(daemon: &mut Daemon, local_rloc: Option<IpAddr>, rtrs: &[Address]) {
    let Some(local) = local_rloc else { return };
    let address = Address::from(local);
    let prefixes: Vec<EidPrefix> =
        daemon.local_db.iter_local().map(|m| m.eid.clone()).collect();
    for prefix in prefixes {
        if let Some(mapping) = daemon.local_db.lookup_exact_mut(&prefix) {
            if let Some(locator) = mapping.locator_mut(&address) {
                locator.rtrs = rtrs.to_vec();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lattice_joins_upward() {
        assert_eq!(NatStatus::Unknown.join(NatReport::NotBehindNat), NatStatus::NoNat);
        assert_eq!(NatStatus::Unknown.join(NatReport::BehindNat), NatStatus::Full);
        assert_eq!(NatStatus::NoNat.join(NatReport::BehindNat), NatStatus::Partial);
        assert_eq!(NatStatus::Partial.join(NatReport::BehindNat), NatStatus::Full);
        assert_eq!(NatStatus::Full.join(NatReport::BehindNat), NatStatus::Full);
    }

    #[test]
    fn open_reports_do_not_walk_status_back() {
        assert_eq!(NatStatus::Partial.join(NatReport::NotBehindNat), NatStatus::Partial);
        assert_eq!(NatStatus::Full.join(NatReport::NotBehindNat), NatStatus::Full);
    }

    #[test]
    fn unknown_report_changes_nothing() {
        for status in [NatStatus::Unknown, NatStatus::NoNat, NatStatus::Partial, NatStatus::Full] {
            assert_eq!(status.join(NatReport::Unknown), status);
        }
    }
}
