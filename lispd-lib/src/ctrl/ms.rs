//! Map-server: accepts authenticated registrations for configured sites
//! and answers map-requests from the registrations it holds.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::auth;
use crate::config::Config;
use crate::error::{LispError, Result};
use crate::msg::{
    Address, AuthField, Info, LcafAddress, MapNotify, MapRegister, MapReply, MapRequest, Message,
    INFO_AUTH_DATA_OFFSET, NOTIFY_AUTH_DATA_OFFSET, REGISTER_AUTH_DATA_OFFSET,
};
use crate::store::{EidKey, EidPrefix, MapReplyAction, Mapping};
use tokio::time::Instant;

use super::{Daemon, CONTROL_PORT, MS_SITE_EXPIRATION};

/// TTL of the negative reply for an EID no site covers.
const NEGATIVE_REPLY_TTL_MINUTES: u32 = 15;

/// One configured site: who may register under a prefix, and with what key.
pub struct Site {
    pub prefix: EidPrefix,
    pub key: String,
    pub key_id: u16,
    pub proxy_reply: bool,
}

/// A live registration from an ETR.
pub struct Registration {
    pub mapping: Mapping,
    pub expires_at: Instant,
    pub etr: SocketAddr,
    /// Answer map-requests here instead of forwarding them to the ETR.
    pub proxy_reply: bool,
}

pub struct MsState {
    pub sites: Vec<Site>,
    pub registrations: BTreeMap<EidKey, Registration>,
}

impl MsState {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let mut sites = Vec::with_capacity(cfg.sites.len());
        for site in &cfg.sites {
            sites.push(Site {
                prefix: EidPrefix::from_net(site.prefix, site.iid),
                key: site.key.clone(),
                key_id: site.key_id,
                proxy_reply: site.proxy_reply,
            });
        }
        if sites.is_empty() {
            return Err(LispError::Config("map-server started without sites".into()));
        }
        Ok(MsState { sites, registrations: BTreeMap::new() })
    }

    fn site_for(&self, eid: &EidPrefix) -> Option<&Site> {
        self.sites
            .iter()
            .filter(|s| {
                s.prefix.iid() == eid.iid()
                    && eid
                        .address()
                        .ip()
                        .map(|ip| s.prefix.contains(ip, eid.iid()))
                        .unwrap_or(false)
            })
            .max_by_key(|s| s.prefix.mask_len())
    }
}

/// Verify and store a registration, acknowledging with a map-notify when
/// asked to. `reply_to` differs from `etr` when the register was relayed
/// inside an ECM.
pub fn on_map_register(
    daemon: &mut Daemon,
    register: MapRegister,
    raw: &[u8],
    etr: SocketAddr,
    reply_to: SocketAddr,
) {
    let state = match &daemon.device {
        super::device::Device::Ms(state) => state,
        _ => return,
    };
    let Some(first) = register.records.first() else {
        debug!(%etr, "map-register without records dropped");
        return;
    };
    let (iid, address) = first.eid.clone().split_iid();
    let Ok(eid) = EidPrefix::new(address, first.mask_len, iid) else {
        daemon.counters.malformed_records += 1;
        return;
    };
    let Some(site) = state.site_for(&eid) else {
        debug!(%etr, %eid, "map-register for an unknown site dropped");
        return;
    };
    if let Err(e) = auth::verify(
        raw,
        REGISTER_AUTH_DATA_OFFSET,
        &register.auth.data,
        site.key.as_bytes(),
        register.auth.key_id,
    ) {
        daemon.counters.auth_failures += 1;
        warn!(%etr, %eid, error = %e, "map-register failed authentication");
        return;
    }
    let (site_key, site_key_id, site_proxy) = (site.key.clone(), site.key_id, site.proxy_reply);

    let mut accepted = Vec::new();
    for record in register.records.clone() {
        match Mapping::from_record(record) {
            Ok(mapping) => accepted.push(mapping),
            Err(e) => {
                daemon.counters.malformed_records += 1;
                debug!(%etr, error = %e, "skipping unusable record in register");
            }
        }
    }
    let expires_at = Instant::now() + MS_SITE_EXPIRATION;
    let proxy_reply = register.proxy_reply || site_proxy;
    let state = match &mut daemon.device {
        super::device::Device::Ms(state) => state,
        _ => return,
    };
    for mapping in accepted {
        let key = EidKey::of(&mapping.eid);
        info!(%etr, eid = %mapping.eid, locators = mapping.locator_count(), "site registered");
        state
            .registrations
            .insert(key, Registration { mapping, expires_at, etr, proxy_reply });
    }

    if register.want_map_notify {
        let Ok(mac_len) = auth::mac_len(site_key_id) else { return };
        let notify = MapNotify {
            nonce: register.nonce,
            auth: AuthField::placeholder(site_key_id, mac_len),
            records: register.records,
        };
        let mut bytes = Message::MapNotify(notify).encode();
        if let Err(e) =
            auth::sign(&mut bytes, NOTIFY_AUTH_DATA_OFFSET, site_key.as_bytes(), site_key_id)
        {
            warn!(%etr, error = %e, "could not sign map-notify");
            return;
        }
        daemon.queue_send(reply_to, bytes);
    }
}

/// Answer a map-request from the registrations. `reply_to` is the inner
/// source of the encapsulation when the request travelled through a
/// map-resolver, so the reply lands on the ITR that asked.
pub fn on_map_request(daemon: &mut Daemon, request: MapRequest, reply_to: SocketAddr) {
    let state = match &daemon.device {
        super::device::Device::Ms(state) => state,
        _ => return,
    };
    let mut records = Vec::new();
    let mut forward_to: Option<SocketAddr> = None;
    for record in &request.records {
        let (iid, address) = record.eid.clone().split_iid();
        let Some(ip) = address.ip() else {
            daemon.counters.malformed_records += 1;
            continue;
        };
        let registered = state
            .registrations
            .values()
            .filter(|r| r.mapping.eid.contains(ip, iid))
            .max_by_key(|r| r.mapping.eid.mask_len());
        match registered {
            Some(registration) if !registration.proxy_reply => {
                // The ETR wants to answer for itself.
                forward_to = Some(registration.etr);
            }
            Some(registration) => records.push(registration.mapping.to_record()),
            None => {
                // Nobody registered it: answer negatively so the ITR
                // stops asking for a while.
                if let Ok(eid) = EidPrefix::new(address, record.mask_len, iid) {
                    let negative = Mapping::negative(
                        eid,
                        NEGATIVE_REPLY_TTL_MINUTES,
                        MapReplyAction::NativelyForward,
                    );
                    records.push(negative.to_record());
                }
            }
        }
    }
    if let Some(etr) = forward_to {
        // Hand the request to the ETR; its reply goes straight to the
        // ITR's inner source recorded in the request's ITR-RLOCs.
        debug!(%etr, nonce = request.nonce, "forwarding map-request to ETR");
        daemon.queue_send(etr, Message::MapRequest(request).encode());
        return;
    }
    let reply = MapReply {
        probe: request.probe,
        echo_nonce: false,
        security: false,
        nonce: request.nonce,
        records,
    };
    debug!(%reply_to, nonce = request.nonce, "map-reply sent");
    daemon.queue_send(reply_to, Message::MapReply(reply).encode());
}

/// Answer an info-request: echo what we observed about the sender, which
/// is exactly what it cannot see about itself from behind a NAT.
pub fn on_info_request(daemon: &mut Daemon, request: Info, raw: &[u8], src: SocketAddr) {
    let state = match &daemon.device {
        super::device::Device::Ms(state) => state,
        _ => return,
    };
    let (iid, address) = request.eid.clone().split_iid();
    let site = EidPrefix::new(address, request.mask_len, iid)
        .ok()
        .and_then(|eid| state.site_for(&eid));
    let Some(site) = site else {
        debug!(%src, "info-request for an unknown site dropped");
        return;
    };
    if let Err(e) = auth::verify(
        raw,
        INFO_AUTH_DATA_OFFSET,
        &request.auth.data,
        site.key.as_bytes(),
        request.auth.key_id,
    ) {
        daemon.counters.auth_failures += 1;
        warn!(%src, error = %e, "info-request failed authentication");
        return;
    }
    let (site_key, site_key_id) = (site.key.clone(), site.key_id);

    let rtrs: Vec<Address> =
        daemon.cfg.rtrs.iter().map(|r| Address::from(r.address)).collect();
    let body = Address::Lcaf(LcafAddress::NatTraversal {
        ms_port: CONTROL_PORT,
        etr_port: src.port(),
        global_etr: Box::new(Address::from(src.ip())),
        ms: Box::new(Address::NoAddress),
        private_etr: Box::new(Address::NoAddress),
        rtrs,
    });
    let Ok(mac_len) = auth::mac_len(site_key_id) else { return };
    let reply = Info {
        nonce: request.nonce,
        auth: AuthField::placeholder(site_key_id, mac_len),
        ttl_minutes: 5,
        mask_len: request.mask_len,
        eid: request.eid,
        body,
    };
    let mut bytes = Message::InfoReply(reply).encode();
    if let Err(e) = auth::sign(&mut bytes, INFO_AUTH_DATA_OFFSET, site_key.as_bytes(), site_key_id)
    {
        warn!(%src, error = %e, "could not sign info-reply");
        return;
    }
    debug!(%src, "info-reply sent");
    daemon.queue_send(src, bytes);
}

/// Drop registrations whose lease lapsed, then rearm.
pub fn expiry_sweep(daemon: &mut Daemon) {
    let now = Instant::now();
    if let super::device::Device::Ms(state) = &mut daemon.device {
        let before = state.registrations.len();
        state.registrations.retain(|_, r| r.expires_at > now);
        let dropped = before - state.registrations.len();
        if dropped > 0 {
            info!(dropped, "expired site registrations");
        }
    }
    daemon.timers.schedule(MS_SITE_EXPIRATION, expiry_sweep);
}
