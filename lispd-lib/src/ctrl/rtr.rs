//! Re-encapsulating tunnel router: relays ECM-wrapped map-registers from
//! NATted xTRs to the map-server after checking the MS-RTR auth field.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::auth;
use crate::config::Config;
use crate::msg::{Ecm, Message};

use super::{Daemon, CONTROL_PORT};

pub struct RtrState {
    /// Map-server the relayed registrations go to, with the MS-RTR key.
    pub ms: Option<RtrUplink>,
}

pub struct RtrUplink {
    pub address: std::net::IpAddr,
    pub key: String,
    pub key_id: u16,
}

impl RtrState {
    pub fn from_config(cfg: &Config) -> Self {
        let ms = cfg.map_servers.first().map(|ms| RtrUplink {
            address: ms.address,
            key: ms.key.clone(),
            key_id: ms.key_id,
        });
        RtrState { ms }
    }
}

/// Decapsulate, verify the RTR auth field when present, and re-emit the
/// inner message to the map-server over our own transport.
pub fn on_ecm(daemon: &mut Daemon, ecm: Ecm, src: SocketAddr) {
    let uplink = match &daemon.device {
        super::device::Device::Rtr(state) => match &state.ms {
            Some(uplink) => uplink,
            None => {
                debug!(%src, "no map-server uplink configured, dropping relay");
                return;
            }
        },
        _ => return,
    };

    if let Some(rtr_auth) = &ecm.rtr_auth {
        // The auth field covers the inner message bytes.
        let expected =
            match auth::keyed_digest(&ecm.inner.payload, uplink.key.as_bytes(), rtr_auth.key_id) {
                Ok(mac) => mac,
                Err(e) => {
                    daemon.counters.auth_failures += 1;
                    warn!(%src, error = %e, "cannot check RTR auth field");
                    return;
                }
            };
        if !subtle_eq(&expected, &rtr_auth.data) {
            daemon.counters.auth_failures += 1;
            warn!(%src, "RTR auth field mismatch, dropping relay");
            return;
        }
    }

    let inner = match Message::parse(&ecm.inner.payload) {
        Ok(message) => message,
        Err(e) => {
            daemon.counters.decode_errors += 1;
            debug!(%src, error = %e, "undecodable relayed message");
            return;
        }
    };
    match inner {
        Message::MapRegister(_) => {
            let ms = SocketAddr::new(uplink.address, CONTROL_PORT);
            info!(%src, %ms, "relaying map-register to map-server");
            daemon.queue_send(ms, ecm.inner.payload);
        }
        other => {
            debug!(%src, kind = other.kind(), "relay only carries map-registers");
        }
    }
}

/// Constant-time equality for the relayed auth check.
fn subtle_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}
