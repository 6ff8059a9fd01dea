use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::debug;

use crate::config::{Config, DeviceMode};
use crate::error::Result;
use crate::msg::Message;
use crate::timers::TimerId;

use super::ms::MsState;
use super::nat::NatStatus;
use super::rtr::RtrState;
use super::Daemon;

/// Per-personality state. One tagged variant, one dispatch point; the
/// shared stores stay on `Daemon`.
pub enum Device {
    Xtr(XtrState),
    Mn(XtrState),
    Ms(MsState),
    Rtr(RtrState),
}

/// State for the tunnel-router personalities (xTR and MN share it).
pub struct XtrState {
    pub nat_status: NatStatus,
    /// Holdoff timer coalescing local changes into one SMR round.
    pub smr_timer: Option<TimerId>,
    /// Rearmed info-request when we sit behind a NAT.
    pub info_timer: Option<TimerId>,
    /// Map-servers we are waiting on for a map-notify, with the warn timer.
    pub notify_wait: HashMap<std::net::IpAddr, TimerId>,
    pub xtr_id: [u8; 16],
    pub site_id: u64,
}

impl XtrState {
    pub fn new() -> Self {
        let mut xtr_id = [0u8; 16];
        for chunk in xtr_id.chunks_mut(8) {
            let word: u64 = rand::Rng::random(&mut rand::rng());
            chunk.copy_from_slice(&word.to_be_bytes()[..chunk.len()]);
        }
        XtrState {
            nat_status: NatStatus::Unknown,
            smr_timer: None,
            info_timer: None,
            notify_wait: HashMap::new(),
            xtr_id,
            site_id: 0,
        }
    }
}

impl Default for XtrState {
    fn default() -> Self {
        Self::new()
    }
}

impl Device {
    pub fn from_config(cfg: &Config) -> Result<Device> {
        Ok(match cfg.mode {
            DeviceMode::Xtr => Device::Xtr(XtrState::new()),
            DeviceMode::Mn => Device::Mn(XtrState::new()),
            DeviceMode::Ms => Device::Ms(MsState::from_config(cfg)?),
            DeviceMode::Rtr => Device::Rtr(RtrState::from_config(cfg)),
        })
    }

    pub fn mode(&self) -> DeviceMode {
        match self {
            Device::Xtr(_) => DeviceMode::Xtr,
            Device::Mn(_) => DeviceMode::Mn,
            Device::Ms(_) => DeviceMode::Ms,
            Device::Rtr(_) => DeviceMode::Rtr,
        }
    }
}

/// Fetch the tunnel-router state, or bail out for other personalities.
macro_rules! xtr_state {
    ($daemon:expr) => {
        match &mut $daemon.device {
            Device::Xtr(state) | Device::Mn(state) => state,
            _ => return,
        }
    };
}
pub(crate) use xtr_state;

/// Route one inbound control message to the device logic. Decode and
/// verification failures drop the datagram here; nothing downstream sees
/// a message that failed its checks.
pub fn handle_inbound(daemon: &mut Daemon, raw: &[u8], src: SocketAddr) {
    let message = match Message::parse(raw) {
        Ok(message) => message,
        Err(e) => {
            daemon.counters.decode_errors += 1;
            debug!(%src, error = %e, "dropping undecodable control message");
            return;
        }
    };
    debug!(%src, kind = message.kind(), "control message received");

    match daemon.device.mode() {
        DeviceMode::Xtr | DeviceMode::Mn => match message {
            Message::MapReply(reply) => super::xtr::on_map_reply(daemon, reply),
            Message::MapRequest(request) => super::xtr::on_map_request(daemon, request, src),
            Message::MapNotify(notify) => super::xtr::on_map_notify(daemon, notify, raw, src),
            Message::InfoReply(info) => super::nat::on_info_reply(daemon, info, raw, src),
            other => {
                debug!(%src, kind = other.kind(), "message ignored by tunnel router");
            }
        },
        DeviceMode::Ms => match message {
            Message::MapRegister(register) => {
                super::ms::on_map_register(daemon, register, raw, src, src);
            }
            Message::MapRequest(request) => super::ms::on_map_request(daemon, request, src),
            Message::InfoRequest(info) => super::ms::on_info_request(daemon, info, raw, src),
            Message::Encapsulated(ecm) => {
                let inner_src = ecm.inner.src;
                match Message::parse(&ecm.inner.payload) {
                    Ok(Message::MapRequest(request)) => {
                        super::ms::on_map_request(daemon, request, inner_src);
                    }
                    Ok(Message::MapRegister(register)) => {
                        super::ms::on_map_register(
                            daemon,
                            register,
                            &ecm.inner.payload,
                            inner_src,
                            src,
                        );
                    }
                    Ok(other) => {
                        debug!(%src, kind = other.kind(), "encapsulated message ignored");
                    }
                    Err(e) => {
                        daemon.counters.decode_errors += 1;
                        debug!(%src, error = %e, "undecodable encapsulated message");
                    }
                }
            }
            other => {
                debug!(%src, kind = other.kind(), "message ignored by map-server");
            }
        },
        DeviceMode::Rtr => match message {
            Message::Encapsulated(ecm) => super::rtr::on_ecm(daemon, ecm, src),
            other => {
                debug!(%src, kind = other.kind(), "message ignored by rtr");
            }
        },
    }
}
