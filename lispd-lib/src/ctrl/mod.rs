#![forbid(unsafe_code)]

pub mod device;
pub mod ms;
pub mod nat;
pub mod rtr;
pub mod sockets;
pub mod status;
pub mod xtr;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::{Config, DeviceMode};
use crate::error::{LispError, Result};
use crate::msg::Address;
use crate::nonce::{NonceEntry, NonceRegistry, RequestContext, RequestKind, TimerVerdict};
use crate::store::{EidPrefix, FwdCache, LocalDb, MapCache, Mapping};
use crate::timers::TimerWheel;

use device::Device;
use sockets::Sockets;

/// LISP control traffic runs over this UDP port.
pub const CONTROL_PORT: u16 = 4342;

/// First map-request fires again after this long.
pub const INITIAL_MRQ_TIMEOUT: Duration = Duration::from_secs(2);
/// First SMR retransmit delay.
pub const INITIAL_SMR_TIMEOUT: Duration = Duration::from_secs(3);
/// First info-request retransmit delay.
pub const INITIAL_INFO_TIMEOUT: Duration = Duration::from_secs(3);
/// Interface flaps within this window collapse into one SMR round.
pub const SMR_HOLDOFF: Duration = Duration::from_secs(5);
pub const MAX_SMR_RETRANSMIT: u8 = 2;
pub const MAP_REQUEST_RETRIES: u8 = 3;
pub const INFO_REQUEST_RETRIES: u8 = 3;
pub const MAP_REGISTER_INTERVAL: Duration = Duration::from_secs(60);
/// How long to wait for a map-notify before logging the miss.
pub const MAP_NOTIFY_WAIT: Duration = Duration::from_secs(32);
pub const RLOC_PROBING_INTERVAL: Duration = Duration::from_secs(30);
pub const RLOC_PROBING_RETRIES: u8 = 2;
pub const RLOC_PROBING_RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound on the multiplexer wait so the expiry sweep runs at least
/// once a second.
pub const SELECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Registrations at a map-server lapse after this long.
pub const MS_SITE_EXPIRATION: Duration = Duration::from_secs(180);
/// TTL of the negative cache entry installed when a map-request times out.
pub const NEGATIVE_CACHE_TTL_MINUTES: u32 = 1;
/// TTL advertised for our own mappings in map-registers.
pub const LOCAL_MAPPING_TTL_MINUTES: u32 = 1440;
/// TTL on the IP header wrapped around an encapsulated control message.
pub const ENCAP_TTL: u8 = 32;
/// A map-request carries at most this many ITR-RLOCs.
pub const MAX_ITR_RLOCS: usize = 31;

/// The inner UDP source port of an encapsulated map-request encodes the
/// low nonce bits so the reply can be demultiplexed behind a NAT.
pub fn map_request_source_port(nonce: u64) -> u16 {
    0xf000 | (nonce & 0x0fff) as u16
}

/// A control datagram queued for the socket layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub dst: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Narrow interface to the data-plane collaborator owning the tun device
/// and route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataPlaneIntent {
    InstallEid { prefix: EidPrefix },
    RemoveEid { prefix: EidPrefix },
    SetMtu { mtu: usize },
    /// Stop encapsulating toward an RLOC that went down.
    DrainRloc { rloc: Address },
    /// A pending lookup resolved; queued packets can be flushed.
    CacheFilled { prefix: EidPrefix },
}

/// Events injected by external collaborators (netlink watcher, data plane).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalEvent {
    /// The data plane has no encap decision for this destination.
    CacheMiss { dst: IpAddr, iid: Option<u32> },
    InterfaceUp { rloc: IpAddr },
    InterfaceDown { rloc: IpAddr },
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct Counters {
    pub rx_datagrams: u64,
    pub tx_datagrams: u64,
    pub oversize_dropped: u64,
    pub decode_errors: u64,
    pub auth_failures: u64,
    pub nonce_mismatches: u64,
    pub malformed_records: u64,
    pub intents_dropped: u64,
    pub registrations_sent: u64,
    pub probes_sent: u64,
}

/// The whole control plane: every piece of mutable state lives here and is
/// only touched from the daemon thread. Timer callbacks, inbound datagrams
/// and external events all run to completion against this value.
pub struct Daemon {
    pub cfg: Arc<Config>,
    pub device: Device,
    pub local_db: LocalDb,
    pub map_cache: MapCache,
    pub fwd_cache: FwdCache,
    pub nonces: NonceRegistry,
    pub timers: TimerWheel<Daemon>,
    pub counters: Counters,
    /// RLOCs of interfaces currently up, in report order.
    pub local_rlocs: Vec<IpAddr>,
    /// Datagrams queued for the socket layer, flushed once per turn.
    pub out: Vec<Outbound>,
    intents: Option<mpsc::Sender<DataPlaneIntent>>,
    ip_id: u16,
}

impl Daemon {
    pub fn new(cfg: Arc<Config>, intents: Option<mpsc::Sender<DataPlaneIntent>>) -> Result<Self> {
        let device = Device::from_config(&cfg)?;
        let mut local_db = LocalDb::new();
        for eid in &cfg.eids {
            let prefix = EidPrefix::from_net(eid.prefix, eid.iid);
            let mut mapping = Mapping::new(prefix, LOCAL_MAPPING_TTL_MINUTES);
            mapping.authoritative = true;
            local_db.add_local(mapping)?;
        }
        Ok(Daemon {
            cfg,
            device,
            local_db,
            map_cache: MapCache::new(),
            fwd_cache: FwdCache::new(),
            nonces: NonceRegistry::new(),
            timers: TimerWheel::new(),
            counters: Counters::default(),
            local_rlocs: Vec::new(),
            out: Vec::new(),
            intents,
            ip_id: 0,
        })
    }

    /// Arm the periodic machinery and tell the data plane about the MTU.
    pub fn start(&mut self) {
        let mtu = self.cfg.mtu;
        self.intent(DataPlaneIntent::SetMtu { mtu });
        for mapping in self.local_db.iter_local() {
            let prefix = mapping.eid.clone();
            if let Some(tx) = &self.intents {
                if tx.try_send(DataPlaneIntent::InstallEid { prefix }).is_err() {
                    self.counters.intents_dropped += 1;
                }
            }
        }
        match self.cfg.mode {
            DeviceMode::Xtr | DeviceMode::Mn => {
                self.timers.schedule(MAP_REGISTER_INTERVAL, xtr::register_cycle);
                self.timers.schedule(RLOC_PROBING_INTERVAL, xtr::probe_cycle);
            }
            DeviceMode::Ms => {
                self.timers.schedule(MS_SITE_EXPIRATION, ms::expiry_sweep);
            }
            DeviceMode::Rtr => {}
        }
    }

    pub fn handle_external(&mut self, event: ExternalEvent) {
        match event {
            ExternalEvent::CacheMiss { dst, iid } => xtr::handle_cache_miss(self, dst, iid),
            ExternalEvent::InterfaceUp { rloc } => xtr::on_interface_up(self, rloc),
            ExternalEvent::InterfaceDown { rloc } => xtr::on_interface_down(self, rloc),
        }
    }

    pub fn handle_datagram(&mut self, raw: &[u8], src: SocketAddr) {
        self.counters.rx_datagrams += 1;
        device::handle_inbound(self, raw, src);
    }

    /// Remove lapsed map-cache entries, clearing any outstanding request
    /// tied to them and telling the forwarding cache.
    pub fn expire_sweep(&mut self, now: Instant) {
        let mut expired: Vec<(EidPrefix, Option<u64>)> = Vec::new();
        self.map_cache.expire(now, |prefix, nonce| {
            expired.push((prefix.clone(), nonce));
        });
        for (prefix, nonce) in expired {
            tracing::debug!(%prefix, "map-cache entry expired");
            if let Some(nonce) = nonce {
                self.take_nonce(nonce);
            }
            self.fwd_cache.invalidate_prefix(&prefix);
        }
    }

    /// Issue a nonce with its retransmit timer attached.
    pub(crate) fn issue_request(
        &mut self,
        kind: RequestKind,
        context: RequestContext,
        initial_timeout: Duration,
        max_retries: u8,
    ) -> u64 {
        let nonce = self.nonces.issue(kind, context, initial_timeout, max_retries);
        let timer =
            self.timers.schedule(initial_timeout, move |d: &mut Daemon| d.on_nonce_timer(nonce));
        self.nonces.set_timer(nonce, timer);
        nonce
    }

    /// Consume an outstanding nonce and cancel its retransmit timer.
    pub(crate) fn take_nonce(&mut self, value: u64) -> Option<NonceEntry> {
        let entry = self.nonces.consume(value)?;
        if let Some(timer) = entry.timer {
            self.timers.cancel(timer);
        }
        Some(entry)
    }

    fn on_nonce_timer(&mut self, nonce: u64) {
        match self.nonces.on_timer_fired(nonce) {
            Some(TimerVerdict::Retransmit { timeout, context }) => {
                xtr::retransmit(self, nonce, &context);
                let timer =
                    self.timers.schedule(timeout, move |d: &mut Daemon| d.on_nonce_timer(nonce));
                self.nonces.set_timer(nonce, timer);
            }
            Some(TimerVerdict::Expired { context }) => {
                xtr::on_request_expired(self, context);
            }
            None => {}
        }
    }

    pub(crate) fn queue_send(&mut self, dst: SocketAddr, bytes: Vec<u8>) {
        self.out.push(Outbound { dst, bytes });
    }

    pub(crate) fn intent(&mut self, intent: DataPlaneIntent) {
        if let Some(tx) = &self.intents {
            if tx.try_send(intent).is_err() {
                self.counters.intents_dropped += 1;
            }
        }
    }

    /// Wrapping counter feeding the identification field of encapsulated
    /// IPv4 headers.
    pub(crate) fn next_ip_id(&mut self) -> u16 {
        let id = self.ip_id;
        self.ip_id = self.ip_id.wrapping_add(1);
        id
    }

    /// A local RLOC in the same family as `peer`, if any interface is up.
    pub(crate) fn local_rloc_for(&self, peer: IpAddr) -> Option<IpAddr> {
        self.local_rlocs.iter().copied().find(|r| r.is_ipv4() == peer.is_ipv4())
    }

    pub fn shutdown(&mut self) {
        self.timers.cancel_all();
        self.out.clear();
    }
}

/// Bind the control sockets and run the daemon until SIGINT or SIGTERM.
/// Single-threaded: one iteration drains expired cache entries, due timers
/// and ready sources, in the order external events, timers, datagrams.
pub async fn run(
    cfg: Arc<Config>,
    intents: mpsc::Sender<DataPlaneIntent>,
    mut external: mpsc::Receiver<ExternalEvent>,
) -> Result<()> {
    let sockets = Sockets::bind()?;
    let status_listener = match &cfg.status_socket {
        Some(path) => {
            let _ = std::fs::remove_file(path);
            Some(UnixListener::bind(path).map_err(|e| LispError::Socket(e.to_string()))?)
        }
        None => None,
    };

    let mut daemon = Daemon::new(cfg.clone(), Some(intents))?;
    daemon.start();
    tracing::info!(mode = ?cfg.mode, "control plane started");

    let mut sigterm =
        signal(SignalKind::terminate()).map_err(|e| LispError::Socket(e.to_string()))?;
    let mut sigint =
        signal(SignalKind::interrupt()).map_err(|e| LispError::Socket(e.to_string()))?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut external_open = true;

    loop {
        let now = Instant::now();
        daemon.expire_sweep(now);
        while let Some(callback) = daemon.timers.pop_due(now) {
            callback(&mut daemon);
        }
        sockets.flush(&mut daemon).await;

        let deadline = daemon
            .timers
            .next_deadline()
            .map_or(now + SELECT_TIMEOUT, |d| d.min(now + SELECT_TIMEOUT));

        tokio::select! {
            biased;
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, shutting down");
                break;
            }
            _ = sigint.recv() => {
                tracing::info!("SIGINT received, shutting down");
                break;
            }
            event = external.recv(), if external_open => {
                match event {
                    Some(event) => daemon.handle_external(event),
                    None => external_open = false,
                }
            }
            received = sockets.recv(&mut buf) => {
                match received {
                    Ok((len, src)) => {
                        if len > cfg.mtu {
                            daemon.counters.oversize_dropped += 1;
                            tracing::debug!(%src, len, "oversize control datagram dropped");
                        } else {
                            daemon.handle_datagram(&buf[..len], src);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "control socket receive error");
                    }
                }
            }
            accepted = status::accept(&status_listener) => {
                if let Some(stream) = accepted {
                    status::serve(&daemon, stream);
                }
            }
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }

    daemon.shutdown();
    if let Some(path) = &cfg.status_socket {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}
