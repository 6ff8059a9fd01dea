//! Status socket: each connection gets one JSON snapshot of the control
//! plane, then EOF. Meant for a CLI or monitoring probe on the same host.

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::config::DeviceMode;

use super::device::Device;
use super::nat::NatStatus;
use super::{Counters, Daemon};

#[derive(Serialize)]
struct StatusSnapshot {
    mode: &'static str,
    nat_status: Option<NatStatus>,
    local_mappings: usize,
    map_cache: Vec<CacheLine>,
    outstanding_requests: usize,
    counters: Counters,
}

#[derive(Serialize)]
struct CacheLine {
    eid: String,
    locators: usize,
    active: bool,
}

/// Accept on the optional status listener, pending forever when disabled
/// so it can sit in the daemon's select.
pub async fn accept(listener: &Option<UnixListener>) -> Option<UnixStream> {
    match listener {
        Some(listener) => listener.accept().await.ok().map(|(stream, _)| stream),
        None => std::future::pending().await,
    }
}

/// Serialize the snapshot now (daemon state cannot leave this thread) and
/// let a task drain it to the client.
pub fn serve(daemon: &Daemon, stream: UnixStream) {
    let snapshot = snapshot(daemon);
    let mut body = match serde_json::to_vec_pretty(&snapshot) {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, "status snapshot failed to serialize");
            return;
        }
    };
    body.push(b'\n');
    tokio::spawn(async move {
        let mut stream = stream;
        let _ = stream.write_all(&body).await;
        let _ = stream.shutdown().await;
    });
}

fn snapshot(daemon: &Daemon) -> StatusSnapshot {
    let nat_status = match &daemon.device {
        Device::Xtr(state) | Device::Mn(state) => Some(state.nat_status),
        _ => None,
    };
    StatusSnapshot {
        mode: match daemon.device.mode() {
            DeviceMode::Xtr => "xtr",
            DeviceMode::Mn => "mn",
            DeviceMode::Ms => "ms",
            DeviceMode::Rtr => "rtr",
        },
        nat_status,
        local_mappings: daemon.local_db.len(),
        map_cache: daemon
            .map_cache
            .iter_cache()
            .map(|entry| CacheLine {
                eid: entry.mapping.eid.to_string(),
                locators: entry.mapping.locator_count(),
                active: entry.active,
            })
            .collect(),
        outstanding_requests: daemon.nonces.len(),
        counters: daemon.counters,
    }
}
