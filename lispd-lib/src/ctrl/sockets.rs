//! UDP control sockets. Bound through socket2 so reuse and family options
//! are set before tokio takes over the descriptor.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::{LispError, Result};

use super::{Daemon, CONTROL_PORT};

pub struct Sockets {
    v4: Option<UdpSocket>,
    v6: Option<UdpSocket>,
}

impl Sockets {
    /// Bind UDP 4342 for each address family. A family that cannot bind is
    /// fatal only when the other is missing too: dual-stack hosts keep
    /// running on the family they have.
    pub fn bind() -> Result<Self> {
        let v4 = match bind_udp((Ipv4Addr::UNSPECIFIED, CONTROL_PORT).into()) {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!(error = %e, "IPv4 control socket unavailable");
                None
            }
        };
        let v6 = match bind_udp((Ipv6Addr::UNSPECIFIED, CONTROL_PORT).into()) {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!(error = %e, "IPv6 control socket unavailable");
                None
            }
        };
        if v4.is_none() && v6.is_none() {
            return Err(LispError::Socket(format!(
                "cannot bind UDP {CONTROL_PORT} on any address family"
            )));
        }
        Ok(Sockets { v4, v6 })
    }

    /// Wait for a datagram on whichever family socket becomes readable.
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        match (&self.v4, &self.v6) {
            (Some(v4), Some(v6)) => {
                let mut v6_buf = vec![0u8; buf.len()];
                tokio::select! {
                    r = v4.recv_from(buf) => r,
                    r = v6.recv_from(&mut v6_buf) => {
                        match r {
                            Ok((n, addr)) => {
                                buf[..n].copy_from_slice(&v6_buf[..n]);
                                Ok((n, addr))
                            }
                            Err(e) => Err(e),
                        }
                    },
                }
            }
            (Some(v4), None) => v4.recv_from(buf).await,
            (None, Some(v6)) => v6.recv_from(buf).await,
            (None, None) => std::future::pending().await,
        }
    }

    /// Drain the daemon's outbound queue. Send failures are logged and the
    /// datagram dropped; the retransmit machinery covers the loss.
    pub async fn flush(&self, daemon: &mut Daemon) {
        let queued = std::mem::take(&mut daemon.out);
        for outbound in queued {
            let socket = match outbound.dst {
                SocketAddr::V4(_) => self.v4.as_ref(),
                SocketAddr::V6(_) => self.v6.as_ref(),
            };
            let Some(socket) = socket else {
                debug!(dst = %outbound.dst, "no socket for family, dropping send");
                continue;
            };
            match socket.send_to(&outbound.bytes, outbound.dst).await {
                Ok(_) => daemon.counters.tx_datagrams += 1,
                Err(e) => warn!(dst = %outbound.dst, error = %e, "send failed"),
            }
        }
    }
}

fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| LispError::Socket(e.to_string()))?;
    socket.set_reuse_address(true).map_err(|e| LispError::Socket(e.to_string()))?;
    if addr.is_ipv6() {
        // Keep the families separate; the v4 socket owns v4 traffic.
        socket.set_only_v6(true).map_err(|e| LispError::Socket(e.to_string()))?;
    }
    socket.set_nonblocking(true).map_err(|e| LispError::Socket(e.to_string()))?;
    socket.bind(&addr.into()).map_err(|e| LispError::Socket(e.to_string()))?;
    UdpSocket::from_std(socket.into()).map_err(|e| LispError::Socket(e.to_string()))
}
