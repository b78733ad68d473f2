// src/multicast.rs
use anyhow::Context;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use crate::service::Service;

const MCAST_RECV_BUFFER_BYTES: usize = 4 << 20;

/// Build, bind and join the group socket for a multicast service.
/// The socket is non-blocking; the caller registers it with epoll.
pub fn join_mcast_group(service: &Service) -> anyhow::Result<UdpSocket> {
    let group = service
        .addr
        .ok_or_else(|| anyhow::anyhow!("service has no multicast address"))?;

    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket")?;
    sock.set_reuse_address(true).ok();
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    sock.set_reuse_port(true).ok();

    // Bind to wildcard:port for multicast RX
    let bind_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), group.port());
    sock.bind(&bind_addr.into()).context("bind")?;

    // Tolerate bursts while a slow client backs up the worker
    let _ = sock.set_recv_buffer_size(MCAST_RECV_BUFFER_BYTES);

    join(&sock, group, service.source)?;

    sock.set_nonblocking(true).context("set nonblocking")?;
    Ok(sock.into())
}

/// LEAVE then JOIN on the existing socket, forcing a fresh IGMP report.
/// Used by the periodic rejoin tick to survive snooping switches that
/// time out group state.
pub fn rejoin_mcast_group(sock: &UdpSocket, service: &Service) -> anyhow::Result<()> {
    let group = service
        .addr
        .ok_or_else(|| anyhow::anyhow!("service has no multicast address"))?;
    let s = SockRef::from(sock);
    match service.source {
        Some(src) => {
            s.leave_ssm_v4(&src, group.ip(), &Ipv4Addr::UNSPECIFIED).ok();
            s.join_ssm_v4(&src, group.ip(), &Ipv4Addr::UNSPECIFIED)
                .context("rejoin ssm")?;
        }
        None => {
            s.leave_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED).ok();
            s.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)
                .context("rejoin")?;
        }
    }
    Ok(())
}

fn join(sock: &Socket, group: SocketAddrV4, source: Option<Ipv4Addr>) -> anyhow::Result<()> {
    match source {
        Some(src) => sock
            .join_ssm_v4(&src, group.ip(), &Ipv4Addr::UNSPECIFIED)
            .context("join_ssm_v4"),
        None => sock
            .join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)
            .context("join_multicast_v4"),
    }
}
