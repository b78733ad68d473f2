// src/stream.rs
//
// Upstream side of a streaming connection: one of plain multicast, FCC
// burst + multicast, or RTSP, all dispatched through the owning worker's
// epoll. Media buffers flow through the reorder stage and are handed back
// to the connection for enqueueing.
use std::net::UdpSocket;
use std::os::fd::{AsRawFd, RawFd};

use log::{debug, warn};
use nix::sys::epoll::EpollFlags;

use crate::fcc::{FccSession, FccState, FCC_MSG_RESPONSE, FCC_MSG_SYNC};
use crate::metrics;
use crate::multicast::{join_mcast_group, rejoin_mcast_group};
use crate::pool::{BufferRef, BUFFER_SIZE};
use crate::rtp::{classify_and_trim, PacketKind, ReorderBuffer};
use crate::rtsp::{RtspOutcome, RtspSession, RtspState, RtspTransport};
use crate::service::{Service, ServiceKind};
use crate::snapshot::SnapshotCtx;
use crate::worker::{Env, FdTag};

pub const MCAST_TIMEOUT_MS: i64 = 10_000;
const FCC_TIMEOUT_SIGNALING_MS: i64 = 2_000;
const FCC_TIMEOUT_UNICAST_MS: i64 = 2_000;
const FCC_TIMEOUT_SYNC_WAIT_MS: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamVerdict {
    Continue,
    Close,
}

pub struct StreamContext {
    service: Service,
    pub mcast_sock: Option<UdpSocket>,
    pub fcc: FccSession,
    pub rtsp: Option<RtspSession>,
    pub reorder: ReorderBuffer,
    pub snapshot: SnapshotCtx,
    pub total_bytes: u64,
    last_bytes: u64,
    last_status_update: i64,
    last_mcast_data: i64,
    last_fcc_data: i64,
    last_rejoin: i64,
}

impl StreamContext {
    /// Choose the ingress path and register its sockets with the worker
    /// epoll, owned by `conn_fd`.
    pub fn init(service: &Service, env: &mut Env, conn_fd: RawFd, snapshot_mode: u8) -> anyhow::Result<Self> {
        let now = env.now;
        let mut ctx = Self {
            service: service.clone(),
            mcast_sock: None,
            fcc: FccSession::new(),
            rtsp: None,
            reorder: ReorderBuffer::new(),
            snapshot: SnapshotCtx::default(),
            total_bytes: 0,
            last_bytes: 0,
            last_status_update: now,
            last_mcast_data: now,
            last_fcc_data: now,
            last_rejoin: now,
        };
        if snapshot_mode > 0 {
            ctx.snapshot.init(now, snapshot_mode == 2);
        }

        match service.kind {
            ServiceKind::Rtsp => {
                let transport = if env.cfg.general.rtsp_transport == "udp" {
                    RtspTransport::Udp
                } else {
                    RtspTransport::Tcp
                };
                let rtsp_url = service
                    .rtsp_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("rtsp service without URL"))?;
                let rtsp = RtspSession::connect(
                    rtsp_url,
                    transport,
                    service.playseek.clone(),
                    service.user_agent.clone(),
                )?;
                if let Some(sock) = rtsp.sock.as_ref() {
                    env.registry.add(
                        sock.as_raw_fd(),
                        conn_fd,
                        FdTag::RtspCtl,
                        EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT,
                    )?;
                }
                if let Some(sock) = rtsp.rtp_sock.as_ref() {
                    env.registry
                        .add(sock.as_raw_fd(), conn_fd, FdTag::RtspRtp, EpollFlags::EPOLLIN)?;
                }
                if let Some(sock) = rtsp.rtcp_sock.as_ref() {
                    env.registry
                        .add(sock.as_raw_fd(), conn_fd, FdTag::RtspRtcp, EpollFlags::EPOLLIN)?;
                }
                if transport == RtspTransport::Tcp {
                    // Interleaved TCP delivery is already ordered.
                    ctx.reorder.set_enabled(false);
                }
                ctx.rtsp = Some(rtsp);
            }
            ServiceKind::Mrtp if service.fcc.is_some() => {
                ctx.fcc.initialize_and_request(service)?;
                if let Some(sock) = ctx.fcc.sock.as_ref() {
                    env.registry
                        .add(sock.as_raw_fd(), conn_fd, FdTag::Fcc, EpollFlags::EPOLLIN)?;
                }
            }
            ServiceKind::Mrtp => {
                ctx.join_mcast(env, conn_fd)?;
                ctx.fcc.set_state(FccState::McastActive, "direct multicast");
            }
        }
        Ok(ctx)
    }

    /// Join (or re-create) the multicast socket. Joining resets the data
    /// and rejoin timers so a fresh join never trips a stale timeout.
    fn join_mcast(&mut self, env: &mut Env, conn_fd: RawFd) -> anyhow::Result<()> {
        let sock = join_mcast_group(&self.service)?;
        env.registry
            .add(sock.as_raw_fd(), conn_fd, FdTag::Mcast, EpollFlags::EPOLLIN)?;
        self.last_mcast_data = env.now;
        self.last_rejoin = env.now;
        self.mcast_sock = Some(sock);
        Ok(())
    }

    /// Receive one datagram into a pool buffer. On pool exhaustion the
    /// datagram is drained into a scratch buffer (so level-triggered epoll
    /// does not spin) and accounted as if data had arrived.
    fn recv_pooled(sock: &UdpSocket, env: &Env) -> Option<(BufferRef, Option<std::net::SocketAddr>)> {
        let buf = match env.pool.alloc() {
            Some(b) => b,
            None => {
                debug!("buffer pool exhausted, dropping upstream packet");
                let mut scratch = [0u8; BUFFER_SIZE];
                let _ = sock.recv(&mut scratch);
                return None;
            }
        };
        let res = {
            let mut mem = buf.mem_mut();
            sock.recv_from(&mut mem[..])
        };
        match res {
            Ok((n, peer)) => {
                buf.set_len(n);
                Some((buf, Some(peer)))
            }
            Err(_) => None,
        }
    }

    pub fn handle_fd_event(
        &mut self,
        tag: FdTag,
        readable: bool,
        writable: bool,
        env: &mut Env,
        conn_fd: RawFd,
        out: &mut Vec<BufferRef>,
    ) -> StreamVerdict {
        match tag {
            FdTag::Mcast => self.on_mcast_event(env, out),
            FdTag::Fcc => self.on_fcc_event(env, conn_fd, out),
            FdTag::RtspCtl => self.on_rtsp_ctl_event(readable, writable, env, out),
            FdTag::RtspRtp => {
                let mut raw = Vec::new();
                if let Some(rtsp) = self.rtsp.as_mut() {
                    rtsp.handle_udp_rtp_data(env.pool, &mut raw);
                }
                self.last_mcast_data = env.now;
                for buf in raw {
                    self.ingest(buf, env.now, out);
                }
                StreamVerdict::Continue
            }
            FdTag::RtspRtcp => {
                if let Some(rtsp) = self.rtsp.as_mut() {
                    rtsp.drain_rtcp();
                }
                StreamVerdict::Continue
            }
            FdTag::Client => StreamVerdict::Continue,
        }
    }

    fn on_mcast_event(&mut self, env: &mut Env, out: &mut Vec<BufferRef>) -> StreamVerdict {
        let sock = match self.mcast_sock.as_ref() {
            Some(s) => s,
            None => return StreamVerdict::Continue,
        };
        let buf = match Self::recv_pooled(sock, env) {
            Some((b, _)) => b,
            None => {
                self.last_mcast_data = env.now;
                return StreamVerdict::Continue;
            }
        };
        self.last_mcast_data = env.now;

        match self.fcc.state {
            FccState::McastActive => self.ingest(buf, env.now, out),
            FccState::McastRequested => {
                self.fcc
                    .handle_mcast_transition(buf, env.now, &mut self.reorder, out);
            }
            state => {
                debug!("multicast data in unexpected fcc state {:?}", state);
            }
        }
        StreamVerdict::Continue
    }

    fn on_fcc_event(&mut self, env: &mut Env, conn_fd: RawFd, out: &mut Vec<BufferRef>) -> StreamVerdict {
        let server = match self.fcc.server {
            Some(s) => s,
            None => return StreamVerdict::Continue,
        };
        let sock = match self.fcc.sock.as_ref() {
            Some(s) => s,
            None => return StreamVerdict::Continue,
        };
        let (buf, peer) = match Self::recv_pooled(sock, env) {
            Some((b, p)) => (b, p),
            None => {
                self.last_fcc_data = env.now;
                return StreamVerdict::Continue;
            }
        };
        let peer = match peer {
            Some(std::net::SocketAddr::V4(p)) => p,
            _ => return StreamVerdict::Continue,
        };
        // Only the negotiated server may feed this socket.
        if peer.ip() != server.ip() {
            return StreamVerdict::Continue;
        }
        self.last_fcc_data = env.now;

        if peer.port() == server.port() {
            let kind = buf.payload().first().copied();
            match kind {
                Some(FCC_MSG_RESPONSE) => {
                    let redirect = {
                        let payload = buf.payload();
                        self.fcc.handle_server_response(&payload)
                    };
                    match redirect {
                        Ok(true) => {
                            if let Err(e) = self.fcc.initialize_and_request(&self.service) {
                                warn!("fcc redirect retry failed: {:#}", e);
                                return self.fcc_fallback_to_mcast(env, conn_fd, "redirect failed");
                            }
                        }
                        Ok(false) => {}
                        Err(e) => {
                            debug!("fcc response rejected: {:#}", e);
                            return self.fcc_fallback_to_mcast(env, conn_fd, "server rejected");
                        }
                    }
                }
                Some(FCC_MSG_SYNC) => {
                    return self.handle_sync(env, conn_fd, "sync notification");
                }
                _ => {}
            }
        } else if peer.port() == self.fcc.media_port {
            self.fcc
                .handle_unicast_media(buf, env.now, &mut self.reorder, out);
        }
        StreamVerdict::Continue
    }

    /// Time to join the multicast group while the burst keeps running.
    fn handle_sync(&mut self, env: &mut Env, conn_fd: RawFd, reason: &str) -> StreamVerdict {
        if self.mcast_sock.is_none() {
            if let Err(e) = self.join_mcast(env, conn_fd) {
                warn!("fcc: multicast join failed at sync: {:#}", e);
                return StreamVerdict::Close;
            }
        }
        self.fcc.set_state(FccState::McastRequested, reason);
        StreamVerdict::Continue
    }

    /// Any FCC failure degrades to plain multicast; the client keeps its
    /// stream, at worst with a slower start.
    fn fcc_fallback_to_mcast(&mut self, env: &mut Env, conn_fd: RawFd, reason: &str) -> StreamVerdict {
        if let Some(sock) = self.fcc.sock.as_ref() {
            env.registry.remove(sock.as_raw_fd());
        }
        self.fcc.close();
        if self.mcast_sock.is_none() {
            if let Err(e) = self.join_mcast(env, conn_fd) {
                warn!("multicast join failed during fcc fallback: {:#}", e);
                return StreamVerdict::Close;
            }
        }
        self.fcc.set_state(FccState::McastActive, reason);
        StreamVerdict::Continue
    }

    fn on_rtsp_ctl_event(
        &mut self,
        readable: bool,
        writable: bool,
        env: &mut Env,
        out: &mut Vec<BufferRef>,
    ) -> StreamVerdict {
        let mut raw = Vec::new();
        let (outcome, ctl_fd, wants_write, transport) = match self.rtsp.as_mut() {
            Some(rtsp) => {
                let outcome = rtsp.handle_socket_event(writable, readable, env.pool, &mut raw);
                let fd = rtsp.sock.as_ref().map(|s| s.as_raw_fd());
                (outcome, fd, rtsp.wants_write(), rtsp.transport)
            }
            None => return StreamVerdict::Continue,
        };
        self.last_mcast_data = env.now;

        for buf in raw {
            match classify_and_trim(&buf) {
                PacketKind::Rtp { seq } if transport == RtspTransport::Udp => {
                    self.reorder.push(seq, buf, env.now, out);
                }
                _ => out.push(buf), // interleaved TCP arrives in order
            }
        }

        match outcome {
            RtspOutcome::Continue => {
                if let Some(fd) = ctl_fd {
                    let mut flags = EpollFlags::EPOLLIN;
                    if wants_write {
                        flags |= EpollFlags::EPOLLOUT;
                    }
                    env.registry.modify(fd, flags);
                }
                StreamVerdict::Continue
            }
            RtspOutcome::Closed => {
                debug!("rtsp: session closed gracefully");
                self.drop_rtsp(env);
                StreamVerdict::Close
            }
            RtspOutcome::Error => {
                self.drop_rtsp(env);
                StreamVerdict::Close
            }
        }
    }

    fn ingest(&mut self, buf: BufferRef, now: i64, out: &mut Vec<BufferRef>) {
        if self.snapshot.enabled {
            let _ = self.snapshot.process_packet(&buf.payload());
            return;
        }
        match classify_and_trim(&buf) {
            PacketKind::Rtp { seq } => self.reorder.push(seq, buf, now, out),
            PacketKind::Raw => out.push(buf),
        }
    }

    /// Periodic work: rejoin, timeouts, keepalives, reorder recovery and
    /// bandwidth accounting. Returns the verdict, whether the snapshot
    /// budget expired, and a pending status byte/bandwidth update.
    pub fn tick(
        &mut self,
        env: &mut Env,
        conn_fd: RawFd,
        out: &mut Vec<BufferRef>,
    ) -> (StreamVerdict, bool, Option<(u64, u32)>) {
        let now = env.now;

        // Periodic IGMP rejoin on the existing socket
        let rejoin_interval = env.cfg.general.mcast_rejoin_interval as i64 * 1000;
        if rejoin_interval > 0 {
            if let Some(sock) = self.mcast_sock.as_ref() {
                if now - self.last_rejoin >= rejoin_interval {
                    debug!("multicast: periodic rejoin");
                    match rejoin_mcast_group(sock, &self.service) {
                        Ok(()) => self.last_rejoin = now,
                        Err(e) => warn!("multicast rejoin failed: {:#}", e),
                    }
                }
            }
        }

        // Multicast silence budget
        if self.mcast_sock.is_some() && now - self.last_mcast_data >= MCAST_TIMEOUT_MS {
            warn!("multicast: no data for {} ms, closing connection", MCAST_TIMEOUT_MS);
            return (StreamVerdict::Close, false, None);
        }

        // FCC timeouts, distinct per phase
        if self.fcc.sock.is_some() {
            let elapsed = now - self.last_fcc_data;
            match self.fcc.state {
                FccState::Requested | FccState::UnicastPending => {
                    if elapsed >= FCC_TIMEOUT_SIGNALING_MS {
                        warn!("fcc: signalling timeout, falling back to multicast");
                        if let StreamVerdict::Close =
                            self.fcc_fallback_to_mcast(env, conn_fd, "signalling timeout")
                        {
                            return (StreamVerdict::Close, false, None);
                        }
                    }
                }
                FccState::UnicastActive | FccState::McastRequested => {
                    if elapsed >= FCC_TIMEOUT_UNICAST_MS {
                        warn!("fcc: unicast stream interrupted, falling back to multicast");
                        if let StreamVerdict::Close =
                            self.fcc_fallback_to_mcast(env, conn_fd, "unicast interrupted")
                        {
                            return (StreamVerdict::Close, false, None);
                        }
                    } else if self.fcc.state == FccState::UnicastActive
                        && self.fcc.unicast_start_ms > 0
                        && now - self.fcc.unicast_start_ms >= FCC_TIMEOUT_SYNC_WAIT_MS
                    {
                        // Server never sent the sync; force the join path.
                        if let StreamVerdict::Close = self.handle_sync(env, conn_fd, "sync wait timeout") {
                            return (StreamVerdict::Close, false, None);
                        }
                    }
                }
                _ => {}
            }
        }

        // RTSP keepalive (UDP transport keeps the session alive via OPTIONS)
        if let Some(rtsp) = self.rtsp.as_mut() {
            if rtsp.state == RtspState::Playing
                && rtsp.transport == RtspTransport::Udp
                && rtsp.keepalive_interval_ms > 0
            {
                if rtsp.last_keepalive_ms == 0 {
                    rtsp.last_keepalive_ms = now;
                } else if now - rtsp.last_keepalive_ms >= rtsp.keepalive_interval_ms {
                    rtsp.send_keepalive(now);
                }
            }
            if rtsp.state == RtspState::Teardown && now >= rtsp.teardown_deadline_ms {
                debug!("rtsp: teardown deadline passed");
                return (StreamVerdict::Close, false, None);
            }
        }

        // Reorder wait recovery
        if self.reorder.is_waiting() {
            self.reorder.tick(now, out);
        }

        // Snapshot budget
        let snapshot_expired = self.snapshot.timed_out(now);

        // Bandwidth/status once per second
        let mut status_update = None;
        if !self.snapshot.enabled && now - self.last_status_update >= 1000 {
            let diff = self.total_bytes - self.last_bytes;
            let elapsed = now - self.last_status_update;
            let bandwidth = if elapsed > 0 { (diff * 1000 / elapsed as u64) as u32 } else { 0 };
            status_update = Some((self.total_bytes, bandwidth));
            self.last_bytes = self.total_bytes;
            self.last_status_update = now;
        }

        (StreamVerdict::Continue, snapshot_expired, status_update)
    }

    fn drop_rtsp(&mut self, env: &mut Env) {
        if let Some(rtsp) = self.rtsp.take() {
            if let Some(s) = rtsp.sock.as_ref() {
                env.registry.remove(s.as_raw_fd());
            }
            if let Some(s) = rtsp.rtp_sock.as_ref() {
                env.registry.remove(s.as_raw_fd());
            }
            if let Some(s) = rtsp.rtcp_sock.as_ref() {
                env.registry.remove(s.as_raw_fd());
            }
        }
    }

    /// First phase of teardown: stop multicast/FCC immediately, start an
    /// asynchronous RTSP TEARDOWN when a session is live.
    pub fn begin_cleanup(&mut self, env: &mut Env, _conn_fd: RawFd) {
        if self.reorder.has_activity() {
            debug!(
                "rtp reorder stats: out_of_order={}, duplicates={}, recovered={}, drops={}",
                self.reorder.out_of_order,
                self.reorder.duplicates,
                self.reorder.recovered,
                self.reorder.drops
            );
            metrics::add_reorder_events("out_of_order", self.reorder.out_of_order);
            metrics::add_reorder_events("duplicates", self.reorder.duplicates);
            metrics::add_reorder_events("recovered", self.reorder.recovered);
            metrics::add_reorder_events("drops", self.reorder.drops);
        }

        if let Some(sock) = self.mcast_sock.take() {
            env.registry.remove(sock.as_raw_fd());
        }
        if let Some(sock) = self.fcc.sock.as_ref() {
            env.registry.remove(sock.as_raw_fd());
        }
        self.fcc.close();

        let teardown_started = match self.rtsp.as_mut() {
            Some(rtsp) if rtsp.state == RtspState::Playing => {
                // RTP/RTCP ingress stops now; the control channel stays up
                // for the TEARDOWN exchange.
                if let Some(s) = rtsp.rtp_sock.take() {
                    env.registry.remove(s.as_raw_fd());
                }
                if let Some(s) = rtsp.rtcp_sock.take() {
                    env.registry.remove(s.as_raw_fd());
                }
                rtsp.start_teardown(env.now)
            }
            _ => false,
        };
        if !teardown_started {
            self.drop_rtsp(env);
        }
    }

    /// True once no asynchronous teardown holds the context open.
    pub fn cleanup_finished(&self, now: i64) -> bool {
        match self.rtsp.as_ref() {
            None => true,
            Some(rtsp) => rtsp.state != RtspState::Teardown || now >= rtsp.teardown_deadline_ms,
        }
    }

    pub fn finish_cleanup(&mut self, env: &mut Env) {
        if let Some(sock) = self.mcast_sock.take() {
            env.registry.remove(sock.as_raw_fd());
        }
        if let Some(sock) = self.fcc.sock.as_ref() {
            env.registry.remove(sock.as_raw_fd());
        }
        self.fcc.close();
        self.drop_rtsp(env);
    }
}
