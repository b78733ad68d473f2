// src/rtsp.rs
//
// Non-blocking RTSP client session. The handshake
// (OPTIONS -> DESCRIBE -> SETUP -> PLAY) runs asynchronously off the worker
// epoll; in PLAYING state RTP arrives either interleaved on the control TCP
// socket ('$'-framed) or on a dedicated UDP socket pair.
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};

use anyhow::Context;
use bytes::{Buf, BytesMut};
use log::{debug, info, warn};
use url::Url;

use crate::pool::{BufferPool, BufferRef, BUFFER_SIZE};

pub const RTSP_DEFAULT_PORT: u16 = 554;
pub const TEARDOWN_TIMEOUT_MS: i64 = 2000;
const DEFAULT_KEEPALIVE_MS: i64 = 30_000;
const RTSP_INBUF_MAX: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspState {
    Init,
    Connecting,
    Options,
    Describe,
    Setup,
    Play,
    Playing,
    Teardown,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspTransport {
    Tcp,
    Udp,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RtspOutcome {
    Continue,
    /// Graceful end: TEARDOWN acknowledged or server closed after teardown.
    Closed,
    Error,
}

pub struct RtspSession {
    pub state: RtspState,
    pub transport: RtspTransport,
    pub sock: Option<TcpStream>,
    pub rtp_sock: Option<UdpSocket>,
    pub rtcp_sock: Option<UdpSocket>,
    url: String,
    control_url: String,
    cseq: u32,
    session_id: String,
    pub keepalive_interval_ms: i64,
    pub last_keepalive_ms: i64,
    pub teardown_deadline_ms: i64,
    inbuf: BytesMut,
    outbuf: BytesMut,
    client_rtp_port: u16,
    playseek: Option<String>,
    user_agent: Option<String>,
}

impl RtspSession {
    /// Parse the URL, pick a transport, and start the non-blocking connect.
    /// The handshake proceeds from the first writable event.
    pub fn connect(
        rtsp_url: &str,
        transport: RtspTransport,
        playseek: Option<String>,
        user_agent: Option<String>,
    ) -> anyhow::Result<Self> {
        let parsed = Url::parse(rtsp_url).context("rtsp url")?;
        if parsed.scheme() != "rtsp" {
            anyhow::bail!("unsupported scheme {}", parsed.scheme());
        }
        let host = parsed.host_str().context("rtsp url missing host")?;
        let port = parsed.port().unwrap_or(RTSP_DEFAULT_PORT);
        let server_addr: SocketAddr = (host, port)
            .to_socket_addrs()
            .context("resolve rtsp host")?
            .next()
            .context("rtsp host resolves to nothing")?;

        let sock = socket2::Socket::new(
            socket2::Domain::for_address(server_addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .context("rtsp socket")?;
        sock.set_nonblocking(true)?;
        sock.set_nodelay(true).ok();
        match sock.connect(&server_addr.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e).context("rtsp connect"),
        }

        let mut session = Self {
            state: RtspState::Init,
            transport,
            sock: Some(sock.into()),
            rtp_sock: None,
            rtcp_sock: None,
            url: rtsp_url.to_string(),
            control_url: rtsp_url.to_string(),
            cseq: 0,
            session_id: String::new(),
            keepalive_interval_ms: DEFAULT_KEEPALIVE_MS,
            last_keepalive_ms: 0,
            teardown_deadline_ms: 0,
            inbuf: BytesMut::with_capacity(4096),
            outbuf: BytesMut::new(),
            client_rtp_port: 0,
            playseek,
            user_agent,
        };
        if transport == RtspTransport::Udp {
            session.bind_udp_pair()?;
        }
        session.state = RtspState::Connecting;
        Ok(session)
    }

    fn bind_udp_pair(&mut self) -> anyhow::Result<()> {
        // RTP wants an even port with RTCP on the next one up.
        for _ in 0..8 {
            let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).context("rtp bind")?;
            let port = probe.local_addr()?.port() & !1;
            let rtp = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let rtcp = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port + 1)) {
                Ok(s) => s,
                Err(_) => continue,
            };
            rtp.set_nonblocking(true)?;
            rtcp.set_nonblocking(true)?;
            self.client_rtp_port = port;
            self.rtp_sock = Some(rtp);
            self.rtcp_sock = Some(rtcp);
            return Ok(());
        }
        anyhow::bail!("could not bind an even/odd UDP port pair for RTP/RTCP")
    }

    fn send_request(&mut self, method: &str, uri: &str, extra: &str) {
        self.cseq += 1;
        let mut req = format!("{} {} RTSP/1.0\r\nCSeq: {}\r\n", method, uri, self.cseq);
        if !self.session_id.is_empty() {
            req.push_str(&format!("Session: {}\r\n", self.session_id));
        }
        if let Some(ref ua) = self.user_agent {
            req.push_str(&format!("User-Agent: {}\r\n", ua));
        }
        req.push_str(extra);
        req.push_str("\r\n");
        self.outbuf.extend_from_slice(req.as_bytes());
    }

    fn flush_out(&mut self) -> RtspOutcome {
        while !self.outbuf.is_empty() {
            let sock = match self.sock.as_mut() {
                Some(s) => s,
                None => return RtspOutcome::Error,
            };
            match sock.write(&self.outbuf) {
                Ok(0) => return RtspOutcome::Error,
                Ok(n) => {
                    self.outbuf.advance(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => return RtspOutcome::Error,
            }
        }
        RtspOutcome::Continue
    }

    pub fn wants_write(&self) -> bool {
        self.state == RtspState::Connecting || !self.outbuf.is_empty()
    }

    /// Drive the control socket. RTP payload buffers (header intact) are
    /// appended to `out`; the caller classifies and orders them.
    pub fn handle_socket_event(
        &mut self,
        writable: bool,
        readable: bool,
        pool: &BufferPool,
        out: &mut Vec<BufferRef>,
    ) -> RtspOutcome {
        if self.state == RtspState::Connecting && writable {
            // Connect settled; a failed connect surfaces on the first write.
            self.state = RtspState::Options;
            self.send_request("OPTIONS", &self.url.clone(), "");
            debug!("rtsp: connected, OPTIONS sent to {}", self.url);
        }
        if writable {
            if let RtspOutcome::Error = self.flush_out() {
                return RtspOutcome::Error;
            }
        }
        if !readable {
            return RtspOutcome::Continue;
        }

        let mut tmp = [0u8; 4096];
        loop {
            let sock = match self.sock.as_mut() {
                Some(s) => s,
                None => return RtspOutcome::Error,
            };
            match sock.read(&mut tmp) {
                Ok(0) => {
                    return if self.state == RtspState::Teardown {
                        RtspOutcome::Closed
                    } else {
                        warn!("rtsp: server closed control connection");
                        RtspOutcome::Error
                    };
                }
                Ok(n) => {
                    self.inbuf.extend_from_slice(&tmp[..n]);
                    if self.inbuf.len() > RTSP_INBUF_MAX {
                        warn!("rtsp: control buffer overflow, closing");
                        return RtspOutcome::Error;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => return RtspOutcome::Error,
            }
        }
        self.process_inbuf(pool, out)
    }

    fn process_inbuf(&mut self, pool: &BufferPool, out: &mut Vec<BufferRef>) -> RtspOutcome {
        loop {
            if self.inbuf.is_empty() {
                return RtspOutcome::Continue;
            }
            if self.state == RtspState::Playing && self.inbuf[0] == b'$' {
                // Interleaved frame: '$' channel len16 payload
                if self.inbuf.len() < 4 {
                    return RtspOutcome::Continue;
                }
                let channel = self.inbuf[1];
                let len = u16::from_be_bytes([self.inbuf[2], self.inbuf[3]]) as usize;
                if self.inbuf.len() < 4 + len {
                    return RtspOutcome::Continue;
                }
                self.inbuf.advance(4);
                if channel == 0 && len > 0 {
                    let take = len.min(BUFFER_SIZE);
                    if let Some(buf) = pool.alloc() {
                        buf.copy_from(&self.inbuf[..take]);
                        out.push(buf);
                    }
                    // else: pool exhausted, frame dropped
                }
                // RTCP (channel 1) and oversized tails are discarded.
                self.inbuf.advance(len);
                continue;
            }

            // RTSP response: wait for full header block plus body.
            let head_end = match find_crlf2(&self.inbuf) {
                Some(e) => e,
                None => return RtspOutcome::Continue,
            };
            let head = String::from_utf8_lossy(&self.inbuf[..head_end]).into_owned();
            let body_len = header_value(&head, "Content-Length")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            let total = head_end + 4 + body_len;
            if self.inbuf.len() < total {
                return RtspOutcome::Continue;
            }
            let body = String::from_utf8_lossy(&self.inbuf[head_end + 4..total]).into_owned();
            self.inbuf.advance(total);

            match self.handle_response(&head, &body) {
                RtspOutcome::Continue => continue,
                other => return other,
            }
        }
    }

    fn handle_response(&mut self, head: &str, body: &str) -> RtspOutcome {
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(0);
        if status != 200 {
            warn!("rtsp: {:?} got status {}", self.state, status);
            return if self.state == RtspState::Teardown {
                RtspOutcome::Closed
            } else {
                RtspOutcome::Error
            };
        }

        match self.state {
            RtspState::Options => {
                self.state = RtspState::Describe;
                self.send_request("DESCRIBE", &self.url.clone(), "Accept: application/sdp\r\n");
            }
            RtspState::Describe => {
                self.control_url = sdp_control_url(&self.url, body);
                let transport_hdr = match self.transport {
                    RtspTransport::Tcp => {
                        "Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n".to_string()
                    }
                    RtspTransport::Udp => format!(
                        "Transport: RTP/AVP;unicast;client_port={}-{}\r\n",
                        self.client_rtp_port,
                        self.client_rtp_port + 1
                    ),
                };
                self.state = RtspState::Setup;
                let uri = self.control_url.clone();
                self.send_request("SETUP", &uri, &transport_hdr);
            }
            RtspState::Setup => {
                if let Some(sess) = header_value(head, "Session") {
                    let mut parts = sess.split(';');
                    self.session_id = parts.next().unwrap_or("").trim().to_string();
                    for p in parts {
                        if let Some(t) = p.trim().strip_prefix("timeout=") {
                            if let Ok(secs) = t.parse::<i64>() {
                                // Keep alive at half the advertised timeout.
                                self.keepalive_interval_ms = (secs * 1000 / 2).max(1000);
                            }
                        }
                    }
                }
                if self.session_id.is_empty() {
                    warn!("rtsp: SETUP reply without Session id");
                    return RtspOutcome::Error;
                }
                let range = match self.playseek {
                    Some(ref ps) => format!("Range: clock={}\r\n", format_playseek(ps)),
                    None => "Range: npt=0.000-\r\n".to_string(),
                };
                self.state = RtspState::Play;
                let uri = self.url.clone();
                self.send_request("PLAY", &uri, &range);
            }
            RtspState::Play => {
                info!("rtsp: playing {} ({:?})", self.url, self.transport);
                self.state = RtspState::Playing;
            }
            RtspState::Playing => {
                // Keepalive OPTIONS reply.
            }
            RtspState::Teardown => {
                self.state = RtspState::Closed;
                return RtspOutcome::Closed;
            }
            _ => {}
        }
        RtspOutcome::Continue
    }

    /// UDP-transport RTP ingress; buffers come out with headers intact.
    pub fn handle_udp_rtp_data(&mut self, pool: &BufferPool, out: &mut Vec<BufferRef>) -> usize {
        let sock = match self.rtp_sock.as_ref() {
            Some(s) => s,
            None => return 0,
        };
        let mut received = 0;
        loop {
            let buf = match pool.alloc() {
                Some(b) => b,
                None => {
                    // Pool dry: drain one datagram into a scratch buffer so
                    // level-triggered epoll does not spin.
                    let mut scratch = [0u8; BUFFER_SIZE];
                    let _ = sock.recv(&mut scratch);
                    return received;
                }
            };
            let n = {
                let mut mem = buf.mem_mut();
                match sock.recv(&mut mem[..]) {
                    Ok(n) => n,
                    Err(_) => return received,
                }
            };
            buf.set_len(n);
            received += n;
            out.push(buf);
        }
    }

    /// Drain RTCP; contents are not interpreted.
    pub fn drain_rtcp(&mut self) {
        if let Some(sock) = self.rtcp_sock.as_ref() {
            let mut scratch = [0u8; 1536];
            while sock.recv(&mut scratch).is_ok() {}
        }
    }

    pub fn send_keepalive(&mut self, now: i64) {
        let uri = self.url.clone();
        self.send_request("OPTIONS", &uri, "");
        let _ = self.flush_out();
        self.last_keepalive_ms = now;
    }

    /// Begin an asynchronous TEARDOWN. Returns true when the caller must
    /// keep the session alive until the reply (or the teardown deadline).
    pub fn start_teardown(&mut self, now: i64) -> bool {
        if self.session_id.is_empty() || self.sock.is_none() || self.state == RtspState::Teardown {
            return false;
        }
        let uri = self.url.clone();
        self.state = RtspState::Teardown;
        self.teardown_deadline_ms = now + TEARDOWN_TIMEOUT_MS;
        self.send_request("TEARDOWN", &uri, "");
        matches!(self.flush_out(), RtspOutcome::Continue)
    }
}

fn find_crlf2(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    for line in head.split("\r\n").skip(1) {
        if let Some((n, v)) = line.split_once(':') {
            if n.trim().eq_ignore_ascii_case(name) {
                return Some(v.trim());
            }
        }
    }
    None
}

/// Resolve the SDP `a=control:` attribute against the presentation URL.
fn sdp_control_url(base: &str, sdp: &str) -> String {
    for line in sdp.lines() {
        let line = line.trim();
        if let Some(ctrl) = line.strip_prefix("a=control:") {
            let ctrl = ctrl.trim();
            if ctrl == "*" || ctrl.is_empty() {
                return base.to_string();
            }
            if ctrl.starts_with("rtsp://") {
                return ctrl.to_string();
            }
            return format!("{}/{}", base.trim_end_matches('/'), ctrl);
        }
    }
    base.to_string()
}

/// playseek values are wall-clock ranges; normalize "start[-end]" into the
/// RTSP clock range form.
fn format_playseek(ps: &str) -> String {
    if ps.contains('-') {
        ps.to_string()
    } else {
        format!("{}-", ps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let head = "RTSP/1.0 200 OK\r\nCSeq: 2\r\nsession: ABC123;timeout=60\r\n";
        assert_eq!(header_value(head, "Session"), Some("ABC123;timeout=60"));
        assert_eq!(header_value(head, "CSeq"), Some("2"));
        assert_eq!(header_value(head, "Transport"), None);
    }

    #[test]
    fn control_url_resolution() {
        let base = "rtsp://host:554/live/ch1";
        assert_eq!(sdp_control_url(base, "a=control:*\r\n"), base);
        assert_eq!(
            sdp_control_url(base, "v=0\r\na=control:trackID=1\r\n"),
            "rtsp://host:554/live/ch1/trackID=1"
        );
        assert_eq!(
            sdp_control_url(base, "a=control:rtsp://other/track0\r\n"),
            "rtsp://other/track0"
        );
        assert_eq!(sdp_control_url(base, "v=0\r\n"), base);
    }

    #[test]
    fn playseek_range_forms() {
        assert_eq!(format_playseek("20240101T000000Z"), "20240101T000000Z-");
        assert_eq!(
            format_playseek("20240101T000000Z-20240101T010000Z"),
            "20240101T000000Z-20240101T010000Z"
        );
    }
}
