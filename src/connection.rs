// src/connection.rs
//
// One accepted HTTP client: request parsing, routing, the streaming
// transition, and the per-connection backpressure controller that bounds
// the zero-copy send queue.
use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use log::{debug, info, warn};
use nix::sys::epoll::EpollFlags;

use crate::http::{self, HttpRequest, ParseResult, INBUF_SIZE};
use crate::metrics;
use crate::pool::{BufferRef, BUFFER_SIZE};
use crate::sendq::{SendOutcome, SendQueue};
use crate::service::Service;
use crate::stream::{StreamContext, StreamVerdict};
use crate::worker::{Env, FdTag};

pub const TCP_USER_TIMEOUT_MS: libc::c_int = 10_000;

const CONN_QUEUE_MIN_BUFFERS: usize = 64;
const CONN_QUEUE_BURST_FACTOR: f64 = 3.0;
const CONN_QUEUE_BURST_FACTOR_CONGESTED: f64 = 1.5;
const CONN_QUEUE_BURST_FACTOR_DRAIN: f64 = 1.0;
const CONN_QUEUE_EWMA_ALPHA: f64 = 0.2;
const CONN_QUEUE_SLOW_FACTOR: f64 = 1.5;
const CONN_QUEUE_SLOW_EXIT_FACTOR: f64 = 1.1;
const CONN_QUEUE_SLOW_DEBOUNCE_MS: i64 = 3000;
const CONN_QUEUE_HIGH_UTIL_THRESHOLD: f64 = 0.85;
const CONN_QUEUE_DRAIN_UTIL_THRESHOLD: f64 = 0.95;
const CONN_QUEUE_SLOW_LIMIT_RATIO: f64 = 0.9;
const CONN_QUEUE_SLOW_EXIT_LIMIT_RATIO: f64 = 0.75;
const CONN_QUEUE_SLOW_CLAMP_FACTOR: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    ReadRequest,
    Streaming,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferClass {
    Control,
    Media,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WriteStatus {
    Idle,
    Pending,
    Blocked,
    Closed,
}

pub struct Connection {
    pub fd: RawFd,
    sock: TcpStream,
    peer: SocketAddr,
    pub state: ConnState,
    inbuf: Box<[u8]>,
    in_len: usize,
    req: HttpRequest,
    pub service: Option<Service>,
    pub streaming: bool,
    pub status_index: Option<usize>,
    pub sendq: SendQueue,
    buffer_class: BufferClass,
    pub stream: Option<StreamContext>,
    stream_registered: bool,
    close_started: bool,

    // Backpressure telemetry
    queue_limit_bytes: usize,
    queue_bytes_highwater: usize,
    queue_buffers_highwater: usize,
    dropped_packets: u64,
    dropped_bytes: u64,
    backpressure_events: u64,
    queue_avg_bytes: f64,
    slow_active: bool,
    slow_candidate_since: i64,
}

impl Connection {
    pub fn new(sock: TcpStream, peer: SocketAddr) -> Self {
        let fd = sock.as_raw_fd();
        let mut sendq = SendQueue::new();

        sock.set_nodelay(true).ok();
        // Unacknowledged data fails fast instead of tying the queue up.
        unsafe {
            let timeout = TCP_USER_TIMEOUT_MS;
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_USER_TIMEOUT,
                &timeout as *const _ as *const libc::c_void,
                std::mem::size_of_val(&timeout) as libc::socklen_t,
            );
            let one: libc::c_int = 1;
            let rc = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ZEROCOPY,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of_val(&one) as libc::socklen_t,
            );
            sendq.set_zerocopy(rc == 0);
        }

        Self {
            fd,
            sock,
            peer,
            state: ConnState::ReadRequest,
            inbuf: vec![0u8; INBUF_SIZE].into_boxed_slice(),
            in_len: 0,
            req: HttpRequest::default(),
            service: None,
            streaming: false,
            status_index: None,
            sendq,
            buffer_class: BufferClass::Control,
            stream: None,
            stream_registered: false,
            close_started: false,
            queue_limit_bytes: 0,
            queue_bytes_highwater: 0,
            queue_buffers_highwater: 0,
            dropped_packets: 0,
            dropped_bytes: 0,
            backpressure_events: 0,
            queue_avg_bytes: 0.0,
            slow_active: false,
            slow_candidate_since: 0,
        }
    }

    fn client_events(&self, want_write: bool) -> EpollFlags {
        let mut f = EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
        if want_write {
            f |= EpollFlags::EPOLLOUT;
        }
        f
    }

    fn arm_write(&self, env: &mut Env) {
        env.registry.modify(self.fd, self.client_events(true));
    }

    // ----- read path -----

    pub fn handle_read(&mut self, env: &mut Env) {
        if self.state == ConnState::Streaming {
            // Streaming clients do not send more; drain anything (pipelined
            // noise) and watch for EOF.
            let mut scratch = [0u8; 256];
            match self.sock.read(&mut scratch) {
                Ok(0) => self.state = ConnState::Closing,
                _ => {}
            }
            return;
        }
        if self.state != ConnState::ReadRequest {
            return;
        }

        if self.in_len < INBUF_SIZE {
            match self.sock.read(&mut self.inbuf[self.in_len..]) {
                Ok(0) => {
                    self.state = ConnState::Closing;
                    return;
                }
                Ok(n) => self.in_len += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(_) => {
                    self.state = ConnState::Closing;
                    return;
                }
            }
        } else {
            // Headers filled the whole buffer without terminating.
            self.send_error(env, 400);
            return;
        }

        match http::parse_request(&self.inbuf[..self.in_len], &mut self.req) {
            ParseResult::NeedMore => {}
            ParseResult::Error => self.send_error(env, 400),
            ParseResult::Complete => self.route_and_start(env),
        }
    }

    // ----- routing -----

    fn route_and_start(&mut self, env: &mut Env) {
        let url = self.req.url.clone();
        info!("client {} requested {} ({})", self.peer, url, self.req.method);

        if !url.starts_with('/') {
            self.send_error(env, 400);
            return;
        }

        // Host validation (port stripped, case-insensitive)
        if let Some(expected) = env.cfg.general.hostname.as_deref().filter(|h| !h.is_empty()) {
            let host = self.req.hostname.as_str();
            let host = host.split(':').next().unwrap_or("");
            if host.is_empty() || !host.eq_ignore_ascii_case(expected) {
                warn!("rejecting request: Host {:?} != {:?}", host, expected);
                self.send_error(env, 400);
                return;
            }
        }

        let after_slash = &url[1..];
        let (path_raw, query) = match after_slash.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (after_slash, None),
        };

        // Access token
        if let Some(token) = env.cfg.general.r2h_token.as_deref().filter(|t| !t.is_empty()) {
            let presented = query.and_then(|q| http::query_param(q, "r2h-token"));
            match presented {
                Some(ref t) if t == token => {}
                _ => {
                    warn!("rejecting request: bad or missing r2h-token");
                    self.send_error(env, 401);
                    return;
                }
            }
        }

        // Exactly one trailing slash is tolerated.
        let path_raw = path_raw.strip_suffix('/').unwrap_or(path_raw);

        let status_route = env.cfg.general.status_page_route.as_str();
        let sse_route = format!("{}/sse", status_route);
        let api_prefix = format!("{}/api/", status_route);

        if path_raw == status_route {
            let body = env.status.json_summary();
            self.send_response(env, 200, http::CONTENT_JSON, body.as_bytes());
            return;
        }
        if path_raw == "playlist.m3u" {
            match env.playlist.get() {
                Some(body) => {
                    let extra = format!("Content-Length: {}\r\n", body.len());
                    let headers = http::response_headers(200, http::CONTENT_M3U, Some(&extra));
                    metrics::inc_response(200);
                    self.queue_bytes(env, headers.as_bytes());
                    self.queue_bytes(env, body.as_bytes());
                    self.arm_write(env);
                    self.state = ConnState::Closing;
                }
                None => self.send_error(env, 404),
            }
            return;
        }
        if path_raw == sse_route {
            // One-shot SSE frame; the live stream belongs to the status
            // collaborator.
            let headers = http::response_headers(200, http::CONTENT_SSE, Some("Cache-Control: no-cache\r\n"));
            let frame = format!("data: {}\n\n", env.status.json_summary());
            metrics::inc_response(200);
            self.queue_bytes_and_flush(env, headers.as_bytes());
            self.queue_bytes_and_flush(env, frame.as_bytes());
            self.state = ConnState::Closing;
            return;
        }
        if let Some(api) = path_raw.strip_prefix(api_prefix.as_str()) {
            match api {
                "disconnect" => {
                    let target = query
                        .and_then(|q| http::query_param(q, "fd"))
                        .and_then(|v| v.parse::<i32>().ok())
                        .and_then(|fd| env.status.client_fd(fd));
                    match target {
                        Some(fd) => {
                            env.disconnect_fd = Some(fd);
                            self.send_response(env, 200, http::CONTENT_JSON, b"{\"ok\":true}");
                        }
                        None => self.send_error(env, 404),
                    }
                }
                "log-level" => {
                    let level = query.and_then(|q| http::query_param(q, "level"));
                    match level.and_then(|l| parse_level(&l)) {
                        Some(l) => {
                            log::set_max_level(l);
                            info!("log level set to {}", l);
                            self.send_response(env, 200, http::CONTENT_JSON, b"{\"ok\":true}");
                        }
                        None => self.send_error(env, 400),
                    }
                }
                _ => self.send_error(env, 404),
            }
            return;
        }

        // Configured service lookup on the decoded path.
        let decoded = match http::url_decode(path_raw) {
            Some(d) => d,
            None => {
                self.send_error(env, 400);
                return;
            }
        };
        let mut service = env
            .services
            .iter()
            .find(|s| s.url == decoded)
            .map(|s| match query {
                Some(q) => s.with_query_merge(q).unwrap_or_else(|| s.clone()),
                None => s.clone(),
            });
        if service.is_none() && env.cfg.general.udpxy {
            service = Service::from_udpxy_url(&url);
        }
        let mut service = match service {
            Some(s) => s,
            None => {
                self.send_error(env, 404);
                return;
            }
        };

        if self.req.method.eq_ignore_ascii_case("HEAD") {
            // Success without touching the upstream.
            let headers = http::response_headers(200, http::CONTENT_MP2T, None);
            metrics::inc_response(200);
            self.queue_bytes_and_flush(env, headers.as_bytes());
            self.state = ConnState::Closing;
            return;
        }

        if !self.req.user_agent.is_empty() {
            service.user_agent = Some(self.req.user_agent.clone());
        }

        // Capacity check
        if env.status.total_clients() >= env.cfg.general.maxclients {
            warn!("client cap {} reached, rejecting {}", env.cfg.general.maxclients, self.peer);
            self.send_error(env, 503);
            return;
        }

        // Snapshot detection: header and Accept set fallback-to-streaming,
        // the query form does not.
        let mut snapshot_mode = 0u8;
        if env.cfg.general.video_snapshot {
            if self.req.x_request_snapshot || self.req.accept.contains("image/jpeg") {
                snapshot_mode = 2;
            } else if query
                .and_then(|q| http::query_param(q, "snapshot"))
                .map(|v| v == "1")
                .unwrap_or(false)
            {
                snapshot_mode = 1;
            }
        }

        // Register in the status table with the display URL.
        let display_url = match query {
            Some(q) => format!("/{}?{}", decoded, q),
            None => format!("/{}", decoded),
        };
        self.status_index = env.status.register_client(self.fd, self.peer.to_string(), display_url);

        // Streaming headers go out now; snapshot responses wait for the JPEG.
        if snapshot_mode == 0 {
            let headers = http::response_headers(200, http::CONTENT_MP2T, None);
            metrics::inc_response(200);
            self.queue_bytes_and_flush(env, headers.as_bytes());
        }

        match StreamContext::init(&service, env, self.fd, snapshot_mode) {
            Ok(stream) => {
                if snapshot_mode == 0 && !self.stream_registered {
                    env.pool.register_stream_client();
                    self.stream_registered = true;
                    metrics::add_active_clients(1);
                }
                self.stream = Some(stream);
                self.service = Some(service);
                self.streaming = true;
                self.state = ConnState::Streaming;
                self.buffer_class = BufferClass::Media;
            }
            Err(e) => {
                warn!("stream init failed for {}: {:#}", self.peer, e);
                if let Some(idx) = self.status_index.take() {
                    env.status.unregister_client(idx);
                }
                self.state = ConnState::Closing;
            }
        }
    }

    // ----- control output -----

    fn alloc_output_buffer(&self, env: &Env) -> Option<BufferRef> {
        match self.buffer_class {
            BufferClass::Control => env.pool.alloc_control(),
            BufferClass::Media => env.pool.alloc(),
        }
    }

    /// Split arbitrary control bytes across pool buffers and queue them.
    pub fn queue_bytes(&mut self, env: &mut Env, data: &[u8]) -> bool {
        for chunk in data.chunks(BUFFER_SIZE) {
            let buf = match self.alloc_output_buffer(env) {
                Some(b) => b,
                None => {
                    warn!("buffer pool exhausted, cannot queue {} control bytes", chunk.len());
                    return false;
                }
            };
            buf.copy_from(chunk);
            self.sendq.queue_buf(buf);
        }
        true
    }

    pub fn queue_bytes_and_flush(&mut self, env: &mut Env, data: &[u8]) -> bool {
        let ok = self.queue_bytes(env, data);
        self.arm_write(env);
        ok
    }

    fn send_response(&mut self, env: &mut Env, status: u16, content_type: &str, body: &[u8]) {
        let extra = format!("Content-Length: {}\r\n", body.len());
        let headers = http::response_headers(status, content_type, Some(&extra));
        metrics::inc_response(status);
        self.queue_bytes(env, headers.as_bytes());
        self.queue_bytes(env, body);
        self.arm_write(env);
        self.state = ConnState::Closing;
    }

    fn send_error(&mut self, env: &mut Env, status: u16) {
        let body = http::error_body(status);
        self.send_response(env, status, http::CONTENT_HTML, body.as_bytes());
    }

    /// Streaming headers for a snapshot connection that degrades to a
    /// normal stream.
    pub fn send_streaming_headers(&mut self, env: &mut Env) {
        let headers = http::response_headers(200, http::CONTENT_MP2T, None);
        metrics::inc_response(200);
        self.queue_bytes_and_flush(env, headers.as_bytes());
    }

    // ----- backpressure controller -----

    fn compute_limit_bytes(stats: &crate::pool::PoolStats, fair_bytes: usize, burst_factor: f64) -> usize {
        let mut limit_bytes = (fair_bytes as f64 * burst_factor) as usize;

        if stats.max_buffers > 0 {
            let global_cap = stats.max_buffers * BUFFER_SIZE;
            let reserve = CONN_QUEUE_MIN_BUFFERS * BUFFER_SIZE;
            let hard_cap = if global_cap > reserve { global_cap - reserve } else { global_cap };
            if limit_bytes > hard_cap {
                limit_bytes = hard_cap;
            }
        }
        limit_bytes.max(BUFFER_SIZE * 4)
    }

    fn calculate_queue_limit(&mut self, env: &Env) -> usize {
        let stats = env.pool.stats();
        let active = stats.stream_clients.max(1);
        let total_buffers = stats.num_buffers.max(1);

        let share_buffers = (total_buffers / active).max(CONN_QUEUE_MIN_BUFFERS);

        let used = stats.num_buffers.saturating_sub(stats.num_free);
        let utilization = if stats.max_buffers > 0 {
            used as f64 / stats.max_buffers as f64
        } else {
            0.0
        };

        let mut burst_factor = CONN_QUEUE_BURST_FACTOR;
        if stats.num_buffers >= stats.max_buffers || utilization >= CONN_QUEUE_HIGH_UTIL_THRESHOLD {
            burst_factor = CONN_QUEUE_BURST_FACTOR_CONGESTED;
        }
        if stats.num_free < stats.low_watermark / 2 || utilization >= CONN_QUEUE_DRAIN_UTIL_THRESHOLD {
            burst_factor = CONN_QUEUE_BURST_FACTOR_DRAIN;
        }

        let fair_bytes = share_buffers * BUFFER_SIZE;
        let queue_mem_bytes = (self.sendq.queued_buffers() * BUFFER_SIZE) as f64;

        if self.queue_avg_bytes <= 0.0 {
            self.queue_avg_bytes = queue_mem_bytes;
        } else {
            self.queue_avg_bytes = (1.0 - CONN_QUEUE_EWMA_ALPHA) * self.queue_avg_bytes
                + CONN_QUEUE_EWMA_ALPHA * queue_mem_bytes;
        }

        let bursted_bytes = Self::compute_limit_bytes(&stats, fair_bytes, burst_factor);

        let mut slow_threshold = fair_bytes as f64 * CONN_QUEUE_SLOW_FACTOR;
        let limit_based = bursted_bytes as f64 * CONN_QUEUE_SLOW_LIMIT_RATIO;
        if slow_threshold > limit_based {
            slow_threshold = limit_based;
        }

        let mut slow_exit = fair_bytes as f64 * CONN_QUEUE_SLOW_EXIT_FACTOR;
        let limit_exit = bursted_bytes as f64 * CONN_QUEUE_SLOW_EXIT_LIMIT_RATIO;
        if slow_exit > limit_exit {
            slow_exit = limit_exit;
        }
        if slow_exit >= slow_threshold {
            slow_exit = slow_threshold * CONN_QUEUE_SLOW_EXIT_LIMIT_RATIO;
        }

        let now = env.now;
        if self.queue_avg_bytes > slow_threshold {
            if self.slow_candidate_since == 0 {
                self.slow_candidate_since = now;
            } else if !self.slow_active
                && now >= self.slow_candidate_since
                && now - self.slow_candidate_since >= CONN_QUEUE_SLOW_DEBOUNCE_MS
            {
                self.slow_active = true;
            }
        } else {
            self.slow_candidate_since = 0;
        }

        if self.slow_active && self.queue_avg_bytes < slow_exit {
            self.slow_active = false;
            self.slow_candidate_since = 0;
        }

        if self.slow_active && burst_factor > CONN_QUEUE_SLOW_CLAMP_FACTOR {
            burst_factor = CONN_QUEUE_SLOW_CLAMP_FACTOR;
        }

        Self::compute_limit_bytes(&stats, fair_bytes, burst_factor)
    }

    fn record_drop(&mut self, len: usize) {
        self.dropped_packets += 1;
        self.dropped_bytes += len as u64;
        self.backpressure_events += 1;
        metrics::inc_backpressure_drop();
    }

    fn report_queue(&self, env: &mut Env) {
        if let Some(idx) = self.status_index {
            env.status.update_client_queue(
                idx,
                self.sendq.queued_buffers() * BUFFER_SIZE,
                self.sendq.queued_buffers(),
                self.queue_limit_bytes,
                self.queue_bytes_highwater,
                self.queue_buffers_highwater,
                self.dropped_packets,
                self.dropped_bytes,
                self.backpressure_events,
                self.slow_active,
            );
        }
    }

    /// Enqueue one media buffer under the adaptive queue limit. Returns the
    /// number of payload bytes accepted (0 on drop).
    pub fn enqueue_media(&mut self, env: &mut Env, buf: BufferRef) -> usize {
        let len = buf.len();
        if len == 0 {
            return 0;
        }

        let limit_bytes = self.calculate_queue_limit(env);
        self.queue_limit_bytes = limit_bytes;

        let queued_bytes = self.sendq.queued_buffers() * BUFFER_SIZE;
        let projected = queued_bytes + len;
        if projected > limit_bytes {
            self.record_drop(len);
            if self.backpressure_events == 1 || self.backpressure_events % 200 == 0 {
                debug!(
                    "backpressure: dropping {} bytes for fd={} (queued={} limit={} drops={})",
                    len, self.fd, queued_bytes, limit_bytes, self.dropped_packets
                );
            }
            self.report_queue(env);
            return 0;
        }

        self.sendq.queue_buf(buf);

        if queued_bytes > self.queue_bytes_highwater {
            self.queue_bytes_highwater = queued_bytes;
        }
        if self.sendq.queued_buffers() > self.queue_buffers_highwater {
            self.queue_buffers_highwater = self.sendq.queued_buffers();
        }
        self.report_queue(env);

        // Arm writable interest only past the flush gate so small packets
        // batch into one sendmsg.
        if self.sendq.should_flush(env.now) {
            self.arm_write(env);
        }
        len
    }

    // ----- write path -----

    pub fn handle_write(&mut self, env: &mut Env) -> WriteStatus {
        if self.sendq.is_empty() {
            self.report_queue(env);
            if self.state == ConnState::Closing && !self.sendq.has_pending() {
                return WriteStatus::Closed;
            }
            env.registry.modify(self.fd, self.client_events(false));
            return WriteStatus::Idle;
        }

        match self.sendq.send(self.fd) {
            SendOutcome::Fatal => {
                self.state = ConnState::Closing;
                self.report_queue(env);
                WriteStatus::Closed
            }
            SendOutcome::WouldBlock => {
                self.report_queue(env);
                WriteStatus::Blocked
            }
            SendOutcome::Progressed => {
                self.report_queue(env);
                if !self.sendq.is_empty() {
                    return WriteStatus::Pending;
                }
                env.registry.modify(self.fd, self.client_events(false));
                if self.state == ConnState::Closing && !self.sendq.has_pending() {
                    return WriteStatus::Closed;
                }
                WriteStatus::Idle
            }
        }
    }

    pub fn reap_zerocopy_completions(&mut self) {
        self.sendq.reap_completions(self.fd);
    }

    // ----- upstream dispatch -----

    pub fn handle_upstream_event(
        &mut self,
        tag: FdTag,
        readable: bool,
        writable: bool,
        env: &mut Env,
    ) -> StreamVerdict {
        let mut out: Vec<BufferRef> = Vec::new();
        let verdict = match self.stream.as_mut() {
            Some(stream) => stream.handle_fd_event(tag, readable, writable, env, self.fd, &mut out),
            None => StreamVerdict::Close,
        };
        self.forward_media(env, out);
        verdict
    }

    fn forward_media(&mut self, env: &mut Env, out: Vec<BufferRef>) {
        if out.is_empty() {
            return;
        }
        let mut queued_bytes = 0u64;
        let mut queued_packets = 0u64;
        for buf in out {
            let n = self.enqueue_media(env, buf);
            if n > 0 {
                queued_bytes += n as u64;
                queued_packets += 1;
            }
        }
        if queued_packets > 0 {
            metrics::inc_forward(queued_packets, queued_bytes);
            if let Some(stream) = self.stream.as_mut() {
                stream.total_bytes += queued_bytes;
            }
        }
    }

    // ----- periodic tick -----

    pub fn tick(&mut self, env: &mut Env) -> StreamVerdict {
        if self.state != ConnState::Streaming {
            return StreamVerdict::Continue;
        }
        let mut out: Vec<BufferRef> = Vec::new();
        let (verdict, snapshot_fallback, status_update) = match self.stream.as_mut() {
            Some(stream) => stream.tick(env, self.fd, &mut out),
            None => return StreamVerdict::Continue,
        };
        self.forward_media(env, out);

        if snapshot_fallback {
            let degrade = self
                .stream
                .as_ref()
                .map(|s| s.snapshot.fallback_to_streaming)
                .unwrap_or(false);
            if degrade {
                if let Some(stream) = self.stream.as_mut() {
                    stream.snapshot.fallback();
                }
                self.send_streaming_headers(env);
                if !self.stream_registered {
                    env.pool.register_stream_client();
                    self.stream_registered = true;
                    metrics::add_active_clients(1);
                }
            } else {
                warn!("snapshot timed out without fallback for {}", self.peer);
                self.send_error(env, 500);
                return StreamVerdict::Close;
            }
        }

        if let (Some(idx), Some((total, bw))) = (self.status_index, status_update) {
            env.status.update_client_bytes(idx, total, bw);
        }

        // Flush-deadline expiry also gets checked from the tick, so a
        // half-full queue does not sit past the deadline.
        if self.sendq.should_flush(env.now) {
            self.arm_write(env);
        }

        verdict
    }

    // ----- teardown -----

    /// First phase of close: stop the upstream side. The connection object
    /// stays alive until pending zero-copy completions (and an RTSP
    /// teardown, if one is in flight) resolve.
    pub fn begin_close(&mut self, env: &mut Env) {
        if self.close_started {
            return;
        }
        self.close_started = true;
        self.state = ConnState::Closing;

        if self.streaming {
            let url = self.service.as_ref().map(|s| s.url.as_str()).unwrap_or("?");
            debug!("closing streaming client {} ({})", self.peer, url);
            self.streaming = false;
        }
        if self.stream_registered {
            env.pool.unregister_stream_client();
            self.stream_registered = false;
            metrics::add_active_clients(-1);
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.begin_cleanup(env, self.fd);
        }
    }

    /// True once nothing keeps the connection alive.
    pub fn close_finished(&self, now: i64) -> bool {
        if self.sendq.has_pending() {
            return false;
        }
        match self.stream.as_ref() {
            Some(stream) => stream.cleanup_finished(now),
            None => true,
        }
    }

    /// Final teardown: release upstream fds from the registry and the
    /// status slot. The socket closes when the connection drops.
    pub fn finish_close(&mut self, env: &mut Env) {
        if let Some(mut stream) = self.stream.take() {
            stream.finish_cleanup(env);
        }
        if let Some(idx) = self.status_index.take() {
            env.status.unregister_client(idx);
        }
        self.sendq.cleanup();
        env.pool.try_shrink();
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

fn parse_level(s: &str) -> Option<log::LevelFilter> {
    match s.to_ascii_lowercase().as_str() {
        "error" => Some(log::LevelFilter::Error),
        "warn" => Some(log::LevelFilter::Warn),
        "info" => Some(log::LevelFilter::Info),
        "debug" => Some(log::LevelFilter::Debug),
        "trace" => Some(log::LevelFilter::Trace),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::m3u::Playlist;
    use crate::pool::BufferPool;
    use crate::status::StatusTable;
    use crate::worker::FdRegistry;
    use std::io::{Read as _, Write as _};
    use std::net::{TcpListener, TcpStream};

    struct Fixture {
        cfg: AppConfig,
        services: Vec<Service>,
        pool: BufferPool,
        status: StatusTable,
        registry: FdRegistry,
        playlist: Playlist,
    }

    impl Fixture {
        fn new(extra_general: &str) -> Self {
            let toml_str = format!(
                r#"
                [general]
                listen = "127.0.0.1:0"
                udpxy = true
                {extra_general}

                [[services]]
                url = "ch1"
                addr = "239.0.0.1:1234"
            "#
            );
            let cfg: AppConfig = toml::from_str(&toml_str).unwrap();
            cfg.validate().unwrap();
            let services = cfg
                .services
                .iter()
                .map(|s| Service::from_config(s).unwrap())
                .collect();
            Self {
                cfg,
                services,
                pool: BufferPool::new(256, 512, 16, 128),
                status: StatusTable::new(4),
                registry: FdRegistry::new().unwrap(),
                playlist: Playlist::load(None),
            }
        }

        fn env(&mut self, now: i64) -> Env<'_> {
            Env {
                cfg: &self.cfg,
                services: &self.services,
                pool: &self.pool,
                status: &mut self.status,
                registry: &mut self.registry,
                playlist: &self.playlist,
                now,
                disconnect_fd: None,
            }
        }
    }

    fn conn_pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (Connection::new(server, peer), client)
    }

    /// Send a request, run the read+route path, drain the response.
    fn roundtrip(fx: &mut Fixture, request: &str) -> String {
        let (mut conn, mut client) = conn_pair();
        client.write_all(request.as_bytes()).unwrap();
        // Non-blocking read may need a moment for loopback delivery.
        for _ in 0..50 {
            {
                let mut env = fx.env(0);
                conn.handle_read(&mut env);
            }
            if conn.state != ConnState::ReadRequest {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        {
            let mut env = fx.env(0);
            conn.handle_write(&mut env);
        }
        client
            .set_read_timeout(Some(std::time::Duration::from_millis(500)))
            .unwrap();
        let mut response = Vec::new();
        let mut tmp = [0u8; 4096];
        while let Ok(n) = client.read(&mut tmp) {
            if n == 0 {
                break;
            }
            response.extend_from_slice(&tmp[..n]);
            if conn.sendq.is_empty() {
                break;
            }
        }
        String::from_utf8_lossy(&response).into_owned()
    }

    #[test]
    fn head_request_succeeds_without_upstream() {
        let mut fx = Fixture::new("");
        let resp = roundtrip(&mut fx, "HEAD /ch1 HTTP/1.1\r\nHost: gw\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 200 OK"));
        assert!(resp.contains("Content-Type: video/mp2t"));
        assert!(resp.ends_with("\r\n\r\n")); // headers only, no body
    }

    #[test]
    fn missing_token_rejected_with_401() {
        let mut fx = Fixture::new(r#"r2h_token = "abc""#);
        let resp = roundtrip(&mut fx, "GET /ch1?other=1 HTTP/1.1\r\nHost: gw\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 401"));
        let resp = roundtrip(&mut fx, "HEAD /ch1?r2h-token=abc HTTP/1.1\r\nHost: gw\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn bad_host_rejected_with_400() {
        let mut fx = Fixture::new(r#"hostname = "gw.example""#);
        let resp = roundtrip(&mut fx, "HEAD /ch1 HTTP/1.1\r\nHost: other.example\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 400"));
        let resp = roundtrip(&mut fx, "HEAD /ch1 HTTP/1.1\r\nHost: GW.EXAMPLE:8080\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn unknown_path_is_404() {
        let mut fx = Fixture::new("");
        let resp = roundtrip(&mut fx, "GET /nope HTTP/1.1\r\nHost: gw\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn over_capacity_is_503() {
        let mut fx = Fixture::new("maxclients = 1");
        fx.status = StatusTable::new(1);
        fx.status
            .register_client(99, "1.2.3.4:5".into(), "/ch1".into())
            .unwrap();
        let resp = roundtrip(&mut fx, "GET /ch1 HTTP/1.1\r\nHost: gw\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 503"));
    }

    #[test]
    fn status_page_serves_json() {
        let mut fx = Fixture::new("");
        let resp = roundtrip(&mut fx, "GET /status HTTP/1.1\r\nHost: gw\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 200"));
        assert!(resp.contains("application/json"));
        assert!(resp.contains("total_clients"));
    }

    #[test]
    fn limit_floor_and_hard_cap() {
        let fx = Fixture::new("");
        let stats = fx.pool.stats();
        // Floor: a tiny fair share is still four buffers.
        assert_eq!(Connection::compute_limit_bytes(&stats, BUFFER_SIZE, 1.0), BUFFER_SIZE * 4);
        // Cap: an absurd request is clamped below the global pool size.
        let huge = Connection::compute_limit_bytes(&stats, stats.max_buffers * BUFFER_SIZE * 10, 3.0);
        assert!(huge <= stats.max_buffers * BUFFER_SIZE);
    }

    #[test]
    fn enqueue_respects_limit_and_counts_drops() {
        let mut fx = Fixture::new("");
        fx.pool = BufferPool::new(1024, 1024, 16, 512);
        // Many streaming clients shrink the fair share well below what one
        // connection could otherwise queue.
        for _ in 0..16 {
            fx.pool.register_stream_client();
        }
        let (mut conn, _client) = conn_pair();

        // Flood far past the fair-share limit; drops must start and the
        // queue must stay at or below the advertised limit.
        let mut accepted = 0usize;
        for _ in 0..512 {
            let buf = match fx.pool.alloc() {
                Some(b) => b,
                None => break,
            };
            buf.copy_from(&[0u8; BUFFER_SIZE]);
            let mut env = fx.env(0);
            if conn.enqueue_media(&mut env, buf) > 0 {
                accepted += 1;
            }
        }
        assert!(accepted > 0);
        assert!(conn.dropped_packets > 0);
        assert!(conn.backpressure_events > 0);
        assert!(conn.sendq.queued_buffers() * BUFFER_SIZE <= conn.queue_limit_bytes);
        assert!(conn.queue_bytes_highwater <= conn.queue_limit_bytes);
        // Tail drops: the connection stays usable.
        assert_ne!(conn.state, ConnState::Closing);
    }

    #[test]
    fn slow_client_hysteresis() {
        let mut fx = Fixture::new("");
        fx.pool = BufferPool::new(1024, 1024, 16, 512);
        for _ in 0..4 {
            fx.pool.register_stream_client();
        }
        let (mut conn, _client) = conn_pair();

        // Keep the queue saturated: EWMA climbs over the slow threshold,
        // and after the debounce window the client is marked slow.
        let mut held = Vec::new();
        for _ in 0..400 {
            if let Some(b) = fx.pool.alloc() {
                b.copy_from(&[0u8; BUFFER_SIZE]);
                held.push(b.clone());
                conn.sendq.queue_buf(b);
            }
        }
        assert!(conn.sendq.queued_buffers() >= 400);
        for t in (0..5000i64).step_by(100) {
            let env = fx.env(t);
            conn.calculate_queue_limit(&env);
        }
        assert!(conn.slow_active);

        // Drain the queue; sustained low occupancy clears the flag.
        conn.sendq.cleanup();
        drop(held);
        for t in (5000..20_000i64).step_by(100) {
            let env = fx.env(t);
            conn.calculate_queue_limit(&env);
        }
        assert!(!conn.slow_active);
    }
}
