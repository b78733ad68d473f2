// src/worker.rs
//
// One single-threaded worker: an epoll handle, the accept loop, the
// fd->connection registry, and the per-iteration timeout tick. Workers
// share nothing but the listener port (SO_REUSEPORT) and the shutdown flag.
use std::net::TcpListener;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use anyhow::Context;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};

use crate::config::AppConfig;
use crate::connection::{ConnState, Connection, WriteStatus};
use crate::m3u::Playlist;
use crate::metrics;
use crate::pool::BufferPool;
use crate::service::Service;
use crate::status::StatusTable;
use crate::stream::StreamVerdict;
use crate::util::{now_ms, BarrierFlag};

const EPOLL_WAIT_MS: isize = 250;
const TICK_INTERVAL_MS: i64 = 250;

/// Which role an fd plays; upstream fds resolve to their owning connection
/// through the registry rather than a back-pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdTag {
    Client,
    Mcast,
    Fcc,
    RtspCtl,
    RtspRtp,
    RtspRtcp,
}

pub struct FdRegistry {
    pub epfd: RawFd,
    map: hashbrown::HashMap<RawFd, (RawFd, FdTag)>,
}

impl FdRegistry {
    pub fn new() -> anyhow::Result<Self> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).context("epoll_create1")?;
        Ok(Self { epfd, map: hashbrown::HashMap::new() })
    }

    pub fn add(&mut self, fd: RawFd, owner: RawFd, tag: FdTag, flags: EpollFlags) -> anyhow::Result<()> {
        let mut ev = EpollEvent::new(flags, fd as u64);
        epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, fd, &mut ev).context("epoll add")?;
        self.map.insert(fd, (owner, tag));
        Ok(())
    }

    /// Listener fd: polled but not part of the connection map.
    pub fn add_listener(&mut self, fd: RawFd) -> anyhow::Result<()> {
        let mut ev = EpollEvent::new(EpollFlags::EPOLLIN, fd as u64);
        epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, fd, &mut ev).context("epoll add listener")?;
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, flags: EpollFlags) {
        let mut ev = EpollEvent::new(flags, fd as u64);
        let _ = epoll_ctl(self.epfd, EpollOp::EpollCtlMod, fd, &mut ev);
    }

    pub fn remove(&mut self, fd: RawFd) {
        self.map.remove(&fd);
        let _ = epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, None);
    }

    pub fn lookup(&self, fd: RawFd) -> Option<(RawFd, FdTag)> {
        self.map.get(&fd).copied()
    }
}

impl Drop for FdRegistry {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.epfd);
    }
}

/// Mutable slice of worker state passed down into connection handling.
pub struct Env<'a> {
    pub cfg: &'a AppConfig,
    pub services: &'a [Service],
    pub pool: &'a BufferPool,
    pub status: &'a mut StatusTable,
    pub registry: &'a mut FdRegistry,
    pub playlist: &'a Playlist,
    pub now: i64,
    /// Set by the disconnect control API; the worker acts on it after the
    /// current dispatch returns.
    pub disconnect_fd: Option<RawFd>,
}

pub struct Worker {
    listener: TcpListener,
    registry: FdRegistry,
    pool: BufferPool,
    status: StatusTable,
    conns: hashbrown::HashMap<RawFd, Connection>,
    cfg: Arc<AppConfig>,
    services: Arc<Vec<Service>>,
    playlist: Arc<Playlist>,
    shutdown: Arc<BarrierFlag>,
}

impl Worker {
    pub fn new(
        listener: TcpListener,
        cfg: Arc<AppConfig>,
        services: Arc<Vec<Service>>,
        playlist: Arc<Playlist>,
        shutdown: Arc<BarrierFlag>,
    ) -> anyhow::Result<Self> {
        listener.set_nonblocking(true).context("listener nonblocking")?;
        let mut registry = FdRegistry::new()?;
        registry.add_listener(listener.as_raw_fd())?;
        let pool = BufferPool::new(
            cfg.pool.initial_size,
            cfg.pool.max_buffers,
            cfg.pool.low_watermark,
            cfg.pool.high_watermark,
        );
        let status = StatusTable::new(cfg.general.maxclients);
        Ok(Self {
            listener,
            registry,
            pool,
            status,
            conns: hashbrown::HashMap::new(),
            cfg,
            services,
            playlist,
            shutdown,
        })
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        info!("worker started on {}", self.listener.local_addr()?);
        let listener_fd = self.listener.as_raw_fd();
        let mut events = vec![EpollEvent::empty(); 256];
        let mut last_tick = now_ms();

        while !self.shutdown.is_raised() {
            let n = match epoll_wait(self.registry.epfd, &mut events, EPOLL_WAIT_MS) {
                Ok(n) => n,
                Err(Errno::EINTR) => 0,
                Err(e) => return Err(e).context("epoll_wait"),
            };

            let now = now_ms();
            for i in 0..n {
                let fd = events[i].data() as RawFd;
                let flags = events[i].events();
                if fd == listener_fd {
                    self.accept_clients();
                } else {
                    self.dispatch(fd, flags, now);
                }
            }

            let now = now_ms();
            if now - last_tick >= TICK_INTERVAL_MS {
                last_tick = now;
                self.tick_all(now);
            }
        }
        info!("worker draining {} connections", self.conns.len());
        self.conns.clear();
        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((sock, peer)) => {
                    if sock.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let conn = Connection::new(sock, peer);
                    let fd = conn.fd;
                    if let Err(e) = self.registry.add(
                        fd,
                        fd,
                        FdTag::Client,
                        EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP,
                    ) {
                        warn!("failed to register client fd: {:#}", e);
                        continue;
                    }
                    metrics::inc_connection();
                    debug!("accepted client {} (fd={})", peer, fd);
                    self.conns.insert(fd, conn);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, fd: RawFd, flags: EpollFlags, now: i64) {
        let (owner, tag) = match self.registry.lookup(fd) {
            Some(e) => e,
            None => return,
        };
        let readable = flags.contains(EpollFlags::EPOLLIN);
        let writable = flags.contains(EpollFlags::EPOLLOUT);
        let errored = flags.contains(EpollFlags::EPOLLERR);
        let hangup = flags.contains(EpollFlags::EPOLLHUP) || flags.contains(EpollFlags::EPOLLRDHUP);

        let disconnect_target;
        {
            let Worker { conns, registry, status, pool, cfg, services, playlist, .. } = self;
            let conn = match conns.get_mut(&owner) {
                Some(c) => c,
                None => return,
            };
            let mut env = Env {
                cfg: cfg.as_ref(),
                services: services.as_slice(),
                pool,
                status,
                registry,
                playlist: playlist.as_ref(),
                now,
                disconnect_fd: None,
            };

            match tag {
                FdTag::Client => {
                    if errored {
                        // MSG_ZEROCOPY completions arrive on the error queue.
                        conn.reap_zerocopy_completions();
                    }
                    if readable && conn.state != ConnState::Closing {
                        conn.handle_read(&mut env);
                    }
                    if writable {
                        if conn.handle_write(&mut env) == WriteStatus::Closed {
                            conn.state = ConnState::Closing;
                        }
                    }
                    if hangup {
                        conn.state = ConnState::Closing;
                    }
                }
                upstream => {
                    if conn.handle_upstream_event(upstream, readable, writable, &mut env)
                        == StreamVerdict::Close
                    {
                        conn.begin_close(&mut env);
                    }
                }
            }
            disconnect_target = env.disconnect_fd;
        }

        self.progress_close(owner, now);
        if let Some(target) = disconnect_target {
            info!("disconnect API: closing client fd={}", target);
            self.close_conn(target, now);
        }
    }

    fn close_conn(&mut self, fd: RawFd, now: i64) {
        let Worker { conns, registry, status, pool, cfg, services, playlist, .. } = self;
        if let Some(conn) = conns.get_mut(&fd) {
            let mut env = Env {
                cfg: cfg.as_ref(),
                services: services.as_slice(),
                pool,
                status,
                registry,
                playlist: playlist.as_ref(),
                now,
                disconnect_fd: None,
            };
            conn.begin_close(&mut env);
        }
        self.progress_close(fd, now);
    }

    /// Drive a closing connection to completion: free it once the send
    /// queue, zero-copy pending list and any RTSP teardown have drained.
    fn progress_close(&mut self, fd: RawFd, now: i64) {
        let finished = {
            let Worker { conns, registry, status, pool, cfg, services, playlist, .. } = self;
            let conn = match conns.get_mut(&fd) {
                Some(c) => c,
                None => return,
            };
            if conn.state != ConnState::Closing {
                return;
            }
            let mut env = Env {
                cfg: cfg.as_ref(),
                services: services.as_slice(),
                pool,
                status,
                registry,
                playlist: playlist.as_ref(),
                now,
                disconnect_fd: None,
            };
            conn.begin_close(&mut env);

            // Flush whatever is still queued; deferred free waits only on
            // kernel completions, not on unsent data after a fatal error.
            if !conn.sendq.is_empty() && conn.handle_write(&mut env) == WriteStatus::Closed {
                // Socket is dead; nothing queued will ever flush.
                conn.sendq.cleanup();
            }
            if conn.sendq.has_pending() {
                conn.reap_zerocopy_completions();
            }

            if conn.close_finished(now) && conn.sendq.is_empty() {
                conn.finish_close(&mut env);
                true
            } else {
                false
            }
        };
        if finished {
            self.registry.remove(fd);
            if let Some(conn) = self.conns.remove(&fd) {
                debug!("connection {} closed (fd={})", conn.peer(), fd);
            }
        }
    }

    fn tick_all(&mut self, now: i64) {
        let fds: Vec<RawFd> = self.conns.keys().copied().collect();
        for fd in fds {
            {
                let Worker { conns, registry, status, pool, cfg, services, playlist, .. } = self;
                let conn = match conns.get_mut(&fd) {
                    Some(c) => c,
                    None => continue,
                };
                let mut env = Env {
                    cfg: cfg.as_ref(),
                    services: services.as_slice(),
                    pool,
                    status,
                    registry,
                    playlist: playlist.as_ref(),
                    now,
                    disconnect_fd: None,
                };
                if conn.tick(&mut env) == StreamVerdict::Close {
                    conn.begin_close(&mut env);
                }
            }
            self.progress_close(fd, now);
        }

        let stats = self.pool.stats();
        metrics::set_pool_gauges(stats.num_buffers, stats.num_free);
        self.pool.try_shrink();
    }
}
