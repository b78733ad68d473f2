// src/main.rs
mod config;
mod connection;
mod fcc;
mod http;
mod m3u;
mod metrics;
mod multicast;
mod pool;
mod rtp;
mod rtsp;
mod sendq;
mod service;
mod snapshot;
mod status;
mod stream;
mod util;
mod worker;

use crate::config::AppConfig;
use crate::m3u::Playlist;
use crate::service::Service;
use crate::util::BarrierFlag;
use crate::worker::Worker;
use anyhow::Context;
use log::{error, info};
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

fn main() -> anyhow::Result<()> {
    let cfg_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    // Load config before logger to allow JSON formatting choice
    let cfg = AppConfig::from_file(&cfg_path)?;

    if cfg.general.json_logs {
        let mut b =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        b.format(|buf, record| {
            use std::io::Write;
            let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            writeln!(
                buf,
                "{{\"ts\":\"{}\",\"level\":\"{}\",\"target\":\"{}\",\"msg\":\"{}\"}}",
                ts,
                record.level(),
                record.target(),
                record.args().to_string().replace('"', "'")
            )
        })
        .init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("loaded config: {:?}", cfg);

    let shutdown = Arc::new(BarrierFlag::default());
    {
        let s = shutdown.clone();
        ctrlc::set_handler(move || {
            s.raise();
        })?;
    }

    // Resolve configured services up front so bad entries fail the boot.
    let mut services = Vec::with_capacity(cfg.services.len());
    for sc in &cfg.services {
        services.push(Service::from_config(sc)?);
    }
    info!("{} configured services", services.len());

    let playlist = Arc::new(Playlist::load(cfg.general.playlist_path.as_deref()));

    let metrics_handle = cfg
        .metrics
        .as_ref()
        .map(|m| metrics::spawn_http(m.bind.clone()));

    let listen_addr: SocketAddr = cfg
        .general
        .listen
        .parse()
        .with_context(|| format!("bad listen address {}", cfg.general.listen))?;

    let workers = cfg.general.workers.max(1);
    let cfg = Arc::new(cfg);
    let services = Arc::new(services);

    // One listener per worker via SO_REUSEPORT so the kernel spreads
    // accepts; each worker runs its own epoll and owns its connections.
    let mut joins = Vec::with_capacity(workers);
    for i in 0..workers {
        let listener = build_listener(listen_addr, workers > 1)
            .with_context(|| format!("bind {}", listen_addr))?;
        let cfg = cfg.clone();
        let services = services.clone();
        let playlist = playlist.clone();
        let shutdown = shutdown.clone();
        let name = format!("worker-{i}");
        let t = thread::Builder::new().name(name).spawn(move || {
            match Worker::new(listener, cfg, services, playlist, shutdown) {
                Ok(mut w) => {
                    if let Err(e) = w.run() {
                        error!("worker failed: {e:?}");
                    }
                }
                Err(e) => error!("worker init failed: {e:?}"),
            }
        })?;
        joins.push(t);
    }

    for t in joins {
        if t.join().is_err() {
            error!("worker thread panicked");
        }
    }
    // The metrics exporter thread serves until process exit.
    drop(metrics_handle);
    info!("clean shutdown");
    Ok(())
}

fn build_listener(addr: SocketAddr, reuse_port: bool) -> anyhow::Result<TcpListener> {
    let sock = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    sock.set_reuse_address(true)?;
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    if reuse_port {
        sock.set_reuse_port(true)?;
    }
    sock.bind(&addr.into())?;
    sock.listen(1024)?;
    Ok(sock.into())
}
