// src/metrics.rs
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::net::ToSocketAddrs;
use std::thread;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static CONNECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("connections_total", "Accepted TCP connections")
        .expect("connections_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static RESPONSES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("responses_total", "HTTP responses by status"),
        &["status"],
    )
    .expect("responses_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static FORWARD_PACKETS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("forward_packets_total", "Media packets queued to clients")
        .expect("forward_packets_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static FORWARD_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("forward_bytes_total", "Media bytes queued to clients")
        .expect("forward_bytes_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static BACKPRESSURE_DROPS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "backpressure_drops_total",
        "Packets dropped at enqueue by per-client backpressure",
    )
    .expect("backpressure_drops_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static REORDER_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("reorder_events_total", "RTP reorder buffer events"),
        &["kind"],
    )
    .expect("reorder_events_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static ACTIVE_CLIENTS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("active_clients", "Streaming clients currently connected")
        .expect("active_clients");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static POOL_BUFFERS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("pool_buffers", "Allocated pool buffers").expect("pool_buffers");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static POOL_FREE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("pool_free_buffers", "Free pool buffers").expect("pool_free_buffers");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub fn inc_connection() {
    CONNECTIONS.inc();
}

pub fn inc_response(status: u16) {
    RESPONSES.with_label_values(&[&status.to_string()]).inc();
}

pub fn inc_forward(packets: u64, bytes: u64) {
    FORWARD_PACKETS.inc_by(packets);
    FORWARD_BYTES.inc_by(bytes);
}

pub fn inc_backpressure_drop() {
    BACKPRESSURE_DROPS.inc();
}

pub fn add_reorder_events(kind: &str, n: u64) {
    if n > 0 {
        REORDER_EVENTS.with_label_values(&[kind]).inc_by(n);
    }
}

pub fn add_active_clients(delta: i64) {
    ACTIVE_CLIENTS.add(delta);
}

pub fn set_pool_gauges(num_buffers: usize, num_free: usize) {
    POOL_BUFFERS.set(num_buffers as i64);
    POOL_FREE.set(num_free as i64);
}

pub fn spawn_http<A: ToSocketAddrs + Send + 'static>(addr: A) -> thread::JoinHandle<()> {
    let addr_string = addr
        .to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "0.0.0.0:9100".to_string());

    thread::spawn(move || {
        let server = tiny_http::Server::http(&addr_string).expect("start metrics http");
        log::info!("prometheus metrics listening on http://{addr_string}/metrics");
        let encoder = TextEncoder::new();
        loop {
            if let Ok(req) = server.recv() {
                let url = req.url().to_string();
                if url == "/metrics" {
                    let metric_families = REGISTRY.gather();
                    let mut buf = Vec::with_capacity(16 * 1024);
                    encoder.encode(&metric_families, &mut buf).ok();
                    let resp = tiny_http::Response::from_data(buf)
                        .with_status_code(200)
                        .with_header(
                            tiny_http::Header::from_bytes(
                                &b"Content-Type"[..],
                                &b"text/plain; version=0.0.4"[..],
                            )
                            .unwrap(),
                        );
                    let _ = req.respond(resp);
                } else if url == "/live" || url == "/healthz" {
                    let _ =
                        req.respond(tiny_http::Response::from_string("OK").with_status_code(200));
                } else {
                    let _ = req.respond(tiny_http::Response::empty(404));
                }
            }
        }
    })
}
