// src/service.rs
//
// A resolved media source: either a multicast RTP/UDP group (optionally
// source-specific, optionally with an FCC server) or an RTSP URL. Dynamic
// services are parsed out of udpxy-style request paths.
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::config::ServiceCfg;
use crate::http::{query_param, url_decode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Mrtp,
    Rtsp,
}

#[derive(Debug, Clone)]
pub struct Service {
    pub url: String, // request path without leading slash
    pub kind: ServiceKind,
    pub addr: Option<SocketAddrV4>,  // multicast group
    pub source: Option<Ipv4Addr>,    // SSM source filter
    pub fcc: Option<SocketAddrV4>,   // FCC server
    pub rtsp_url: Option<String>,
    pub playseek: Option<String>,
    pub user_agent: Option<String>,
}

impl Service {
    pub fn from_config(cfg: &ServiceCfg) -> anyhow::Result<Self> {
        if let Some(ref rtsp) = cfg.rtsp {
            if !rtsp.starts_with("rtsp://") {
                anyhow::bail!("service {}: rtsp URL must start with rtsp://", cfg.url);
            }
            return Ok(Self {
                url: cfg.url.clone(),
                kind: ServiceKind::Rtsp,
                addr: None,
                source: None,
                fcc: None,
                rtsp_url: Some(rtsp.clone()),
                playseek: cfg.playseek.clone(),
                user_agent: None,
            });
        }
        let addr_str = cfg.addr.as_deref().unwrap_or_default();
        let addr: SocketAddrV4 = addr_str
            .parse()
            .map_err(|_| anyhow::anyhow!("service {}: bad addr {}", cfg.url, addr_str))?;
        if !addr.ip().is_multicast() {
            anyhow::bail!("service {}: {} is not a multicast group", cfg.url, addr.ip());
        }
        let source = match cfg.source.as_deref() {
            Some(s) => Some(
                s.parse::<Ipv4Addr>()
                    .map_err(|_| anyhow::anyhow!("service {}: bad source {}", cfg.url, s))?,
            ),
            None => None,
        };
        let fcc = match cfg.fcc.as_deref() {
            Some(s) => Some(
                s.parse::<SocketAddrV4>()
                    .map_err(|_| anyhow::anyhow!("service {}: bad fcc {}", cfg.url, s))?,
            ),
            None => None,
        };
        Ok(Self {
            url: cfg.url.clone(),
            kind: ServiceKind::Mrtp,
            addr: Some(addr),
            source,
            fcc,
            rtsp_url: None,
            playseek: cfg.playseek.clone(),
            user_agent: None,
        })
    }

    /// Parse a udpxy-style dynamic URL:
    ///   /udp/<addr>:<port>[@<src>[:<port>]]
    ///   /rtp/<addr>:<port>[@<src>[:<port>]][?fcc=<host:port>]
    ///   /rtsp/<host>:<port>/<path>[?playseek=<v>]
    /// The raw UDP and RTP forms produce the same service; packets are
    /// classified as RTP or raw at receive time.
    pub fn from_udpxy_url(url: &str) -> Option<Self> {
        let path = url.strip_prefix('/')?;
        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path, None),
        };
        if let Some(rest) = path.strip_prefix("rtsp/") {
            return Self::from_rtsp_path(rest, query);
        }
        let rest = path
            .strip_prefix("udp/")
            .or_else(|| path.strip_prefix("rtp/"))?;
        let rest = url_decode(rest)?;

        let (group_part, source) = match rest.split_once('@') {
            Some((g, s)) => {
                // Source may carry a port; only the address matters for SSM.
                let src_addr = s.split_once(':').map(|(a, _)| a).unwrap_or(s);
                (g, Some(src_addr.parse::<Ipv4Addr>().ok()?))
            }
            None => (rest.as_str(), None),
        };
        let addr: SocketAddrV4 = group_part.parse().ok()?;
        if !addr.ip().is_multicast() {
            return None;
        }

        let fcc = query
            .and_then(|q| query_param(q, "fcc"))
            .and_then(|v| parse_host_port(&v));

        Some(Self {
            url: path.to_string(),
            kind: ServiceKind::Mrtp,
            addr: Some(addr),
            source,
            fcc,
            rtsp_url: None,
            playseek: None,
            user_agent: None,
        })
    }

    fn from_rtsp_path(rest: &str, query: Option<&str>) -> Option<Self> {
        if rest.is_empty() {
            return None;
        }
        let playseek = query.and_then(|q| query_param(q, "playseek"));
        // Rebuild the upstream URL; non-playseek query params pass through.
        let passthrough: Vec<&str> = query
            .map(|q| {
                q.split('&')
                    .filter(|p| !p.starts_with("playseek=") && !p.starts_with("r2h-token="))
                    .collect()
            })
            .unwrap_or_default();
        let mut rtsp_url = format!("rtsp://{}", rest);
        if !passthrough.is_empty() {
            rtsp_url.push('?');
            rtsp_url.push_str(&passthrough.join("&"));
        }
        Some(Self {
            url: format!("rtsp/{}", rest),
            kind: ServiceKind::Rtsp,
            addr: None,
            source: None,
            fcc: None,
            rtsp_url: Some(rtsp_url),
            playseek,
            user_agent: None,
        })
    }

    /// Per-request copy of a configured service with query overrides folded
    /// in. Returns None when the query carries nothing to merge.
    pub fn with_query_merge(&self, query: &str) -> Option<Self> {
        let fcc = query_param(query, "fcc").and_then(|v| parse_host_port(&v));
        let playseek = query_param(query, "playseek");
        if fcc.is_none() && playseek.is_none() {
            return None;
        }
        let mut merged = self.clone();
        if fcc.is_some() {
            merged.fcc = fcc;
        }
        if playseek.is_some() {
            merged.playseek = playseek;
        }
        Some(merged)
    }
}

fn parse_host_port(s: &str) -> Option<SocketAddrV4> {
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_udp_url() {
        let s = Service::from_udpxy_url("/udp/239.0.0.1:1234").unwrap();
        assert_eq!(s.kind, ServiceKind::Mrtp);
        assert_eq!(s.addr.unwrap().to_string(), "239.0.0.1:1234");
        assert!(s.source.is_none());
        assert!(s.fcc.is_none());
    }

    #[test]
    fn parses_rtp_with_source_and_fcc() {
        let s = Service::from_udpxy_url("/rtp/239.1.2.3:5000@10.0.0.9:0?fcc=10.0.0.2%3A8027").unwrap();
        assert_eq!(s.addr.unwrap().to_string(), "239.1.2.3:5000");
        assert_eq!(s.source.unwrap().to_string(), "10.0.0.9");
        assert_eq!(s.fcc.unwrap().to_string(), "10.0.0.2:8027");
    }

    #[test]
    fn rejects_non_multicast_group() {
        assert!(Service::from_udpxy_url("/udp/10.0.0.1:1234").is_none());
    }

    #[test]
    fn parses_rtsp_url_with_playseek() {
        let s = Service::from_udpxy_url("/rtsp/host.example:554/live/ch1?playseek=20240101T000000Z").unwrap();
        assert_eq!(s.kind, ServiceKind::Rtsp);
        assert_eq!(s.rtsp_url.as_deref(), Some("rtsp://host.example:554/live/ch1"));
        assert_eq!(s.playseek.as_deref(), Some("20240101T000000Z"));
    }

    #[test]
    fn query_merge_overrides_fcc() {
        let cfg = ServiceCfg {
            url: "ch1".into(),
            addr: Some("239.0.0.1:1234".into()),
            source: None,
            fcc: None,
            rtsp: None,
            playseek: None,
        };
        let base = Service::from_config(&cfg).unwrap();
        assert!(base.with_query_merge("other=1").is_none());
        let merged = base.with_query_merge("fcc=10.0.0.2:8027").unwrap();
        assert_eq!(merged.fcc.unwrap().to_string(), "10.0.0.2:8027");
        assert_eq!(merged.addr, base.addr);
    }
}
