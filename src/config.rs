// src/config.rs
use serde::Deserialize;
use std::{fs, path::Path};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub general: General,
    #[serde(default)]
    pub pool: Pool,
    pub metrics: Option<Metrics>,
    #[serde(default)]
    pub services: Vec<ServiceCfg>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub listen: String, // e.g., "0.0.0.0:5140"
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub hostname: Option<String>, // required Host header value, if set
    #[serde(default)]
    pub r2h_token: Option<String>, // access token query parameter, if set
    #[serde(default = "default_status_route")]
    pub status_page_route: String,
    #[serde(default)]
    pub udpxy: bool, // enable dynamic /udp/ and /rtp/ URL parsing
    #[serde(default = "default_maxclients")]
    pub maxclients: usize,
    #[serde(default)]
    pub mcast_rejoin_interval: u64, // seconds; 0 disables periodic IGMP rejoin
    #[serde(default)]
    pub video_snapshot: bool, // enable JPEG snapshot request detection
    #[serde(default)]
    pub playlist_path: Option<String>, // file served for /playlist.m3u
    #[serde(default = "default_rtsp_transport")]
    pub rtsp_transport: String, // "tcp" (interleaved) or "udp"
    #[serde(default)]
    pub json_logs: bool, // structured JSON logs to stdout
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pool {
    pub initial_size: usize,   // buffers allocated at worker start
    pub max_buffers: usize,    // hard cap
    pub low_watermark: usize,  // grow pressure threshold
    pub high_watermark: usize, // shrink threshold
}

impl Default for Pool {
    fn default() -> Self {
        Self {
            initial_size: 1024,
            max_buffers: 16384,
            low_watermark: 256,
            high_watermark: 4096,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metrics {
    /// Bind address for Prometheus exporter (e.g. "0.0.0.0:9100")
    pub bind: String,
}

/// One configured media source. Either `addr` (multicast RTP/UDP, with
/// optional `source` and `fcc`) or `rtsp` must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceCfg {
    pub url: String, // request path without leading slash, e.g. "ch1"
    #[serde(default)]
    pub addr: Option<String>, // "239.0.0.1:1234"
    #[serde(default)]
    pub source: Option<String>, // SSM source "10.0.0.1"
    #[serde(default)]
    pub fcc: Option<String>, // FCC server "10.0.0.2:8027"
    #[serde(default)]
    pub rtsp: Option<String>, // "rtsp://host:554/path"
    #[serde(default)]
    pub playseek: Option<String>,
}

fn default_workers() -> usize {
    1
}
fn default_status_route() -> String {
    "status".to_string()
}
fn default_maxclients() -> usize {
    64
}
fn default_rtsp_transport() -> String {
    "tcp".to_string()
}

impl AppConfig {
    pub fn from_file(p: &Path) -> anyhow::Result<Self> {
        let s = fs::read_to_string(p)?;
        let cfg: AppConfig = toml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.listen.trim().is_empty() || !self.general.listen.contains(':') {
            anyhow::bail!("general.listen must be host:port");
        }
        if self.general.workers == 0 {
            anyhow::bail!("general.workers must be > 0");
        }
        if self.general.maxclients == 0 {
            anyhow::bail!("general.maxclients must be > 0");
        }
        if self.pool.initial_size == 0 || self.pool.max_buffers < self.pool.initial_size {
            anyhow::bail!("pool.max_buffers must be >= pool.initial_size > 0");
        }
        if self.pool.low_watermark >= self.pool.high_watermark {
            anyhow::bail!("pool.low_watermark must be < pool.high_watermark");
        }
        if self.general.rtsp_transport != "tcp" && self.general.rtsp_transport != "udp" {
            anyhow::bail!("general.rtsp_transport must be \"tcp\" or \"udp\"");
        }
        if let Some(ref m) = self.metrics {
            if m.bind.trim().is_empty() || !m.bind.contains(':') {
                anyhow::bail!("metrics.bind must be host:port");
            }
        }
        for s in &self.services {
            if s.url.trim().is_empty() {
                anyhow::bail!("services.url must be non-empty");
            }
            match (&s.addr, &s.rtsp) {
                (None, None) => anyhow::bail!("service {}: needs addr or rtsp", s.url),
                (Some(_), Some(_)) => {
                    anyhow::bail!("service {}: addr and rtsp are mutually exclusive", s.url)
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> AppConfig {
        toml::from_str(
            r#"
            [general]
            listen = "0.0.0.0:5140"
            udpxy = true

            [[services]]
            url = "ch1"
            addr = "239.0.0.1:1234"
        "#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_and_validate_ok() {
        let cfg = base();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.general.workers, 1);
        assert_eq!(cfg.general.status_page_route, "status");
        assert_eq!(cfg.general.maxclients, 64);
        assert_eq!(cfg.pool.initial_size, 1024);
    }

    #[test]
    fn rejects_service_without_source() {
        let mut cfg = base();
        cfg.services[0].addr = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_watermarks() {
        let mut cfg = base();
        cfg.pool.low_watermark = cfg.pool.high_watermark;
        assert!(cfg.validate().is_err());
    }
}
