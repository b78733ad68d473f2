// src/status.rs
//
// Per-worker table of streaming clients, one slot per active connection.
// Feeds the in-band status endpoints and the metrics gauges.
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ClientEntry {
    pub fd: i32,
    pub addr: String,
    pub url: String,
    pub total_bytes: u64,
    pub bandwidth_bps: u32,
    pub queue_bytes: usize,
    pub queue_buffers: usize,
    pub queue_limit_bytes: usize,
    pub queue_bytes_highwater: usize,
    pub queue_buffers_highwater: usize,
    pub dropped_packets: u64,
    pub dropped_bytes: u64,
    pub backpressure_events: u64,
    pub slow: bool,
}

pub struct StatusTable {
    slots: Vec<Option<ClientEntry>>,
}

#[derive(Serialize)]
struct Summary<'a> {
    total_clients: usize,
    clients: Vec<&'a ClientEntry>,
}

impl StatusTable {
    pub fn new(maxclients: usize) -> Self {
        Self { slots: (0..maxclients).map(|_| None).collect() }
    }

    pub fn total_clients(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn register_client(&mut self, fd: i32, addr: String, url: String) -> Option<usize> {
        let idx = self.slots.iter().position(|s| s.is_none())?;
        self.slots[idx] = Some(ClientEntry {
            fd,
            addr,
            url,
            total_bytes: 0,
            bandwidth_bps: 0,
            queue_bytes: 0,
            queue_buffers: 0,
            queue_limit_bytes: 0,
            queue_bytes_highwater: 0,
            queue_buffers_highwater: 0,
            dropped_packets: 0,
            dropped_bytes: 0,
            backpressure_events: 0,
            slow: false,
        });
        Some(idx)
    }

    pub fn unregister_client(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            *slot = None;
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_client_queue(
        &mut self,
        idx: usize,
        queue_bytes: usize,
        queue_buffers: usize,
        queue_limit_bytes: usize,
        queue_bytes_highwater: usize,
        queue_buffers_highwater: usize,
        dropped_packets: u64,
        dropped_bytes: u64,
        backpressure_events: u64,
        slow: bool,
    ) {
        if let Some(Some(e)) = self.slots.get_mut(idx) {
            e.queue_bytes = queue_bytes;
            e.queue_buffers = queue_buffers;
            e.queue_limit_bytes = queue_limit_bytes;
            e.queue_bytes_highwater = queue_bytes_highwater;
            e.queue_buffers_highwater = queue_buffers_highwater;
            e.dropped_packets = dropped_packets;
            e.dropped_bytes = dropped_bytes;
            e.backpressure_events = backpressure_events;
            e.slow = slow;
        }
    }

    pub fn update_client_bytes(&mut self, idx: usize, total_bytes: u64, bandwidth_bps: u32) {
        if let Some(Some(e)) = self.slots.get_mut(idx) {
            e.total_bytes = total_bytes;
            e.bandwidth_bps = bandwidth_bps;
        }
    }

    /// Find the client fd behind a status-table slot, for the disconnect API.
    pub fn client_fd(&self, fd: i32) -> Option<i32> {
        self.slots
            .iter()
            .flatten()
            .find(|e| e.fd == fd)
            .map(|e| e.fd)
    }

    pub fn json_summary(&self) -> String {
        let summary = Summary {
            total_clients: self.total_clients(),
            clients: self.slots.iter().flatten().collect(),
        };
        serde_json::to_string(&summary).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_until_full() {
        let mut t = StatusTable::new(2);
        let a = t.register_client(10, "1.1.1.1:5".into(), "/ch1".into()).unwrap();
        let b = t.register_client(11, "1.1.1.2:6".into(), "/ch2".into()).unwrap();
        assert_ne!(a, b);
        assert_eq!(t.total_clients(), 2);
        assert!(t.register_client(12, "x".into(), "y".into()).is_none());
        t.unregister_client(a);
        assert_eq!(t.total_clients(), 1);
        assert!(t.register_client(12, "x".into(), "y".into()).is_some());
    }

    #[test]
    fn updates_land_in_slot() {
        let mut t = StatusTable::new(1);
        let idx = t.register_client(7, "1.1.1.1:2".into(), "/ch1".into()).unwrap();
        t.update_client_bytes(idx, 4096, 1000);
        t.update_client_queue(idx, 100, 1, 5000, 200, 2, 3, 300, 3, true);
        let json = t.json_summary();
        assert!(json.contains("\"total_bytes\":4096"));
        assert!(json.contains("\"slow\":true"));
    }
}
