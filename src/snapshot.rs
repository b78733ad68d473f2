// src/snapshot.rs
//
// Snapshot request state. Frame extraction and JPEG encoding are the
// business of the external snapshot collaborator; this module carries the
// per-connection state machine around it: armed/fallback flags, the
// timeout budget, and the decision to degrade to a normal stream.
use log::debug;

pub const SNAPSHOT_TIMEOUT_MS: i64 = 5000;

#[derive(Debug, PartialEq, Eq)]
pub enum SnapshotVerdict {
    /// Keep feeding packets; no I-frame captured yet.
    Pending,
}

#[derive(Debug, Default)]
pub struct SnapshotCtx {
    pub enabled: bool,
    pub fallback_to_streaming: bool,
    pub start_ms: i64,
}

impl SnapshotCtx {
    pub fn init(&mut self, now: i64, fallback_to_streaming: bool) {
        self.enabled = true;
        self.fallback_to_streaming = fallback_to_streaming;
        self.start_ms = now;
    }

    /// Hand one media payload to the extractor. Decoding lives in the
    /// external JPEG collaborator; until it reports a frame, snapshot
    /// requests resolve through the timeout path.
    pub fn process_packet(&mut self, _payload: &[u8]) -> SnapshotVerdict {
        SnapshotVerdict::Pending
    }

    pub fn timed_out(&self, now: i64) -> bool {
        self.enabled && now - self.start_ms > SNAPSHOT_TIMEOUT_MS
    }

    /// Degrade to a plain streaming response.
    pub fn fallback(&mut self) {
        debug!("snapshot: no I-frame within budget, falling back to streaming");
        self.enabled = false;
    }
}
