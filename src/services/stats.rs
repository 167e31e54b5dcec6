use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::Serialize;

#[derive(Default)]
pub(crate) struct BridgeStats {
    received: AtomicU64,
    injected: AtomicU64,
    injection_failed: AtomicU64,
    replied: AtomicU64,
    timed_out: AtomicU64,
    rate_limited: AtomicU64,
    total_reply_ms: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatsSnapshot {
    pub(crate) received: u64,
    pub(crate) injected: u64,
    pub(crate) injection_failed: u64,
    pub(crate) replied: u64,
    pub(crate) timed_out: u64,
    pub(crate) rate_limited: u64,
    pub(crate) average_reply_ms: Option<u64>,
}

impl BridgeStats {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_injection(&self, ok: bool) {
        let counter = if ok {
            &self.injected
        } else {
            &self.injection_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reply(&self, elapsed: Duration) {
        self.replied.fetch_add(1, Ordering::Relaxed);
        self.total_reply_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        let replied = self.replied.load(Ordering::Relaxed);
        let total_reply_ms = self.total_reply_ms.load(Ordering::Relaxed);

        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            injected: self.injected.load(Ordering::Relaxed),
            injection_failed: self.injection_failed.load(Ordering::Relaxed),
            replied,
            timed_out: self.timed_out.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            average_reply_ms: (replied > 0).then(|| total_reply_ms / replied),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_reply_time_is_absent_until_a_reply_arrives() {
        let stats = BridgeStats::default();
        stats.record_received();
        stats.record_injection(true);
        stats.record_timeout();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 1);
        assert_eq!(snapshot.injected, 1);
        assert_eq!(snapshot.timed_out, 1);
        assert_eq!(snapshot.average_reply_ms, None);
    }

    #[test]
    fn averages_reply_latency() {
        let stats = BridgeStats::default();
        stats.record_reply(Duration::from_millis(1_000));
        stats.record_reply(Duration::from_millis(3_000));
        stats.record_injection(false);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.replied, 2);
        assert_eq!(snapshot.injection_failed, 1);
        assert_eq!(snapshot.average_reply_ms, Some(2_000));
    }
}
