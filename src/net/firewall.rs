//! Connection admission control.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::addr::HostPort;

/// Admission predicate consulted by the acceptor.
///
/// `grant` decides at accept time; `release` is called when the connection
/// closes so concurrent-connection tracking stays correct.
pub trait Firewall: Send + Sync + 'static {
    fn grant(&self, peer: &HostPort) -> bool;

    fn release(&self, peer: &HostPort);

    /// Bytes sent to a rejected peer before the abortive close; empty means
    /// a silent close.
    fn reject_message(&self) -> &[u8] {
        b""
    }
}

// Per-IP request timestamps; count_recent evicts entries older than the
// window while counting.
#[derive(Default)]
struct RequestTracker {
    timestamps: VecDeque<Instant>,
}

impl RequestTracker {
    fn add_request(&mut self, now: Instant) {
        self.timestamps.push_back(now);
    }

    fn count_recent(&mut self, now: Instant, window: Duration) -> usize {
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) > window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        self.timestamps.len()
    }
}

#[derive(Default)]
struct Inner {
    ip_counts: HashMap<String, usize>,
    total: usize,
    trackers: HashMap<String, RequestTracker>,
}

/// The bundled firewall: per-IP concurrent, total concurrent, and per-IP
/// requests-per-second ceilings, enforced atomically under a single mutex.
/// A zero ceiling means unlimited.
///
/// The rps tracker grows with the number of unique peers;
/// [`cleanup_stale_entries`](RateLimitFirewall::cleanup_stale_entries) must
/// be called periodically by the host.
pub struct RateLimitFirewall {
    max_per_ip: usize,
    max_total: usize,
    max_rps: usize,
    reject_message: Vec<u8>,
    inner: Mutex<Inner>,
}

impl RateLimitFirewall {
    pub fn new(max_per_ip: usize, max_total: usize) -> RateLimitFirewall {
        RateLimitFirewall {
            max_per_ip,
            max_total,
            max_rps: 100,
            reject_message: Vec::new(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Sets the per-IP accepted-connections-per-second ceiling; zero
    /// disables rate limiting.
    pub fn set_request_rate_limit(mut self, max_rps: usize) -> RateLimitFirewall {
        self.max_rps = max_rps;
        self
    }

    /// Sets the message sent to rejected peers before the abortive close.
    pub fn set_reject_message(mut self, message: impl Into<Vec<u8>>) -> RateLimitFirewall {
        self.reject_message = message.into();
        self
    }

    pub fn connections_from(&self, peer: &HostPort) -> usize {
        let inner = self.inner.lock().expect("firewall lock");
        inner.ip_counts.get(peer.host()).copied().unwrap_or(0)
    }

    pub fn total_connections(&self) -> usize {
        self.inner.lock().expect("firewall lock").total
    }

    pub fn request_rate(&self, peer: &HostPort) -> usize {
        let mut inner = self.inner.lock().expect("firewall lock");
        let now = Instant::now();
        match inner.trackers.get_mut(peer.host()) {
            Some(t) => t.count_recent(now, Duration::from_secs(1)),
            None => 0,
        }
    }

    /// Drops rps trackers with no recent activity, returning how many were
    /// removed.
    pub fn cleanup_stale_entries(&self) -> usize {
        let mut inner = self.inner.lock().expect("firewall lock");
        let now = Instant::now();
        let before = inner.trackers.len();
        inner
            .trackers
            .retain(|_, t| t.count_recent(now, Duration::from_secs(1)) > 0);
        before - inner.trackers.len()
    }
}

impl Firewall for RateLimitFirewall {
    fn grant(&self, peer: &HostPort) -> bool {
        let mut inner = self.inner.lock().expect("firewall lock");

        if self.max_total > 0 && inner.total >= self.max_total {
            return false;
        }

        let ip = peer.host();
        let current = inner.ip_counts.get(ip).copied().unwrap_or(0);
        if self.max_per_ip > 0 && current >= self.max_per_ip {
            return false;
        }

        if self.max_rps > 0 {
            let now = Instant::now();
            let tracker = inner.trackers.entry(ip.to_owned()).or_default();
            if tracker.count_recent(now, Duration::from_secs(1)) >= self.max_rps {
                return false;
            }
            tracker.add_request(now);
        }

        *inner.ip_counts.entry(ip.to_owned()).or_insert(0) += 1;
        inner.total += 1;
        true
    }

    fn release(&self, peer: &HostPort) {
        let mut inner = self.inner.lock().expect("firewall lock");
        match inner.ip_counts.get_mut(peer.host()) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                inner.ip_counts.remove(peer.host());
            }
            None => {}
        }
        inner.total = inner.total.saturating_sub(1);
    }

    fn reject_message(&self) -> &[u8] {
        &self.reject_message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(host: &str) -> HostPort {
        HostPort::new(host, 1000).unwrap()
    }

    #[test]
    fn per_ip_ceiling() {
        let fw = RateLimitFirewall::new(2, 0).set_request_rate_limit(0);
        let a = peer("10.0.0.1");
        assert!(fw.grant(&a));
        assert!(fw.grant(&a));
        assert!(!fw.grant(&a));
        assert_eq!(fw.connections_from(&a), 2);

        fw.release(&a);
        assert!(fw.grant(&a));
    }

    #[test]
    fn total_ceiling_across_ips() {
        let fw = RateLimitFirewall::new(0, 2).set_request_rate_limit(0);
        assert!(fw.grant(&peer("10.0.0.1")));
        assert!(fw.grant(&peer("10.0.0.2")));
        assert!(!fw.grant(&peer("10.0.0.3")));
        assert_eq!(fw.total_connections(), 2);
    }

    #[test]
    fn zero_means_unlimited() {
        let fw = RateLimitFirewall::new(0, 0).set_request_rate_limit(0);
        let a = peer("10.0.0.1");
        for _ in 0..100 {
            assert!(fw.grant(&a));
        }
    }

    #[test]
    fn rps_ceiling() {
        let fw = RateLimitFirewall::new(0, 0).set_request_rate_limit(3);
        let a = peer("10.0.0.1");
        assert!(fw.grant(&a));
        assert!(fw.grant(&a));
        assert!(fw.grant(&a));
        assert!(!fw.grant(&a));
        // an unrelated peer is unaffected
        assert!(fw.grant(&peer("10.0.0.2")));
        assert_eq!(fw.request_rate(&a), 3);
    }

    #[test]
    fn release_does_not_underflow() {
        let fw = RateLimitFirewall::new(0, 0);
        let a = peer("10.0.0.1");
        fw.release(&a);
        assert_eq!(fw.total_connections(), 0);
    }

    #[test]
    fn cleanup_drops_quiet_trackers() {
        let fw = RateLimitFirewall::new(0, 0).set_request_rate_limit(100);
        let a = peer("10.0.0.1");
        assert!(fw.grant(&a));
        // the tracker still holds a recent timestamp
        assert_eq!(fw.cleanup_stale_entries(), 0);
        {
            let mut inner = fw.inner.lock().unwrap();
            let t = inner.trackers.get_mut(a.host()).unwrap();
            for ts in t.timestamps.iter_mut() {
                *ts -= Duration::from_secs(5);
            }
        }
        assert_eq!(fw.cleanup_stale_entries(), 1);
        assert_eq!(fw.request_rate(&a), 0);
    }
}
