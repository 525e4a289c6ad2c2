use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
struct EndpointSlot {
    url: String,
    failures: u32,
    excluded_until: Option<Instant>,
}

/// Multi-endpoint selection with exponential per-endpoint backoff: a failed
/// endpoint is excluded for `min(base × 2^(failures-1), cap)`. Selection
/// rotates to the next endpoint whose backoff window has lapsed.
pub struct EndpointPool {
    slots: Mutex<Vec<EndpointSlot>>,
    cursor: AtomicUsize,
    backoff_base: Duration,
    backoff_cap: Duration,
    provider: String,
}

impl EndpointPool {
    pub fn new(
        provider: impl Into<String>,
        endpoints: Vec<String>,
        backoff_base: Duration,
        backoff_cap: Duration,
    ) -> Self {
        Self {
            slots: Mutex::new(
                endpoints
                    .into_iter()
                    .map(|url| EndpointSlot {
                        url,
                        failures: 0,
                        excluded_until: None,
                    })
                    .collect(),
            ),
            cursor: AtomicUsize::new(0),
            backoff_base,
            backoff_cap,
            provider: provider.into(),
        }
    }

    pub fn with_defaults(provider: impl Into<String>, endpoints: Vec<String>) -> Self {
        Self::new(provider, endpoints, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Next live endpoint in rotation order, or `AllEndpointsUnavailable`
    /// when every endpoint is currently backed off.
    pub fn acquire(&self) -> Result<String> {
        self.acquire_at(Instant::now())
    }

    fn acquire_at(&self, now: Instant) -> Result<String> {
        let slots = self.slots.lock();
        if slots.is_empty() {
            return Err(Error::AllEndpointsUnavailable {
                provider: self.provider.clone(),
            });
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % slots.len();
        for offset in 0..slots.len() {
            let slot = &slots[(start + offset) % slots.len()];
            let live = slot.excluded_until.map(|until| now >= until).unwrap_or(true);
            if live {
                debug!(
                    "Pool '{}' selected endpoint '{}' ({} failures)",
                    self.provider, slot.url, slot.failures
                );
                return Ok(slot.url.clone());
            }
        }

        warn!(
            "Pool '{}': all {} endpoints within backoff",
            self.provider,
            slots.len()
        );
        Err(Error::AllEndpointsUnavailable {
            provider: self.provider.clone(),
        })
    }

    /// Clear the failure state of an endpoint after a successful call.
    pub fn record_success(&self, url: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|s| s.url == url) {
            if slot.failures > 0 {
                debug!(
                    "Pool '{}': endpoint '{}' recovered after {} failures",
                    self.provider, url, slot.failures
                );
            }
            slot.failures = 0;
            slot.excluded_until = None;
        }
    }

    pub fn record_failure(&self, url: &str) {
        self.record_failure_at(url, Instant::now());
    }

    fn record_failure_at(&self, url: &str, now: Instant) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|s| s.url == url) {
            slot.failures = slot.failures.saturating_add(1);
            let exp = slot.failures.saturating_sub(1).min(16);
            let backoff = self
                .backoff_base
                .saturating_mul(1u32 << exp)
                .min(self.backoff_cap);
            slot.excluded_until = Some(now + backoff);
            warn!(
                "Pool '{}': endpoint '{}' failure #{}, backed off for {:?}",
                self.provider, url, slot.failures, backoff
            );
        }
    }

    /// Replace the endpoint list, keeping failure state for endpoints that
    /// survive the change. Called when the registry reports new endpoints.
    pub fn replace_endpoints(&self, endpoints: &[String]) {
        let mut slots = self.slots.lock();
        let mut next: Vec<EndpointSlot> = Vec::with_capacity(endpoints.len());
        for url in endpoints {
            if let Some(pos) = slots.iter().position(|s| &s.url == url) {
                next.push(slots.remove(pos));
            } else {
                next.push(EndpointSlot {
                    url: url.clone(),
                    failures: 0,
                    excluded_until: None,
                });
            }
        }
        debug!(
            "Pool '{}': endpoint list replaced ({} entries)",
            self.provider,
            next.len()
        );
        *slots = next;
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.slots.lock().iter().map(|s| s.url.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(endpoints: &[&str]) -> EndpointPool {
        EndpointPool::new(
            "groq",
            endpoints.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(300),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_rotation() {
        let p = pool(&["e1", "e2"]);
        let first = p.acquire().unwrap();
        let second = p.acquire().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_failed_endpoint_excluded() {
        let p = pool(&["e1", "e2"]);
        let now = Instant::now();
        p.record_failure_at("e1", now);

        for _ in 0..4 {
            assert_eq!(p.acquire_at(now).unwrap(), "e2");
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = pool(&["e1"]);
        let now = Instant::now();

        // First failure: 5min exclusion.
        p.record_failure_at("e1", now);
        assert!(p.acquire_at(now + Duration::from_secs(299)).is_err());
        assert!(p.acquire_at(now + Duration::from_secs(301)).is_ok());

        // Second failure: 10min.
        p.record_failure_at("e1", now);
        assert!(p.acquire_at(now + Duration::from_secs(599)).is_err());
        assert!(p.acquire_at(now + Duration::from_secs(601)).is_ok());

        // Many failures: capped at 60min.
        for _ in 0..10 {
            p.record_failure_at("e1", now);
        }
        assert!(p.acquire_at(now + Duration::from_secs(3599)).is_err());
        assert!(p.acquire_at(now + Duration::from_secs(3601)).is_ok());
    }

    #[test]
    fn test_all_backed_off_yields_unavailable() {
        let p = pool(&["e1", "e2"]);
        let now = Instant::now();
        p.record_failure_at("e1", now);
        p.record_failure_at("e2", now);

        assert!(matches!(
            p.acquire_at(now),
            Err(Error::AllEndpointsUnavailable { .. })
        ));
    }

    #[test]
    fn test_success_clears_backoff() {
        let p = pool(&["e1"]);
        let now = Instant::now();
        p.record_failure_at("e1", now);
        assert!(p.acquire_at(now).is_err());

        p.record_success("e1");
        assert_eq!(p.acquire_at(now).unwrap(), "e1");
    }

    #[test]
    fn test_replace_endpoints_keeps_surviving_state() {
        let p = pool(&["e1", "e2"]);
        let now = Instant::now();
        p.record_failure_at("e1", now);

        p.replace_endpoints(&["e1".to_string(), "e3".to_string()]);
        assert_eq!(p.endpoints(), vec!["e1", "e3"]);
        // e1 stays excluded, e3 is fresh.
        assert_eq!(p.acquire_at(now).unwrap(), "e3");
    }
}
