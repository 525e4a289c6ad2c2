use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding one-minute request windows keyed by (tenant, capability
/// fingerprint). Entries are pruned lazily on each check and idle keys are
/// evicted when a new key registers; each key has its own lock so tenants
/// never contend with each other.
pub struct RateWindowLimiter {
    windows: RwLock<HashMap<WindowKey, Arc<Mutex<VecDeque<Instant>>>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    tenant_id: String,
    capability: String,
}

impl RateWindowLimiter {
    pub fn new() -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Record one request against the window, rejecting with
    /// `RateLimitExceeded` when the window already holds `limit` entries.
    pub fn check(&self, tenant_id: &str, capability_fingerprint: &str, limit: u32) -> Result<()> {
        self.check_at(tenant_id, capability_fingerprint, limit, Instant::now())
    }

    fn check_at(
        &self,
        tenant_id: &str,
        capability_fingerprint: &str,
        limit: u32,
        now: Instant,
    ) -> Result<()> {
        let window = self.window_for(tenant_id, capability_fingerprint, now);
        let mut entries = window.lock();

        while let Some(front) = entries.front() {
            if now.duration_since(*front) >= WINDOW {
                entries.pop_front();
            } else {
                break;
            }
        }

        if entries.len() as u32 >= limit {
            warn!(
                "Rate limit of {}/min hit for tenant '{}' (window holds {})",
                limit,
                tenant_id,
                entries.len()
            );
            return Err(Error::RateLimitExceeded {
                tenant_id: tenant_id.to_string(),
            });
        }

        entries.push_back(now);
        debug!(
            "Rate window for tenant '{}' at {}/{}",
            tenant_id,
            entries.len(),
            limit
        );
        Ok(())
    }

    fn window_for(
        &self,
        tenant_id: &str,
        capability: &str,
        now: Instant,
    ) -> Arc<Mutex<VecDeque<Instant>>> {
        let key = WindowKey {
            tenant_id: tenant_id.to_string(),
            capability: capability.to_string(),
        };

        if let Some(window) = self.windows.read().get(&key) {
            return Arc::clone(window);
        }

        let mut windows = self.windows.write();
        // New keys are rare; use the write lock to also evict windows whose
        // last request fell out of the sliding minute, so the map tracks
        // active keys rather than every key ever seen.
        windows.retain(|_, window| match window.try_lock() {
            Some(entries) => entries
                .back()
                .map(|last| now.duration_since(*last) < WINDOW)
                .unwrap_or(false),
            // A held lock means the window is in use right now.
            None => true,
        });
        Arc::clone(windows.entry(key).or_default())
    }
}

impl Default for RateWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}
