//! Remote worker registry.
//!
//! Endpoints are shared read-many between dispatchers; every write that
//! disables or revives an endpoint goes through the registry's single
//! mutex. Once net errors reach the limit an endpoint is disabled for the
//! life of the process.

use std::sync::Mutex;
use tracing::{info, warn};

/// One remote worker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoint {
    pub host: String,
    pub port: u16,
    /// Worker-id token when the scheduler handed one out.
    pub token: Option<String>,
    /// Rolling counter of consecutive net errors.
    pub net_errors: u32,
    /// Tripped once `net_errors` reaches the limit; never reset.
    pub disabled: bool,
    /// Requests currently in flight on this endpoint.
    pub in_flight: u32,
}

impl WorkerEndpoint {
    /// Parse a `host:port` entry from a worker list.
    pub fn parse(entry: &str) -> Option<Self> {
        let (host, port) = entry.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            port,
            token: None,
            net_errors: 0,
            disabled: false,
            in_flight: 0,
        })
    }

    /// The `host:port` key used to address this endpoint.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Registry of the remote workers one work session may dispatch to.
pub struct WorkerRegistry {
    net_error_limit: u32,
    limit_per_worker: u32,
    workers: Mutex<Vec<WorkerEndpoint>>,
}

impl WorkerRegistry {
    pub fn new(net_error_limit: u32, limit_per_worker: u32) -> Self {
        Self {
            net_error_limit,
            limit_per_worker: limit_per_worker.max(1),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Build a registry from `host:port` entries, dropping malformed ones.
    pub fn from_list(entries: &[String], net_error_limit: u32, limit_per_worker: u32) -> Self {
        let registry = Self::new(net_error_limit, limit_per_worker);
        {
            let mut workers = registry.workers.lock().expect("worker registry poisoned");
            for entry in entries {
                match WorkerEndpoint::parse(entry) {
                    Some(endpoint) => workers.push(endpoint),
                    None => warn!(entry = %entry, "skipping malformed worker entry"),
                }
            }
        }
        registry
    }

    /// Select an endpoint for dispatch and reserve one in-flight unit on
    /// it. With no explicit selection the first live endpoint with spare
    /// capacity wins.
    pub fn pick(&self, preferred: Option<&str>) -> Option<WorkerEndpoint> {
        let mut workers = self.workers.lock().expect("worker registry poisoned");
        let position = match preferred {
            Some(key) => workers
                .iter()
                .position(|w| !w.disabled && w.key() == key && w.in_flight < self.limit_per_worker),
            None => workers
                .iter()
                .position(|w| !w.disabled && w.in_flight < self.limit_per_worker),
        }?;
        workers[position].in_flight += 1;
        Some(workers[position].clone())
    }

    /// Return the in-flight unit reserved by [`pick`].
    pub fn done(&self, key: &str) {
        let mut workers = self.workers.lock().expect("worker registry poisoned");
        if let Some(w) = workers.iter_mut().find(|w| w.key() == key) {
            w.in_flight = w.in_flight.saturating_sub(1);
        }
    }

    /// A successful interaction clears the rolling error counter.
    pub fn record_success(&self, key: &str) {
        let mut workers = self.workers.lock().expect("worker registry poisoned");
        if let Some(w) = workers.iter_mut().find(|w| w.key() == key) {
            w.net_errors = 0;
        }
    }

    /// Count one net error; trips the disabled flag at the limit. Returns
    /// true when this call disabled the endpoint.
    pub fn record_net_error(&self, key: &str) -> bool {
        let mut workers = self.workers.lock().expect("worker registry poisoned");
        let Some(w) = workers.iter_mut().find(|w| w.key() == key) else {
            return false;
        };
        w.net_errors += 1;
        if !w.disabled && w.net_errors >= self.net_error_limit {
            w.disabled = true;
            info!(
                worker = %key,
                net_errors = w.net_errors,
                "worker disabled after repeated net errors"
            );
            return true;
        }
        false
    }

    /// Endpoints that are still eligible for dispatch.
    pub fn live_count(&self) -> usize {
        self.workers
            .lock()
            .expect("worker registry poisoned")
            .iter()
            .filter(|w| !w.disabled)
            .count()
    }

    /// Total endpoints ever registered.
    pub fn total_count(&self) -> usize {
        self.workers.lock().expect("worker registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> WorkerRegistry {
        WorkerRegistry::from_list(
            &["10.0.0.1:31000".to_string(), "10.0.0.2:31000".to_string()],
            3,
            2,
        )
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(WorkerEndpoint::parse("10.0.0.1:31000").is_some());
        assert!(WorkerEndpoint::parse("10.0.0.1").is_none());
        assert!(WorkerEndpoint::parse(":31000").is_none());
        assert!(WorkerEndpoint::parse("host:notaport").is_none());
    }

    #[test]
    fn test_default_pick_is_first_live() {
        let r = registry();
        let w = r.pick(None).unwrap();
        assert_eq!(w.key(), "10.0.0.1:31000");
    }

    #[test]
    fn test_disable_is_monotonic() {
        let r = registry();
        for _ in 0..2 {
            assert!(!r.record_net_error("10.0.0.1:31000"));
        }
        assert!(r.record_net_error("10.0.0.1:31000"));
        assert_eq!(r.live_count(), 1);

        // success after disable does not revive it
        r.record_success("10.0.0.1:31000");
        let w = r.pick(None).unwrap();
        assert_eq!(w.key(), "10.0.0.2:31000");
    }

    #[test]
    fn test_success_resets_counter() {
        let r = registry();
        r.record_net_error("10.0.0.1:31000");
        r.record_net_error("10.0.0.1:31000");
        r.record_success("10.0.0.1:31000");
        // the counter restarted, one more error does not disable
        assert!(!r.record_net_error("10.0.0.1:31000"));
        assert_eq!(r.live_count(), 2);
    }

    #[test]
    fn test_limit_per_worker_spills_to_next() {
        let r = registry();
        let a = r.pick(None).unwrap();
        let b = r.pick(None).unwrap();
        assert_eq!(a.key(), b.key());
        let c = r.pick(None).unwrap();
        assert_eq!(c.key(), "10.0.0.2:31000");

        r.done(&a.key());
        let d = r.pick(None).unwrap();
        assert_eq!(d.key(), "10.0.0.1:31000");
    }
}
