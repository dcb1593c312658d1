//! Connection admission control
//!
//! Two quotas checked before a CONNECT is accepted: a per-source-address
//! connection cap and a process-wide connection rate that resets every
//! second. A denied connection is answered with `SERVER_UNAVAILABLE` and
//! closed before any session exists.

use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::session::now_millis;

/// Why a connection was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDenied {
    /// The source address holds too many connections
    PerIpLimit,
    /// The process-wide connect rate was exceeded
    RateLimit,
}

#[derive(Debug)]
struct Inner {
    enabled: bool,
    max_connections_per_ip: u32,
    connect_rate_per_second: u32,
    connections_per_ip: DashMap<IpAddr, AtomicU32>,
    window_count: AtomicU32,
    window_start_millis: AtomicI64,
}

/// Shared admission controller; one per process
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    inner: Arc<Inner>,
}

impl AdmissionControl {
    pub fn new(enabled: bool, max_connections_per_ip: u32, connect_rate_per_second: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                enabled,
                max_connections_per_ip,
                connect_rate_per_second,
                connections_per_ip: DashMap::new(),
                window_count: AtomicU32::new(0),
                window_start_millis: AtomicI64::new(now_millis() as i64),
            }),
        }
    }

    /// Check both quotas. On success the returned permit holds the per-IP
    /// slot until dropped.
    pub fn try_acquire(&self, ip: IpAddr) -> Result<ConnectionPermit, AdmissionDenied> {
        if !self.inner.enabled {
            return Ok(ConnectionPermit {
                control: None,
                ip,
            });
        }

        // Per-IP cap
        let ip_count = self
            .inner
            .connections_per_ip
            .entry(ip)
            .or_insert_with(|| AtomicU32::new(0));
        if ip_count.load(Ordering::Relaxed) >= self.inner.max_connections_per_ip {
            warn!(
                "Admission: {} exceeded max connections ({})",
                ip, self.inner.max_connections_per_ip
            );
            return Err(AdmissionDenied::PerIpLimit);
        }

        // Process-wide rate, reset every second
        let now = now_millis() as i64;
        let window_start = self.inner.window_start_millis.load(Ordering::Relaxed);
        if now - window_start >= 1000 {
            if self
                .inner
                .window_start_millis
                .compare_exchange(window_start, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                self.inner.window_count.store(0, Ordering::Relaxed);
            }
        }

        if self.inner.window_count.load(Ordering::Relaxed) >= self.inner.connect_rate_per_second {
            warn!(
                "Admission: connection rate exceeded ({}/sec)",
                self.inner.connect_rate_per_second
            );
            return Err(AdmissionDenied::RateLimit);
        }

        self.inner.window_count.fetch_add(1, Ordering::Relaxed);
        ip_count.fetch_add(1, Ordering::Relaxed);
        drop(ip_count);

        Ok(ConnectionPermit {
            control: Some(self.clone()),
            ip,
        })
    }

    pub fn connection_count(&self, ip: IpAddr) -> u32 {
        self.inner
            .connections_per_ip
            .get(&ip)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn tracked_ip_count(&self) -> usize {
        self.inner.connections_per_ip.len()
    }

    fn release(&self, ip: IpAddr) {
        let remove = if let Some(count) = self.inner.connections_per_ip.get(&ip) {
            count.fetch_sub(1, Ordering::Relaxed) <= 1
        } else {
            false
        };
        if remove {
            self.inner
                .connections_per_ip
                .remove_if(&ip, |_, count| count.load(Ordering::Relaxed) == 0);
        }
    }
}

/// RAII per-IP connection slot
#[derive(Debug)]
pub struct ConnectionPermit {
    control: Option<AdmissionControl>,
    ip: IpAddr,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        if let Some(control) = self.control.take() {
            control.release(self.ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_per_ip_limit() {
        let control = AdmissionControl::new(true, 2, 1000);
        let a = ip("10.0.0.1");

        let p1 = control.try_acquire(a).unwrap();
        let _p2 = control.try_acquire(a).unwrap();
        assert_eq!(
            control.try_acquire(a).unwrap_err(),
            AdmissionDenied::PerIpLimit
        );

        // Releasing a permit frees the slot
        drop(p1);
        assert!(control.try_acquire(a).is_ok());
    }

    #[test]
    fn test_other_ip_unaffected() {
        let control = AdmissionControl::new(true, 1, 1000);

        let _p1 = control.try_acquire(ip("10.0.0.1")).unwrap();
        assert!(control.try_acquire(ip("10.0.0.2")).is_ok());
    }

    #[test]
    fn test_rate_limit() {
        let control = AdmissionControl::new(true, 1000, 3);
        let a = ip("10.0.0.1");

        let mut permits = Vec::new();
        for _ in 0..3 {
            permits.push(control.try_acquire(a).unwrap());
        }
        assert_eq!(
            control.try_acquire(a).unwrap_err(),
            AdmissionDenied::RateLimit
        );
    }

    #[test]
    fn test_disabled_allows_everything() {
        let control = AdmissionControl::new(false, 0, 0);
        for _ in 0..10 {
            // Permits are inert when disabled
            let _ = control.try_acquire(ip("10.0.0.1")).unwrap();
        }
        assert_eq!(control.tracked_ip_count(), 0);
    }

    #[test]
    fn test_permit_drop_cleans_map() {
        let control = AdmissionControl::new(true, 10, 1000);
        let a = ip("192.168.1.1");

        let permit = control.try_acquire(a).unwrap();
        assert_eq!(control.connection_count(a), 1);
        drop(permit);
        assert_eq!(control.connection_count(a), 0);
        assert_eq!(control.tracked_ip_count(), 0);
    }
}
