// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Platform services facade.
//!
//! Wall-clock time and connectivity are injected rather than read from
//! globals so the router and orchestrator can run against a controlled
//! clock in tests.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

pub trait Platform: Send + Sync + Debug {
    /// Current wall-clock time in epoch milliseconds.
    fn now_millis(&self) -> i64;

    /// Whether the host believes it has network connectivity.
    fn is_online(&self) -> bool;
}

/// Real clock. Connectivity is whatever the host last reported via
/// [`SystemPlatform::set_online`] (online by default).
#[derive(Debug)]
pub struct SystemPlatform {
    online: AtomicBool,
}

impl SystemPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self { online: AtomicBool::new(true) }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }
}

impl Default for SystemPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SystemPlatform {
    fn now_millis(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

/// Hand-driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualPlatform {
    now: AtomicI64,
    online: AtomicBool,
}

impl ManualPlatform {
    #[must_use]
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
            online: AtomicBool::new(true),
        }
    }

    pub fn advance_millis(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::AcqRel);
    }

    pub fn set_now(&self, millis: i64) {
        self.now.store(millis, Ordering::Release);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }
}

impl Platform for ManualPlatform {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let platform = ManualPlatform::new(1_000);
        platform.advance_millis(250);
        assert_eq!(platform.now_millis(), 1_250);
        platform.set_now(5);
        assert_eq!(platform.now_millis(), 5);
    }

    #[test]
    fn test_connectivity_toggle() {
        let platform = SystemPlatform::new();
        assert!(platform.is_online());
        platform.set_online(false);
        assert!(!platform.is_online());
    }

    #[test]
    fn test_system_clock_is_epoch_millis() {
        // 2020-01-01 in epoch millis
        assert!(SystemPlatform::new().now_millis() > 1_577_836_800_000);
    }
}
