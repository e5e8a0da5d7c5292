// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;

/// Tracks endpoints that asked for a graceful drain on shutdown.
///
/// Counts are registered while an endpoint is serving and released when it
/// finishes; `wait_for_completion` parks until the count reaches zero.
#[derive(Debug, Default)]
pub struct GracefulShutdownTracker {
    count: AtomicUsize,
    done: Notify,
}

impl GracefulShutdownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.done.notify_waiters();
        }
    }

    pub fn get_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub async fn wait_for_completion(&self) {
        loop {
            let notified = self.done.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Build a stable peer name of the form `hostname-pid-slot`.
///
/// The hostname comes from `$HOSTNAME`, falling back to `localhost` when the
/// variable is unset (containers always set it, bare shells usually do too).
pub fn build_peer_name(slot: u32) -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{}-{}-{}", host, std::process::id(), slot)
}

/// Identity of a registry instance: `hostname-pid`.
pub fn registry_name() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}

/// Wall-clock time in nanoseconds since the unix epoch.
pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_name_shape() {
        let name = build_peer_name(3);
        let parts: Vec<&str> = name.rsplitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "3");
        assert_eq!(parts[1], std::process::id().to_string());
    }

    #[tokio::test]
    async fn test_tracker_completes_at_zero() {
        let tracker = GracefulShutdownTracker::new();
        tracker.register();
        tracker.register();
        assert_eq!(tracker.get_count(), 2);
        tracker.release();
        tracker.release();
        tracker.wait_for_completion().await;
        assert_eq!(tracker.get_count(), 0);
    }
}
