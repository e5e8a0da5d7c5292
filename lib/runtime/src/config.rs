// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration.
//!
//! Every tunable can be set through a `LAT_` environment variable and falls
//! back to a documented default. Durations are given in whole seconds except
//! where noted.

use std::time::Duration;

/// Leases shorter than this are silently clamped.
pub const MIN_LEASE_DURATION: Duration = Duration::from_secs(1);

/// Number of heartbeats emitted per lease duration.
pub const HEARTBEATS_PER_LEASE: u32 = 5;

/// Runtime-wide tunables.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// TTL of the registry lease. Clamped to at least [`MIN_LEASE_DURATION`]
    /// and at most `heart_timeout`, so a dead peer's registrations are gone
    /// within the cluster's failure-detection bound.
    pub lease_duration: Duration,
    /// Upper bound on failure detection: a lost peer is observed, and a new
    /// leader elected, within this window. Registry leases never outlive it,
    /// and the leader key's own lease uses it as TTL.
    pub heart_timeout: Duration,
    /// Capacity of each mailbox's inbound queue.
    pub mailbox_capacity: usize,
    /// Soft byte threshold at which a buffered sender flushes.
    pub batch_bytes: usize,
    /// Soft age threshold at which a buffered sender flushes (milliseconds).
    pub batch_delay: Duration,
    /// Default deadline applied to `request` when the caller gives none.
    pub request_timeout: Duration,
    /// Initial restart backoff for supervised actors.
    pub restart_backoff_initial: Duration,
    /// Cap on the restart backoff for supervised actors.
    pub restart_backoff_max: Duration,
    /// How long shutdown waits for actors to drain before cancelling them.
    pub shutdown_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            heart_timeout: Duration::from_secs(30),
            mailbox_capacity: 100,
            batch_bytes: 2700,
            batch_delay: Duration::from_millis(50),
            request_timeout: Duration::from_secs(1),
            restart_backoff_initial: Duration::from_millis(100),
            restart_backoff_max: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl RuntimeConfig {
    /// Build a config from `LAT_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            lease_duration: env_secs("LAT_LEASE_DURATION", d.lease_duration),
            heart_timeout: env_secs("LAT_HEART_TIMEOUT", d.heart_timeout),
            mailbox_capacity: env_usize("LAT_MAILBOX_CAPACITY", d.mailbox_capacity),
            batch_bytes: env_usize("LAT_BATCH_BYTES", d.batch_bytes),
            batch_delay: env_millis("LAT_BATCH_DELAY_MS", d.batch_delay),
            request_timeout: env_secs("LAT_REQUEST_TIMEOUT", d.request_timeout),
            restart_backoff_initial: env_millis(
                "LAT_RESTART_BACKOFF_INITIAL_MS",
                d.restart_backoff_initial,
            ),
            restart_backoff_max: env_secs("LAT_RESTART_BACKOFF_MAX", d.restart_backoff_max),
            shutdown_grace: env_secs("LAT_SHUTDOWN_GRACE", d.shutdown_grace),
        }
        .clamped()
    }

    /// Apply the hard floors and the failure-detection bound: both durations
    /// are floored at [`MIN_LEASE_DURATION`], and `lease_duration` is capped
    /// at `heart_timeout` so that neither peer-loss detection nor leader
    /// failover can take longer than `heart_timeout`.
    pub fn clamped(mut self) -> Self {
        if self.heart_timeout < MIN_LEASE_DURATION {
            self.heart_timeout = MIN_LEASE_DURATION;
        }
        if self.lease_duration < MIN_LEASE_DURATION {
            self.lease_duration = MIN_LEASE_DURATION;
        }
        if self.lease_duration > self.heart_timeout {
            self.lease_duration = self.heart_timeout;
        }
        self
    }

    /// Cadence of registry lease heartbeats.
    pub fn heartbeat_interval(&self) -> Duration {
        self.lease_duration / HEARTBEATS_PER_LEASE
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = RuntimeConfig::default();
        assert_eq!(c.lease_duration, Duration::from_secs(30));
        assert_eq!(c.heart_timeout, Duration::from_secs(30));
        assert_eq!(c.mailbox_capacity, 100);
        assert_eq!(c.batch_bytes, 2700);
        assert_eq!(c.batch_delay, Duration::from_millis(50));
        assert_eq!(c.request_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_defaults_respect_heart_timeout_bound() {
        let c = RuntimeConfig::default().clamped();
        assert!(c.lease_duration <= c.heart_timeout);
        assert_eq!(c.lease_duration, Duration::from_secs(30));
    }

    #[test]
    fn test_lease_duration_clamped_at_floor() {
        let c = RuntimeConfig {
            lease_duration: Duration::from_millis(10),
            ..Default::default()
        }
        .clamped();
        assert_eq!(c.lease_duration, MIN_LEASE_DURATION);
    }

    #[test]
    fn test_lease_duration_capped_at_heart_timeout() {
        let c = RuntimeConfig {
            lease_duration: Duration::from_secs(90),
            heart_timeout: Duration::from_secs(30),
            ..Default::default()
        }
        .clamped();
        assert_eq!(c.lease_duration, Duration::from_secs(30));
    }

    #[test]
    fn test_heart_timeout_floored() {
        let c = RuntimeConfig {
            lease_duration: Duration::from_secs(5),
            heart_timeout: Duration::from_millis(1),
            ..Default::default()
        }
        .clamped();
        assert_eq!(c.heart_timeout, MIN_LEASE_DURATION);
        assert_eq!(c.lease_duration, MIN_LEASE_DURATION);
    }

    #[test]
    fn test_heartbeat_interval_divides_lease() {
        let c = RuntimeConfig::default();
        assert_eq!(c.heartbeat_interval(), Duration::from_secs(6));
    }
}
