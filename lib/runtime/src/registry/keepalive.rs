// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Background heartbeating of the registry lease.
//!
//! Transient failures are retried with exponential backoff for up to one
//! lease duration since the last confirmed heartbeat. A closed keepalive
//! stream, a remotely revoked lease, or a retry window that runs dry all put
//! the registry into its terminal failed state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::Shared;
use crate::config::HEARTBEATS_PER_LEASE;

/// Counts of keepalive outcomes since `start`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepAliveStats {
    pub success: u64,
    pub failure: u64,
}

pub(super) async fn run(
    client: etcd_client::Client,
    lease_id: i64,
    lease_duration: Duration,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let interval = lease_duration / HEARTBEATS_PER_LEASE;
    let mut backoff = interval / 2;
    let mut last_success = Instant::now();

    'reconnect: loop {
        if cancel.is_cancelled() {
            return;
        }

        let mut c = client.clone();
        let (mut keeper, mut stream) = match c.lease_keep_alive(lease_id).await {
            Ok(pair) => pair,
            Err(e) => {
                shared.record_failure();
                tracing::warn!(lease_id, error = %e, "keepalive stream open failed");
                if retry_exhausted(last_success, lease_duration) {
                    break 'reconnect;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(lease_duration);
                continue 'reconnect;
            }
        };

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if let Err(e) = keeper.keep_alive().await {
                shared.record_failure();
                tracing::warn!(lease_id, error = %e, "keepalive send failed");
                if retry_exhausted(last_success, lease_duration) {
                    break 'reconnect;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(lease_duration);
                continue 'reconnect;
            }

            match stream.message().await {
                Ok(Some(resp)) if resp.ttl() > 0 => {
                    shared.record_success();
                    last_success = Instant::now();
                    backoff = interval / 2;
                }
                Ok(Some(_)) => {
                    // TTL of zero means the lease was revoked remotely.
                    tracing::error!(lease_id, "lease revoked remotely");
                    break 'reconnect;
                }
                Ok(None) => {
                    tracing::error!(lease_id, "keepalive stream closed");
                    break 'reconnect;
                }
                Err(e) => {
                    shared.record_failure();
                    tracing::warn!(lease_id, error = %e, "keepalive response failed");
                    if retry_exhausted(last_success, lease_duration) {
                        break 'reconnect;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(lease_duration);
                    continue 'reconnect;
                }
            }
        }
    }

    if !cancel.is_cancelled() {
        shared.mark_failed();
        tracing::error!(lease_id, "registry entered failed state, lease lost");
    }
}

fn retry_exhausted(last_success: Instant, lease_duration: Duration) -> bool {
    last_success.elapsed() > lease_duration
}
