// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Leader election over a KV lease.
//!
//! Candidates try to create `<grid>/leader` bound to a dedicated election
//! lease whose TTL is the cluster's heart timeout; the creator is leader for
//! a fresh, strictly increasing term. Everyone else watches the key and
//! re-campaigns when it disappears. Because the key dies with its lease, a
//! crashed leader is replaced within one heart timeout.

use std::time::Duration;

use etcd_client::{Compare, CompareOp, PutOptions, Txn, TxnOp, WatchOptions};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::conditions::keep_alive_once;
use crate::config::{HEARTBEATS_PER_LEASE, MIN_LEASE_DURATION};
use crate::registry::NO_LEASE;

/// The value stored at the leader key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub leader: String,
    pub term: u64,
}

pub struct Election {
    client: etcd_client::Client,
    key: String,
    peer_name: String,
    /// TTL of the election lease; bounds failover latency.
    lease_ttl: Duration,
    lease_id: i64,
    cancel: CancellationToken,
}

impl Election {
    pub fn new(
        client: etcd_client::Client,
        grid: &str,
        peer_name: impl Into<String>,
        heart_timeout: Duration,
        cancel: CancellationToken,
    ) -> Election {
        Election {
            client,
            key: format!("{}/leader", grid),
            peer_name: peer_name.into(),
            lease_ttl: heart_timeout.max(MIN_LEASE_DURATION),
            lease_id: NO_LEASE,
            cancel,
        }
    }

    /// Spawn the campaign loop. The receiver always holds the most recently
    /// observed leader record; `None` means no leader is currently known.
    pub fn start(self) -> watch::Receiver<Option<LeaderRecord>> {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(self.campaign(tx));
        rx
    }

    async fn campaign(mut self, tx: watch::Sender<Option<LeaderRecord>>) {
        let mut last_term: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            // Observe the current leader, if any.
            let resp = match self.client.get(self.key.as_str(), None).await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(error = %e, "leader read failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };
            let revision = resp.header().map(|h| h.revision()).unwrap_or(0);

            match resp.kvs().first() {
                Some(kv) => {
                    let record: LeaderRecord = match serde_json::from_slice(kv.value()) {
                        Ok(record) => record,
                        Err(e) => {
                            tracing::error!(error = %e, "unparsable leader record");
                            break;
                        }
                    };
                    last_term = last_term.max(record.term);
                    let _ = tx.send(Some(record));

                    if self.watch_for_vacancy(revision + 1).await.is_err() {
                        break;
                    }
                    let _ = tx.send(None);
                }
                None => {
                    // Vacant: campaign with the next term.
                    let record = LeaderRecord {
                        leader: self.peer_name.clone(),
                        term: last_term + 1,
                    };
                    match self.try_claim(&record).await {
                        Ok(true) => {
                            tracing::info!(term = record.term, "became leader");
                            last_term = record.term;
                            let _ = tx.send(Some(record));

                            // Hold the key until it disappears (lease loss
                            // or resignation).
                            if self.watch_for_vacancy(revision + 1).await.is_err() {
                                break;
                            }
                            tracing::info!("stepped down");
                            let _ = tx.send(None);
                        }
                        Ok(false) => {
                            // Lost the race; observe the winner.
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "leader claim failed");
                            tokio::select! {
                                _ = self.cancel.cancelled() => break,
                                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            }
                        }
                    }
                }
            }
        }

        self.resign().await;
    }

    /// Reuse the election lease while the store still honors it, granting a
    /// fresh one otherwise.
    async fn ensure_lease(&mut self) -> anyhow::Result<i64> {
        if self.lease_id != NO_LEASE {
            match keep_alive_once(&self.client, self.lease_id).await {
                Ok(true) => return Ok(self.lease_id),
                _ => {
                    tracing::debug!(
                        lease_id = self.lease_id,
                        "election lease expired, granting new"
                    );
                }
            }
        }

        let granted = self
            .client
            .lease_grant(self.lease_ttl.as_secs() as i64, None)
            .await?;
        self.lease_id = granted.id();
        Ok(granted.id())
    }

    async fn try_claim(&mut self, record: &LeaderRecord) -> anyhow::Result<bool> {
        let lease_id = self.ensure_lease().await?;
        let value = serde_json::to_vec(record)?;
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                self.key.as_str(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(
                self.key.as_str(),
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )]);
        let resp = self.client.txn(txn).await?;
        Ok(resp.succeeded())
    }

    /// Block until the leader key is deleted, a new record is written, or
    /// the election is cancelled, heartbeating the election lease while
    /// parked. `Err` means the election should end.
    async fn watch_for_vacancy(&mut self, from_revision: i64) -> Result<(), ()> {
        let options = WatchOptions::new().with_start_revision(from_revision);
        let (mut watcher, mut stream) =
            match self.client.watch(self.key.as_str(), Some(options)).await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "leader watch failed");
                    return Err(());
                }
            };

        let mut ticker = tokio::time::interval(self.lease_ttl / HEARTBEATS_PER_LEASE);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Err(()),

                _ = ticker.tick() => {
                    // If the lease dies anyway, the store deletes the key
                    // and the watch below observes the vacancy.
                    if self.lease_id != NO_LEASE {
                        if let Err(e) = keep_alive_once(&self.client, self.lease_id).await {
                            tracing::warn!(error = %e, "election lease heartbeat failed");
                        }
                    }
                }

                message = stream.message() => match message {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            break Err(());
                        }
                        let deleted = resp
                            .events()
                            .iter()
                            .any(|e| e.event_type() == etcd_client::EventType::Delete);
                        if deleted {
                            break Ok(());
                        }
                    }
                    Ok(None) => break Err(()),
                    Err(e) => {
                        tracing::warn!(error = %e, "leader watch stream error");
                        break Err(());
                    }
                },
            }
        };

        let _ = watcher.cancel().await;
        outcome
    }

    /// Delete the leader key if this peer's election lease owns it, and
    /// release the lease.
    async fn resign(&mut self) {
        if self.lease_id == NO_LEASE {
            return;
        }

        let txn = Txn::new()
            .when(vec![Compare::lease(
                self.key.as_str(),
                CompareOp::Equal,
                self.lease_id,
            )])
            .and_then(vec![TxnOp::delete(self.key.as_str(), None)]);
        if let Err(e) = self.client.txn(txn).await {
            tracing::debug!(error = %e, "resign failed");
        }
        if let Err(e) = self.client.lease_revoke(self.lease_id).await {
            tracing::debug!(error = %e, "election lease revoke failed");
        }
        self.lease_id = NO_LEASE;
    }
}
