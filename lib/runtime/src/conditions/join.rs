// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use etcd_client::PutOptions;
use parking_lot::Mutex;

use super::{keep_alive_once, ConditionError};
use crate::registry::NO_LEASE;

/// Cohort membership assertion: a TTL key at `<parts...>/<member>` held
/// under its own lease.
pub struct Join {
    client: etcd_client::Client,
    key: String,
    ttl: Duration,
    lease_id: Mutex<i64>,
}

impl Join {
    /// `parts` already include the member id as the final component.
    pub fn new(client: etcd_client::Client, ttl: Duration, parts: &[&str]) -> Join {
        Join {
            client,
            key: super::join_path(parts),
            ttl,
            lease_id: Mutex::new(NO_LEASE),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Assert the key, creating it if absent or refreshing its TTL if this
    /// join already holds it. Repeated calls before the TTL elapses are
    /// equivalent to a single call.
    pub async fn rejoin(&self) -> Result<(), ConditionError> {
        let lease_id = *self.lease_id.lock();
        if lease_id != NO_LEASE {
            match keep_alive_once(&self.client, lease_id).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    tracing::debug!(key = %self.key, lease_id, "join lease expired, recreating");
                }
                Err(e) => {
                    tracing::debug!(key = %self.key, lease_id, error = %e, "join keepalive failed, recreating");
                }
            }
        }

        let mut client = self.client.clone();
        let granted = client.lease_grant(self.ttl.as_secs() as i64, None).await?;
        let lease_id = granted.id();

        client
            .put(
                self.key.as_str(),
                Vec::new(),
                Some(PutOptions::new().with_lease(lease_id)),
            )
            .await?;

        *self.lease_id.lock() = lease_id;
        Ok(())
    }

    /// Refresh the TTL. Fails with [`ConditionError::Expired`] if the key
    /// expired and could not be recreated.
    pub async fn alive(&self) -> Result<(), ConditionError> {
        let lease_id = *self.lease_id.lock();
        if lease_id != NO_LEASE {
            if let Ok(true) = keep_alive_once(&self.client, lease_id).await {
                return Ok(());
            }
        }
        self.rejoin().await.map_err(|e| match e {
            ConditionError::Etcd(_) | ConditionError::Codec(_) => ConditionError::Expired,
            other => other,
        })
    }

    /// Remove the key and release its lease.
    pub async fn exit(&self) -> Result<(), ConditionError> {
        let lease_id = {
            let mut guard = self.lease_id.lock();
            std::mem::replace(&mut *guard, NO_LEASE)
        };

        let mut client = self.client.clone();
        client.delete(self.key.as_str(), None).await?;
        if lease_id != NO_LEASE {
            // Revoke is best-effort; the key is already gone.
            if let Err(e) = client.lease_revoke(lease_id).await {
                tracing::debug!(key = %self.key, lease_id, error = %e, "join lease revoke failed");
            }
        }
        Ok(())
    }

    /// Release local resources without touching the key; the store expires
    /// it on its own once the TTL lapses.
    pub fn stop(&self) {
        *self.lease_id.lock() = NO_LEASE;
    }
}
