// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use etcd_client::{Compare, CompareOp, PutOptions, Txn, TxnOp, TxnOpResponse};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{keep_alive_once, ConditionError};
use crate::registry::NO_LEASE;

/// A JSON checkpoint at a key, written with compare-and-swap semantics.
///
/// `fetch` records the store's mod revision as the expected CAS index;
/// `store` writes only while the stored revision still equals that index and
/// advances it on success. The key carries a TTL refreshed by each store, so
/// an abandoned checkpoint eventually expires.
pub struct State {
    client: etcd_client::Client,
    key: String,
    ttl: Duration,
    lease_id: Mutex<i64>,
    index: Mutex<i64>,
}

impl State {
    pub fn new(client: etcd_client::Client, ttl: Duration, parts: &[&str]) -> State {
        State {
            client,
            key: super::join_path(parts),
            ttl,
            lease_id: Mutex::new(NO_LEASE),
            index: Mutex::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Expected CAS index from the last successful `init`/`fetch`/`store`.
    pub fn index(&self) -> i64 {
        *self.index.lock()
    }

    async fn ensure_lease(&self) -> Result<i64, ConditionError> {
        let lease_id = *self.lease_id.lock();
        if lease_id != NO_LEASE {
            match keep_alive_once(&self.client, lease_id).await {
                Ok(true) => return Ok(lease_id),
                _ => {
                    tracing::debug!(key = %self.key, lease_id, "state lease expired, granting new");
                }
            }
        }

        let mut client = self.client.clone();
        let granted = client.lease_grant(self.ttl.as_secs() as i64, None).await?;
        *self.lease_id.lock() = granted.id();
        Ok(granted.id())
    }

    /// Create the checkpoint if absent. Fails with
    /// [`ConditionError::Conflict`] when it already exists; callers then
    /// `fetch` instead.
    pub async fn init<T: Serialize>(&self, v: &T) -> Result<(), ConditionError> {
        let lease_id = self.ensure_lease().await?;
        let value = serde_json::to_vec(v)?;

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

        let mut client = self.client.clone();
        let resp = client.txn(txn).await?;
        if !resp.succeeded() {
            return Err(ConditionError::Conflict);
        }

        if let Some(header) = resp.header() {
            *self.index.lock() = header.revision();
        }
        Ok(())
    }

    /// Read the checkpoint and record its revision as the CAS index.
    pub async fn fetch<T: DeserializeOwned>(&self) -> Result<T, ConditionError> {
        let mut client = self.client.clone();
        let resp = client.get(self.key.as_str(), None).await?;
        let Some(kv) = resp.kvs().first() else {
            return Err(ConditionError::NotFound);
        };
        let v = serde_json::from_slice(kv.value())?;
        *self.index.lock() = kv.mod_revision();
        Ok(v)
    }

    /// Write the checkpoint, succeeding only if nobody else has written it
    /// since our last `init`/`fetch`/`store`.
    pub async fn store<T: Serialize>(&self, v: &T) -> Result<(), ConditionError> {
        let lease_id = self.ensure_lease().await?;
        let value = serde_json::to_vec(v)?;
        let index = *self.index.lock();

        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                self.key.as_str(),
                CompareOp::Equal,
                index,
            )])
            .and_then(vec![TxnOp::put(
                self.key.as_str(),
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )])
            .or_else(vec![TxnOp::get(self.key.as_str(), None)]);

        let mut client = self.client.clone();
        let resp = client.txn(txn).await?;
        if resp.succeeded() {
            if let Some(header) = resp.header() {
                *self.index.lock() = header.revision();
            }
            return Ok(());
        }

        for op in resp.op_responses() {
            if let TxnOpResponse::Get(get) = op {
                if get.count() == 0 {
                    return Err(ConditionError::NotFound);
                }
            }
        }
        Err(ConditionError::Conflict)
    }

    /// Release local resources without touching the key.
    pub fn stop(&self) {
        *self.lease_id.lock() = NO_LEASE;
    }
}
