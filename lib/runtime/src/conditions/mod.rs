// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Distributed conditions built on registry primitives: keys, TTL, watch.
//!
//! Applications express cohort membership and barrier progress with these.
//! A [`Join`] asserts "member X of cohort Y is alive" as a TTL key; a
//! [`CountWatch`] resolves once a cohort reaches a size; a [`NameWatch`]
//! resolves once a specific member appears; [`State`] is a small JSON
//! checkpoint with compare-and-swap semantics.
//!
//! Conditions observe the linearizable order of the backing store. Between
//! different condition instances only store-global ordering applies.

mod join;
mod state;
mod watch;

pub use join::Join;
pub use state::State;
pub use watch::{CountWatch, NameWatch};

#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    /// The TTL key expired and could not be recreated.
    #[error("condition expired")]
    Expired,

    /// A CAS write lost the race; refetch and retry.
    #[error("state conflict")]
    Conflict,

    #[error("condition key not found")]
    NotFound,

    #[error(transparent)]
    Etcd(#[from] etcd_client::Error),

    #[error("state encoding: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Join path parts into a single key.
pub(crate) fn join_path(parts: &[&str]) -> String {
    parts.join("/")
}

/// One keepalive round-trip for a lease. `Ok(true)` means the lease is still
/// live, `Ok(false)` means the store no longer knows it.
pub(crate) async fn keep_alive_once(
    client: &etcd_client::Client,
    lease_id: i64,
) -> Result<bool, etcd_client::Error> {
    let mut client = client.clone();
    let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
    keeper.keep_alive().await?;
    match stream.message().await? {
        Some(resp) if resp.ttl() > 0 => Ok(true),
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(
            join_path(&["grid", "flow", "started", "member-1"]),
            "grid/flow/started/member-1"
        );
        assert_eq!(join_path(&["solo"]), "solo");
    }
}
