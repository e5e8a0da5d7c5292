// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Registry, condition, and election tests against a live etcd.
//!
//! These are ignored by default; bring up an etcd on localhost:2379 and run
//! `cargo test -p lattice-runtime -- --ignored`.

use std::collections::HashSet;
use std::time::Duration;

use lattice_runtime::conditions::{ConditionError, CountWatch, Join, NameWatch, State};
use lattice_runtime::config::RuntimeConfig;
use lattice_runtime::registry::{EventType, Registry, RegistryError, NO_LEASE};

async fn connect() -> etcd_client::Client {
    etcd_client::Client::connect(["localhost:2379"], None)
        .await
        .expect("etcd not reachable on localhost:2379")
}

fn scratch(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

fn fast_registry(client: etcd_client::Client) -> Registry {
    let config = RuntimeConfig {
        lease_duration: Duration::from_secs(2),
        ..Default::default()
    };
    Registry::with_config(client, &config)
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_initial_lease_id() {
    let registry = fast_registry(connect().await);
    assert_eq!(registry.lease_id(), NO_LEASE);

    registry.start("1.2.3.4:5000").await.unwrap();
    assert!(registry.lease_id() > 0);

    registry.stop().await;
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_register_then_read() {
    let registry = fast_registry(connect().await);
    registry.start("1.2.3.4:5000").await.unwrap();

    let key = scratch("test-registration");
    registry.register(key.as_str()).await.unwrap();

    let reg = registry.find_registration(&key).await.unwrap();
    assert_eq!(reg.key, key);
    assert_eq!(reg.address, "1.2.3.4:5000");
    assert_eq!(reg.registry, registry.registry());

    registry.stop().await;
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_register_deregister_not_started() {
    let registry = fast_registry(connect().await);

    let err = registry.register("never-started").await.unwrap_err();
    assert!(matches!(err, RegistryError::NotStarted));

    let err = registry.deregister("never-started").await.unwrap_err();
    assert!(matches!(err, RegistryError::NotStarted));
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_double_register_rejected() {
    let registry = fast_registry(connect().await);
    registry.start("localhost:7000").await.unwrap();

    let key = scratch("test-registration-twice");
    registry.register(key.as_str()).await.unwrap();
    let err = registry.register(key.as_str()).await.unwrap_err();
    assert!(matches!(err, RegistryError::AlreadyRegistered));

    registry.stop().await;
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_deregister_then_find_is_not_found() {
    let registry = fast_registry(connect().await);
    registry.start("localhost:7000").await.unwrap();

    let key = scratch("test-dereg");
    registry.register(key.as_str()).await.unwrap();
    registry.deregister(key.as_str()).await.unwrap();

    let err = registry.find_registration(&key).await.unwrap_err();
    assert!(matches!(err, RegistryError::NotFound));

    registry.stop().await;
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_stop_deletes_owned_keys() {
    let client = connect().await;
    let registry = fast_registry(client.clone());
    registry.start("localhost:7000").await.unwrap();

    let prefix = scratch("test-stop");
    for i in 0..3 {
        registry
            .register(format!("{}/k-{}", prefix, i))
            .await
            .unwrap();
    }
    registry.stop().await;

    let mut client = client;
    let resp = client
        .get(
            prefix.as_str(),
            Some(etcd_client::GetOptions::new().with_prefix()),
        )
        .await
        .unwrap();
    assert_eq!(resp.count(), 0, "stop did not delete lease-owned keys");
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_keepalive_heartbeats() {
    let client = connect().await;
    let config = RuntimeConfig {
        lease_duration: Duration::from_secs(1),
        ..Default::default()
    };
    let registry = Registry::with_config(client, &config);
    registry.start("localhost:7000").await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    let stats = registry.keep_alive_stats();
    assert!(
        stats.success >= 1,
        "expected at least one successful heartbeat, got {:?}",
        stats
    );

    registry.stop().await;
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_watch_additions_and_deletions() {
    let registry = fast_registry(connect().await);
    registry.start("localhost:7000").await.unwrap();

    let prefix = scratch("peer");
    let initial_keys: Vec<String> = (1..=3).map(|i| format!("{}-{}", prefix, i)).collect();
    for key in &initial_keys {
        registry.register(key.as_str()).await.unwrap();
    }

    let (initial, mut events) = registry.watch(prefix.clone()).await.unwrap();
    let initial_set: HashSet<String> = initial.into_iter().map(|r| r.key).collect();
    assert_eq!(
        initial_set,
        initial_keys.iter().cloned().collect::<HashSet<_>>()
    );

    let added_keys: Vec<String> = (4..=5).map(|i| format!("{}-{}", prefix, i)).collect();
    for key in &added_keys {
        registry.register(key.as_str()).await.unwrap();
    }
    for key in &initial_keys {
        registry.deregister(key.as_str()).await.unwrap();
    }

    let mut adds = HashSet::new();
    let mut dels = HashSet::new();
    while adds.len() + dels.len() < 5 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("watch timed out")
            .expect("watch closed early");
        match event.event_type {
            EventType::Create => {
                adds.insert(event.key);
            }
            EventType::Delete => {
                dels.insert(event.key);
            }
            other => panic!("unexpected event type {:?}", other),
        }
    }

    assert_eq!(adds, added_keys.iter().cloned().collect::<HashSet<_>>());
    assert_eq!(dels, initial_keys.iter().cloned().collect::<HashSet<_>>());

    registry.stop().await;
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_join_rejoin_and_exit() {
    let client = connect().await;
    let cohort = scratch("cohort");
    let join = Join::new(
        client.clone(),
        Duration::from_secs(10),
        &[&cohort, "started", "member-1"],
    );

    join.rejoin().await.unwrap();
    // Rejoin before the TTL elapses is equivalent to a single rejoin.
    join.rejoin().await.unwrap();
    join.alive().await.unwrap();

    let mut client = client;
    let resp = client.get(join.key(), None).await.unwrap();
    assert_eq!(resp.count(), 1);

    join.exit().await.unwrap();
    let resp = client.get(join.key(), None).await.unwrap();
    assert_eq!(resp.count(), 0);
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_count_watch_reaches_target() {
    let client = connect().await;
    let cohort = scratch("cohort");

    let watch = CountWatch::new(client.clone(), &[&cohort, "started"]);
    let reached = watch.watch_until(2).await.unwrap();

    let j1 = Join::new(
        client.clone(),
        Duration::from_secs(10),
        &[&cohort, "started", "m-1"],
    );
    let j2 = Join::new(
        client.clone(),
        Duration::from_secs(10),
        &[&cohort, "started", "m-2"],
    );
    j1.rejoin().await.unwrap();
    j2.rejoin().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), reached)
        .await
        .expect("count never reached")
        .expect("watch dropped");

    j1.exit().await.unwrap();
    j2.exit().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_name_watch_sees_member() {
    let client = connect().await;
    let cohort = scratch("cohort");

    let watch = NameWatch::new(client.clone(), &[&cohort, "finished"]);
    let appeared = watch.watch_until("leader-0").await.unwrap();

    let join = Join::new(
        client.clone(),
        Duration::from_secs(10),
        &[&cohort, "finished", "leader-0"],
    );
    join.rejoin().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), appeared)
        .await
        .expect("name never appeared")
        .expect("watch dropped");

    join.exit().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_state_cas() {
    let client = connect().await;
    let path = scratch("flow-state");

    let writer = State::new(client.clone(), Duration::from_secs(60), &[&path, "leader"]);
    let racer = State::new(client.clone(), Duration::from_secs(60), &[&path, "leader"]);

    writer.init(&42u64).await.unwrap();
    let err = racer.init(&0u64).await.unwrap_err();
    assert!(matches!(err, ConditionError::Conflict));

    let v: u64 = racer.fetch().await.unwrap();
    assert_eq!(v, 42);

    // Both saw the same revision; the first store wins, the second
    // conflicts until it refetches.
    let _: u64 = writer.fetch().await.unwrap();
    writer.store(&43u64).await.unwrap();
    let err = racer.store(&44u64).await.unwrap_err();
    assert!(matches!(err, ConditionError::Conflict));

    let v: u64 = racer.fetch().await.unwrap();
    assert_eq!(v, 43);
    racer.store(&44u64).await.unwrap();

    let v: u64 = writer.fetch().await.unwrap();
    assert_eq!(v, 44);
}
