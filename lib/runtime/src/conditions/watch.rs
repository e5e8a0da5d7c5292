// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;

use etcd_client::{EventType, GetOptions, WatchOptions};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::ConditionError;

/// Resolves once the number of keys under a path reaches a target.
pub struct CountWatch {
    client: etcd_client::Client,
    prefix: String,
    cancel: CancellationToken,
}

impl CountWatch {
    pub fn new(client: etcd_client::Client, parts: &[&str]) -> CountWatch {
        CountWatch {
            client,
            prefix: format!("{}/", super::join_path(parts)),
            cancel: CancellationToken::new(),
        }
    }

    /// The returned receiver resolves exactly once, when the count of keys
    /// under the path is ≥ `n`. It observes both the initial count and
    /// subsequent create/delete events. Dropping into an error or calling
    /// [`CountWatch::stop`] closes the channel without resolving it.
    pub async fn watch_until(&self, n: usize) -> Result<oneshot::Receiver<()>, ConditionError> {
        let (tx, rx) = oneshot::channel();

        let mut client = self.client.clone();
        let resp = client
            .get(self.prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);

        let mut keys: HashSet<Vec<u8>> = resp.kvs().iter().map(|kv| kv.key().to_vec()).collect();
        if keys.len() >= n {
            let _ = tx.send(());
            return Ok(rx);
        }

        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(revision + 1);
        let (mut watcher, mut stream) = client.watch(self.prefix.as_str(), Some(options)).await?;

        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = stream.message() => message,
                };
                let resp = match message {
                    Ok(Some(resp)) => resp,
                    _ => break,
                };
                if resp.canceled() {
                    break;
                }
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    match event.event_type() {
                        EventType::Put => {
                            keys.insert(kv.key().to_vec());
                        }
                        EventType::Delete => {
                            keys.remove(kv.key());
                        }
                    }
                }
                if keys.len() >= n {
                    let _ = tx.send(());
                    break;
                }
            }
            let _ = watcher.cancel().await;
        });

        Ok(rx)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Resolves once a key whose final path segment equals a given name appears
/// under a path.
pub struct NameWatch {
    client: etcd_client::Client,
    prefix: String,
    cancel: CancellationToken,
}

impl NameWatch {
    pub fn new(client: etcd_client::Client, parts: &[&str]) -> NameWatch {
        NameWatch {
            client,
            prefix: format!("{}/", super::join_path(parts)),
            cancel: CancellationToken::new(),
        }
    }

    /// The returned receiver resolves exactly once, when `<path>/<name>`
    /// exists.
    pub async fn watch_until(&self, name: &str) -> Result<oneshot::Receiver<()>, ConditionError> {
        let (tx, rx) = oneshot::channel();
        let target = format!("{}{}", self.prefix, name);

        let mut client = self.client.clone();
        let resp = client.get(target.as_str(), None).await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        if resp.count() > 0 {
            let _ = tx.send(());
            return Ok(rx);
        }

        let options = WatchOptions::new().with_start_revision(revision + 1);
        let (mut watcher, mut stream) = client.watch(target.as_str(), Some(options)).await?;

        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = stream.message() => message,
                };
                let resp = match message {
                    Ok(Some(resp)) => resp,
                    _ => break,
                };
                if resp.canceled() {
                    break;
                }
                let appeared = resp
                    .events()
                    .iter()
                    .any(|e| e.event_type() == EventType::Put);
                if appeared {
                    let _ = tx.send(());
                    break;
                }
            }
            let _ = watcher.cancel().await;
        });

        Ok(rx)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
