// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The [Runtime] is the process-wide context shared by every component on a
//! peer. It holds the primary [`CancellationToken`] from which all component
//! tokens descend, and coordinates phased shutdown: stop accepting new work,
//! drain gracefully, then cancel everything still running.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::utils::GracefulShutdownTracker;

#[derive(Debug, Clone)]
pub struct Runtime {
    id: Arc<String>,
    cancellation_token: CancellationToken,
    endpoint_shutdown_token: CancellationToken,
    graceful_shutdown_tracker: Arc<GracefulShutdownTracker>,
}

impl Runtime {
    pub fn new() -> Runtime {
        let id = Arc::new(uuid::Uuid::new_v4().to_string());

        let cancellation_token = CancellationToken::new();

        // endpoint shutdown token is a child of the main token
        let endpoint_shutdown_token = cancellation_token.child_token();

        Runtime {
            id,
            cancellation_token,
            endpoint_shutdown_token,
            graceful_shutdown_tracker: Arc::new(GracefulShutdownTracker::new()),
        }
    }

    /// Unique identifier for this [`Runtime`] instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The primary [`CancellationToken`]. Cancelled last, after graceful
    /// endpoints have drained.
    pub fn primary_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Creates a child token tied to the endpoint shutdown phase.
    pub fn child_token(&self) -> CancellationToken {
        self.endpoint_shutdown_token.child_token()
    }

    pub(crate) fn graceful_shutdown_tracker(&self) -> Arc<GracefulShutdownTracker> {
        self.graceful_shutdown_tracker.clone()
    }

    /// Shut the runtime down in phases.
    pub fn shutdown(&self) {
        tracing::info!("runtime shutdown initiated");

        let tracker = self.graceful_shutdown_tracker.clone();
        let main_token = self.cancellation_token.clone();
        let endpoint_token = self.endpoint_shutdown_token.clone();

        tokio::spawn(async move {
            // Phase 1: stop accepting new requests
            endpoint_token.cancel();

            // Phase 2: wait for graceful endpoints to complete
            let count = tracker.get_count();
            tracing::info!(active = count, "waiting for graceful endpoints");
            if count != 0 {
                tracker.wait_for_completion().await;
            }

            // Phase 3: disconnect everything else
            main_token.cancel();
        });
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
