// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lattice
//!
//! A distributed actor-execution runtime. Peers register themselves in a
//! strongly consistent key-value store under lease, expose a named mailbox
//! server over TCP, run long-lived named actors, and coordinate placement of
//! those actors across the live peer set.

pub use anyhow::{
    Context as ErrorContext, Error, Ok as OK, Result, anyhow as error, bail as raise,
};

pub mod config;
pub use config::RuntimeConfig;

pub mod actor;
pub mod cluster;
pub mod conditions;
pub mod logging;
pub mod mailbox;
pub mod registry;
pub mod runtime;
pub mod transport;
pub mod utils;

pub use cluster::Manager;
pub use registry::Registry;
pub use runtime::Runtime;
pub use tokio_util::sync::CancellationToken;
