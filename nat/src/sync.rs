// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Synchronization primitives used by the shared session table.
//!
//! With the `shuttle` feature enabled, primitives come from `shuttle` so that the code paths
//! sharing the table can be exercised under randomized scheduling.

#[cfg(not(feature = "shuttle"))]
pub(crate) use std::sync::{Arc, Mutex, MutexGuard};

#[cfg(feature = "shuttle")]
pub(crate) use shuttle::sync::{Arc, Mutex, MutexGuard};
