// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Compile-time configuration for the cleanup & cascade engine.

use cfg_if::cfg_if;

/// What the cascade does when a PD dies.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CleanupPolicy {
    /// Remove only the holds the dead PD had; dependents keep running
    /// but may be left with dangling references.
    ResourcesDirect,
    /// Additionally, destroy the spaces the PD managed (and spaces
    /// derived from them) and strip all holders of their resources.
    ResourcesRecursive,
    /// Additionally, terminate PDs directly dependent on a destroyed
    /// space.
    DependentsDirect,
    /// Additionally, terminate dependent PDs transitively, bounded by
    /// [`CLEANUP_PD_DEPTH`].
    DependentsRecursive,
}

cfg_if! {
    if #[cfg(feature = "CONFIG_CLEANUP_RESOURCES_DIRECT")] {
        pub const CLEANUP_POLICY: CleanupPolicy = CleanupPolicy::ResourcesDirect;
    } else if #[cfg(feature = "CONFIG_CLEANUP_DEPENDENTS_DIRECT")] {
        pub const CLEANUP_POLICY: CleanupPolicy = CleanupPolicy::DependentsDirect;
    } else if #[cfg(feature = "CONFIG_CLEANUP_DEPENDENTS_RECURSIVE")] {
        pub const CLEANUP_POLICY: CleanupPolicy = CleanupPolicy::DependentsRecursive;
    } else {
        pub const CLEANUP_POLICY: CleanupPolicy = CleanupPolicy::ResourcesRecursive;
    }
}

#[cfg(any(
    all(
        feature = "CONFIG_CLEANUP_RESOURCES_DIRECT",
        feature = "CONFIG_CLEANUP_DEPENDENTS_DIRECT"
    ),
    all(
        feature = "CONFIG_CLEANUP_RESOURCES_DIRECT",
        feature = "CONFIG_CLEANUP_DEPENDENTS_RECURSIVE"
    ),
    all(
        feature = "CONFIG_CLEANUP_DEPENDENTS_DIRECT",
        feature = "CONFIG_CLEANUP_DEPENDENTS_RECURSIVE"
    )
))]
compile_error!("at most one CONFIG_CLEANUP_* policy may be enabled");

/// Bound on transitive PD termination depth; -1 is unbounded.
pub const CLEANUP_PD_DEPTH: i32 = -1;

impl CleanupPolicy {
    /// Whether holders of resources in a destroyed space are stripped
    /// of them (and derived spaces destroyed).
    pub fn strips_holders(&self) -> bool { *self != CleanupPolicy::ResourcesDirect }
}
