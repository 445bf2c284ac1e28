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

use num_enum::{FromPrimitive, IntoPrimitive};
use osmium_os_common::badge::BadBadge;
use osmium_os_common::caps::KernelError;
use osmium_os_common::registry::RegistryError;
use serde::{Deserialize, Serialize};

/// Error codes returned by the Resource Manager. A message handler
/// that detects an error records it into the reply and returns; the
/// reply is always sent except for the explicit deferred cases.
#[repr(usize)]
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromPrimitive,
    IntoPrimitive,
    Serialize,
    Deserialize,
)]
pub enum RmError {
    Success = 0,
    /// Badge fields out of range or cap type is NONE.
    BadBadge,
    /// Object id not present in the component's registry.
    NotFound,
    /// Cap type in badge does not match the component receiving.
    WrongType,
    /// Operation forbidden in the current state machine state.
    InvalidState,
    /// Frame or object allocation failed.
    OutOfMemory,
    /// Target PD's cspace is full, or a component ran out of ids.
    OutOfSlots,
    /// VMR reservation collides with an existing range.
    Overlap,
    /// Cleanup or extraction already pending.
    OperationInProgress,
    SerializeFailed,
    DeserializeFailed,
    /// Catch-all for invariant violations.
    #[default]
    UnknownError,
}

impl From<RmError> for Result<(), RmError> {
    fn from(err: RmError) -> Result<(), RmError> {
        if err == RmError::Success {
            Ok(())
        } else {
            Err(err)
        }
    }
}

impl From<BadBadge> for RmError {
    fn from(_: BadBadge) -> RmError { RmError::BadBadge }
}

impl From<KernelError> for RmError {
    fn from(err: KernelError) -> RmError {
        match err {
            KernelError::OutOfMemory => RmError::OutOfMemory,
            KernelError::InvalidArgument => RmError::UnknownError,
            KernelError::InvalidCapability => RmError::NotFound,
            KernelError::NotSupported => RmError::InvalidState,
        }
    }
}

impl From<RegistryError> for RmError {
    fn from(err: RegistryError) -> RmError {
        match err {
            RegistryError::OutOfIds => RmError::OutOfSlots,
            RegistryError::DuplicateId => RmError::UnknownError,
            RegistryError::NotFound => RmError::NotFound,
        }
    }
}

impl From<postcard::Error> for RmError {
    fn from(_: postcard::Error) -> RmError { RmError::DeserializeFailed }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        assert_eq!(RmError::from(usize::from(RmError::Overlap)), RmError::Overlap);
        // Unknown codes collapse to the catch-all.
        assert_eq!(RmError::from(9999usize), RmError::UnknownError);
    }

    #[test]
    fn test_into_result() {
        let ok: Result<(), RmError> = RmError::Success.into();
        assert!(ok.is_ok());
        let err: Result<(), RmError> = RmError::NotFound.into();
        assert_eq!(err, Err(RmError::NotFound));
    }
}
