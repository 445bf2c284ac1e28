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

//! Compact resource identifiers.
//!
//! Every message the Resource Manager receives arrives tagged with a
//! 64-bit kernel badge packing `{cap_type, space_id, object_id,
//! client_pd_id}`. The badge identifies both what kind of resource is
//! being invoked and which process is invoking it.

use core::fmt;
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

pub type ObjId = u32;
pub type SpaceId = u16;
pub type PdId = u32;

/// Reserved object id; a badge carrying it names a component's
/// allocation/administrative entry point rather than an object.
pub const NULL_OBJ: ObjId = 0;

/// Space id 0 selects the default space of the badge's cap type.
pub const NULL_SPACE: SpaceId = 0;

// Badge layout, least-significant field first.
const CAP_TYPE_BITS: u32 = 8;
const SPACE_ID_BITS: u32 = 16;
const OBJECT_ID_BITS: u32 = 20;
const CLIENT_PD_BITS: u32 = 20;
const_assert_eq!(
    CAP_TYPE_BITS + SPACE_ID_BITS + OBJECT_ID_BITS + CLIENT_PD_BITS,
    64
);

const SPACE_ID_SHIFT: u32 = CAP_TYPE_BITS;
const OBJECT_ID_SHIFT: u32 = SPACE_ID_SHIFT + SPACE_ID_BITS;
const CLIENT_PD_SHIFT: u32 = OBJECT_ID_SHIFT + OBJECT_ID_BITS;

/// Largest object id a badge can carry.
pub const MAX_OBJ_ID: ObjId = (1 << OBJECT_ID_BITS) - 1;
/// Largest PD id a badge can carry.
pub const MAX_PD_ID: PdId = (1 << CLIENT_PD_BITS) - 1;

/// Tag identifying which component a resource belongs to. Values past
/// the built-in components are assigned dynamically to user-defined
/// resource types (block devices, files, key-value stores, ...).
#[repr(u8)]
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    FromPrimitive,
    IntoPrimitive,
    Serialize,
    Deserialize,
)]
pub enum CapType {
    None = 0,
    Pd = 1,
    Ads = 2,
    Mo = 3,
    Cpu = 4,
    Ep = 5,
    Resspc = 6,
    #[num_enum(catch_all)]
    User(u8),
}

/// First tag available for user-defined resource types.
pub const FIRST_USER_CAP_TYPE: u8 = 7;

impl CapType {
    pub fn is_core(&self) -> bool { !matches!(self, CapType::None | CapType::User(_)) }
}

impl fmt::Display for CapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapType::None => write!(f, "NONE"),
            CapType::Pd => write!(f, "PD"),
            CapType::Ads => write!(f, "ADS"),
            CapType::Mo => write!(f, "MO"),
            CapType::Cpu => write!(f, "CPU"),
            CapType::Ep => write!(f, "EP"),
            CapType::Resspc => write!(f, "RESSPC"),
            CapType::User(t) => write!(f, "USER({})", t),
        }
    }
}

/// Raised when badge fields do not fit their widths or the cap type
/// is `None`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BadBadge;

/// The packed 64-bit badge. The kernel-level badge carries this exact
/// value; unpacking is total, packing checks field widths.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Badge(u64);

impl Badge {
    pub fn new(
        cap_type: CapType,
        space_id: SpaceId,
        object_id: ObjId,
        client_pd_id: PdId,
    ) -> Result<Badge, BadBadge> {
        if cap_type == CapType::None {
            return Err(BadBadge);
        }
        if object_id > MAX_OBJ_ID || client_pd_id > MAX_PD_ID {
            return Err(BadBadge);
        }
        Ok(Badge(
            u8::from(cap_type) as u64
                | (space_id as u64) << SPACE_ID_SHIFT
                | (object_id as u64) << OBJECT_ID_SHIFT
                | (client_pd_id as u64) << CLIENT_PD_SHIFT,
        ))
    }

    /// Wraps a raw kernel badge value without validation; use the
    /// accessors to pick it apart.
    pub fn from_raw(raw: u64) -> Badge { Badge(raw) }
    pub fn raw(&self) -> u64 { self.0 }

    pub fn cap_type(&self) -> CapType { CapType::from((self.0 & 0xff) as u8) }
    pub fn space_id(&self) -> SpaceId { (self.0 >> SPACE_ID_SHIFT) as SpaceId }
    pub fn object_id(&self) -> ObjId {
        ((self.0 >> OBJECT_ID_SHIFT) & (MAX_OBJ_ID as u64)) as ObjId
    }
    pub fn client_pd_id(&self) -> PdId {
        ((self.0 >> CLIENT_PD_SHIFT) & (MAX_PD_ID as u64)) as PdId
    }

    /// True when the badge names a component's allocation entry point
    /// rather than an existing object.
    pub fn is_alloc_entry(&self) -> bool { self.object_id() == NULL_OBJ }

    /// A resource key identifies the resource alone; the client field
    /// is dropped so all holders of one resource share a key.
    pub fn resource_key(&self) -> u64 { self.0 & !((MAX_PD_ID as u64) << CLIENT_PD_SHIFT) }
}

impl fmt::Display for Badge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{} (client {})",
            self.cap_type(),
            self.space_id(),
            self.object_id(),
            self.client_pd_id()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_badge_roundtrip() {
        let b = Badge::new(CapType::Mo, 7, 17, 42).unwrap();
        assert_eq!(b.cap_type(), CapType::Mo);
        assert_eq!(b.space_id(), 7);
        assert_eq!(b.object_id(), 17);
        assert_eq!(b.client_pd_id(), 42);
        assert_eq!(Badge::from_raw(b.raw()), b);
    }

    #[test]
    fn test_badge_null_type_rejected() {
        assert_eq!(Badge::new(CapType::None, 0, 1, 1), Err(BadBadge));
    }

    #[test]
    fn test_badge_field_overflow() {
        assert!(Badge::new(CapType::Pd, 0, MAX_OBJ_ID, 1).is_ok());
        assert_eq!(Badge::new(CapType::Pd, 0, MAX_OBJ_ID + 1, 1), Err(BadBadge));
        assert_eq!(Badge::new(CapType::Pd, 0, 1, MAX_PD_ID + 1), Err(BadBadge));
    }

    #[test]
    fn test_alloc_entry() {
        let b = Badge::new(CapType::Ads, 0, NULL_OBJ, 3).unwrap();
        assert!(b.is_alloc_entry());
        let b = Badge::new(CapType::Ads, 0, 5, 3).unwrap();
        assert!(!b.is_alloc_entry());
    }

    #[test]
    fn test_resource_key_ignores_client() {
        let a = Badge::new(CapType::User(9), 7, 3, 1).unwrap();
        let b = Badge::new(CapType::User(9), 7, 3, 2).unwrap();
        assert_eq!(a.resource_key(), b.resource_key());
        assert_ne!(a.raw(), b.raw());
    }

    #[test]
    fn test_user_cap_type() {
        let t = CapType::from(FIRST_USER_CAP_TYPE + 1);
        assert_eq!(t, CapType::User(FIRST_USER_CAP_TYPE + 1));
        assert!(!t.is_core());
        assert_eq!(u8::from(t), FIRST_USER_CAP_TYPE + 1);
    }
}
