//! Bounded uid/gid offset arithmetic for `--uid-offset` / `--gid-offset`.
//!
//! Reported ids get the offset added; ids assigned to new or chowned files
//! get it subtracted. Both directions go through `i64` checked arithmetic
//! and fail instead of wrapping.

use crate::error::{IdKind, TransformError};

/// Largest assignable id. `(uid_t)-1` means "leave unchanged" to chown(2).
pub const ID_MAX: u32 = u32::MAX - 1;

/// `id + offset`, or `None` if the result is below zero or above `max`.
pub fn apply_offset(id: u32, offset: i64, max: u32) -> Option<u32> {
    narrow(i64::from(id).checked_add(offset)?, max)
}

/// `id - offset`, or `None` if the result is below zero or above `max`.
pub fn unapply_offset(id: u32, offset: i64, max: u32) -> Option<u32> {
    narrow(i64::from(id).checked_sub(offset)?, max)
}

fn narrow(wide: i64, max: u32) -> Option<u32> {
    if wide < 0 || wide > i64::from(max) {
        return None;
    }
    u32::try_from(wide).ok()
}

/// Configured uid and gid offsets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IdOffsets {
    pub uid: i64,
    pub gid: i64,
}

impl IdOffsets {
    pub fn new(uid: i64, gid: i64) -> Self {
        Self { uid, gid }
    }

    pub fn is_zero(&self) -> bool {
        self.uid == 0 && self.gid == 0
    }

    pub fn apply_uid(&self, uid: u32) -> Result<u32, TransformError> {
        shift(IdKind::User, uid, self.uid, apply_offset)
    }

    pub fn apply_gid(&self, gid: u32) -> Result<u32, TransformError> {
        shift(IdKind::Group, gid, self.gid, apply_offset)
    }

    pub fn unapply_uid(&self, uid: u32) -> Result<u32, TransformError> {
        shift(IdKind::User, uid, self.uid, unapply_offset)
    }

    pub fn unapply_gid(&self, gid: u32) -> Result<u32, TransformError> {
        shift(IdKind::Group, gid, self.gid, unapply_offset)
    }
}

fn shift(
    kind: IdKind,
    id: u32,
    offset: i64,
    op: fn(u32, i64, u32) -> Option<u32>,
) -> Result<u32, TransformError> {
    if offset == 0 {
        return Ok(id);
    }
    op(id, offset, ID_MAX).ok_or(TransformError::IdOutOfRange { kind, id, offset })
}
