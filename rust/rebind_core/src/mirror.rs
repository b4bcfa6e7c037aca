//! Mirrored users: requesters who see themselves as the owner of every file.

use crate::cache::IdentityCache;
use crate::error::ConfigError;
use crate::userinfo::{group_gid, user_uid, IdentityDb};

/// Users and `@group`s from `--mirror` / `--mirror-only`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MirrorList {
    users: Vec<u32>,
    groups: Vec<u32>,
}

impl MirrorList {
    pub fn new(users: Vec<u32>, groups: Vec<u32>) -> Self {
        Self { users, groups }
    }

    /// Parse `alice,@staff,1000`. Entries are separated by `,` or `:`;
    /// `@` marks a group.
    pub fn parse(spec: &str, db: &dyn IdentityDb) -> Result<Self, ConfigError> {
        let mut list = Self::default();
        for entry in spec.split(|c: char| c == ',' || c == ':') {
            if entry.is_empty() {
                continue;
            }
            match entry.strip_prefix('@') {
                Some(group) => list.groups.push(group_gid(db, group)?),
                None => list.users.push(user_uid(db, entry)?),
            }
        }
        Ok(list)
    }

    pub fn is_enabled(&self) -> bool {
        !self.users.is_empty() || !self.groups.is_empty()
    }

    pub fn users(&self) -> &[u32] {
        &self.users
    }

    pub fn groups(&self) -> &[u32] {
        &self.groups
    }

    /// Listed directly, or a member of a listed group.
    pub fn is_mirrored(&self, uid: u32, cache: &IdentityCache) -> bool {
        self.users.contains(&uid)
            || self
                .groups
                .iter()
                .any(|&gid| cache.user_belongs_to_group(uid, gid))
    }
}
