//! Ownership and permission transformation for a single request.
//!
//! [`AttrTransformer`] is the only type the FUSE layer talks to. It turns
//! on-disk attributes into the attributes a requester sees, picks the owner
//! of newly created files, and filters chown/chmod/unlink/rename requests
//! according to the mount policies.

use std::io;
use std::os::unix::fs::{chown, lchown};
use std::path::Path;
use std::sync::Arc;

use log::debug;
use nix::unistd::{access, AccessFlags};

use crate::cache::IdentityCache;
use crate::error::{Result, TransformError};
use crate::permchain::{is_symlink_mode, PERM_MASK};
use crate::settings::{ChangePolicy, CreatePolicy, Settings};
use crate::usermap::Direction;

const S_IFMT: u32 = libc::S_IFMT as u32;
const S_IFREG: u32 = libc::S_IFREG as u32;
/// Permission bits plus setuid, setgid and sticky.
const MODE_BITS: u32 = 0o7777;

/// Ownership and mode of an inode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Attributes {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

/// Credentials of the process making a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Requester {
    pub uid: u32,
    pub gid: u32,
}

impl Requester {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

/// Whether the mounting process can actually exercise an access mode on
/// the underlying inode.
pub trait AccessProbe {
    fn allows(&self, access: Access) -> bool;
}

/// Probes a path in the source tree with access(2).
#[derive(Clone, Copy, Debug)]
pub struct PathProbe<'a> {
    path: &'a Path,
}

impl<'a> PathProbe<'a> {
    pub fn new(path: &'a Path) -> Self {
        Self { path }
    }
}

impl AccessProbe for PathProbe<'_> {
    fn allows(&self, mode: Access) -> bool {
        let flags = match mode {
            Access::Read => AccessFlags::R_OK,
            Access::Write => AccessFlags::W_OK,
            Access::Execute => AccessFlags::X_OK,
        };
        access(self.path, flags).is_ok()
    }
}

/// Whether an ownership change follows a final symlink.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkMode {
    /// chown(2)
    Follow,
    /// lchown(2), for symlinks themselves.
    NoFollow,
}

/// Ownership to apply to an inode. `None` leaves that id unchanged.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NewOwner {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl NewOwner {
    pub fn is_unchanged(&self) -> bool {
        self.uid.is_none() && self.gid.is_none()
    }

    /// Apply to `path`. Does nothing when both ids are unset.
    pub fn apply(&self, path: &Path, link: LinkMode) -> io::Result<()> {
        if self.is_unchanged() {
            return Ok(());
        }
        match link {
            LinkMode::Follow => chown(path, self.uid, self.gid),
            LinkMode::NoFollow => lchown(path, self.uid, self.gid),
        }
    }
}

/// Outcome of filtering a chmod request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChmodDecision {
    /// chmod the underlying inode to this mode.
    Apply(u32),
    /// Report success without touching the inode.
    Skip,
    /// Refuse with EPERM.
    Deny,
}

/// Applies the mount's identity and permission rules.
#[derive(Clone, Debug)]
pub struct AttrTransformer {
    settings: Arc<Settings>,
    cache: Arc<IdentityCache>,
}

impl AttrTransformer {
    pub fn new(settings: Arc<Settings>, cache: Arc<IdentityCache>) -> Self {
        Self { settings, cache }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }

    /// Attributes reported to `requester` for an inode with on-disk
    /// attributes `raw`.
    ///
    /// Steps, in order: forward identity map, offset, forced owner,
    /// mirroring (or mirror-only denial, which returns immediately),
    /// permission chain (not for symlinks), realistic-permission probing.
    pub fn reported_attributes(
        &self,
        raw: Attributes,
        requester: Requester,
        probe: &dyn AccessProbe,
    ) -> Result<Attributes> {
        let s = &*self.settings;
        let forward = s.identity_map.get(Direction::Forward);

        let mut uid = s.offsets.apply_uid(forward.uid_or(raw.uid, raw.uid))?;
        let mut gid = s.offsets.apply_gid(forward.gid_or(raw.gid, raw.gid))?;
        let mut mode = raw.mode;

        if let Some(forced) = s.force_uid {
            uid = forced;
        }
        if let Some(forced) = s.force_gid {
            gid = forced;
        }

        if s.mirroring_enabled() && s.mirror.is_mirrored(requester.uid, &self.cache) {
            uid = requester.uid;
        } else if s.mirror_only && !requester.is_root() {
            mode &= !PERM_MASK;
            return Ok(Attributes { uid, gid, mode });
        }

        if is_symlink_mode(mode) {
            return Ok(Attributes { uid, gid, mode });
        }

        mode = s.perms.apply(mode);

        if s.realistic_permissions {
            if !probe.allows(Access::Read) {
                mode &= !0o444;
            }
            if !probe.allows(Access::Write) {
                mode &= !0o222;
            }
            if !probe.allows(Access::Execute) {
                mode &= !0o111;
            }
        }

        Ok(Attributes { uid, gid, mode })
    }

    /// Owner for an inode `requester` just created.
    ///
    /// With create-as-user the requester's ids are the starting point; the
    /// group is left alone when the parent directory is setgid so it is
    /// inherited. Reverse-mapped requester ids override, offsets are
    /// removed, and `--create-for-user/--create-for-group` win over all of
    /// it.
    pub fn owner_for_new_file(
        &self,
        requester: Requester,
        parent_has_setgid: bool,
    ) -> Result<NewOwner> {
        let s = &*self.settings;
        let mut owner = match s.create_policy {
            CreatePolicy::AsUser => NewOwner {
                uid: Some(requester.uid),
                gid: (!parent_has_setgid).then_some(requester.gid),
            },
            CreatePolicy::AsMounter => NewOwner::default(),
        };

        let reverse = s.identity_map.get(Direction::Reverse);
        if let Some(uid) = reverse.uid(requester.uid) {
            owner.uid = Some(uid);
        }
        if let Some(gid) = reverse.gid(requester.gid) {
            owner.gid = Some(gid);
        }

        owner.uid = owner.uid.map(|uid| s.offsets.unapply_uid(uid)).transpose()?;
        owner.gid = owner.gid.map(|gid| s.offsets.unapply_gid(gid)).transpose()?;

        if s.create_for_uid.is_some() {
            owner.uid = s.create_for_uid;
        }
        if s.create_for_gid.is_some() {
            owner.gid = s.create_for_gid;
        }

        Ok(owner)
    }

    /// Filter a chown/chgrp request and translate the surviving ids into
    /// on-disk ids.
    pub fn chown_request(&self, uid: Option<u32>, gid: Option<u32>) -> Result<NewOwner> {
        let s = &*self.settings;
        let uid = filter_change(uid, s.chown_policy, "chown")?;
        let gid = filter_change(gid, s.chgrp_policy, "chgrp")?;

        let reverse = s.identity_map.get(Direction::Reverse);
        let uid = uid
            .map(|uid| s.offsets.unapply_uid(reverse.uid_or(uid, uid)))
            .transpose()?;
        let gid = gid
            .map(|gid| s.offsets.unapply_gid(reverse.gid_or(gid, gid)))
            .transpose()?;

        if uid.is_none() && gid.is_none() {
            debug!("chown request reduced to a no-op by policy");
        }
        Ok(NewOwner { uid, gid })
    }

    /// Filter a chmod of an inode whose current on-disk mode is
    /// `current_mode` (including file type bits).
    pub fn chmod_request(&self, current_mode: u32, requested: u32) -> ChmodDecision {
        let s = &*self.settings;
        let execute_only = s.chmod_allow_x && current_mode & S_IFMT == S_IFREG;
        let diff = (current_mode ^ requested) & MODE_BITS;

        match s.chmod_policy {
            ChangePolicy::Normal => {
                let typed = (current_mode & S_IFMT) | (requested & MODE_BITS);
                ChmodDecision::Apply(s.chmod_filter.apply(typed) & MODE_BITS)
            }
            ChangePolicy::Ignore if execute_only => {
                ChmodDecision::Apply((current_mode & MODE_BITS) ^ (diff & 0o111))
            }
            ChangePolicy::Ignore => ChmodDecision::Skip,
            ChangePolicy::Deny if execute_only && diff & !0o111 == 0 => {
                ChmodDecision::Apply(requested & MODE_BITS)
            }
            ChangePolicy::Deny => ChmodDecision::Deny,
        }
    }

    /// Mode for a new inode. `mode` carries the file type bits so `D` and
    /// `X` rules can tell directories apart.
    pub fn creation_mode(&self, mode: u32) -> u32 {
        self.settings.create_perms.apply(mode)
    }

    pub fn check_delete(&self) -> Result<()> {
        if self.settings.delete_deny {
            return Err(TransformError::PolicyDenied("delete"));
        }
        Ok(())
    }

    pub fn check_rename(&self) -> Result<()> {
        if self.settings.rename_deny {
            return Err(TransformError::PolicyDenied("rename"));
        }
        Ok(())
    }
}

fn filter_change(id: Option<u32>, policy: ChangePolicy, what: &'static str) -> Result<Option<u32>> {
    match (id, policy) {
        (None, _) => Ok(None),
        (Some(id), ChangePolicy::Normal) => Ok(Some(id)),
        (Some(_), ChangePolicy::Ignore) => Ok(None),
        (Some(_), ChangePolicy::Deny) => Err(TransformError::PolicyDenied(what)),
    }
}
