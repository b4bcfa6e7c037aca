//! Per-mount configuration.
//!
//! [`MountConfig`] holds option values as given on the command line.
//! [`Settings::resolve`] validates them, resolves names through an
//! [`IdentityDb`] and produces the immutable [`Settings`] shared by every
//! request. All configuration errors surface here, before mounting.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use log::info;

use crate::error::{ConfigError, IdKind};
use crate::mirror::MirrorList;
use crate::offset::IdOffsets;
use crate::permchain::PermChain;
use crate::userinfo::{group_gid, user_uid, IdentityDb};
use crate::usermap::IdentityMap;

/// Who owns newly created files.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CreatePolicy {
    /// The requesting user. Needs root.
    AsUser,
    /// Whoever runs the mount.
    AsMounter,
}

/// What to do with a chown, chgrp or chmod request.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ChangePolicy {
    #[default]
    Normal,
    Ignore,
    Deny,
}

impl FromStr for ChangePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "ignore" => Ok(Self::Ignore),
            "deny" => Ok(Self::Deny),
            other => Err(format!("unknown policy '{}' (expected normal, ignore or deny)", other)),
        }
    }
}

impl fmt::Display for ChangePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::Ignore => f.write_str("ignore"),
            Self::Deny => f.write_str("deny"),
        }
    }
}

/// Raw mount options.
#[derive(Clone, Debug, Default)]
pub struct MountConfig {
    pub perms: Option<String>,
    pub create_with_perms: Option<String>,
    pub chmod_filter: Option<String>,
    pub chmod_allow_x: bool,

    pub force_user: Option<String>,
    pub force_group: Option<String>,

    pub mirror: Option<String>,
    pub mirror_only: Option<String>,

    pub map: Option<String>,
    pub map_passwd: Option<PathBuf>,
    pub map_passwd_rev: Option<PathBuf>,
    pub map_group: Option<PathBuf>,
    pub map_group_rev: Option<PathBuf>,

    pub uid_offset: Option<String>,
    pub gid_offset: Option<String>,

    pub create_as_user: bool,
    pub create_as_mounter: bool,
    pub create_for_user: Option<String>,
    pub create_for_group: Option<String>,

    pub chown_policy: ChangePolicy,
    pub chgrp_policy: ChangePolicy,
    pub chmod_policy: ChangePolicy,

    pub realistic_permissions: bool,
    pub ctime_from_mtime: bool,
    pub hide_hard_links: bool,
    pub delete_deny: bool,
    pub rename_deny: bool,
}

impl MountConfig {
    fn uses_map(&self) -> bool {
        self.map.is_some()
            || self.map_passwd.is_some()
            || self.map_passwd_rev.is_some()
            || self.map_group.is_some()
            || self.map_group_rev.is_some()
    }
}

/// Validated, immutable mount configuration.
#[derive(Clone, Debug)]
pub struct Settings {
    pub perms: PermChain,
    pub create_perms: PermChain,
    pub chmod_filter: PermChain,
    pub chmod_allow_x: bool,

    pub force_uid: Option<u32>,
    pub force_gid: Option<u32>,

    pub create_policy: CreatePolicy,
    pub create_for_uid: Option<u32>,
    pub create_for_gid: Option<u32>,

    pub chown_policy: ChangePolicy,
    pub chgrp_policy: ChangePolicy,
    pub chmod_policy: ChangePolicy,

    pub mirror: MirrorList,
    pub mirror_only: bool,

    pub identity_map: IdentityMap,
    pub offsets: IdOffsets,

    pub realistic_permissions: bool,
    pub ctime_from_mtime: bool,
    pub hide_hard_links: bool,
    pub delete_deny: bool,
    pub rename_deny: bool,
}

impl Default for Settings {
    /// Plain passthrough, creating files as the mounter.
    fn default() -> Self {
        Self {
            perms: PermChain::new(),
            create_perms: PermChain::new(),
            chmod_filter: PermChain::new(),
            chmod_allow_x: false,
            force_uid: None,
            force_gid: None,
            create_policy: CreatePolicy::AsMounter,
            create_for_uid: None,
            create_for_gid: None,
            chown_policy: ChangePolicy::Normal,
            chgrp_policy: ChangePolicy::Normal,
            chmod_policy: ChangePolicy::Normal,
            mirror: MirrorList::default(),
            mirror_only: false,
            identity_map: IdentityMap::new(),
            offsets: IdOffsets::default(),
            realistic_permissions: false,
            ctime_from_mtime: false,
            hide_hard_links: false,
            delete_deny: false,
            rename_deny: false,
        }
    }
}

impl Settings {
    /// Validate `config` and resolve every name it mentions.
    ///
    /// `is_root` is whether the mounting process runs as uid 0; it gates the
    /// options that need to chown and picks the default create policy.
    pub fn resolve(
        config: &MountConfig,
        db: &dyn IdentityDb,
        is_root: bool,
    ) -> Result<Self, ConfigError> {
        if config.mirror.is_some() && config.mirror_only.is_some() {
            return Err(ConfigError::Conflict("--mirror", "--mirror-only"));
        }
        if config.create_as_user && config.create_as_mounter {
            return Err(ConfigError::Conflict("--create-as-user", "--create-as-mounter"));
        }
        let has_offset = config.uid_offset.is_some() || config.gid_offset.is_some();
        if config.uses_map() && has_offset {
            return Err(ConfigError::Conflict("--map", "--uid-offset/--gid-offset"));
        }

        let create_policy = if config.create_as_user {
            if !is_root {
                return Err(ConfigError::RequiresRoot("--create-as-user"));
            }
            CreatePolicy::AsUser
        } else if config.create_as_mounter || !is_root {
            CreatePolicy::AsMounter
        } else {
            CreatePolicy::AsUser
        };

        if config.create_for_user.is_some() && !is_root {
            return Err(ConfigError::RequiresRoot("--create-for-user"));
        }
        if config.create_for_group.is_some() && !is_root {
            return Err(ConfigError::RequiresRoot("--create-for-group"));
        }

        let mirror = match config.mirror.as_deref().or(config.mirror_only.as_deref()) {
            Some(spec) => MirrorList::parse(spec, db)?,
            None => MirrorList::default(),
        };

        let mut identity_map = IdentityMap::new();
        if let Some(spec) = &config.map {
            identity_map.add_spec(spec, db)?;
        }
        if let Some(path) = &config.map_passwd {
            identity_map.load_passwd_file(path, false, db)?;
        }
        if let Some(path) = &config.map_passwd_rev {
            identity_map.load_passwd_file(path, true, db)?;
        }
        if let Some(path) = &config.map_group {
            identity_map.load_group_file(path, false, db)?;
        }
        if let Some(path) = &config.map_group_rev {
            identity_map.load_group_file(path, true, db)?;
        }

        let offsets = IdOffsets::new(
            parse_offset(IdKind::User, config.uid_offset.as_deref())?,
            parse_offset(IdKind::Group, config.gid_offset.as_deref())?,
        );

        let settings = Self {
            perms: parse_chain(config.perms.as_deref())?,
            create_perms: parse_chain(config.create_with_perms.as_deref())?,
            chmod_filter: parse_chain(config.chmod_filter.as_deref())?,
            chmod_allow_x: config.chmod_allow_x,
            force_uid: resolve_opt(config.force_user.as_deref(), |n| user_uid(db, n))?,
            force_gid: resolve_opt(config.force_group.as_deref(), |n| group_gid(db, n))?,
            create_policy,
            create_for_uid: resolve_opt(config.create_for_user.as_deref(), |n| user_uid(db, n))?,
            create_for_gid: resolve_opt(config.create_for_group.as_deref(), |n| {
                group_gid(db, n)
            })?,
            chown_policy: config.chown_policy,
            chgrp_policy: config.chgrp_policy,
            chmod_policy: config.chmod_policy,
            mirror,
            mirror_only: config.mirror_only.is_some(),
            identity_map,
            offsets,
            realistic_permissions: config.realistic_permissions,
            ctime_from_mtime: config.ctime_from_mtime,
            hide_hard_links: config.hide_hard_links,
            delete_deny: config.delete_deny,
            rename_deny: config.rename_deny,
        };

        info!(
            "Resolved mount settings: {} perm rules, create {:?}, mirroring {}",
            settings.perms.len(),
            settings.create_policy,
            if settings.mirroring_enabled() { "on" } else { "off" }
        );
        Ok(settings)
    }

    pub fn mirroring_enabled(&self) -> bool {
        self.mirror.is_enabled()
    }
}

fn parse_chain(spec: Option<&str>) -> Result<PermChain, ConfigError> {
    spec.map_or_else(|| Ok(PermChain::new()), PermChain::parse)
}

fn resolve_opt(
    name: Option<&str>,
    resolve: impl FnOnce(&str) -> Result<u32, ConfigError>,
) -> Result<Option<u32>, ConfigError> {
    name.map(resolve).transpose()
}

fn parse_offset(kind: IdKind, value: Option<&str>) -> Result<i64, ConfigError> {
    let Some(value) = value else {
        return Ok(0);
    };
    value.trim().parse::<i64>().map_err(|_| ConfigError::InvalidOffset {
        kind,
        value: value.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::userinfo::{GroupRecord, StaticDb, UserRecord};

    fn db() -> StaticDb {
        StaticDb::new(
            vec![
                UserRecord::new("alice", 1000, 1000),
                UserRecord::new("bob", 1001, 100),
            ],
            vec![
                GroupRecord::new("users", 100, &[]),
                GroupRecord::new("staff", 50, &["alice"]),
            ],
        )
    }

    #[test]
    fn test_defaults_depend_on_root() {
        let config = MountConfig::default();
        let as_root = Settings::resolve(&config, &db(), true).unwrap();
        assert_eq!(as_root.create_policy, CreatePolicy::AsUser);
        let as_user = Settings::resolve(&config, &db(), false).unwrap();
        assert_eq!(as_user.create_policy, CreatePolicy::AsMounter);
        assert!(as_user.perms.is_empty());
        assert!(!as_user.mirroring_enabled());
        assert!(as_user.offsets.is_zero());
    }

    #[test]
    fn test_resolves_names() {
        let config = MountConfig {
            perms: Some("og-x,og+rD".into()),
            force_user: Some("alice".into()),
            force_group: Some("staff".into()),
            create_for_user: Some("bob".into()),
            create_for_group: Some("200".into()),
            mirror_only: Some("alice,@users".into()),
            uid_offset: Some("-500".into()),
            chmod_policy: ChangePolicy::Deny,
            ..MountConfig::default()
        };
        let settings = Settings::resolve(&config, &db(), true).unwrap();
        assert_eq!(settings.perms.len(), 2);
        assert_eq!(settings.force_uid, Some(1000));
        assert_eq!(settings.force_gid, Some(50));
        assert_eq!(settings.create_for_uid, Some(1001));
        assert_eq!(settings.create_for_gid, Some(200));
        assert!(settings.mirror_only);
        assert_eq!(settings.mirror.users(), &[1000]);
        assert_eq!(settings.mirror.groups(), &[100]);
        assert_eq!(settings.offsets, IdOffsets::new(-500, 0));
        assert_eq!(settings.chmod_policy, ChangePolicy::Deny);
    }

    #[test]
    fn test_conflicting_options() {
        let both_mirrors = MountConfig {
            mirror: Some("alice".into()),
            mirror_only: Some("bob".into()),
            ..MountConfig::default()
        };
        assert!(matches!(
            Settings::resolve(&both_mirrors, &db(), true),
            Err(ConfigError::Conflict("--mirror", "--mirror-only"))
        ));

        let map_and_offset = MountConfig {
            map: Some("alice/bob".into()),
            gid_offset: Some("10".into()),
            ..MountConfig::default()
        };
        assert!(matches!(
            Settings::resolve(&map_and_offset, &db(), true),
            Err(ConfigError::Conflict(..))
        ));
    }

    #[test]
    fn test_root_only_options() {
        let config = MountConfig {
            create_as_user: true,
            ..MountConfig::default()
        };
        assert!(matches!(
            Settings::resolve(&config, &db(), false),
            Err(ConfigError::RequiresRoot("--create-as-user"))
        ));

        let config = MountConfig {
            create_for_group: Some("staff".into()),
            ..MountConfig::default()
        };
        assert!(matches!(
            Settings::resolve(&config, &db(), false),
            Err(ConfigError::RequiresRoot("--create-for-group"))
        ));
    }

    #[test]
    fn test_invalid_values() {
        let bad_perms = MountConfig {
            perms: Some("u+q".into()),
            ..MountConfig::default()
        };
        assert!(matches!(
            Settings::resolve(&bad_perms, &db(), false),
            Err(ConfigError::InvalidPermSpec { .. })
        ));

        let bad_offset = MountConfig {
            uid_offset: Some("lots".into()),
            ..MountConfig::default()
        };
        assert!(matches!(
            Settings::resolve(&bad_offset, &db(), false),
            Err(ConfigError::InvalidOffset { kind: IdKind::User, .. })
        ));

        let unknown_user = MountConfig {
            force_user: Some("mallory".into()),
            ..MountConfig::default()
        };
        assert!(matches!(
            Settings::resolve(&unknown_user, &db(), false),
            Err(ConfigError::UnknownUser(_))
        ));
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("ignore".parse::<ChangePolicy>().unwrap(), ChangePolicy::Ignore);
        assert_eq!(ChangePolicy::Deny.to_string(), "deny");
        assert!("sometimes".parse::<ChangePolicy>().is_err());
    }
}
