//! End-to-end tests of the transformation pipeline, from raw mount options
//! to the attributes a requester sees and the owner of a new file.

use std::io::Write;
use std::sync::Arc;

use rebind_core::attrs::{Access, AccessProbe, NewOwner};
use rebind_core::error::ConfigError;
use rebind_core::settings::ChangePolicy;
use rebind_core::userinfo::{GroupRecord, UserRecord};
use rebind_core::{
    AttrTransformer, Attributes, CacheStrategy, IdentityCache, MountConfig, PermChain, Requester,
    Settings, StaticDb,
};
use tempfile::NamedTempFile;

const REG: u32 = libc::S_IFREG as u32;
const DIR: u32 = libc::S_IFDIR as u32;

struct AllowAll;

impl AccessProbe for AllowAll {
    fn allows(&self, _access: Access) -> bool {
        true
    }
}

fn site_db() -> Arc<StaticDb> {
    Arc::new(StaticDb::new(
        vec![
            UserRecord::new("root", 0, 0),
            UserRecord::new("alice", 1000, 1000),
            UserRecord::new("bob", 1001, 100),
            UserRecord::new("www-data", 33, 33),
        ],
        vec![
            GroupRecord::new("root", 0, &[]),
            GroupRecord::new("users", 100, &[]),
            GroupRecord::new("www-data", 33, &[]),
            GroupRecord::new("devs", 500, &["alice"]),
        ],
    ))
}

fn mount(config: &MountConfig, is_root: bool) -> Result<AttrTransformer, ConfigError> {
    let db = site_db();
    let settings = Settings::resolve(config, db.as_ref(), is_root)?;
    let cache = Arc::new(IdentityCache::new(db, CacheStrategy::Bulk));
    Ok(AttrTransformer::new(Arc::new(settings), cache))
}

fn attrs(uid: u32, gid: u32, mode: u32) -> Attributes {
    Attributes { uid, gid, mode }
}

#[test]
fn test_chain_examples_through_settings() {
    let t = mount(
        &MountConfig {
            perms: Some("0644,a+X".into()),
            ..MountConfig::default()
        },
        false,
    )
    .unwrap();
    let out = t
        .reported_attributes(attrs(1, 1, REG | 0o100), Requester::new(1, 1), &AllowAll)
        .unwrap();
    assert_eq!(out.mode, REG | 0o755);

    assert_eq!(PermChain::parse("u=rwX,g+rw").unwrap().apply(DIR | 0o750), DIR | 0o770);
}

#[test]
fn test_shared_web_root() {
    // Files owned by www-data appear as alice's to alice, group-writable
    // directories stay traversable, and new files go back to www-data.
    let t = mount(
        &MountConfig {
            map: Some("www-data/alice:@www-data/@devs".into()),
            perms: Some("og-x,og+rD,u=rwX,g+rw".into()),
            create_as_user: true,
            ..MountConfig::default()
        },
        true,
    )
    .unwrap();

    let alice = Requester::new(1000, 1000);
    let file = t
        .reported_attributes(attrs(33, 33, REG | 0o600), alice, &AllowAll)
        .unwrap();
    assert_eq!(file, attrs(1000, 500, REG | 0o664));

    let dir = t
        .reported_attributes(attrs(33, 33, DIR | 0o700), alice, &AllowAll)
        .unwrap();
    assert_eq!(dir, attrs(1000, 500, DIR | 0o775));

    let owner = t.owner_for_new_file(Requester::new(1000, 500), false).unwrap();
    assert_eq!(
        owner,
        NewOwner {
            uid: Some(33),
            gid: Some(33)
        }
    );

    let chown = t.chown_request(Some(1000), Some(500)).unwrap();
    assert_eq!(
        chown,
        NewOwner {
            uid: Some(33),
            gid: Some(33)
        }
    );
}

#[test]
fn test_container_offset_round_trip() {
    let t = mount(
        &MountConfig {
            uid_offset: Some("100000".into()),
            gid_offset: Some("100000".into()),
            create_as_user: true,
            ..MountConfig::default()
        },
        true,
    )
    .unwrap();

    let seen = t
        .reported_attributes(attrs(1000, 100, REG | 0o644), Requester::new(0, 0), &AllowAll)
        .unwrap();
    assert_eq!((seen.uid, seen.gid), (101_000, 100_100));

    let owner = t
        .owner_for_new_file(Requester::new(seen.uid, seen.gid), false)
        .unwrap();
    assert_eq!(
        owner,
        NewOwner {
            uid: Some(1000),
            gid: Some(100)
        }
    );
}

#[test]
fn test_map_passwd_file_drives_reporting() {
    let mut passwd = NamedTempFile::new().unwrap();
    writeln!(passwd, "alice:x:2000:2000::/home/alice:/bin/sh").unwrap();
    writeln!(passwd, "nobody-here:x:2001:2001::/:/bin/false").unwrap();
    passwd.flush().unwrap();

    let t = mount(
        &MountConfig {
            map_passwd: Some(passwd.path().to_path_buf()),
            ..MountConfig::default()
        },
        false,
    )
    .unwrap();
    let out = t
        .reported_attributes(attrs(2000, 7, REG | 0o644), Requester::new(1, 1), &AllowAll)
        .unwrap();
    assert_eq!(out.uid, 1000);
    let out = t
        .reported_attributes(attrs(2001, 7, REG | 0o644), Requester::new(1, 1), &AllowAll)
        .unwrap();
    assert_eq!(out.uid, 2001);
}

#[test]
fn test_mirror_only_group() {
    let db = site_db();
    let config = MountConfig {
        mirror_only: Some("@devs".into()),
        ..MountConfig::default()
    };
    let settings = Settings::resolve(&config, db.as_ref(), false).unwrap();
    let cache = Arc::new(IdentityCache::new(db.clone(), CacheStrategy::Bulk));
    let t = AttrTransformer::new(Arc::new(settings), cache);

    let raw = attrs(0, 0, REG | 0o644);
    let alice = t
        .reported_attributes(raw, Requester::new(1000, 1000), &AllowAll)
        .unwrap();
    assert_eq!(alice, attrs(1000, 0, REG | 0o644));

    let bob = t
        .reported_attributes(raw, Requester::new(1001, 100), &AllowAll)
        .unwrap();
    assert_eq!(bob, attrs(0, 0, REG));

    // bob joins devs; the old snapshot still answers until invalidated.
    db.replace(
        vec![
            UserRecord::new("root", 0, 0),
            UserRecord::new("alice", 1000, 1000),
            UserRecord::new("bob", 1001, 100),
        ],
        vec![
            GroupRecord::new("users", 100, &[]),
            GroupRecord::new("devs", 500, &["alice", "bob"]),
        ],
    );
    let bob = t
        .reported_attributes(raw, Requester::new(1001, 100), &AllowAll)
        .unwrap();
    assert_eq!(bob, attrs(0, 0, REG));

    t.cache().invalidate();
    let bob = t
        .reported_attributes(raw, Requester::new(1001, 100), &AllowAll)
        .unwrap();
    assert_eq!(bob, attrs(1001, 0, REG | 0o644));

    let root = t
        .reported_attributes(raw, Requester::new(0, 0), &AllowAll)
        .unwrap();
    assert_eq!(root.mode, REG | 0o644);
}

#[test]
fn test_policies_end_to_end() {
    let t = mount(
        &MountConfig {
            chown_policy: ChangePolicy::Deny,
            chmod_policy: ChangePolicy::Ignore,
            rename_deny: true,
            ..MountConfig::default()
        },
        false,
    )
    .unwrap();
    assert_eq!(t.chown_request(Some(5), None).unwrap_err().to_errno(), libc::EPERM);
    assert_eq!(t.check_rename().unwrap_err().to_errno(), libc::EPERM);
    assert!(t.check_delete().is_ok());
}

#[test]
fn test_invalid_configurations_fail_before_mount() {
    let conflicts = MountConfig {
        map: Some("alice/bob".into()),
        uid_offset: Some("1".into()),
        ..MountConfig::default()
    };
    assert!(matches!(mount(&conflicts, true), Err(ConfigError::Conflict(..))));

    let duplicate = MountConfig {
        map: Some("alice/bob,alice/root".into()),
        ..MountConfig::default()
    };
    assert!(matches!(
        mount(&duplicate, true),
        Err(ConfigError::DuplicateMapping { from: 1000, .. })
    ));

    let bad_chain = MountConfig {
        create_with_perms: Some("u+rw,,g+r".into()),
        ..MountConfig::default()
    };
    assert!(matches!(
        mount(&bad_chain, true),
        Err(ConfigError::InvalidPermSpec { .. })
    ));
}
