//! User and group identity resolution.
//!
//! [`IdentityDb`] is the seam between the transformation core and the
//! password/group databases. [`SystemDb`] talks to the host through NSS;
//! [`StaticDb`] is an in-memory table whose contents can be swapped at
//! runtime, which is what the cache tests use to simulate `/etc/group` edits.

use std::ffi::CStr;
use std::io;
use std::sync::{Mutex, PoisonError, RwLock};

use nix::unistd::{Gid, Group, Uid, User};

use crate::error::ConfigError;

/// One password database entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UserRecord {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

impl UserRecord {
    pub fn new(name: impl Into<String>, uid: u32, gid: u32) -> Self {
        Self {
            name: name.into(),
            uid,
            gid,
        }
    }
}

/// One group database entry. `members` lists supplementary members by name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupRecord {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

impl GroupRecord {
    pub fn new(name: impl Into<String>, gid: u32, members: &[&str]) -> Self {
        Self {
            name: name.into(),
            gid,
            members: members.iter().map(|m| (*m).to_owned()).collect(),
        }
    }
}

/// Source of user and group records.
///
/// Lookups return `Ok(None)` for a missing entry and `Err` only when the
/// database itself could not be consulted.
pub trait IdentityDb: Send + Sync {
    fn user_by_name(&self, name: &str) -> io::Result<Option<UserRecord>>;
    fn user_by_uid(&self, uid: u32) -> io::Result<Option<UserRecord>>;
    fn group_by_name(&self, name: &str) -> io::Result<Option<GroupRecord>>;
    fn group_by_gid(&self, gid: u32) -> io::Result<Option<GroupRecord>>;
    fn all_users(&self) -> io::Result<Vec<UserRecord>>;
    fn all_groups(&self) -> io::Result<Vec<GroupRecord>>;
}

// ============================================================================
// System database
// ============================================================================

/// getpwent/getgrent keep a cursor in libc-global state.
static ENUMERATION_LOCK: Mutex<()> = Mutex::new(());

/// The host's password and group databases.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemDb;

impl SystemDb {
    pub fn new() -> Self {
        Self
    }
}

impl From<User> for UserRecord {
    fn from(user: User) -> Self {
        Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        }
    }
}

impl From<Group> for GroupRecord {
    fn from(group: Group) -> Self {
        Self {
            name: group.name,
            gid: group.gid.as_raw(),
            members: group.mem,
        }
    }
}

impl IdentityDb for SystemDb {
    fn user_by_name(&self, name: &str) -> io::Result<Option<UserRecord>> {
        Ok(User::from_name(name)?.map(UserRecord::from))
    }

    fn user_by_uid(&self, uid: u32) -> io::Result<Option<UserRecord>> {
        Ok(User::from_uid(Uid::from_raw(uid))?.map(UserRecord::from))
    }

    fn group_by_name(&self, name: &str) -> io::Result<Option<GroupRecord>> {
        Ok(Group::from_name(name)?.map(GroupRecord::from))
    }

    fn group_by_gid(&self, gid: u32) -> io::Result<Option<GroupRecord>> {
        Ok(Group::from_gid(Gid::from_raw(gid))?.map(GroupRecord::from))
    }

    fn all_users(&self) -> io::Result<Vec<UserRecord>> {
        let _guard = ENUMERATION_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut users = Vec::new();

        // SAFETY: the enumeration cursor is process-global; ENUMERATION_LOCK
        // serializes every setpwent/getpwent/endpwent sequence in this crate.
        unsafe { libc::setpwent() };
        let outcome = loop {
            // SAFETY: errno is cleared so a NULL return can be told apart
            // from end of database. The returned record lives in libc static
            // storage and is copied out before the next getpwent call.
            let entry = unsafe {
                nix::errno::Errno::clear();
                libc::getpwent()
            };
            if entry.is_null() {
                break enumeration_end();
            }
            // SAFETY: `entry` is non-null and points at a valid passwd record.
            let record = unsafe {
                let pw = &*entry;
                UserRecord {
                    name: c_string(pw.pw_name),
                    uid: pw.pw_uid,
                    gid: pw.pw_gid,
                }
            };
            users.push(record);
        };
        // SAFETY: closes the cursor opened above, still under the lock.
        unsafe { libc::endpwent() };

        outcome.map(|()| users)
    }

    fn all_groups(&self) -> io::Result<Vec<GroupRecord>> {
        let _guard = ENUMERATION_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut groups = Vec::new();

        // SAFETY: see `all_users`.
        unsafe { libc::setgrent() };
        let outcome = loop {
            // SAFETY: see `all_users`.
            let entry = unsafe {
                nix::errno::Errno::clear();
                libc::getgrent()
            };
            if entry.is_null() {
                break enumeration_end();
            }
            // SAFETY: `entry` is non-null; `gr_mem` is a NULL-terminated
            // array owned by libc and valid until the next getgrent call.
            let record = unsafe {
                let gr = &*entry;
                GroupRecord {
                    name: c_string(gr.gr_name),
                    gid: gr.gr_gid,
                    members: member_names(gr.gr_mem),
                }
            };
            groups.push(record);
        };
        // SAFETY: closes the cursor opened above, still under the lock.
        unsafe { libc::endgrent() };

        outcome.map(|()| groups)
    }
}

/// Classify a NULL return from getpwent/getgrent.
fn enumeration_end() -> io::Result<()> {
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        // glibc reports ENOENT at the end of some NSS backends.
        None | Some(0) | Some(libc::ENOENT) => Ok(()),
        Some(_) => Err(err),
    }
}

unsafe fn c_string(ptr: *const libc::c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

unsafe fn member_names(mut ptr: *mut *mut libc::c_char) -> Vec<String> {
    let mut members = Vec::new();
    if ptr.is_null() {
        return members;
    }
    while !(*ptr).is_null() {
        members.push(c_string(*ptr));
        ptr = ptr.add(1);
    }
    members
}

// ============================================================================
// In-memory database
// ============================================================================

#[derive(Debug, Default)]
struct Tables {
    users: Vec<UserRecord>,
    groups: Vec<GroupRecord>,
}

/// In-memory identity database with replaceable contents.
#[derive(Debug, Default)]
pub struct StaticDb {
    tables: RwLock<Tables>,
}

impl StaticDb {
    pub fn new(users: Vec<UserRecord>, groups: Vec<GroupRecord>) -> Self {
        Self {
            tables: RwLock::new(Tables { users, groups }),
        }
    }

    /// Swap in new contents, as an administrator editing the databases would.
    pub fn replace(&self, users: Vec<UserRecord>, groups: Vec<GroupRecord>) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        *tables = Tables { users, groups };
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        f(&tables)
    }
}

impl IdentityDb for StaticDb {
    fn user_by_name(&self, name: &str) -> io::Result<Option<UserRecord>> {
        Ok(self.read(|t| t.users.iter().find(|u| u.name == name).cloned()))
    }

    fn user_by_uid(&self, uid: u32) -> io::Result<Option<UserRecord>> {
        Ok(self.read(|t| t.users.iter().find(|u| u.uid == uid).cloned()))
    }

    fn group_by_name(&self, name: &str) -> io::Result<Option<GroupRecord>> {
        Ok(self.read(|t| t.groups.iter().find(|g| g.name == name).cloned()))
    }

    fn group_by_gid(&self, gid: u32) -> io::Result<Option<GroupRecord>> {
        Ok(self.read(|t| t.groups.iter().find(|g| g.gid == gid).cloned()))
    }

    fn all_users(&self) -> io::Result<Vec<UserRecord>> {
        Ok(self.read(|t| t.users.clone()))
    }

    fn all_groups(&self) -> io::Result<Vec<GroupRecord>> {
        Ok(self.read(|t| t.groups.clone()))
    }
}

// ============================================================================
// Name resolution
// ============================================================================

/// Resolve a user name or numeric uid.
///
/// Numeric strings are accepted even when no such user exists, so files
/// can be handed to orphaned ids.
pub fn user_uid(db: &dyn IdentityDb, name: &str) -> Result<u32, ConfigError> {
    if let Ok(uid) = name.parse::<u32>() {
        return Ok(uid);
    }
    match db.user_by_name(name) {
        Ok(Some(user)) => Ok(user.uid),
        Ok(None) => Err(ConfigError::UnknownUser(name.to_owned())),
        Err(source) => Err(ConfigError::Lookup {
            name: name.to_owned(),
            source,
        }),
    }
}

/// Resolve a group name or numeric gid. Same rules as [`user_uid`].
pub fn group_gid(db: &dyn IdentityDb, name: &str) -> Result<u32, ConfigError> {
    if let Ok(gid) = name.parse::<u32>() {
        return Ok(gid);
    }
    match db.group_by_name(name) {
        Ok(Some(group)) => Ok(group.gid),
        Ok(None) => Err(ConfigError::UnknownGroup(name.to_owned())),
        Err(source) => Err(ConfigError::Lookup {
            name: name.to_owned(),
            source,
        }),
    }
}

/// Uncached membership test: primary group, or listed as a member by name.
///
/// Every call hits the database. The mount uses
/// [`IdentityCache`](crate::cache::IdentityCache); this is the reference it
/// is checked against.
pub fn user_belongs_to_group(db: &dyn IdentityDb, uid: u32, gid: u32) -> io::Result<bool> {
    let Some(user) = db.user_by_uid(uid)? else {
        return Ok(false);
    };
    if user.gid == gid {
        return Ok(true);
    }
    let Some(group) = db.group_by_gid(gid)? else {
        return Ok(false);
    };
    for member in &group.members {
        if let Some(record) = db.user_by_name(member)? {
            if record.uid == uid {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_db() -> StaticDb {
        StaticDb::new(
            vec![
                UserRecord::new("alice", 1000, 1000),
                UserRecord::new("bob", 1001, 100),
                UserRecord::new("carol", 1002, 1002),
            ],
            vec![
                GroupRecord::new("alice", 1000, &[]),
                GroupRecord::new("users", 100, &[]),
                GroupRecord::new("staff", 50, &["alice", "carol"]),
                GroupRecord::new("ghosts", 60, &["nobody-here"]),
            ],
        )
    }

    #[test]
    fn test_user_uid_resolves_names_and_numbers() {
        let db = sample_db();
        assert_eq!(user_uid(&db, "bob").unwrap(), 1001);
        assert_eq!(user_uid(&db, "4242").unwrap(), 4242);
        assert!(matches!(
            user_uid(&db, "mallory"),
            Err(ConfigError::UnknownUser(name)) if name == "mallory"
        ));
    }

    #[test]
    fn test_group_gid_resolves_names_and_numbers() {
        let db = sample_db();
        assert_eq!(group_gid(&db, "staff").unwrap(), 50);
        assert_eq!(group_gid(&db, "77").unwrap(), 77);
        assert!(matches!(
            group_gid(&db, "wheel"),
            Err(ConfigError::UnknownGroup(_))
        ));
    }

    #[test]
    fn test_membership_primary_and_listed() {
        let db = sample_db();
        // primary
        assert!(user_belongs_to_group(&db, 1001, 100).unwrap());
        // listed member
        assert!(user_belongs_to_group(&db, 1000, 50).unwrap());
        assert!(user_belongs_to_group(&db, 1002, 50).unwrap());
        // neither
        assert!(!user_belongs_to_group(&db, 1001, 50).unwrap());
        // unknown user or group
        assert!(!user_belongs_to_group(&db, 9999, 50).unwrap());
        assert!(!user_belongs_to_group(&db, 1000, 9999).unwrap());
        // member names that resolve to nobody are ignored
        assert!(!user_belongs_to_group(&db, 1000, 60).unwrap());
    }

    #[test]
    fn test_static_db_replace() {
        let db = sample_db();
        assert!(!user_belongs_to_group(&db, 1001, 50).unwrap());
        db.replace(
            vec![UserRecord::new("bob", 1001, 100)],
            vec![GroupRecord::new("staff", 50, &["bob"])],
        );
        assert!(user_belongs_to_group(&db, 1001, 50).unwrap());
        assert_eq!(db.all_users().unwrap().len(), 1);
    }

    #[test]
    fn test_system_db_resolves_root() {
        let db = SystemDb::new();
        let root = db.user_by_uid(0).unwrap().expect("root user exists");
        assert_eq!(root.uid, 0);
        assert_eq!(user_uid(&db, &root.name).unwrap(), 0);
        assert!(db.all_users().unwrap().iter().any(|u| u.uid == 0));
        assert!(db.all_groups().unwrap().iter().any(|g| g.gid == root.gid));
    }
}
