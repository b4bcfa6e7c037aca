//! Group membership cache backing mirrored-user access checks.
//!
//! Two strategies:
//! - **Bulk**: after an invalidation the next lookup snapshots both
//!   databases into uid/gid-sorted arrays and answers by binary search.
//! - **Read-through**: entries are fetched one key at a time on a miss and
//!   kept sorted; an invalidation empties both arrays.
//!
//! Invalidation only stores into an atomic flag, so it may be raised from a
//! signal handler. The refresh itself happens under the write lock on the
//! next lookup, which means a slow identity backend stalls every membership
//! test mount-wide until it answers. There is no timeout.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, error, info, warn};

use crate::userinfo::IdentityDb;

/// How the cache is populated.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CacheStrategy {
    #[default]
    Bulk,
    ReadThrough,
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bulk => f.write_str("bulk"),
            Self::ReadThrough => f.write_str("read-through"),
        }
    }
}

/// `primary_gid` is `None` for a memoized miss.
#[derive(Clone, Debug)]
struct UidEntry {
    uid: u32,
    primary_gid: Option<u32>,
    name: String,
}

/// `members` is sorted.
#[derive(Clone, Debug)]
struct GidEntry {
    gid: u32,
    members: Vec<u32>,
}

#[derive(Debug, Default)]
struct CacheState {
    users: Vec<UidEntry>,
    groups: Vec<GidEntry>,
}

impl CacheState {
    fn user(&self, uid: u32) -> Option<&UidEntry> {
        self.users
            .binary_search_by_key(&uid, |e| e.uid)
            .ok()
            .map(|i| &self.users[i])
    }

    fn group(&self, gid: u32) -> Option<&GidEntry> {
        self.groups
            .binary_search_by_key(&gid, |e| e.gid)
            .ok()
            .map(|i| &self.groups[i])
    }

    fn lookup(&self, uid: u32, gid: u32) -> CacheLookup {
        let Some(user) = self.user(uid) else {
            return CacheLookup::MissingUser;
        };
        match user.primary_gid {
            None => return CacheLookup::Hit(false),
            Some(primary) if primary == gid => return CacheLookup::Hit(true),
            Some(_) => {}
        }
        match self.group(gid) {
            Some(group) => CacheLookup::Hit(group.members.binary_search(&uid).is_ok()),
            None => CacheLookup::MissingGroup,
        }
    }
}

enum CacheLookup {
    Hit(bool),
    MissingUser,
    MissingGroup,
}

/// Cache statistics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CacheStats {
    pub strategy: CacheStrategy,
    pub user_entries: usize,
    pub group_entries: usize,
    pub rebuilds: u64,
}

/// Concurrent membership cache over an [`IdentityDb`].
pub struct IdentityCache {
    db: Arc<dyn IdentityDb>,
    strategy: CacheStrategy,
    state: RwLock<CacheState>,
    stale: Arc<AtomicBool>,
    rebuilds: AtomicU64,
}

impl fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityCache")
            .field("strategy", &self.strategy)
            .field("stale", &self.stale.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl IdentityCache {
    /// Create an empty cache. The first lookup populates it.
    pub fn new(db: Arc<dyn IdentityDb>, strategy: CacheStrategy) -> Self {
        Self {
            db,
            strategy,
            state: RwLock::new(CacheState::default()),
            stale: Arc::new(AtomicBool::new(true)),
            rebuilds: AtomicU64::new(0),
        }
    }

    pub fn strategy(&self) -> CacheStrategy {
        self.strategy
    }

    /// Mark the cache stale. Async-signal-safe: a single atomic store.
    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// The flag behind [`invalidate`](Self::invalidate), for registration
    /// with `signal_hook::flag::register`.
    pub fn invalidation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stale)
    }

    /// Whether `uid` has `gid` as primary group or is a listed member of it.
    pub fn user_belongs_to_group(&self, uid: u32, gid: u32) -> bool {
        if self.stale.load(Ordering::Acquire) {
            self.refresh();
        }

        let lookup = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            state.lookup(uid, gid)
        };

        match (lookup, self.strategy) {
            (CacheLookup::Hit(member), _) => member,
            // A bulk snapshot is complete: absent means no such entry.
            (_, CacheStrategy::Bulk) => false,
            (_, CacheStrategy::ReadThrough) => self.read_through(uid, gid),
        }
    }

    /// Entry counts and rebuild count.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        CacheStats {
            strategy: self.strategy,
            user_entries: state.users.len(),
            group_entries: state.groups.len(),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
        }
    }

    /// Apply a pending invalidation. Readers never see a half-built state:
    /// the replacement is assembled first and committed in one assignment.
    fn refresh(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        // Another thread may have refreshed while we waited for the lock.
        if !self.stale.swap(false, Ordering::AcqRel) {
            return;
        }

        *state = match self.strategy {
            CacheStrategy::Bulk => match self.snapshot() {
                Ok(fresh) => fresh,
                Err(e) => {
                    error!("Identity cache rebuild failed, treating all users as non-members: {}", e);
                    CacheState::default()
                }
            },
            CacheStrategy::ReadThrough => CacheState::default(),
        };

        let rebuilds = self.rebuilds.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "Identity cache refreshed ({}): {} users, {} groups, rebuild #{}",
            self.strategy,
            state.users.len(),
            state.groups.len(),
            rebuilds
        );
    }

    /// Enumerate both databases into sorted arrays.
    fn snapshot(&self) -> io::Result<CacheState> {
        let records = self.db.all_users()?;
        let groups = self.db.all_groups()?;

        let mut by_name: HashMap<&str, u32> = HashMap::with_capacity(records.len());
        for user in &records {
            by_name.entry(user.name.as_str()).or_insert(user.uid);
        }

        let mut users: Vec<UidEntry> = records
            .iter()
            .map(|u| UidEntry {
                uid: u.uid,
                primary_gid: Some(u.gid),
                name: u.name.clone(),
            })
            .collect();
        // Stable sort keeps the first database entry for a duplicated uid.
        users.sort_by_key(|e| e.uid);
        users.dedup_by_key(|e| e.uid);

        let mut entries: Vec<GidEntry> = groups
            .iter()
            .map(|g| {
                let mut members: Vec<u32> = g
                    .members
                    .iter()
                    .filter_map(|name| by_name.get(name.as_str()).copied())
                    .collect();
                members.sort_unstable();
                members.dedup();
                GidEntry {
                    gid: g.gid,
                    members,
                }
            })
            .collect();
        entries.sort_by_key(|e| e.gid);
        entries.dedup_by_key(|e| e.gid);

        Ok(CacheState {
            users,
            groups: entries,
        })
    }

    /// Slow path for a read-through miss: fetch the missing keys under the
    /// write lock, then answer from the updated state.
    fn read_through(&self, uid: u32, gid: u32) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        loop {
            match state.lookup(uid, gid) {
                CacheLookup::Hit(member) => return member,
                CacheLookup::MissingUser => match self.fetch_user(uid) {
                    Ok(entry) => insert_sorted(&mut state.users, entry, |e| e.uid),
                    Err(e) => {
                        warn!("Failed to look up uid {}: {}", uid, e);
                        return false;
                    }
                },
                CacheLookup::MissingGroup => match self.fetch_group(gid) {
                    Ok(entry) => insert_sorted(&mut state.groups, entry, |e| e.gid),
                    Err(e) => {
                        warn!("Failed to look up gid {}: {}", gid, e);
                        return false;
                    }
                },
            }
        }
    }

    fn fetch_user(&self, uid: u32) -> io::Result<UidEntry> {
        let entry = match self.db.user_by_uid(uid)? {
            Some(user) => UidEntry {
                uid,
                primary_gid: Some(user.gid),
                name: user.name,
            },
            None => UidEntry {
                uid,
                primary_gid: None,
                name: String::new(),
            },
        };
        debug!("identity cache: fetched uid {} '{}'", uid, entry.name);
        Ok(entry)
    }

    /// An absent group is memoized with no members.
    fn fetch_group(&self, gid: u32) -> io::Result<GidEntry> {
        debug!("identity cache: fetching gid {}", gid);
        let mut members = Vec::new();
        if let Some(group) = self.db.group_by_gid(gid)? {
            for name in &group.members {
                if let Some(user) = self.db.user_by_name(name)? {
                    members.push(user.uid);
                }
            }
        }
        members.sort_unstable();
        members.dedup();
        Ok(GidEntry { gid, members })
    }
}

/// Push `item` and sift it left into place. The vector is sorted before the
/// call, so this is one step of insertion sort.
fn insert_sorted<T>(items: &mut Vec<T>, item: T, key: impl Fn(&T) -> u32) {
    items.push(item);
    let mut i = items.len() - 1;
    while i > 0 && key(&items[i - 1]) > key(&items[i]) {
        items.swap(i - 1, i);
        i -= 1;
    }
}
