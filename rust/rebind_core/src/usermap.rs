//! Declarative uid/gid substitution tables (`--map`, `--map-passwd`,
//! `--map-group` and their `-rev` variants).
//!
//! The forward map rewrites ids reported by getattr; the reverse map turns
//! ids requested by chown or chosen for new files back into on-disk ids.
//! Every forward pair is also inserted, inverted, into the reverse map.

use std::fs;
use std::path::Path;

use log::{debug, warn};

use crate::error::{ConfigError, IdKind};
use crate::userinfo::{group_gid, user_uid, IdentityDb};

/// Which table of an [`IdentityMap`] to consult.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// On-disk id to reported id.
    Forward,
    /// Requested id to on-disk id.
    Reverse,
}

/// `(from, to)` pairs with unique `from` keys.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
struct IdTable {
    pairs: Vec<(u32, u32)>,
}

impl IdTable {
    fn get(&self, from: u32) -> Option<u32> {
        self.pairs.iter().find(|(f, _)| *f == from).map(|(_, t)| *t)
    }

    fn contains(&self, from: u32) -> bool {
        self.get(from).is_some()
    }

    fn push(&mut self, from: u32, to: u32) {
        self.pairs.push((from, to));
    }

    fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// One direction's uid and gid tables.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UserMap {
    uids: IdTable,
    gids: IdTable,
}

impl UserMap {
    /// The uid `uid` maps to, or `default`.
    pub fn uid_or(&self, uid: u32, default: u32) -> u32 {
        if self.uids.is_empty() {
            return default;
        }
        self.uids.get(uid).unwrap_or(default)
    }

    /// The gid `gid` maps to, or `default`.
    pub fn gid_or(&self, gid: u32, default: u32) -> u32 {
        if self.gids.is_empty() {
            return default;
        }
        self.gids.get(gid).unwrap_or(default)
    }

    pub fn uid(&self, uid: u32) -> Option<u32> {
        self.uids.get(uid)
    }

    pub fn gid(&self, gid: u32) -> Option<u32> {
        self.gids.get(gid)
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty() && self.gids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.uids.pairs.len() + self.gids.pairs.len()
    }
}

/// Forward and reverse maps built together.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IdentityMap {
    forward: UserMap,
    reverse: UserMap,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, direction: Direction) -> &UserMap {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Reverse => &self.reverse,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Map `from` to `to` for reporting and `to` to `from` for assignment.
    ///
    /// `from == to` is accepted and ignored. A key already present in either
    /// direction is rejected and neither table changes.
    pub fn add_uid(&mut self, from: u32, to: u32) -> Result<(), ConfigError> {
        add_pair(
            IdKind::User,
            &mut self.forward.uids,
            &mut self.reverse.uids,
            from,
            to,
        )
    }

    /// Group counterpart of [`add_uid`](Self::add_uid).
    pub fn add_gid(&mut self, from: u32, to: u32) -> Result<(), ConfigError> {
        add_pair(
            IdKind::Group,
            &mut self.forward.gids,
            &mut self.reverse.gids,
            from,
            to,
        )
    }

    /// Add pairs from a `--map` value such as `alice/bob:@staff/@users`.
    ///
    /// Pairs are separated by `,` or `:`. Group pairs carry `@` on both
    /// sides. Names or numeric ids are accepted on either side.
    pub fn add_spec(&mut self, spec: &str, db: &dyn IdentityDb) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidMapSpec(spec.to_owned());
        let mut staged = self.clone();

        for clause in spec.split(|c: char| c == ',' || c == ':') {
            let (from, to) = clause.split_once('/').ok_or_else(invalid)?;
            if from.is_empty() || to.is_empty() || to.contains('/') {
                return Err(invalid());
            }
            match (from.strip_prefix('@'), to.strip_prefix('@')) {
                (Some(from), Some(to)) => {
                    if from.is_empty() || to.is_empty() {
                        return Err(invalid());
                    }
                    staged.add_gid(group_gid(db, from)?, group_gid(db, to)?)?;
                }
                (None, None) => {
                    staged.add_uid(user_uid(db, from)?, user_uid(db, to)?)?;
                }
                _ => return Err(invalid()),
            }
        }

        *self = staged;
        Ok(())
    }

    /// Load a passwd-format file: each line maps the uid in column 3 to the
    /// local uid of the user named in column 1. `reverse` swaps the pair.
    pub fn load_passwd_file(
        &mut self,
        path: &Path,
        reverse: bool,
        db: &dyn IdentityDb,
    ) -> Result<(), ConfigError> {
        self.load_file(IdKind::User, path, reverse, db)
    }

    /// Load a group-format file. Same layout rules as
    /// [`load_passwd_file`](Self::load_passwd_file).
    pub fn load_group_file(
        &mut self,
        path: &Path,
        reverse: bool,
        db: &dyn IdentityDb,
    ) -> Result<(), ConfigError> {
        self.load_file(IdKind::Group, path, reverse, db)
    }

    fn load_file(
        &mut self,
        kind: IdKind,
        path: &Path,
        reverse: bool,
        db: &dyn IdentityDb,
    ) -> Result<(), ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::MapFile {
            path: path.to_path_buf(),
            source,
        })?;
        let mut staged = self.clone();
        let mut added = 0usize;

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let bad_line = || ConfigError::MapFileLine {
                path: path.to_path_buf(),
                line: index + 1,
            };

            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 3 || fields[0].is_empty() {
                return Err(bad_line());
            }
            let name = fields[0];
            let file_id: u32 = fields[2].trim().parse().map_err(|_| bad_line())?;

            let Some(local_id) = local_id(kind, name, db)? else {
                warn!(
                    "{}:{}: no local {} named '{}', skipping",
                    path.display(),
                    index + 1,
                    kind,
                    name
                );
                continue;
            };

            let (from, to) = if reverse {
                (local_id, file_id)
            } else {
                (file_id, local_id)
            };
            match kind {
                IdKind::User => staged.add_uid(from, to)?,
                IdKind::Group => staged.add_gid(from, to)?,
            }
            added += 1;
        }

        debug!("Loaded {} {} mappings from {}", added, kind, path.display());
        *self = staged;
        Ok(())
    }
}

fn local_id(kind: IdKind, name: &str, db: &dyn IdentityDb) -> Result<Option<u32>, ConfigError> {
    let lookup = match kind {
        IdKind::User => db.user_by_name(name).map(|u| u.map(|u| u.uid)),
        IdKind::Group => db.group_by_name(name).map(|g| g.map(|g| g.gid)),
    };
    lookup.map_err(|source| ConfigError::Lookup {
        name: name.to_owned(),
        source,
    })
}

fn add_pair(
    kind: IdKind,
    forward: &mut IdTable,
    reverse: &mut IdTable,
    from: u32,
    to: u32,
) -> Result<(), ConfigError> {
    if from == to {
        return Ok(());
    }
    if forward.contains(from) {
        return Err(ConfigError::DuplicateMapping { kind, from });
    }
    if reverse.contains(to) {
        return Err(ConfigError::DuplicateMapping { kind, from: to });
    }
    forward.push(from, to);
    reverse.push(to, from);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::userinfo::{GroupRecord, StaticDb, UserRecord};
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn local_db() -> StaticDb {
        StaticDb::new(
            vec![
                UserRecord::new("alice", 1000, 1000),
                UserRecord::new("bob", 1001, 1001),
                UserRecord::new("www", 33, 33),
            ],
            vec![
                GroupRecord::new("staff", 50, &[]),
                GroupRecord::new("users", 100, &[]),
            ],
        )
    }

    #[test]
    fn test_empty_map_returns_default() {
        let map = IdentityMap::new();
        assert!(map.is_empty());
        assert_eq!(map.get(Direction::Forward).uid_or(1000, 1000), 1000);
        assert_eq!(map.get(Direction::Reverse).gid_or(5, 7), 7);
    }

    #[test]
    fn test_add_fills_both_directions() {
        let mut map = IdentityMap::new();
        map.add_uid(1000, 2000).unwrap();
        map.add_gid(50, 60).unwrap();
        assert_eq!(map.get(Direction::Forward).uid(1000), Some(2000));
        assert_eq!(map.get(Direction::Reverse).uid(2000), Some(1000));
        assert_eq!(map.get(Direction::Forward).gid(50), Some(60));
        assert_eq!(map.get(Direction::Reverse).gid(60), Some(50));
        assert_eq!(map.get(Direction::Forward).uid(2000), None);
    }

    #[test]
    fn test_self_mapping_is_ignored() {
        let mut map = IdentityMap::new();
        map.add_uid(5, 5).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_duplicate_leaves_map_unchanged() {
        let mut map = IdentityMap::new();
        map.add_uid(1, 10).unwrap();
        let before = map.clone();

        let err = map.add_uid(1, 11).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::DuplicateMapping { kind: IdKind::User, from: 1 }
        ));
        // Second source for the same target collides in the reverse table.
        assert!(map.add_uid(2, 10).is_err());
        assert_eq!(map, before);
        assert_eq!(map.get(Direction::Forward).uid(1), Some(10));
    }

    #[test]
    fn test_add_spec_users_and_groups() {
        let db = local_db();
        let mut map = IdentityMap::new();
        map.add_spec("alice/bob:@staff/@users,33/4000", &db).unwrap();

        let fwd = map.get(Direction::Forward);
        assert_eq!(fwd.uid(1000), Some(1001));
        assert_eq!(fwd.gid(50), Some(100));
        assert_eq!(fwd.uid(33), Some(4000));
        assert_eq!(map.get(Direction::Reverse).uid(4000), Some(33));
    }

    #[test]
    fn test_add_spec_rejects_malformed() {
        let db = local_db();
        for bad in ["alice", "alice/", "/bob", "@staff/bob", "alice/@users", "a/b/c", "@/@users"] {
            let mut map = IdentityMap::new();
            assert!(map.add_spec(bad, &db).is_err(), "accepted {:?}", bad);
            assert!(map.is_empty());
        }
    }

    #[test]
    fn test_add_spec_is_atomic() {
        let db = local_db();
        let mut map = IdentityMap::new();
        assert!(matches!(
            map.add_spec("alice/bob,mallory/bob", &db),
            Err(ConfigError::UnknownUser(_))
        ));
        assert!(map.is_empty());
    }

    #[test]
    fn test_load_passwd_file() {
        let db = local_db();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# exported from the old server").unwrap();
        writeln!(file, "alice:x:501:20:Alice:/home/alice:/bin/sh").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "bob:x:502:20::/home/bob:/bin/sh").unwrap();
        writeln!(file, "ghost:x:503:20::/:/bin/false").unwrap();
        file.flush().unwrap();

        let mut map = IdentityMap::new();
        map.load_passwd_file(file.path(), false, &db).unwrap();
        let fwd = map.get(Direction::Forward);
        assert_eq!(fwd.uid(501), Some(1000));
        assert_eq!(fwd.uid(502), Some(1001));
        assert_eq!(fwd.uid(503), None);

        let mut rev = IdentityMap::new();
        rev.load_passwd_file(file.path(), true, &db).unwrap();
        assert_eq!(rev.get(Direction::Forward).uid(1000), Some(501));
    }

    #[test]
    fn test_load_group_file() {
        let db = local_db();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "staff:x:20:alice,bob").unwrap();
        file.flush().unwrap();

        let mut map = IdentityMap::new();
        map.load_group_file(file.path(), false, &db).unwrap();
        assert_eq!(map.get(Direction::Forward).gid(20), Some(50));
    }

    #[test]
    fn test_load_file_reports_bad_line() {
        let db = local_db();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "alice:x:501").unwrap();
        writeln!(file, "bob:x").unwrap();
        file.flush().unwrap();

        let mut map = IdentityMap::new();
        match map.load_passwd_file(file.path(), false, &db) {
            Err(ConfigError::MapFileLine { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected MapFileLine, got {:?}", other),
        }
        assert!(map.is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let db = local_db();
        let mut map = IdentityMap::new();
        let err = map
            .load_group_file(Path::new("/nonexistent/rebind/group"), false, &db)
            .unwrap_err();
        assert!(matches!(err, ConfigError::MapFile { .. }));
    }

    proptest! {
        #[test]
        fn prop_pairs_round_trip(pairs in proptest::collection::btree_map(0u32..10_000, 10_000u32..20_000, 1..32)) {
            let mut map = IdentityMap::new();
            let mut used_targets = std::collections::HashSet::new();
            let mut added = Vec::new();
            for (from, to) in pairs {
                if used_targets.insert(to) {
                    map.add_uid(from, to).unwrap();
                    added.push((from, to));
                }
            }
            for (from, to) in added {
                prop_assert_eq!(map.get(Direction::Forward).uid_or(from, u32::MAX), to);
                prop_assert_eq!(map.get(Direction::Reverse).uid_or(to, u32::MAX), from);
            }
        }
    }
}
