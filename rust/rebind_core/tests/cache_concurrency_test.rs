//! Membership cache under concurrent lookups and invalidations.
//!
//! The database flips between two generations of group member lists while
//! readers hammer the cache. Primary groups never change, so any answer must
//! match the uncached lookup against one of the two generations; after the
//! last invalidation every answer must match the final generation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use rebind_core::userinfo::{user_belongs_to_group, GroupRecord, UserRecord};
use rebind_core::{CacheStrategy, IdentityCache, StaticDb};

const UIDS: std::ops::Range<u32> = 1000..1012;
const GIDS: std::ops::Range<u32> = 500..506;

fn generation(n: u32) -> (Vec<UserRecord>, Vec<GroupRecord>) {
    let users = UIDS
        .map(|uid| UserRecord::new(format!("user{uid}"), uid, 500 + uid % 6))
        .collect();
    let groups = GIDS
        .map(|gid| {
            let members: Vec<String> = UIDS
                .filter(|uid| (uid + gid + n) % 3 == 0)
                .map(|uid| format!("user{uid}"))
                .collect();
            GroupRecord {
                name: format!("group{gid}"),
                gid,
                members,
            }
        })
        .collect();
    (users, groups)
}

fn reference(n: u32) -> StaticDb {
    let (users, groups) = generation(n);
    StaticDb::new(users, groups)
}

fn run(strategy: CacheStrategy) {
    let (users, groups) = generation(0);
    let db = Arc::new(StaticDb::new(users, groups));
    let cache = Arc::new(IdentityCache::new(db.clone(), strategy));
    let refs = Arc::new([reference(0), reference(1)]);
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let refs = Arc::clone(&refs);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    for uid in UIDS {
                        for gid in GIDS {
                            let got = cache.user_belongs_to_group(uid, gid);
                            let valid = refs
                                .iter()
                                .any(|r| user_belongs_to_group(r, uid, gid).unwrap() == got);
                            assert!(valid, "uid {uid} gid {gid} answered {got}");
                        }
                    }
                }
            })
        })
        .collect();

    for round in 0..200u32 {
        let (users, groups) = generation(round % 2);
        db.replace(users, groups);
        cache.invalidate();
        thread::yield_now();
    }
    // Last round used generation 1.
    done.store(true, Ordering::Release);
    for reader in readers {
        reader.join().expect("reader panicked");
    }

    cache.invalidate();
    for uid in UIDS {
        for gid in GIDS {
            assert_eq!(
                cache.user_belongs_to_group(uid, gid),
                user_belongs_to_group(&refs[1], uid, gid).unwrap(),
                "final answer for uid {uid} gid {gid}"
            );
        }
    }
}

#[test]
fn test_bulk_cache_under_concurrency() {
    run(CacheStrategy::Bulk);
}

#[test]
fn test_read_through_cache_under_concurrency() {
    run(CacheStrategy::ReadThrough);
}
