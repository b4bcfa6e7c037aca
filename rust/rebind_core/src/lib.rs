//! `rebind_core` - ownership and permission transformation for the rebind
//! passthrough filesystem.
//!
//! Everything here is independent of FUSE and can be exercised without a
//! mount. The daemon builds one [`attrs::AttrTransformer`] at startup and
//! routes every attribute, create and chown/chmod request through it.
//!
//! Modules:
//! - `permchain` - chmod-like permission rule chains
//! - `userinfo`  - user/group lookups behind the `IdentityDb` trait
//! - `cache`     - concurrent group membership cache
//! - `usermap`   - declarative uid/gid substitution tables
//! - `offset`    - checked uid/gid offset arithmetic
//! - `mirror`    - mirrored user and group lists
//! - `settings`  - validated mount configuration
//! - `attrs`     - the request-level transformation pipeline
//! - `error`     - configuration and per-request errors

pub mod attrs;
pub mod cache;
pub mod error;
pub mod mirror;
pub mod offset;
pub mod permchain;
pub mod settings;
pub mod userinfo;
pub mod usermap;

pub use attrs::{AttrTransformer, Attributes, Requester};
pub use cache::{CacheStrategy, IdentityCache};
pub use error::{ConfigError, TransformError};
pub use permchain::PermChain;
pub use settings::{MountConfig, Settings};
pub use userinfo::{IdentityDb, StaticDb, SystemDb};
