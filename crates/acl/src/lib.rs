//! Access control lists over a transactional unit of work.
//!
//! Writes ([`AclRepository::create_acl_entry`],
//! [`AclRepository::revoke_acl_entry`]) join the caller's
//! [`TransactionContext`](cadence_context::TransactionContext): every write
//! in one unit of work shares a single store snapshot that commits with the
//! unit of work and aborts when it rolls back.
//!
//! Checks ([`AclRepository::can`] and friends) take a scope chain of
//! subject ids, all of which must hold the permission, and read through a
//! [`PermissionCache`].

mod cache;
mod error;
mod permission;
mod repository;
mod settings;

pub use cache::{CacheError, CacheKey, CacheStats, MemoryPermissionCache, PermissionCache};
pub use error::AclError;
pub use permission::Permission;
pub use repository::AclRepository;
pub use settings::CacheSettings;
