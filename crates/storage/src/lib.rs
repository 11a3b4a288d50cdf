pub mod conformance;
mod error;
mod memory;
mod record;
mod traits;

pub use error::StorageError;
pub use memory::{MemoryAclStore, MemorySnapshot};
pub use record::{AclEntryRecord, AclGrant, AclKey};
pub use traits::AclStore;
