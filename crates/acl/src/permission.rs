use std::fmt;

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Permission bitmask stored on an ACL row.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Permission: u32 {
        const READ = 1;
        const WRITE = 1 << 1;
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        bitflags::parser::to_writer(self, f)
    }
}
