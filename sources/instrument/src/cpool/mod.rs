pub mod fragment;
pub mod repository;

use bytes::Bytes;

pub use self::fragment::{CpEntry, CpIndex, PackedFragment};

/// Constant pool entries ready to be appended to a class's pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstantPoolExtension {
    pub count: u16,
    pub bytes: Bytes,
}

impl ConstantPoolExtension {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
