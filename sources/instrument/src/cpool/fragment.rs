use bytes::{BufMut, Bytes, BytesMut};
use parse::pool::ConstantTag;
use support::bytes_ext::ByteSlice;

use crate::error::InstrumentResult;
use crate::internal;

/// A reference from one fragment entry to another. Internal indices count
/// from the start of the same fragment, external ones from the start of the
/// fragment it depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpIndex {
    Internal(u16),
    External(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpEntry {
    Utf8(&'static str),
    Class(CpIndex),
    MethodRef {
        class: CpIndex,
        name_and_type: CpIndex,
    },
    NameAndType {
        name: CpIndex,
        descriptor: CpIndex,
    },
}

/// A run of constant pool entries in class file encoding, with the offsets
/// of every index operand so it can be placed at any position in a pool.
#[derive(Debug, Clone)]
pub struct PackedFragment {
    bytes: Bytes,
    count: u16,
    internal: Vec<usize>,
    external: Vec<usize>,
}

impl PackedFragment {
    pub fn pack(entries: &[CpEntry]) -> Self {
        let mut bytes = BytesMut::new();
        let mut internal = Vec::new();
        let mut external = Vec::new();

        let mut put_index = |bytes: &mut BytesMut, index: CpIndex| {
            let (offsets, value) = match index {
                CpIndex::Internal(value) => (&mut internal, value),
                CpIndex::External(value) => (&mut external, value),
            };

            offsets.push(bytes.len());
            bytes.put_u16(value);
        };

        for entry in entries {
            match *entry {
                CpEntry::Utf8(value) => {
                    bytes.put_u8(ConstantTag::Utf8 as u8);
                    bytes.put_u16(value.len() as u16);
                    bytes.put_slice(value.as_bytes());
                }
                CpEntry::Class(name) => {
                    bytes.put_u8(ConstantTag::Class as u8);
                    put_index(&mut bytes, name);
                }
                CpEntry::MethodRef {
                    class,
                    name_and_type,
                } => {
                    bytes.put_u8(ConstantTag::Method as u8);
                    put_index(&mut bytes, class);
                    put_index(&mut bytes, name_and_type);
                }
                CpEntry::NameAndType { name, descriptor } => {
                    bytes.put_u8(ConstantTag::NameAndType as u8);
                    put_index(&mut bytes, name);
                    put_index(&mut bytes, descriptor);
                }
            }
        }

        Self {
            bytes: bytes.freeze(),
            count: entries.len() as u16,
            internal,
            external,
        }
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn has_external_refs(&self) -> bool {
        !self.external.is_empty()
    }

    /// The fragment's bytes for a pool where it starts at index `base`, and
    /// its dependency starts at `external_base`.
    pub fn relocate(&self, base: u16, external_base: Option<u16>) -> InstrumentResult<Bytes> {
        let mut bytes = self.bytes.to_vec();

        for &offset in &self.internal {
            let value = bytes.u16_at(offset)?;
            let relocated = value
                .checked_add(base)
                .ok_or_else(|| internal!("fragment index {} overflows at base {}", value, base))?;
            bytes.put_u16_at(offset, relocated)?;
        }

        if self.has_external_refs() {
            let external_base = external_base
                .ok_or_else(|| internal!("fragment refers to a dependency that is not placed"))?;

            for &offset in &self.external {
                let value = bytes.u16_at(offset)?;
                let relocated = value.checked_add(external_base).ok_or_else(|| {
                    internal!("external index {} overflows at base {}", value, external_base)
                })?;
                bytes.put_u16_at(offset, relocated)?;
            }
        }

        Ok(Bytes::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use support::bytes_ext::ByteSlice;

    use super::{CpEntry, CpIndex, PackedFragment};

    #[test]
    fn it_relocates_both_index_spaces() -> Result<()> {
        let fragment = PackedFragment::pack(&[
            CpEntry::MethodRef {
                class: CpIndex::External(1),
                name_and_type: CpIndex::Internal(1),
            },
            CpEntry::NameAndType {
                name: CpIndex::Internal(2),
                descriptor: CpIndex::External(0),
            },
            CpEntry::Utf8("rootMethodEntry"),
        ]);

        assert_eq!(fragment.count(), 3);

        let bytes = fragment.relocate(100, Some(50))?;
        assert_eq!(bytes[0], 10);
        assert_eq!(bytes.u16_at(1)?, 51);
        assert_eq!(bytes.u16_at(3)?, 101);
        assert_eq!(bytes[5], 12);
        assert_eq!(bytes.u16_at(6)?, 102);
        assert_eq!(bytes.u16_at(8)?, 50);
        assert_eq!(bytes[10], 1);
        assert_eq!(bytes.u16_at(11)?, 15);
        assert_eq!(&bytes[13..], b"rootMethodEntry");

        // the packed template itself is untouched
        assert_eq!(fragment.bytes().u16_at(1)?, 1);
        Ok(())
    }

    #[test]
    fn it_requires_a_placed_dependency() {
        let fragment = PackedFragment::pack(&[CpEntry::Class(CpIndex::External(2))]);
        assert!(fragment.relocate(10, None).is_err());
    }
}
