use anyhow::{anyhow, Result};
use bytes::{BufMut, BytesMut};
use enum_as_inner::EnumAsInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantTag {
    Utf8 = 1,
    Integer = 3,
    Float = 4,
    Long = 5,
    Double = 6,
    Class = 7,
    String = 8,
    Field = 9,
    Method = 10,
    InterfaceMethod = 11,
    NameAndType = 12,
    MethodHandle = 15,
    MethodType = 16,
    Dynamic = 17,
    InvokeDynamic = 18,
    Module = 19,
    Package = 20,
}

impl ConstantTag {
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => ConstantTag::Utf8,
            3 => ConstantTag::Integer,
            4 => ConstantTag::Float,
            5 => ConstantTag::Long,
            6 => ConstantTag::Double,
            7 => ConstantTag::Class,
            8 => ConstantTag::String,
            9 => ConstantTag::Field,
            10 => ConstantTag::Method,
            11 => ConstantTag::InterfaceMethod,
            12 => ConstantTag::NameAndType,
            15 => ConstantTag::MethodHandle,
            16 => ConstantTag::MethodType,
            17 => ConstantTag::Dynamic,
            18 => ConstantTag::InvokeDynamic,
            19 => ConstantTag::Module,
            20 => ConstantTag::Package,
            _ => return Err(anyhow!("{} is an unknown constant pool tag", tag)),
        })
    }
}

/// A class, name and type pair as referenced by field and method refs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberEntry {
    pub class: u16,
    pub name_and_type: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameAndTypeEntry {
    pub name: u16,
    pub descriptor: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DynamicEntry {
    pub bootstrap_method: u16,
    pub name_and_type: u16,
}

#[derive(EnumAsInner, Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstantEntry {
    Utf8(String),
    Integer(u32),
    Float(u32),
    Long(u64),
    Double(u64),
    Class(u16),
    String(u16),
    Field(MemberEntry),
    Method(MemberEntry),
    InterfaceMethod(MemberEntry),
    NameAndType(NameAndTypeEntry),
    MethodHandle(u8, u16),
    MethodType(u16),
    Dynamic(DynamicEntry),
    InvokeDynamic(DynamicEntry),
    Module(u16),
    Package(u16),
    /// Slot 0, and the phantom slot following every Long and Double.
    Reserved,
}

impl ConstantEntry {
    pub fn is_wide(&self) -> bool {
        matches!(self, ConstantEntry::Long(_) | ConstantEntry::Double(_))
    }

    /// Serializes the entry in class file form. Reserved slots write nothing.
    pub fn write(&self, out: &mut BytesMut) {
        match self {
            ConstantEntry::Utf8(value) => {
                out.put_u8(ConstantTag::Utf8 as u8);
                out.put_u16(value.len() as u16);
                out.put_slice(value.as_bytes());
            }
            ConstantEntry::Integer(bits) => {
                out.put_u8(ConstantTag::Integer as u8);
                out.put_u32(*bits);
            }
            ConstantEntry::Float(bits) => {
                out.put_u8(ConstantTag::Float as u8);
                out.put_u32(*bits);
            }
            ConstantEntry::Long(bits) => {
                out.put_u8(ConstantTag::Long as u8);
                out.put_u64(*bits);
            }
            ConstantEntry::Double(bits) => {
                out.put_u8(ConstantTag::Double as u8);
                out.put_u64(*bits);
            }
            ConstantEntry::Class(name) => {
                out.put_u8(ConstantTag::Class as u8);
                out.put_u16(*name);
            }
            ConstantEntry::String(string) => {
                out.put_u8(ConstantTag::String as u8);
                out.put_u16(*string);
            }
            ConstantEntry::Field(member) => {
                out.put_u8(ConstantTag::Field as u8);
                out.put_u16(member.class);
                out.put_u16(member.name_and_type);
            }
            ConstantEntry::Method(member) => {
                out.put_u8(ConstantTag::Method as u8);
                out.put_u16(member.class);
                out.put_u16(member.name_and_type);
            }
            ConstantEntry::InterfaceMethod(member) => {
                out.put_u8(ConstantTag::InterfaceMethod as u8);
                out.put_u16(member.class);
                out.put_u16(member.name_and_type);
            }
            ConstantEntry::NameAndType(nat) => {
                out.put_u8(ConstantTag::NameAndType as u8);
                out.put_u16(nat.name);
                out.put_u16(nat.descriptor);
            }
            ConstantEntry::MethodHandle(kind, index) => {
                out.put_u8(ConstantTag::MethodHandle as u8);
                out.put_u8(*kind);
                out.put_u16(*index);
            }
            ConstantEntry::MethodType(descriptor) => {
                out.put_u8(ConstantTag::MethodType as u8);
                out.put_u16(*descriptor);
            }
            ConstantEntry::Dynamic(dynamic) => {
                out.put_u8(ConstantTag::Dynamic as u8);
                out.put_u16(dynamic.bootstrap_method);
                out.put_u16(dynamic.name_and_type);
            }
            ConstantEntry::InvokeDynamic(dynamic) => {
                out.put_u8(ConstantTag::InvokeDynamic as u8);
                out.put_u16(dynamic.bootstrap_method);
                out.put_u16(dynamic.name_and_type);
            }
            ConstantEntry::Module(name) => {
                out.put_u8(ConstantTag::Module as u8);
                out.put_u16(*name);
            }
            ConstantEntry::Package(name) => {
                out.put_u8(ConstantTag::Package as u8);
                out.put_u16(*name);
            }
            ConstantEntry::Reserved => {}
        }
    }
}

/// A resolved field or method reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRef<'a> {
    pub class: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
}

#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<ConstantEntry>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self {
            entries: vec![ConstantEntry::Reserved],
        }
    }

    pub fn insert(&mut self, entry: ConstantEntry) {
        let wide = entry.is_wide();
        self.entries.push(entry);

        // 64 bit constants take up 2 slots
        if wide {
            self.entries.push(ConstantEntry::Reserved);
        }
    }

    /// The `constant_pool_count` as written in the class file: one more than
    /// the highest valid index.
    pub fn count(&self) -> u16 {
        self.entries.len() as u16
    }

    pub fn get(&self, index: u16) -> Option<&ConstantEntry> {
        self.entries.get(index as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &ConstantEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !matches!(entry, ConstantEntry::Reserved))
            .map(|(index, entry)| (index as u16, entry))
    }

    fn entry(&self, index: u16) -> Result<&ConstantEntry> {
        self.get(index)
            .ok_or_else(|| anyhow!("constant pool index {} out of range ({})", index, self.count()))
    }

    pub fn utf8(&self, index: u16) -> Result<&str> {
        self.entry(index)?
            .as_utf8()
            .map(String::as_str)
            .ok_or_else(|| anyhow!("constant pool entry {} is not a utf8", index))
    }

    pub fn class_name(&self, index: u16) -> Result<&str> {
        let name = self
            .entry(index)?
            .as_class()
            .ok_or_else(|| anyhow!("constant pool entry {} is not a class", index))?;

        self.utf8(*name)
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        let nat = self
            .entry(index)?
            .as_name_and_type()
            .ok_or_else(|| anyhow!("constant pool entry {} is not a name and type", index))?;

        Ok((self.utf8(nat.name)?, self.utf8(nat.descriptor)?))
    }

    /// Resolves a Fieldref, Methodref or InterfaceMethodref.
    pub fn member_ref(&self, index: u16) -> Result<MemberRef<'_>> {
        let member = match self.entry(index)? {
            ConstantEntry::Field(member)
            | ConstantEntry::Method(member)
            | ConstantEntry::InterfaceMethod(member) => member,
            other => {
                return Err(anyhow!(
                    "constant pool entry {} is not a member reference ({:?})",
                    index,
                    other
                ))
            }
        };

        let (name, descriptor) = self.name_and_type(member.name_and_type)?;

        Ok(MemberRef {
            class: self.class_name(member.class)?,
            name,
            descriptor,
        })
    }

    /// Checks that every reference points at an entry of the right kind.
    pub(crate) fn perform_format_checking(&self) -> Result<()> {
        for (index, item) in self.iter() {
            match item {
                ConstantEntry::Class(name) => {
                    self.utf8(*name)?;
                }
                ConstantEntry::String(string) => {
                    self.utf8(*string)?;
                }
                ConstantEntry::Field(_)
                | ConstantEntry::Method(_)
                | ConstantEntry::InterfaceMethod(_) => {
                    self.member_ref(index)?;
                }
                ConstantEntry::NameAndType(_) => {
                    self.name_and_type(index)?;
                }
                ConstantEntry::MethodType(descriptor) => {
                    self.utf8(*descriptor)?;
                }
                ConstantEntry::Dynamic(dynamic) | ConstantEntry::InvokeDynamic(dynamic) => {
                    self.name_and_type(dynamic.name_and_type)?;
                }
                ConstantEntry::Module(name) | ConstantEntry::Package(name) => {
                    self.utf8(*name)?;
                }
                _ => {}
            }
        }

        Ok(())
    }
}
