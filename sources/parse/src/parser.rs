use anyhow::{anyhow, Result};
use bytes::{Buf, Bytes};
use tracing::trace;

use crate::classfile::{ClassInfo, CodeLayout, Layout, LineNumber, MethodInfo};
use crate::constants::{CODE_ATTRIBUTE, LINE_NUMBER_TABLE_ATTRIBUTE, MAGIC};
use crate::flags::{ClassFileAccessFlags, MethodAccessFlags};
use crate::pool::{
    ConstantEntry, ConstantPool, ConstantTag, DynamicEntry, MemberEntry, NameAndTypeEntry,
};
use support::bytes_ext::SafeBuf;

/// Walks a class file once, keeping the constant pool and recording where
/// every other section starts.
pub struct Parser {
    original: Bytes,
    bytes: Bytes,
}

impl Parser {
    pub fn new(data: &[u8]) -> Self {
        let original = Bytes::copy_from_slice(data);
        Self {
            bytes: original.clone(),
            original,
        }
    }

    fn offset(&self) -> usize {
        self.original.len() - self.bytes.remaining()
    }

    fn parse_constant_pool(&mut self) -> Result<ConstantPool> {
        let length = self.bytes.try_get_u16()?;
        if length == 0 {
            return Err(anyhow!("constant pool count must be at least 1"));
        }

        let mut pool = ConstantPool::new();

        while pool.count() < length {
            let tag = ConstantTag::from_tag(self.bytes.try_get_u8()?)?;
            let entry = match tag {
                ConstantTag::Utf8 => {
                    let length = self.bytes.try_get_u16()? as usize;
                    if self.bytes.remaining() < length {
                        return Err(anyhow!("out of bytes"));
                    }

                    let raw = self.bytes.split_to(length);
                    ConstantEntry::Utf8(String::from_utf8_lossy(&raw).into_owned())
                }
                ConstantTag::Integer => ConstantEntry::Integer(self.bytes.try_get_u32()?),
                ConstantTag::Float => ConstantEntry::Float(self.bytes.try_get_u32()?),
                ConstantTag::Long => ConstantEntry::Long(self.bytes.try_get_u64()?),
                ConstantTag::Double => ConstantEntry::Double(self.bytes.try_get_u64()?),
                ConstantTag::Class => ConstantEntry::Class(self.bytes.try_get_u16()?),
                ConstantTag::String => ConstantEntry::String(self.bytes.try_get_u16()?),
                ConstantTag::Field => ConstantEntry::Field(self.parse_member()?),
                ConstantTag::Method => ConstantEntry::Method(self.parse_member()?),
                ConstantTag::InterfaceMethod => {
                    ConstantEntry::InterfaceMethod(self.parse_member()?)
                }
                ConstantTag::NameAndType => ConstantEntry::NameAndType(NameAndTypeEntry {
                    name: self.bytes.try_get_u16()?,
                    descriptor: self.bytes.try_get_u16()?,
                }),
                ConstantTag::MethodHandle => {
                    ConstantEntry::MethodHandle(self.bytes.try_get_u8()?, self.bytes.try_get_u16()?)
                }
                ConstantTag::MethodType => ConstantEntry::MethodType(self.bytes.try_get_u16()?),
                ConstantTag::Dynamic => ConstantEntry::Dynamic(self.parse_dynamic()?),
                ConstantTag::InvokeDynamic => {
                    ConstantEntry::InvokeDynamic(self.parse_dynamic()?)
                }
                ConstantTag::Module => ConstantEntry::Module(self.bytes.try_get_u16()?),
                ConstantTag::Package => ConstantEntry::Package(self.bytes.try_get_u16()?),
            };

            pool.insert(entry);
        }

        // A trailing Long or Double would claim a slot past the declared count
        if pool.count() != length {
            return Err(anyhow!(
                "constant pool overruns its count ({} > {})",
                pool.count(),
                length
            ));
        }

        Ok(pool)
    }

    fn parse_member(&mut self) -> Result<MemberEntry> {
        Ok(MemberEntry {
            class: self.bytes.try_get_u16()?,
            name_and_type: self.bytes.try_get_u16()?,
        })
    }

    fn parse_dynamic(&mut self) -> Result<DynamicEntry> {
        Ok(DynamicEntry {
            bootstrap_method: self.bytes.try_get_u16()?,
            name_and_type: self.bytes.try_get_u16()?,
        })
    }

    fn skip_attributes(&mut self) -> Result<()> {
        let length = self.bytes.try_get_u16()?;
        for _ in 0..length {
            self.bytes.try_skip(2)?;
            let attr_length = self.bytes.try_get_u32()? as usize;
            self.bytes.try_skip(attr_length)?;
        }

        Ok(())
    }

    fn skip_interfaces(&mut self) -> Result<()> {
        let length = self.bytes.try_get_u16()? as usize;
        self.bytes.try_skip(length * 2)
    }

    fn skip_fields(&mut self) -> Result<()> {
        let length = self.bytes.try_get_u16()?;
        for _ in 0..length {
            // access_flags, name_index, descriptor_index
            self.bytes.try_skip(6)?;
            self.skip_attributes()?;
        }

        Ok(())
    }

    fn parse_code(&mut self, method_start: usize, pool: &ConstantPool) -> Result<CodeLayout> {
        let max_stack = self.bytes.try_get_u16()?;
        let max_locals = self.bytes.try_get_u16()?;
        let code_length = self.bytes.try_get_u32()? as usize;
        let code_offset = self.offset() - method_start;
        self.bytes.try_skip(code_length)?;

        let exception_table_offset = self.offset() - method_start;
        let exception_table_length = self.bytes.try_get_u16()?;
        self.bytes
            .try_skip(exception_table_length as usize * 8)?;

        let mut line_numbers = Vec::new();
        let attribute_count = self.bytes.try_get_u16()?;
        for _ in 0..attribute_count {
            let name = pool.utf8(self.bytes.try_get_u16()?)?;
            let length = self.bytes.try_get_u32()? as usize;

            if name == LINE_NUMBER_TABLE_ATTRIBUTE {
                let count = self.bytes.try_get_u16()?;
                if length != 2 + count as usize * 4 {
                    return Err(anyhow!("malformed LineNumberTable"));
                }

                for _ in 0..count {
                    line_numbers.push(LineNumber {
                        start_pc: self.bytes.try_get_u16()?,
                        line: self.bytes.try_get_u16()?,
                    });
                }
            } else {
                self.bytes.try_skip(length)?;
            }
        }

        Ok(CodeLayout {
            max_stack,
            max_locals,
            code_offset,
            code_length,
            exception_table_offset,
            exception_table_length,
            line_numbers,
        })
    }

    fn parse_methods(&mut self, pool: &ConstantPool) -> Result<Vec<MethodInfo>> {
        let length = self.bytes.try_get_u16()?;
        let mut methods = Vec::with_capacity(length.into());

        for _ in 0..length {
            let offset = self.offset();
            let flags = MethodAccessFlags::from_bits_truncate(self.bytes.try_get_u16()?);
            let name = pool.utf8(self.bytes.try_get_u16()?)?.to_string();
            let descriptor = pool.utf8(self.bytes.try_get_u16()?)?.to_string();

            let mut code = None;
            let attribute_count = self.bytes.try_get_u16()?;
            for _ in 0..attribute_count {
                let attribute_name = pool.utf8(self.bytes.try_get_u16()?)?;
                let attribute_length = self.bytes.try_get_u32()? as usize;

                if attribute_name == CODE_ATTRIBUTE && code.is_none() {
                    let body_start = self.offset();
                    let layout = self.parse_code(offset, pool)?;

                    // Format checking: the attribute length must cover exactly what we read
                    if self.offset() - body_start != attribute_length {
                        return Err(anyhow!(
                            "Code attribute of {} declares {} bytes, contains {}",
                            name,
                            attribute_length,
                            self.offset() - body_start
                        ));
                    }

                    code = Some(layout);
                } else {
                    self.bytes.try_skip(attribute_length)?;
                }
            }

            trace!("method {}{} at {}..{}", name, descriptor, offset, self.offset());

            methods.push(MethodInfo {
                flags,
                name,
                descriptor,
                offset,
                length: self.offset() - offset,
                code,
            });
        }

        Ok(methods)
    }

    pub fn parse(&mut self) -> Result<ClassInfo> {
        let magic = self.bytes.try_get_u32()?;

        // Format checking: The first four bytes must contain the right magic number
        if magic != MAGIC {
            return Err(anyhow!("invalid magic value '{:#x}'", magic));
        }

        let minor_version = self.bytes.try_get_u16()?;
        let major_version = self.bytes.try_get_u16()?;

        let mut layout = Layout {
            pool_start: self.offset(),
            ..Layout::default()
        };

        let constant_pool = self.parse_constant_pool()?;
        constant_pool.perform_format_checking()?;
        layout.intermediate_start = self.offset();

        let access_flags = ClassFileAccessFlags::from_bits_truncate(self.bytes.try_get_u16()?);
        let this_class = self.bytes.try_get_u16()?;
        let super_class = self.bytes.try_get_u16()?;

        self.skip_interfaces()?;
        layout.fields_start = self.offset();
        self.skip_fields()?;
        layout.methods_start = self.offset();
        let methods = self.parse_methods(&constant_pool)?;
        layout.attributes_start = self.offset();
        self.skip_attributes()?;

        // Format checking: The class file must not be truncated or have extra bytes at the end
        if !self.bytes.is_empty() {
            return Err(anyhow!("classfile has extra bytes at the end"));
        }

        let class = ClassInfo {
            bytes: self.original.clone(),
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            layout,
            methods,
        };

        // Format checking: this_class must name a class
        class.name()?;

        Ok(class)
    }
}
