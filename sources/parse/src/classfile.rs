use std::ops::Range;

use anyhow::{anyhow, Result};
use bytes::Bytes;

use crate::attributes::{CodeAttribute, ExceptionEntry};
use crate::flags::{ClassFileAccessFlags, MethodAccessFlags};
use crate::parser::Parser;
use crate::pool::{ConstantPool, MemberRef};

/// Offsets of the top level sections, relative to the start of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Layout {
    /// Offset of the `constant_pool_count` u2.
    pub pool_start: usize,
    /// Offset of `access_flags`, the first byte after the pool.
    pub intermediate_start: usize,
    /// Offset of `fields_count`.
    pub fields_start: usize,
    /// Offset of `methods_count`.
    pub methods_start: usize,
    /// Offset of the class `attributes_count`.
    pub attributes_start: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumber {
    pub start_pc: u16,
    pub line: u16,
}

/// Where a method's Code attribute lives, relative to the start of the
/// method_info structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeLayout {
    pub max_stack: u16,
    pub max_locals: u16,
    /// Offset of the first bytecode.
    pub code_offset: usize,
    pub code_length: usize,
    /// Offset of `exception_table_length`.
    pub exception_table_offset: usize,
    pub exception_table_length: u16,
    pub line_numbers: Vec<LineNumber>,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub flags: MethodAccessFlags,
    pub name: String,
    pub descriptor: String,
    /// Offset of the method_info in the class file.
    pub offset: usize,
    pub length: usize,
    pub code: Option<CodeLayout>,
}

impl MethodInfo {
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodAccessFlags::STATIC)
    }

    pub fn qualified(&self, class_name: &str) -> String {
        format!("{}.{}{}", class_name, self.name, self.descriptor)
    }
}

/// The parsed binary layout of one class file. The original bytes are kept
/// untouched; everything else is offsets into them.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub(crate) bytes: Bytes,
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: ClassFileAccessFlags,
    pub this_class: u16,
    pub super_class: u16,
    pub layout: Layout,
    pub methods: Vec<MethodInfo>,
}

impl ClassInfo {
    pub fn parse(data: &[u8]) -> Result<Self> {
        Parser::new(data).parse()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn name(&self) -> Result<&str> {
        self.constant_pool.class_name(self.this_class)
    }

    pub fn super_name(&self) -> Result<Option<&str>> {
        if self.super_class == 0 {
            return Ok(None);
        }

        Ok(Some(self.constant_pool.class_name(self.super_class)?))
    }

    pub fn pool_count(&self) -> u16 {
        self.constant_pool.count()
    }

    pub fn method(&self, index: usize) -> Result<&MethodInfo> {
        self.methods
            .get(index)
            .ok_or_else(|| anyhow!("method index {} out of range ({})", index, self.methods.len()))
    }

    pub fn method_index(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.methods
            .iter()
            .position(|m| m.name == name && m.descriptor == descriptor)
    }

    pub fn method_info_bytes(&self, index: usize) -> Result<&[u8]> {
        let method = self.method(index)?;
        Ok(&self.bytes[method.offset..method.offset + method.length])
    }

    pub fn code_layout(&self, index: usize) -> Result<&CodeLayout> {
        let method = self.method(index)?;
        method
            .code
            .as_ref()
            .ok_or_else(|| anyhow!("method {} has no code", method.name))
    }

    pub fn code(&self, index: usize) -> Result<&[u8]> {
        let method = self.method(index)?;
        let code = self.code_layout(index)?;
        let start = method.offset + code.code_offset;

        Ok(&self.bytes[start..start + code.code_length])
    }

    pub fn code_attribute(&self, index: usize) -> Result<CodeAttribute> {
        CodeAttribute::decode(self.method_info_bytes(index)?, self.code_layout(index)?)
    }

    pub fn exception_table(&self, index: usize) -> Result<Vec<ExceptionEntry>> {
        Ok(self.code_attribute(index)?.exception_table)
    }

    pub fn member_ref(&self, index: u16) -> Result<MemberRef<'_>> {
        self.constant_pool.member_ref(index)
    }

    pub fn class_name(&self, index: u16) -> Result<&str> {
        self.constant_pool.class_name(index)
    }

    pub fn line_table(&self, index: usize) -> Result<&[LineNumber]> {
        Ok(&self.code_layout(index)?.line_numbers)
    }

    /// The bytecode range covering source lines `first..=last`. The end is the
    /// first instruction belonging to a line outside the range, or the end of
    /// the code.
    pub fn bci_range_for_lines(&self, index: usize, first: u16, last: u16) -> Result<Range<usize>> {
        let code = self.code_layout(index)?;
        let mut lines = code.line_numbers.clone();
        lines.sort_by_key(|l| l.start_pc);

        let start = lines
            .iter()
            .filter(|l| l.line >= first && l.line <= last)
            .map(|l| l.start_pc as usize)
            .min()
            .ok_or_else(|| anyhow!("no bytecode for lines {}..={}", first, last))?;

        let end = lines
            .iter()
            .filter(|l| l.start_pc as usize > start && (l.line < first || l.line > last))
            .map(|l| l.start_pc as usize)
            .min()
            .unwrap_or(code.code_length);

        Ok(start..end)
    }
}
