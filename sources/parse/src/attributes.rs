use anyhow::{anyhow, Result};
use bytes::{Buf, Bytes};
use support::bytes_ext::SafeBuf;

use crate::classfile::CodeLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// Zero catches everything.
    pub catch_type: u16,
}

impl ExceptionEntry {
    pub const SIZE: usize = 8;

    pub fn parse(bytes: &mut impl Buf) -> Result<Self> {
        Ok(ExceptionEntry {
            start_pc: bytes.try_get_u16()?,
            end_pc: bytes.try_get_u16()?,
            handler_pc: bytes.try_get_u16()?,
            catch_type: bytes.try_get_u16()?,
        })
    }
}

/// The decoded contents of one method's Code attribute.
#[derive(Debug, Clone)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Bytes,
    pub exception_table: Vec<ExceptionEntry>,
}

impl CodeAttribute {
    /// Reads the attribute out of a complete method_info, using the offsets
    /// recorded by the layout parser.
    pub fn decode(method_info: &[u8], layout: &CodeLayout) -> Result<Self> {
        let code_end = layout.code_offset + layout.code_length;
        if code_end > method_info.len() || layout.code_offset < 8 {
            return Err(anyhow!(
                "code range {}..{} outside method_info ({} bytes)",
                layout.code_offset,
                code_end,
                method_info.len()
            ));
        }

        let mut header = Bytes::copy_from_slice(&method_info[layout.code_offset - 8..]);
        let max_stack = header.try_get_u16()?;
        let max_locals = header.try_get_u16()?;
        let code_length = header.try_get_u32()? as usize;

        if code_length != layout.code_length {
            return Err(anyhow!(
                "code_length {} disagrees with layout ({})",
                code_length,
                layout.code_length
            ));
        }

        let code = Bytes::copy_from_slice(&method_info[layout.code_offset..code_end]);

        let mut table = Bytes::copy_from_slice(&method_info[layout.exception_table_offset..]);
        let length = table.try_get_u16()?;
        let mut exception_table = Vec::with_capacity(length.into());
        for _ in 0..length {
            exception_table.push(ExceptionEntry::parse(&mut table)?);
        }

        Ok(CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table,
        })
    }
}
