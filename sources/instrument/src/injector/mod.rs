//! Inserts code into a method body while keeping every branch offset, switch
//! alignment and exception range pointing where it did before.

mod change;
pub mod crossing;

use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};
use parse::attributes::ExceptionEntry;
use parse::classfile::{ClassInfo, CodeLayout};
use parse::constants::MAX_CODE_LENGTH;
use support::bytes_ext::ByteSlice;
use tracing::{debug, trace, warn};

use crate::buffer::{BufferPool, PooledBuf};
use crate::bytecode::{self, instruction_length, switch_length};
use crate::error::{InstrumentError, InstrumentResult};
use crate::internal;
use crate::opcode::{self, GOTO_W, LOOKUPSWITCH, TABLESWITCH};

use self::change::Change;
pub use self::crossing::{Binding, Relocation};

/// Operand stack slots every rewritten method gets on top of its own needs.
pub const STACK_INCREMENT: u16 = 2;

/// Scratch capacity reserved per byte of original code.
const SCRATCH_FACTOR: usize = 8;

/// Code to insert before the instruction at `bci` of the original method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertionPoint {
    pub bci: usize,
    pub code: Vec<u8>,
    pub binding: Binding,
}

impl InsertionPoint {
    pub fn following(bci: usize, code: impl Into<Vec<u8>>) -> Self {
        Self {
            bci,
            code: code.into(),
            binding: Binding::Following,
        }
    }

    pub fn previous(bci: usize, code: impl Into<Vec<u8>>) -> Self {
        Self {
            bci,
            code: code.into(),
            binding: Binding::Previous,
        }
    }
}

/// One method body being rewritten. Created from the method's original
/// method_info, edited through [`Injector::apply`] and friends, and packed
/// back into a method_info by [`Injector::finish`].
pub struct Injector<'a> {
    method: String,
    method_info: &'a [u8],
    layout: &'a CodeLayout,
    code: PooledBuf<'a>,
    exception_table: Vec<ExceptionEntry>,
    pub max_stack: u16,
    pub max_locals: u16,
    changes: Vec<Change>,
    /// Positions of insertion points not applied yet.
    tracked: Vec<usize>,
    /// Tail of a switch lost when its padding shrinks.
    overwritten: [u8; 3],
    modified: bool,
}

impl<'a> Injector<'a> {
    pub fn new(class: &'a ClassInfo, index: usize, buffers: &'a BufferPool) -> InstrumentResult<Self> {
        let method = class.method(index)?;
        let layout = class.code_layout(index)?;
        let method_info = class.method_info_bytes(index)?;
        let attribute = class.code_attribute(index)?;

        let mut code = buffers.checkout(attribute.code.len() * SCRATCH_FACTOR);
        code.extend_from_slice(&attribute.code);

        Ok(Self {
            method: method.qualified(class.name()?),
            method_info,
            layout,
            code,
            exception_table: attribute.exception_table,
            max_stack: attribute.max_stack,
            max_locals: attribute.max_locals,
            changes: Vec::new(),
            tracked: Vec::new(),
            overwritten: [0; 3],
            modified: false,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn original_length(&self) -> usize {
        self.layout.code_length
    }

    pub fn exception_table(&self) -> &[ExceptionEntry] {
        &self.exception_table
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Applies insertion points given against the original code, in
    /// ascending order and stably for equal positions. Points still pending
    /// follow the code as it moves. Returns how many were applied; points
    /// that would push the code past its maximum length are dropped.
    pub fn apply(&mut self, points: &[InsertionPoint]) -> InstrumentResult<usize> {
        let mut order = (0..points.len()).collect::<Vec<_>>();
        order.sort_by_key(|&i| points[i].bci);

        self.tracked = order.iter().map(|&i| points[i].bci).collect();

        let mut applied = 0;
        for (slot, &index) in order.iter().enumerate() {
            let point = &points[index];
            let length = self.code.len() + point.code.len();

            if length > MAX_CODE_LENGTH {
                warn!(
                    "{}: code would grow to {} bytes, dropping {} insertion points",
                    self.method,
                    length,
                    order.len() - slot
                );
                break;
            }

            let at = self.tracked[slot];
            self.inject(&point.code, at, point.binding)?;
            applied += 1;
        }

        self.tracked.clear();
        Ok(applied)
    }

    /// Inserts `bytes` before the instruction currently at `at`.
    pub fn inject(&mut self, bytes: &[u8], at: usize, binding: Binding) -> InstrumentResult<()> {
        if at > self.code.len() {
            return Err(internal!(
                "{}: insertion at {} past the end of {} bytes",
                self.method,
                at,
                self.code.len()
            ));
        }

        trace!("{}: injecting {} bytes at {}", self.method, bytes.len(), at);

        self.relocate(at, 0, bytes.len() as i32, Relocation::Inject(binding))?;
        self.code[at..at + bytes.len()].copy_from_slice(bytes);
        self.handle_changes()?;
        self.modified = true;

        Ok(())
    }

    /// Adds code after the last instruction. Nothing jumps there unless an
    /// exception entry is added for it.
    pub fn append(&mut self, bytes: &[u8]) -> InstrumentResult<()> {
        let length = self.code.len() + bytes.len();
        if length > MAX_CODE_LENGTH {
            return Err(InstrumentError::CodeTooLarge {
                method: self.method.clone(),
                length,
            });
        }

        self.code.extend_from_slice(bytes);
        self.modified = true;
        Ok(())
    }

    pub fn add_exception_entry(&mut self, entry: ExceptionEntry) {
        self.exception_table.push(entry);
    }

    /// Makes room for `delta` bytes after the `length` byte instruction at
    /// `at` (or removes `-delta` from its end) and fixes up everything that
    /// refers to positions past it.
    fn relocate(
        &mut self,
        at: usize,
        length: usize,
        delta: i32,
        mode: Relocation,
    ) -> InstrumentResult<()> {
        self.change_jumps(at, delta, mode)?;

        let next = at + length;
        if delta < 0 {
            let shrink = delta.unsigned_abs() as usize;
            if shrink > self.overwritten.len() || shrink > length {
                return Err(internal!(
                    "{}: cannot shrink instruction at {} by {}",
                    self.method,
                    at,
                    shrink
                ));
            }

            self.overwritten[..shrink].copy_from_slice(&self.code[next - shrink..next]);
            self.code.drain(next - shrink..next);
        } else {
            let grow = delta as usize;
            self.code
                .splice(next..next, std::iter::repeat(opcode::NOP).take(grow));
        }

        self.update_exception_table(at, delta);

        for change in &mut self.changes {
            if mode.moves(change.bci(), at) {
                change.relocate(delta);
            }
        }

        for bci in &mut self.tracked {
            if mode.moves(*bci, at) {
                *bci = (*bci as i64 + delta as i64) as usize;
            }
        }

        Ok(())
    }

    fn update_exception_table(&mut self, at: usize, delta: i32) {
        let shift = |pc: u16| (pc as i32 + delta) as u16;

        for entry in &mut self.exception_table {
            if entry.start_pc as usize > at {
                entry.start_pc = shift(entry.start_pc);
                entry.end_pc = shift(entry.end_pc);
            } else if at < entry.end_pc as usize {
                entry.end_pc = shift(entry.end_pc);
            }

            if entry.handler_pc as usize > at {
                entry.handler_pc = shift(entry.handler_pc);
            }
        }
    }

    fn recorded_padding(&self, bci: usize) -> Option<usize> {
        self.changes.iter().find_map(|c| match *c {
            Change::SwitchPadding { bci: b, padding, .. } if b == bci => Some(padding),
            _ => None,
        })
    }

    fn pending_widen(&self, bci: usize) -> Option<usize> {
        self.changes
            .iter()
            .position(|c| matches!(*c, Change::Widen { bci: b, .. } if b == bci))
    }

    /// Instruction length that honours switches still laid out with their
    /// old padding.
    fn instruction_length_at(&self, bci: usize) -> InstrumentResult<usize> {
        match self.recorded_padding(bci) {
            Some(padding) => switch_length(&self.code, bci, padding),
            None => instruction_length(&self.code, bci),
        }
    }

    fn change_jumps(&mut self, at: usize, delta: i32, mode: Relocation) -> InstrumentResult<()> {
        let mut bci = 0;

        while bci < self.code.len() {
            let opcode = self.code[bci];

            match opcode {
                op if opcode::is_short_branch(op) => {
                    self.change_jump(bci, bci + 1, true, at, delta, mode)?;
                }
                opcode::GOTO_W | opcode::JSR_W => {
                    self.change_jump(bci, bci + 1, false, at, delta, mode)?;
                }
                TABLESWITCH | LOOKUPSWITCH => {
                    let recorded = self.recorded_padding(bci);
                    let padding = recorded.unwrap_or_else(|| bytecode::padding(bci));

                    if recorded.is_none() && mode.moves(bci, at) {
                        let moved = (bci as i64 + delta as i64) as usize;
                        if bytecode::padding(moved) != padding {
                            self.changes.push(Change::SwitchPadding {
                                bci,
                                padding,
                                lookup: opcode == LOOKUPSWITCH,
                            });
                        }
                    }

                    let base = bci + 1 + padding;
                    self.change_jump(bci, base, false, at, delta, mode)?;

                    let end = if opcode == LOOKUPSWITCH {
                        let pairs = self.code.i32_at(base + 4)?.max(0) as usize;
                        for pair in 0..pairs {
                            self.change_jump(bci, base + 12 + 8 * pair, false, at, delta, mode)?;
                        }
                        base + 8 + 8 * pairs
                    } else {
                        let low = self.code.i32_at(base + 4)? as i64;
                        let high = self.code.i32_at(base + 8)? as i64;
                        let cases = (high - low + 1).max(0) as usize;
                        for case in 0..cases {
                            self.change_jump(bci, base + 12 + 4 * case, false, at, delta, mode)?;
                        }
                        base + 12 + 4 * cases
                    };

                    bci = end;
                    continue;
                }
                _ => {}
            }

            bci += instruction_length(&self.code, bci)?;
        }

        Ok(())
    }

    fn change_jump(
        &mut self,
        bci: usize,
        operand: usize,
        short: bool,
        at: usize,
        delta: i32,
        mode: Relocation,
    ) -> InstrumentResult<()> {
        let pending = if short { self.pending_widen(bci) } else { None };

        let offset = match pending {
            Some(index) => match self.changes[index] {
                Change::Widen { offset, .. } => offset,
                Change::SwitchPadding { .. } => {
                    return Err(internal!("widen lookup at {} found a switch", bci))
                }
            },
            None if short => self.code.i16_at(operand)? as i32,
            None => self.code.i32_at(operand)?,
        };

        if !mode.crosses(bci, bci as i64 + offset as i64, at) {
            return Ok(());
        }

        let adjusted = if offset > 0 {
            offset + delta
        } else {
            offset - delta
        };

        match pending {
            Some(index) => {
                if let Change::Widen { offset, .. } = &mut self.changes[index] {
                    *offset = adjusted;
                }
            }
            None if short => match i16::try_from(adjusted) {
                Ok(value) => self.code.put_i16_at(operand, value)?,
                Err(_) => {
                    debug!("{}: branch at {} needs widening", self.method, bci);
                    self.changes.push(Change::Widen {
                        bci,
                        offset: adjusted,
                    });
                }
            },
            None => self.code.put_i32_at(operand, adjusted)?,
        }

        Ok(())
    }

    /// Works the pending changes off as a stack. A change stays on the
    /// stack while it is handled, so relocations it causes keep it current.
    fn handle_changes(&mut self) -> InstrumentResult<()> {
        while let Some(&change) = self.changes.last() {
            let index = self.changes.len() - 1;

            match change {
                Change::Widen { bci, .. } => self.widen_branch(index, bci)?,
                Change::SwitchPadding {
                    bci,
                    padding,
                    lookup,
                } => self.realign_switch(bci, padding, lookup)?,
            }

            self.changes.remove(index);
        }

        Ok(())
    }

    fn widen_branch(&mut self, index: usize, bci: usize) -> InstrumentResult<()> {
        // Already rewritten through an earlier change for the same branch
        if self.instruction_length_at(bci)? != 3 {
            return Ok(());
        }

        let opcode = self.code[bci];
        let growth = if opcode::widened(opcode).is_some() {
            2
        } else if opcode::is_conditional(opcode) {
            5
        } else {
            return Err(internal!("cannot widen opcode {:#04x} at {}", opcode, bci));
        };

        self.relocate(bci, 3, growth, Relocation::Widen)?;

        let offset = match self.changes[index] {
            Change::Widen { offset, .. } => offset,
            Change::SwitchPadding { .. } => {
                return Err(internal!("change at {} is no longer a widening", bci))
            }
        };

        match (opcode::widened(opcode), opcode::negate(opcode)) {
            (Some(wide), _) => {
                self.code[bci] = wide;
                self.code.put_i32_at(bci + 1, offset)?;
            }
            (None, Some(negated)) => {
                // if<!cond> over the goto_w, then goto_w to the old target
                self.code[bci] = negated;
                self.code.put_i16_at(bci + 1, 8)?;
                self.code[bci + 3] = GOTO_W;
                self.code.put_i32_at(bci + 4, offset - 3)?;
            }
            (None, None) => {
                return Err(anyhow!("unreachable widening of {:#04x}", opcode).into());
            }
        }

        Ok(())
    }

    fn realign_switch(
        &mut self,
        bci: usize,
        old_padding: usize,
        lookup: bool,
    ) -> InstrumentResult<()> {
        let length = self.instruction_length_at(bci)?;
        let new_padding = bytecode::padding(bci);
        let padding_delta = new_padding as i32 - old_padding as i32;

        if padding_delta == 0 {
            return Ok(());
        }

        let base = bci + 1 + old_padding;
        let body = length - 1 - old_padding;
        let destination = bci + 1 + new_padding;

        trace!(
            "{}: realigning {} at {} from {} to {} padding bytes",
            self.method,
            if lookup { "lookupswitch" } else { "tableswitch" },
            bci,
            old_padding,
            new_padding
        );

        self.relocate(bci, length, padding_delta, Relocation::Widen)?;

        if padding_delta < 0 {
            let shrink = padding_delta.unsigned_abs() as usize;
            self.code
                .copy_within(base..base + body - shrink, destination);

            let tail = destination + body - shrink;
            self.code[tail..tail + shrink].copy_from_slice(&self.overwritten[..shrink]);
        } else {
            self.code.copy_within(base..base + body, destination);
        }

        Ok(())
    }

    /// Packs the rewritten body back into a complete method_info, keeping
    /// every attribute outside the code and exception table as it was.
    pub fn finish(self) -> InstrumentResult<Bytes> {
        let length = self.code.len();
        if length > MAX_CODE_LENGTH {
            return Err(InstrumentError::CodeTooLarge {
                method: self.method,
                length,
            });
        }

        if self.exception_table.len() > u16::MAX as usize {
            return Err(internal!("{}: exception table overflow", self.method));
        }

        // attribute_length, max_stack, max_locals, code_length
        let header = self
            .layout
            .code_offset
            .checked_sub(12)
            .ok_or_else(|| internal!("{}: code offset inside method header", self.method))?;

        let rest = self.layout.exception_table_offset
            + 2
            + self.layout.exception_table_length as usize * ExceptionEntry::SIZE;

        if rest > self.method_info.len() {
            return Err(internal!("{}: exception table past method_info", self.method));
        }

        let growth = (length as i64 - self.layout.code_length as i64)
            + (self.exception_table.len() as i64 - self.layout.exception_table_length as i64)
                * ExceptionEntry::SIZE as i64;

        let attribute_length = self.method_info.u32_at(header)? as i64 + growth;

        let mut out = BytesMut::with_capacity((self.method_info.len() as i64 + growth) as usize);
        out.put_slice(&self.method_info[..header]);
        out.put_u32(attribute_length as u32);
        out.put_u16(self.max_stack.saturating_add(STACK_INCREMENT));
        out.put_u16(self.max_locals);
        out.put_u32(length as u32);
        out.put_slice(&self.code);

        out.put_u16(self.exception_table.len() as u16);
        for entry in &self.exception_table {
            out.put_u16(entry.start_pc);
            out.put_u16(entry.end_pc);
            out.put_u16(entry.handler_pc);
            out.put_u16(entry.catch_type);
        }

        out.put_slice(&self.method_info[rest..]);

        Ok(out.freeze())
    }
}
