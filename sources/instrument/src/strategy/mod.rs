//! Where instrumentation goes in a method, and what is inserted there.
//! Strategies look at the original code and answer with insertion points;
//! the [`Injector`] does the rest.

pub mod allocation;
pub mod code_region;
pub mod entry_exit;
pub mod profile_point;
pub mod reflect;
pub mod servlet;

use bytes::Bytes;
use parse::classfile::{ClassInfo, MethodInfo};

use crate::buffer::BufferPool;
use crate::bytecode::{self, Instruction};
use crate::error::{InstrumentError, InstrumentResult};
use crate::injector::{InsertionPoint, Injector};
use crate::opcode::{INVOKESTATIC, NOP, SIPUSH};

pub use self::allocation::{ClassIdResolver, ObjectAllocation, SequentialClassIds};
pub use self::code_region::CodeRegion;
pub use self::entry_exit::{EntryExit, EntryExitCalls, ParameterCalls};
pub use self::profile_point::{ProfilePoint, ProfilePoints};
pub use self::reflect::ReflectInvoke;
pub use self::servlet::ServletDoMethod;

/// The original code of the method being instrumented.
pub struct MethodContext<'a> {
    pub class: &'a ClassInfo,
    pub index: usize,
    pub method: &'a MethodInfo,
    pub code: &'a [u8],
    pub instructions: Vec<Instruction>,
}

impl<'a> MethodContext<'a> {
    pub fn new(class: &'a ClassInfo, index: usize) -> InstrumentResult<Self> {
        let method = class.method(index)?;
        let code = class.code(index)?;

        Ok(Self {
            class,
            index,
            method,
            code,
            instructions: bytecode::scan(code)?,
        })
    }

    pub fn qualified_name(&self) -> String {
        let class = self.class.name().unwrap_or("<unnamed>");
        self.method.qualified(class)
    }

    pub fn is_boundary(&self, bci: usize) -> bool {
        self.instructions
            .binary_search_by_key(&bci, |i| i.bci)
            .is_ok()
    }

    pub fn instruction_at(&self, bci: usize) -> Option<&Instruction> {
        self.instructions
            .binary_search_by_key(&bci, |i| i.bci)
            .ok()
            .map(|index| &self.instructions[index])
    }

    pub fn skipped(&self, reason: impl Into<String>) -> InstrumentError {
        InstrumentError::Skipped {
            method: self.qualified_name(),
            reason: reason.into(),
        }
    }
}

pub trait InjectionStrategy {
    fn insertion_points(&mut self, method: &MethodContext) -> InstrumentResult<Vec<InsertionPoint>>;

    /// Runs once the insertion points are applied, for appended code and
    /// frame size adjustments.
    fn post_process(&mut self, _injector: &mut Injector) -> InstrumentResult<()> {
        Ok(())
    }

    /// Anything odd met while planning, worth a copy of the class on disk.
    fn anomalies(&self) -> &[String] {
        &[]
    }
}

/// Instruments one method. `None` when the strategy found nothing to do.
pub fn rewrite_method(
    class: &ClassInfo,
    index: usize,
    buffers: &BufferPool,
    strategy: &mut dyn InjectionStrategy,
) -> InstrumentResult<Option<Bytes>> {
    let context = MethodContext::new(class, index)?;
    let points = strategy.insertion_points(&context)?;

    let mut injector = Injector::new(class, index, buffers)?;
    injector.apply(&points)?;
    strategy.post_process(&mut injector)?;

    if !injector.is_modified() {
        return Ok(None);
    }

    injector.finish().map(Some)
}

/// `sipush <argument>; invokestatic <method>; nop; nop`
pub fn call_with_id(argument: u16, method: u16) -> [u8; 8] {
    let [a_hi, a_lo] = argument.to_be_bytes();
    let [m_hi, m_lo] = method.to_be_bytes();
    [SIPUSH, a_hi, a_lo, INVOKESTATIC, m_hi, m_lo, NOP, NOP]
}

/// `<load>; invokestatic <method>`
pub fn call_with_local(load: u8, method: u16) -> [u8; 4] {
    let [hi, lo] = method.to_be_bytes();
    [load, INVOKESTATIC, hi, lo]
}
