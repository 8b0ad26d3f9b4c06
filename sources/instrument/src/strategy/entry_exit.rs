use parse::attributes::ExceptionEntry;
use support::descriptor::{BaseType, FieldType, MethodType};

use super::{call_with_id, InjectionStrategy, MethodContext, ProfilePoints};
use crate::cpool::repository::ADD_PARAMETER_OVERLOADS;
use crate::error::InstrumentResult;
use crate::injector::{InsertionPoint, Injector};
use crate::internal;
use crate::opcode::{
    self, ALOAD, ALOAD_0, ALOAD_1, ARETURN, ASTORE_1, ATHROW, DLOAD, DLOAD_0, DUP, FLOAD, FLOAD_0,
    ILOAD, ILOAD_0, INVOKESTATIC, LLOAD, LLOAD_0, NOP, SIPUSH, WIDE,
};

/// `addParameter(Object)`, last of the overloads.
const OBJECT_OVERLOAD: usize = ADD_PARAMETER_OVERLOADS - 1;

/// Pool indices of the runtime methods called on entry and exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryExitCalls {
    pub entry: u16,
    pub exit: u16,
}

/// Pool indices used to hand a marker method's arguments to the runtime,
/// and to report the object it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterCalls {
    /// One `addParameter` overload per entry of the repository's signatures.
    pub add_parameter: [u16; ADD_PARAMETER_OVERLOADS],
    pub exit_with_result: u16,
}

impl ParameterCalls {
    /// Loads every argument, `this` first unless the method is a
    /// constructor, each followed by its `addParameter` call. Padded with
    /// `nop` to a multiple of 4 bytes.
    fn capture(&self, method: &MethodContext) -> InstrumentResult<Vec<u8>> {
        let info = method.method;
        let descriptor = MethodType::parse(&info.descriptor)
            .map_err(|e| method.skipped(format!("unreadable descriptor: {}", e)))?;

        let mut code = Vec::new();
        let mut slot = 0;

        if !info.is_static() {
            if info.name != "<init>" {
                code.extend(load(ALOAD, slot)?);
                code.extend(invoke(self.add_parameter[OBJECT_OVERLOAD]));
            }
            slot += 1;
        }

        for parameter in &descriptor.parameters {
            let (opcode, overload) = overload(parameter)
                .ok_or_else(|| method.skipped(format!("no way to pass a {} argument", parameter)))?;

            code.extend(load(opcode, slot)?);
            code.extend(invoke(self.add_parameter[overload]));
            slot += parameter.slots();
        }

        while code.len() % 4 != 0 {
            code.push(NOP);
        }

        Ok(code)
    }

    /// `dup; sipush id; invokestatic exit; nop`
    fn exit_with_result(&self, method_id: u16) -> [u8; 8] {
        let [id_hi, id_lo] = method_id.to_be_bytes();
        let [hi, lo] = self.exit_with_result.to_be_bytes();
        [DUP, SIPUSH, id_hi, id_lo, INVOKESTATIC, hi, lo, NOP]
    }
}

/// The load instruction for a parameter and the `addParameter` overload
/// taking it.
fn overload(parameter: &FieldType) -> Option<(u8, usize)> {
    Some(match parameter {
        FieldType::Base(base) => match base {
            BaseType::Boolean => (ILOAD, 0),
            BaseType::Char => (ILOAD, 1),
            BaseType::Byte => (ILOAD, 2),
            BaseType::Short => (ILOAD, 3),
            BaseType::Int => (ILOAD, 4),
            BaseType::Long => (LLOAD, 5),
            BaseType::Float => (FLOAD, 6),
            BaseType::Double => (DLOAD, 7),
            BaseType::Void => return None,
        },
        FieldType::Object(_) | FieldType::Array(_) => (ALOAD, OBJECT_OVERLOAD),
    })
}

/// The shortest form of a local variable load.
fn load(opcode: u8, slot: usize) -> InstrumentResult<Vec<u8>> {
    let short = match opcode {
        ILOAD => ILOAD_0,
        LLOAD => LLOAD_0,
        FLOAD => FLOAD_0,
        DLOAD => DLOAD_0,
        ALOAD => ALOAD_0,
        _ => return Err(internal!("{:#04x} is not a load", opcode)),
    };

    Ok(match slot {
        0..=3 => vec![short + slot as u8],
        4..=0xff => vec![opcode, slot as u8],
        _ => {
            let [hi, lo] = u16::try_from(slot)
                .map_err(|_| internal!("local {} out of range", slot))?
                .to_be_bytes();
            vec![WIDE, opcode, hi, lo]
        }
    })
}

fn invoke(method: u16) -> [u8; 3] {
    let [hi, lo] = method.to_be_bytes();
    [INVOKESTATIC, hi, lo]
}

/// Reports entry to a method and every way out of it: each return, and an
/// exception escaping it through a catch-all handler appended to its code.
#[derive(Debug, Clone)]
pub struct EntryExit {
    method_id: u16,
    calls: EntryExitCalls,
    parameters: Option<ParameterCalls>,
    profile_points: Option<ProfilePoints>,
}

impl EntryExit {
    pub fn new(method_id: u16, calls: EntryExitCalls) -> Self {
        Self {
            method_id,
            calls,
            parameters: None,
            profile_points: None,
        }
    }

    /// Reports the method's arguments on entry and, for `areturn`, the
    /// returned object on exit.
    pub fn capturing_parameters(mut self, parameters: ParameterCalls) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_profile_points(mut self, profile_points: ProfilePoints) -> Self {
        if !profile_points.is_empty() {
            self.profile_points = Some(profile_points);
        }
        self
    }

    /// `astore_1; sipush id; invokestatic exit; aload_1; athrow`
    fn rethrow(&self) -> [u8; 9] {
        let [id_hi, id_lo] = self.method_id.to_be_bytes();
        let [hi, lo] = self.calls.exit.to_be_bytes();
        [ASTORE_1, SIPUSH, id_hi, id_lo, INVOKESTATIC, hi, lo, ALOAD_1, ATHROW]
    }
}

impl InjectionStrategy for EntryExit {
    fn insertion_points(&mut self, method: &MethodContext) -> InstrumentResult<Vec<InsertionPoint>> {
        let mut entry = match &self.parameters {
            Some(parameters) => parameters.capture(method)?,
            None => Vec::new(),
        };
        entry.extend(call_with_id(self.method_id, self.calls.entry));

        let mut points = vec![InsertionPoint::following(0, entry)];

        for instruction in &method.instructions {
            if !opcode::is_return(instruction.opcode) {
                continue;
            }

            let exit = match &self.parameters {
                Some(parameters) if instruction.opcode == ARETURN => {
                    parameters.exit_with_result(self.method_id)
                }
                _ => call_with_id(self.method_id, self.calls.exit),
            };
            points.push(InsertionPoint::following(instruction.bci, exit));
        }

        if let Some(profile_points) = &mut self.profile_points {
            points.extend(profile_points.insertion_points(method)?);
        }

        Ok(points)
    }

    fn post_process(&mut self, injector: &mut Injector) -> InstrumentResult<()> {
        let handler = injector.len() as u16;
        injector.append(&self.rethrow())?;
        injector.add_exception_entry(ExceptionEntry {
            start_pc: 0,
            end_pc: handler,
            handler_pc: handler,
            catch_type: 0,
        });

        injector.max_locals = injector.max_locals.max(2);
        injector.max_stack = injector.max_stack.saturating_add(1);

        if let Some(profile_points) = &mut self.profile_points {
            profile_points.post_process(injector)?;
        }

        Ok(())
    }
}
