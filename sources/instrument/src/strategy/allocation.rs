use std::collections::HashMap;

use support::bytes_ext::ByteSlice;
use support::descriptor::{BaseType, FieldType};
use tracing::{trace, warn};

use super::{InjectionStrategy, MethodContext, ProfilePoints};
use crate::config::InstrumentationFilter;
use crate::error::InstrumentResult;
use crate::injector::{InsertionPoint, Injector};
use crate::opcode::{
    self, ALOAD_0, ANEWARRAY, DUP, INVOKESPECIAL, INVOKESTATIC, MULTIANEWARRAY, NEW, NEWARRAY,
    NOP, SIPUSH,
};
use parse::constants::CONSTRUCTOR_NAME;

pub const OBJECT_CLASS: &str = "java/lang/Object";

/// Supplies the ids the runtime knows allocated classes by.
pub trait ClassIdResolver {
    /// The id for a class given in user form (`java.lang.String[]`), or
    /// `None` to leave its allocations untraced.
    fn class_id(&mut self, class_name: &str) -> Option<u16>;
}

/// Hands out ids in order of first sight, starting at 1. Id 0 stands for
/// allocations seen from inside `Object.<init>`.
#[derive(Debug)]
pub struct SequentialClassIds {
    ids: HashMap<String, u16>,
    next: u16,
}

impl SequentialClassIds {
    pub fn new() -> Self {
        Self {
            ids: HashMap::new(),
            next: 1,
        }
    }

    pub fn get(&self, class_name: &str) -> Option<u16> {
        self.ids.get(class_name).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl Default for SequentialClassIds {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassIdResolver for SequentialClassIds {
    fn class_id(&mut self, class_name: &str) -> Option<u16> {
        if let Some(id) = self.ids.get(class_name) {
            return Some(*id);
        }

        if self.next == u16::MAX {
            return None;
        }

        let id = self.next;
        self.next += 1;
        self.ids.insert(class_name.to_string(), id);
        Some(id)
    }
}

/// Reports every allocation site of a method to the runtime with the new
/// object and its class id. Objects are reported once their constructor has
/// returned; arrays right after they are created.
pub struct ObjectAllocation<'r> {
    trace: u16,
    filter: &'r InstrumentationFilter,
    resolver: &'r mut dyn ClassIdResolver,
    object_ctor: bool,
    profile_points: Option<ProfilePoints>,
    anomalies: Vec<String>,
}

impl<'r> ObjectAllocation<'r> {
    pub fn new(
        trace: u16,
        filter: &'r InstrumentationFilter,
        resolver: &'r mut dyn ClassIdResolver,
    ) -> Self {
        Self {
            trace,
            filter,
            resolver,
            object_ctor: false,
            profile_points: None,
            anomalies: Vec::new(),
        }
    }

    /// Instrument `java.lang.Object.<init>` itself, reporting `this`.
    pub fn tracking_object_ctor(mut self, track: bool) -> Self {
        self.object_ctor = track;
        self
    }

    pub fn with_profile_points(mut self, profile_points: ProfilePoints) -> Self {
        if !profile_points.is_empty() {
            self.profile_points = Some(profile_points);
        }
        self
    }

    /// `<head>; sipush id; invokestatic trace; nop`. The head is `dup` when
    /// the reference has to stay on the stack afterwards.
    fn packet(&self, head: u8, class_id: u16) -> [u8; 8] {
        let [id_hi, id_lo] = class_id.to_be_bytes();
        let [hi, lo] = self.trace.to_be_bytes();
        [head, SIPUSH, id_hi, id_lo, INVOKESTATIC, hi, lo, NOP]
    }

    fn resolve(&mut self, class: FieldType) -> Option<u16> {
        let name = class.user_form();
        if !self.filter.passes(&name) {
            trace!("allocation of {} filtered out", name);
            return None;
        }

        self.resolver.class_id(&name)
    }

    /// The instruction after the `<init>` call matching a `new` whose next
    /// instruction is at `after`. Allocations nested in the constructor
    /// arguments have their own `<init>` calls, which are skipped over.
    fn constructor_end(&self, method: &MethodContext, after: usize) -> InstrumentResult<Option<usize>> {
        let mut depth = 0usize;

        for instruction in method.instructions.iter().filter(|i| i.bci >= after) {
            match instruction.opcode {
                NEW => depth += 1,
                INVOKESPECIAL => {
                    let index = method.code.u16_at(instruction.bci + 1)?;
                    if method.class.member_ref(index)?.name != CONSTRUCTOR_NAME {
                        continue;
                    }

                    if depth == 0 {
                        return Ok(Some(instruction.next()));
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }

        Ok(None)
    }

    fn is_object_ctor(method: &MethodContext) -> bool {
        method.method.name == CONSTRUCTOR_NAME && method.class.name().ok() == Some(OBJECT_CLASS)
    }
}

impl InjectionStrategy for ObjectAllocation<'_> {
    fn insertion_points(&mut self, method: &MethodContext) -> InstrumentResult<Vec<InsertionPoint>> {
        if self.object_ctor && Self::is_object_ctor(method) {
            return Ok(vec![InsertionPoint::following(
                0,
                self.packet(ALOAD_0, 0),
            )]);
        }

        let mut points = Vec::new();

        for instruction in &method.instructions {
            let bci = instruction.bci;

            match instruction.opcode {
                NEW => {
                    let class = method.class.class_name(method.code.u16_at(bci + 1)?)?;
                    let Some(class_id) = self.resolve(FieldType::from_class_name(class)?) else {
                        continue;
                    };

                    let next = instruction.next();
                    let Some(end) = self.constructor_end(method, next)? else {
                        let anomaly = format!(
                            "{}: no constructor call for new {} at {}",
                            method.qualified_name(),
                            class,
                            bci
                        );
                        warn!("{}", anomaly);
                        self.anomalies.push(anomaly);
                        continue;
                    };

                    if method.code.get(next).copied().map_or(false, opcode::is_dup) {
                        points.push(InsertionPoint::previous(end, self.packet(DUP, class_id)));
                    } else {
                        // Keep a reference for the trace call to consume
                        points.push(InsertionPoint::previous(next, [DUP, NOP, NOP, NOP]));
                        points.push(InsertionPoint::previous(end, self.packet(NOP, class_id)));
                    }
                }
                ANEWARRAY => {
                    let component = method.class.class_name(method.code.u16_at(bci + 1)?)?;
                    let class = FieldType::from_class_name(component)?.array_of();
                    if let Some(class_id) = self.resolve(class) {
                        points.push(InsertionPoint::previous(
                            instruction.next(),
                            self.packet(DUP, class_id),
                        ));
                    }
                }
                MULTIANEWARRAY => {
                    let array = method.class.class_name(method.code.u16_at(bci + 1)?)?;
                    let class = FieldType::from_class_name(array)?;
                    if let Some(class_id) = self.resolve(class) {
                        points.push(InsertionPoint::previous(
                            instruction.next(),
                            self.packet(DUP, class_id),
                        ));
                    }
                }
                NEWARRAY => {
                    let code = method.code.u8_at(bci + 1)?;
                    let Some(component) = BaseType::from_array_code(code) else {
                        let anomaly = format!(
                            "{}: newarray of unknown type {} at {}",
                            method.qualified_name(),
                            code,
                            bci
                        );
                        warn!("{}", anomaly);
                        self.anomalies.push(anomaly);
                        continue;
                    };

                    let class = FieldType::Base(component).array_of();
                    if let Some(class_id) = self.resolve(class) {
                        points.push(InsertionPoint::previous(
                            instruction.next(),
                            self.packet(DUP, class_id),
                        ));
                    }
                }
                _ => {}
            }
        }

        if let Some(profile_points) = &mut self.profile_points {
            points.extend(profile_points.insertion_points(method)?);
        }

        Ok(points)
    }

    fn post_process(&mut self, injector: &mut Injector) -> InstrumentResult<()> {
        if injector.is_modified() {
            injector.max_stack = injector.max_stack.saturating_add(2);
        }

        match &mut self.profile_points {
            Some(profile_points) => profile_points.post_process(injector),
            None => Ok(()),
        }
    }

    fn anomalies(&self) -> &[String] {
        &self.anomalies
    }
}
