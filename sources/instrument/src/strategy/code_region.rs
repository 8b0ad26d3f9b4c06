use super::{InjectionStrategy, MethodContext};
use crate::error::InstrumentResult;
use crate::injector::InsertionPoint;
use crate::opcode::{self, INVOKESTATIC, NOP};

/// Times the bytecode range `start..end`: entry at its first instruction,
/// exit before every return inside it and where it falls through at `end`.
#[derive(Debug, Clone)]
pub struct CodeRegion {
    start: usize,
    end: usize,
    entry: u16,
    exit: u16,
}

impl CodeRegion {
    pub fn new(start: usize, end: usize, entry: u16, exit: u16) -> Self {
        Self {
            start,
            end,
            entry,
            exit,
        }
    }

    fn call(method: u16) -> [u8; 4] {
        let [hi, lo] = method.to_be_bytes();
        [INVOKESTATIC, hi, lo, NOP]
    }
}

impl InjectionStrategy for CodeRegion {
    fn insertion_points(&mut self, method: &MethodContext) -> InstrumentResult<Vec<InsertionPoint>> {
        let length = method.code.len();

        if self.start >= self.end || self.end > length {
            return Err(method.skipped(format!(
                "region {}..{} does not fit {} bytes of code",
                self.start, self.end, length
            )));
        }

        if !method.is_boundary(self.start) || (self.end < length && !method.is_boundary(self.end)) {
            return Err(method.skipped(format!(
                "region {}..{} does not start and end on instructions",
                self.start, self.end
            )));
        }

        let mut points = vec![InsertionPoint::following(self.start, Self::call(self.entry))];

        for instruction in &method.instructions {
            if (self.start..self.end).contains(&instruction.bci)
                && opcode::is_return(instruction.opcode)
            {
                points.push(InsertionPoint::following(
                    instruction.bci,
                    Self::call(self.exit),
                ));
            }
        }

        if self.end < length {
            points.push(InsertionPoint::following(self.end, Self::call(self.exit)));
        }

        Ok(points)
    }
}
