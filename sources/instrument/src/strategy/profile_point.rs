use tracing::warn;

use super::{call_with_id, InjectionStrategy, MethodContext};
use crate::error::InstrumentResult;
use crate::injector::{InsertionPoint, Injector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilePoint {
    pub id: u16,
    pub bci: usize,
}

/// Reports `profilePointHit(id)` when execution reaches each point.
#[derive(Debug, Clone)]
pub struct ProfilePoints {
    points: Vec<ProfilePoint>,
    hit: u16,
}

impl ProfilePoints {
    pub fn new(points: Vec<ProfilePoint>, hit: u16) -> Self {
        Self { points, hit }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl InjectionStrategy for ProfilePoints {
    fn insertion_points(&mut self, method: &MethodContext) -> InstrumentResult<Vec<InsertionPoint>> {
        let mut points = Vec::with_capacity(self.points.len());

        for point in &self.points {
            if !method.is_boundary(point.bci) {
                warn!(
                    "{}: profile point {} at {} is not on an instruction",
                    method.qualified_name(),
                    point.id,
                    point.bci
                );
                continue;
            }

            points.push(InsertionPoint::following(
                point.bci,
                call_with_id(point.id, self.hit),
            ));
        }

        Ok(points)
    }

    fn post_process(&mut self, injector: &mut Injector) -> InstrumentResult<()> {
        if !self.points.is_empty() {
            injector.max_stack = injector.max_stack.max(4);
        }

        Ok(())
    }
}
