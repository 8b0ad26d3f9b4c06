use super::{call_with_local, InjectionStrategy, MethodContext};
use crate::error::InstrumentResult;
use crate::injector::InsertionPoint;
use crate::opcode::ALOAD_0;

pub const REFLECT_METHOD_CLASS: &str = "java/lang/reflect/Method";
pub const INVOKE_METHOD: &str = "invoke";

pub fn is_reflect_invoke(class_name: &str, method_name: &str) -> bool {
    class_name == REFLECT_METHOD_CLASS && method_name == INVOKE_METHOD
}

/// Hands the `Method` being invoked to the runtime, so calls made through
/// reflection can be followed.
#[derive(Debug, Clone)]
pub struct ReflectInvoke {
    handler: u16,
}

impl ReflectInvoke {
    pub fn new(handler: u16) -> Self {
        Self { handler }
    }
}

impl InjectionStrategy for ReflectInvoke {
    fn insertion_points(&mut self, _method: &MethodContext) -> InstrumentResult<Vec<InsertionPoint>> {
        Ok(vec![InsertionPoint::following(
            0,
            call_with_local(ALOAD_0, self.handler),
        )])
    }
}
