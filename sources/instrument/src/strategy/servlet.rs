use super::{call_with_local, InjectionStrategy, MethodContext};
use crate::error::InstrumentResult;
use crate::injector::InsertionPoint;
use crate::opcode::ALOAD_1;

pub const HTTP_SERVLET_CLASS: &str = "javax/servlet/http/HttpServlet";
pub const DO_METHOD_DESCRIPTOR: &str =
    "(Ljavax/servlet/http/HttpServletRequest;Ljavax/servlet/http/HttpServletResponse;)V";
pub const DO_METHODS: [&str; 4] = ["doGet", "doPost", "doPut", "doDelete"];

pub fn is_servlet_do_method(class_name: &str, method_name: &str, descriptor: &str) -> bool {
    class_name == HTTP_SERVLET_CLASS
        && descriptor == DO_METHOD_DESCRIPTOR
        && DO_METHODS.contains(&method_name)
}

/// Hands each request to the runtime as a servlet starts serving it.
#[derive(Debug, Clone)]
pub struct ServletDoMethod {
    handler: u16,
}

impl ServletDoMethod {
    pub fn new(handler: u16) -> Self {
        Self { handler }
    }
}

impl InjectionStrategy for ServletDoMethod {
    fn insertion_points(&mut self, _method: &MethodContext) -> InstrumentResult<Vec<InsertionPoint>> {
        Ok(vec![InsertionPoint::following(
            0,
            call_with_local(ALOAD_1, self.handler),
        )])
    }
}
