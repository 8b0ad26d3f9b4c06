//! Rewrites Java class files so that profiled code calls into the profiler
//! runtime: method entry and exit, code regions, allocations and profile
//! points.

pub mod buffer;
pub mod bytecode;
pub mod config;
pub mod cpool;
pub mod dump;
pub mod dynamic_class;
pub mod error;
pub mod injector;
pub mod kind;
pub mod opcode;
pub mod rewriter;
pub mod session;
pub mod strategy;

extern crate anyhow;
extern crate bitflags;
extern crate bytes;
extern crate enum_as_inner;
extern crate lazy_static;
extern crate parking_lot;
extern crate parse;
extern crate support;
extern crate thiserror;
extern crate tracing;

pub use config::{InstrumentConfig, InstrumentationFilter};
pub use dynamic_class::{DynamicClass, MethodState};
pub use error::{InstrumentError, InstrumentResult};
pub use kind::InjectionKind;
pub use session::{
    Injection, InstrumentedClass, Instrumentor, MemoryMode, MethodRole, MethodTarget,
};
pub use strategy::{ClassIdResolver, ProfilePoint, SequentialClassIds};
