use std::collections::HashMap;
use std::ops::Range;

use bytes::Bytes;
use enum_as_inner::EnumAsInner;
use parse::classfile::ClassInfo;
use tracing::{debug, error, info, warn};

use crate::buffer::BufferPool;
use crate::config::InstrumentConfig;
use crate::cpool::repository::{
    add_parameter, CODE_REGION_ENTRY, CODE_REGION_EXIT, MARKER_ENTRY, MARKER_EXIT,
    MARKER_EXIT_WITH_RESULT, MEMORY_PROFILE_POINT_HIT, METHOD_ENTRY, METHOD_EXIT,
    PROFILE_POINT_HIT, REFLECT_INVOKE, ROOT_ENTRY, SERVLET_DO_METHOD, TRACE_ALLOCATION,
};
use crate::dump::dump_class;
use crate::dynamic_class::{DynamicClass, MethodState};
use crate::error::{InstrumentError, InstrumentResult};
use crate::internal;
use crate::kind::InjectionKind;
use crate::strategy::reflect::is_reflect_invoke;
use crate::strategy::servlet::is_servlet_do_method;
use crate::strategy::{
    rewrite_method, ClassIdResolver, CodeRegion, EntryExit, EntryExitCalls, InjectionStrategy,
    ObjectAllocation, ParameterCalls, ProfilePoint, ProfilePoints, ReflectInvoke,
    SequentialClassIds, ServletDoMethod,
};

/// Method ids travel as an unsigned 16 bit operand.
pub const MAX_METHOD_ID: u32 = u16::MAX as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MethodRole {
    #[default]
    Normal,
    /// Starts a profiled call tree.
    Root,
    /// Starts a call tree and is reported with its arguments' context.
    Marker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMode {
    Allocations,
    Liveness,
}

/// What to do to a method.
#[derive(EnumAsInner, Debug, Clone, PartialEq, Eq)]
pub enum Injection {
    EntryExit(MethodRole),
    /// Brackets a bytecode range with region entry and exit calls.
    CodeRegion(Range<usize>),
    ObjectAllocation(MemoryMode),
    /// Profile points alone, reported to the CPU runtime.
    ProfilePoints,
    ReflectInvoke,
    ServletDoMethod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodTarget {
    pub method: usize,
    pub injection: Injection,
    /// Applied alongside entry/exit, allocation and standalone injections.
    pub profile_points: Vec<ProfilePoint>,
}

impl MethodTarget {
    pub fn new(method: usize, injection: Injection) -> Self {
        Self {
            method,
            injection,
            profile_points: Vec::new(),
        }
    }

    pub fn with_profile_points(mut self, points: Vec<ProfilePoint>) -> Self {
        self.profile_points = points;
        self
    }
}

/// The outcome of instrumenting a class: its new bytes and what happened to
/// each requested method.
#[derive(Debug)]
pub struct InstrumentedClass {
    pub name: String,
    pub loader: u32,
    pub bytes: Vec<u8>,
    pub instrumented: Vec<usize>,
    pub method_ids: Vec<(usize, u16)>,
    /// Instrumented methods that make no calls of their own.
    pub leaf_methods: Vec<usize>,
    pub skipped: Vec<(usize, InstrumentError)>,
}

/// An instrumentation session. Tracks every class it was given, keyed by
/// name and defining loader, and hands out method ids across all of them.
pub struct Instrumentor {
    config: InstrumentConfig,
    buffers: BufferPool,
    classes: HashMap<(String, u32), DynamicClass>,
    resolver: Box<dyn ClassIdResolver + Send>,
    next_method_id: u32,
}

impl Instrumentor {
    pub fn new(config: InstrumentConfig) -> Self {
        Self::with_resolver(config, Box::new(SequentialClassIds::new()))
    }

    pub fn with_resolver(config: InstrumentConfig, resolver: Box<dyn ClassIdResolver + Send>) -> Self {
        Self {
            config,
            buffers: BufferPool::new(),
            classes: HashMap::new(),
            resolver,
            next_method_id: 0,
        }
    }

    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    /// Registers a class. Loading the same name and loader twice keeps the
    /// first copy along with whatever was done to it.
    pub fn load_class(&mut self, bytes: &[u8], loader: u32) -> InstrumentResult<&mut DynamicClass> {
        let info = ClassInfo::parse(bytes).map_err(InstrumentError::ClassFormat)?;
        let name = info.name().map_err(InstrumentError::ClassFormat)?.to_string();

        debug!("loaded {} ({} methods) for loader {}", name, info.methods.len(), loader);

        Ok(self
            .classes
            .entry((name, loader))
            .or_insert_with(|| DynamicClass::new(info, loader)))
    }

    pub fn class(&self, name: &str, loader: u32) -> Option<&DynamicClass> {
        self.classes.get(&(name.to_string(), loader))
    }

    pub fn class_mut(&mut self, name: &str, loader: u32) -> Option<&mut DynamicClass> {
        self.classes.get_mut(&(name.to_string(), loader))
    }

    pub fn classes(&self) -> impl Iterator<Item = &DynamicClass> {
        self.classes.values()
    }

    /// Index of a method of a loaded class, by name and descriptor.
    pub fn find_method(&self, name: &str, loader: u32, method: &str, descriptor: &str) -> Option<usize> {
        self.class(name, loader)?.info().method_index(method, descriptor)
    }

    fn loaded(&self, name: &str, loader: u32) -> InstrumentResult<&DynamicClass> {
        self.class(name, loader)
            .ok_or_else(|| internal!("{} is not loaded for loader {}", name, loader))
    }

    /// Instruments one method of a loaded class. `Ok(false)` when there was
    /// nothing to do, either because it was done already or because the
    /// method has no matching code.
    pub fn instrument_method(
        &mut self,
        name: &str,
        loader: u32,
        target: &MethodTarget,
    ) -> InstrumentResult<bool> {
        let sampled = self.config.cpu_sampled;
        let class = self
            .classes
            .get_mut(&(name.to_string(), loader))
            .ok_or_else(|| internal!("{} is not loaded for loader {}", name, loader))?;

        let index = target.method;
        let qualified = class.info().method(index)?.qualified(name);
        let state = class.state(index);

        if state.contains(MethodState::UNSCANNABLE) {
            return Err(InstrumentError::Unscannable { method: qualified });
        }

        if state.contains(MethodState::INSTRUMENTED) {
            debug!("{} is already instrumented", qualified);
            return Ok(false);
        }

        let kind = injection_kind(&target.injection, sampled);
        let prepared = class.fragment(kind).and_then(|_| match &target.injection {
            Injection::EntryExit(_) => method_id(class, index, self.next_method_id).map(Some),
            _ => Ok(None),
        });

        let assigned = match prepared {
            Ok(id) => id,
            Err(e) => {
                if e.is_exhaustion() {
                    // Not worth retrying
                    class.set_state(index, MethodState::INSTRUMENTED);
                }
                return Err(e);
            }
        };

        let outcome = rewrite(
            class,
            target,
            assigned,
            sampled,
            &self.buffers,
            &self.config,
            self.resolver.as_mut(),
        );

        let rewritten = match outcome {
            Ok(Rewritten { bytes, anomalies }) => {
                if !anomalies.is_empty() {
                    if let Some(dir) = &self.config.dump_dir {
                        match dump_class(dir, name, class.info().bytes()) {
                            Ok(path) => info!("{} dumped to {}", name, path.display()),
                            Err(e) => warn!("could not dump {}: {}", name, e),
                        }
                    }
                }
                bytes
            }
            Err(e) => {
                if e.is_exhaustion() {
                    class.set_state(index, MethodState::INSTRUMENTED);
                }
                return Err(e);
            }
        };

        let Some(bytes) = rewritten else {
            debug!("{}: nothing to instrument", qualified);
            class.unset_state(index, MethodState::INSTRUMENTED);
            return Ok(false);
        };

        class.replace_method(index, bytes);
        class.set_state(index, MethodState::INSTRUMENTED);

        if let Some(id) = assigned {
            if class.method_id(index).is_none() {
                class.set_method_id(index, id);
                self.next_method_id += 1;
            }
        }

        match target.injection.as_entry_exit() {
            Some(MethodRole::Root) => class.set_state(index, MethodState::ROOT),
            Some(MethodRole::Marker) => class.set_state(index, MethodState::MARKER),
            _ => {}
        }

        class.detect_leaf(index)?;
        debug!("{}: instrumented for {}", qualified, kind);

        Ok(true)
    }

    /// Instruments the given methods and produces the class bytes. Methods
    /// that cannot be instrumented are reported in `skipped` and leave the
    /// rest of the class unaffected.
    pub fn instrument_class(
        &mut self,
        name: &str,
        loader: u32,
        targets: &[MethodTarget],
    ) -> InstrumentResult<InstrumentedClass> {
        self.loaded(name, loader)?;

        let mut instrumented = Vec::new();
        let mut skipped = Vec::new();

        for target in targets {
            match self.instrument_method(name, loader, target) {
                Ok(true) => instrumented.push(target.method),
                Ok(false) => {}
                Err(e) => {
                    if e.is_internal() {
                        error!("{}: {}", name, e);
                    } else {
                        warn!("{}: {}", name, e);
                    }
                    skipped.push((target.method, e));
                }
            }
        }

        let class = self.loaded(name, loader)?;
        let method_ids = (0..class.method_count())
            .filter_map(|i| class.method_id(i).map(|id| (i, id)))
            .collect();
        let leaf_methods = (0..class.method_count())
            .filter(|&i| class.state(i).contains(MethodState::INSTRUMENTED | MethodState::LEAF))
            .collect();

        Ok(InstrumentedClass {
            name: name.to_string(),
            loader,
            bytes: rewritten_or_original(class, class.rewrite()),
            instrumented,
            method_ids,
            leaf_methods,
            skipped,
        })
    }

    /// Entry/exit instrumentation for every reachable method not yet
    /// instrumented, with each method's role taken from its state.
    pub fn instrument_reachable(&mut self, name: &str, loader: u32) -> InstrumentResult<InstrumentedClass> {
        let class = self.loaded(name, loader)?;

        let targets = (0..class.method_count())
            .filter_map(|i| {
                let state = class.state(i);
                let pending = state.contains(MethodState::REACHABLE)
                    && !state.intersects(MethodState::INSTRUMENTED | MethodState::UNSCANNABLE);

                pending.then(|| MethodTarget::new(i, Injection::EntryExit(role_of(state))))
            })
            .collect::<Vec<_>>();

        self.instrument_class(name, loader, &targets)
    }

    /// Hooks the runtime needs in library classes: `Method.invoke`, and
    /// the servlet `do*` methods when request tracking is on. `None` for
    /// classes without any.
    pub fn instrument_runtime_hooks(
        &mut self,
        name: &str,
        loader: u32,
    ) -> InstrumentResult<Option<InstrumentedClass>> {
        let servlets = self.config.servlet_tracking;
        let class = self.loaded(name, loader)?;

        let targets = class
            .info()
            .methods
            .iter()
            .enumerate()
            .filter_map(|(i, m)| {
                if is_reflect_invoke(name, &m.name) {
                    Some(MethodTarget::new(i, Injection::ReflectInvoke))
                } else if servlets && is_servlet_do_method(name, &m.name, &m.descriptor) {
                    Some(MethodTarget::new(i, Injection::ServletDoMethod))
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();

        if targets.is_empty() {
            return Ok(None);
        }

        self.instrument_class(name, loader, &targets).map(Some)
    }

    /// Forgets all instrumentation. Classes stay loaded and method ids
    /// keep counting, so ids handed out earlier are never reused.
    pub fn reset(&mut self) {
        for class in self.classes.values_mut() {
            class.reset();
        }
    }
}

fn role_of(state: MethodState) -> MethodRole {
    if state.contains(MethodState::MARKER) {
        MethodRole::Marker
    } else if state.contains(MethodState::ROOT) {
        MethodRole::Root
    } else {
        MethodRole::Normal
    }
}

fn injection_kind(injection: &Injection, sampled: bool) -> InjectionKind {
    match (injection, sampled) {
        (Injection::EntryExit(MethodRole::Normal) | Injection::ProfilePoints, false) => {
            InjectionKind::NormalMethod
        }
        (Injection::EntryExit(MethodRole::Normal) | Injection::ProfilePoints, true) => {
            InjectionKind::SampledNormalMethod
        }
        (Injection::EntryExit(MethodRole::Root), false) => InjectionKind::RootMethod,
        (Injection::EntryExit(MethodRole::Root), true) => InjectionKind::SampledRootMethod,
        (Injection::EntryExit(MethodRole::Marker), false) => InjectionKind::MarkerMethod,
        (Injection::EntryExit(MethodRole::Marker), true) => InjectionKind::SampledMarkerMethod,
        (Injection::CodeRegion(_), _) => InjectionKind::CodeRegion,
        (Injection::ObjectAllocation(MemoryMode::Allocations), _) => {
            InjectionKind::ObjectAllocations
        }
        (Injection::ObjectAllocation(MemoryMode::Liveness), _) => InjectionKind::ObjectLiveness,
        (Injection::ReflectInvoke, _) => InjectionKind::ReflectMethodInvoke,
        (Injection::ServletDoMethod, _) => InjectionKind::ServletDoMethod,
    }
}

/// A class whose rewrite failed goes out as it came in.
fn rewritten_or_original(class: &DynamicClass, rewritten: InstrumentResult<Vec<u8>>) -> Vec<u8> {
    rewritten.unwrap_or_else(|e| {
        warn!(
            "{}: could not rewrite, keeping the original bytes: {}",
            class.name().unwrap_or("<unnamed>"),
            e
        );
        class.info().bytes().to_vec()
    })
}

/// The method's id, or the next free one if it has none yet. A new id is
/// only taken once the method is rewritten.
fn method_id(class: &DynamicClass, index: usize, next: u32) -> InstrumentResult<u16> {
    if let Some(id) = class.method_id(index) {
        return Ok(id);
    }

    if next > MAX_METHOD_ID {
        return Err(InstrumentError::MethodIdsExhausted);
    }

    Ok(next as u16)
}

struct Rewritten {
    bytes: Option<Bytes>,
    anomalies: Vec<String>,
}

fn run(
    class: &DynamicClass,
    index: usize,
    buffers: &BufferPool,
    strategy: &mut dyn InjectionStrategy,
) -> InstrumentResult<Rewritten> {
    let bytes = rewrite_method(class.info(), index, buffers, strategy)?;
    Ok(Rewritten {
        bytes,
        anomalies: strategy.anomalies().to_vec(),
    })
}

/// Builds the strategy for a target against the fragments already placed
/// in the class, and runs it.
fn rewrite(
    class: &DynamicClass,
    target: &MethodTarget,
    method_id: Option<u16>,
    sampled: bool,
    buffers: &BufferPool,
    config: &InstrumentConfig,
    resolver: &mut dyn ClassIdResolver,
) -> InstrumentResult<Rewritten> {
    let index = target.method;
    let kind = injection_kind(&target.injection, sampled);
    let normal = if sampled {
        InjectionKind::SampledNormalMethod
    } else {
        InjectionKind::NormalMethod
    };

    let index_of = |kind: InjectionKind, offset: u16| {
        class
            .index_of(kind, offset)
            .ok_or_else(|| internal!("{} fragment is not in place", kind))
    };

    let ignores_points = matches!(
        target.injection,
        Injection::CodeRegion(_) | Injection::ReflectInvoke | Injection::ServletDoMethod
    );
    if ignores_points && !target.profile_points.is_empty() {
        warn!(
            "profile points are not supported with {}, ignoring {} of them",
            kind,
            target.profile_points.len()
        );
    }

    match &target.injection {
        Injection::EntryExit(role) => {
            let method_id = method_id.ok_or_else(|| internal!("entry/exit without a method id"))?;
            let calls = match role {
                MethodRole::Normal => EntryExitCalls {
                    entry: index_of(normal, METHOD_ENTRY)?,
                    exit: index_of(normal, METHOD_EXIT)?,
                },
                MethodRole::Root => EntryExitCalls {
                    entry: index_of(kind, ROOT_ENTRY)?,
                    exit: index_of(normal, METHOD_EXIT)?,
                },
                MethodRole::Marker => EntryExitCalls {
                    entry: index_of(kind, MARKER_ENTRY)?,
                    exit: index_of(kind, MARKER_EXIT)?,
                },
            };

            let points = ProfilePoints::new(
                target.profile_points.clone(),
                index_of(normal, PROFILE_POINT_HIT)?,
            );
            let mut strategy = EntryExit::new(method_id, calls).with_profile_points(points);

            if *role == MethodRole::Marker {
                let base = class
                    .base(kind)
                    .ok_or_else(|| internal!("{} fragment is not in place", kind))?;
                strategy = strategy.capturing_parameters(ParameterCalls {
                    add_parameter: std::array::from_fn(|overload| base + add_parameter(overload)),
                    exit_with_result: index_of(kind, MARKER_EXIT_WITH_RESULT)?,
                });
            }

            run(class, index, buffers, &mut strategy)
        }
        Injection::CodeRegion(range) => {
            let mut strategy = CodeRegion::new(
                range.start,
                range.end,
                index_of(kind, CODE_REGION_ENTRY)?,
                index_of(kind, CODE_REGION_EXIT)?,
            );
            run(class, index, buffers, &mut strategy)
        }
        Injection::ObjectAllocation(_) => {
            let points = ProfilePoints::new(
                target.profile_points.clone(),
                index_of(kind, MEMORY_PROFILE_POINT_HIT)?,
            );
            let mut strategy =
                ObjectAllocation::new(index_of(kind, TRACE_ALLOCATION)?, &config.filter, resolver)
                    .tracking_object_ctor(config.track_object_ctor)
                    .with_profile_points(points);
            run(class, index, buffers, &mut strategy)
        }
        Injection::ProfilePoints => {
            let mut strategy = ProfilePoints::new(
                target.profile_points.clone(),
                index_of(kind, PROFILE_POINT_HIT)?,
            );
            run(class, index, buffers, &mut strategy)
        }
        Injection::ReflectInvoke => {
            let mut strategy = ReflectInvoke::new(index_of(kind, REFLECT_INVOKE)?);
            run(class, index, buffers, &mut strategy)
        }
        Injection::ServletDoMethod => {
            let mut strategy = ServletDoMethod::new(index_of(kind, SERVLET_DO_METHOD)?);
            run(class, index, buffers, &mut strategy)
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use parse::builder::{ClassBuilder, MethodBody};
    use parse::classfile::ClassInfo;
    use parse::flags::MethodAccessFlags;

    use super::{rewritten_or_original, Injection, Instrumentor, MemoryMode, MethodRole, MethodTarget};
    use crate::config::InstrumentConfig;
    use crate::cpool::repository::{
        self, add_parameter, MARKER_ENTRY, MARKER_EXIT_WITH_RESULT, METHOD_ENTRY, METHOD_EXIT,
    };
    use crate::internal;
    use crate::dynamic_class::MethodState;
    use crate::error::InstrumentError;
    use crate::kind::InjectionKind;
    use crate::opcode::*;
    use crate::strategy::ProfilePoint;

    const NAME: &str = "demo/Session";

    fn class_bytes() -> Vec<u8> {
        let mut builder = ClassBuilder::new(NAME, Some("java/lang/Object"));
        let widget = builder.class("demo/Widget");
        let init = builder.method_ref("demo/Widget", "<init>", "()V");
        let [w_hi, w_lo] = widget.to_be_bytes();
        let [i_hi, i_lo] = init.to_be_bytes();

        builder
            .method(
                MethodAccessFlags::STATIC,
                "first",
                "()V",
                Some(MethodBody::new(1, 0, vec![ICONST_0, POP, RETURN])),
            )
            .method(
                MethodAccessFlags::STATIC,
                "second",
                "()I",
                Some(MethodBody::new(1, 0, vec![ICONST_1, IRETURN])),
            )
            .method(
                MethodAccessFlags::STATIC,
                "make",
                "()Ljava/lang/Object;",
                Some(MethodBody::new(
                    2,
                    0,
                    vec![NEW, w_hi, w_lo, DUP, INVOKESPECIAL, i_hi, i_lo, ARETURN],
                )),
            )
            .method(
                MethodAccessFlags::STATIC | MethodAccessFlags::NATIVE,
                "native",
                "()V",
                None,
            );

        builder.build()
    }

    fn session(config: InstrumentConfig) -> Result<Instrumentor> {
        let mut session = Instrumentor::new(config);
        session.load_class(&class_bytes(), 7)?;
        Ok(session)
    }

    #[test]
    fn it_loads_classes_once_per_loader() -> Result<()> {
        let mut session = session(InstrumentConfig::default())?;
        session.class_mut(NAME, 7).unwrap().set_state(0, MethodState::ROOT);

        session.load_class(&class_bytes(), 7)?;
        session.load_class(&class_bytes(), 8)?;

        assert!(session.class(NAME, 7).unwrap().state(0).contains(MethodState::ROOT));
        assert!(!session.class(NAME, 8).unwrap().state(0).contains(MethodState::ROOT));
        assert_eq!(session.classes().count(), 2);

        assert!(matches!(
            session.load_class(&[0xca, 0xfe], 7),
            Err(InstrumentError::ClassFormat(_))
        ));

        Ok(())
    }

    #[test]
    fn it_assigns_method_ids_in_order() -> Result<()> {
        let mut session = session(InstrumentConfig::default())?;
        let targets = [
            MethodTarget::new(1, Injection::EntryExit(MethodRole::Normal)),
            MethodTarget::new(0, Injection::EntryExit(MethodRole::Normal)),
        ];

        let result = session.instrument_class(NAME, 7, &targets)?;

        assert_eq!(result.instrumented, vec![1, 0]);
        assert_eq!(result.method_ids, vec![(0, 1), (1, 0)]);
        assert_eq!(result.leaf_methods, vec![0, 1]);
        assert!(result.skipped.is_empty());

        let rewritten = ClassInfo::parse(&result.bytes)?;
        let class = session.class(NAME, 7).unwrap();
        let entry = class.index_of(InjectionKind::NormalMethod, METHOD_ENTRY).unwrap();
        let exit = class.index_of(InjectionKind::NormalMethod, METHOD_EXIT).unwrap();
        let [e_hi, e_lo] = entry.to_be_bytes();
        let [x_hi, x_lo] = exit.to_be_bytes();

        assert_eq!(
            &rewritten.code(1)?[..12],
            &[
                SIPUSH, 0, 0, INVOKESTATIC, e_hi, e_lo, NOP, NOP,
                ICONST_1,
                SIPUSH, 0, 0,
            ]
        );
        assert_eq!(&rewritten.code(1)?[12..17], &[INVOKESTATIC, x_hi, x_lo, NOP, NOP]);
        assert_eq!(rewritten.member_ref(entry)?.name, "methodEntry");

        Ok(())
    }

    #[test]
    fn it_skips_instrumented_and_unscannable_methods() -> Result<()> {
        let mut session = session(InstrumentConfig::default())?;
        let target = MethodTarget::new(0, Injection::EntryExit(MethodRole::Normal));

        assert!(session.instrument_method(NAME, 7, &target)?);
        assert!(!session.instrument_method(NAME, 7, &target)?);

        let result = session.instrument_class(
            NAME,
            7,
            &[MethodTarget::new(3, Injection::EntryExit(MethodRole::Normal))],
        )?;

        assert!(result.instrumented.is_empty());
        assert!(matches!(
            result.skipped.as_slice(),
            [(3, InstrumentError::Unscannable { .. })]
        ));

        Ok(())
    }

    #[test]
    fn it_records_roles_and_leaves() -> Result<()> {
        let mut session = session(InstrumentConfig {
            cpu_sampled: true,
            ..InstrumentConfig::default()
        })?;

        session.instrument_class(
            NAME,
            7,
            &[
                MethodTarget::new(0, Injection::EntryExit(MethodRole::Root)),
                MethodTarget::new(2, Injection::EntryExit(MethodRole::Marker)),
            ],
        )?;

        let class = session.class(NAME, 7).unwrap();
        assert!(class.state(0).contains(MethodState::ROOT | MethodState::LEAF));
        assert!(class.state(2).contains(MethodState::MARKER));
        assert!(!class.state(2).contains(MethodState::LEAF));

        assert!(class.base(InjectionKind::SampledNormalMethod).is_some());
        assert!(class.base(InjectionKind::SampledRootMethod).is_some());
        assert!(class.base(InjectionKind::NormalMethod).is_none());

        let entry = class
            .index_of(InjectionKind::SampledNormalMethod, METHOD_ENTRY)
            .unwrap();
        let rewritten = ClassInfo::parse(&class.rewrite()?)?;
        assert_eq!(
            rewritten.member_ref(entry)?.class,
            repository::CPU_SAMPLED_RUNTIME
        );

        Ok(())
    }

    #[test]
    fn it_instruments_reachable_methods_by_role() -> Result<()> {
        let mut session = session(InstrumentConfig::default())?;
        let class = session.class_mut(NAME, 7).unwrap();
        class.mark_all_reachable();
        class.set_state(1, MethodState::ROOT);

        let result = session.instrument_reachable(NAME, 7)?;

        assert_eq!(result.instrumented, vec![0, 1, 2]);
        assert!(result.skipped.is_empty());

        let class = session.class(NAME, 7).unwrap();
        assert!(class.base(InjectionKind::RootMethod).is_some());
        assert!(class.base(InjectionKind::MarkerMethod).is_none());

        // nothing left to do
        let again = session.instrument_reachable(NAME, 7)?;
        assert!(again.instrumented.is_empty());

        Ok(())
    }

    #[test]
    fn it_traces_allocations_with_profile_points() -> Result<()> {
        let mut session = session(InstrumentConfig::default())?;
        let make = session.find_method(NAME, 7, "make", "()Ljava/lang/Object;").unwrap();
        assert_eq!(make, 2);

        let target = MethodTarget::new(make, Injection::ObjectAllocation(MemoryMode::Liveness))
            .with_profile_points(vec![ProfilePoint { id: 4, bci: 0 }]);

        let result = session.instrument_class(NAME, 7, &[target])?;
        assert_eq!(result.instrumented, vec![2]);

        let class = session.class(NAME, 7).unwrap();
        assert!(class.base(InjectionKind::ObjectLiveness).is_some());
        assert!(class.base(InjectionKind::ObjectAllocations).is_none());

        let rewritten = ClassInfo::parse(&result.bytes)?;
        let code = rewritten.code(2)?;
        assert_eq!(&code[..3], &[SIPUSH, 0, 4]);
        assert_eq!(code.len(), 8 + 8 + 8);

        Ok(())
    }

    #[test]
    fn it_leaves_methods_without_sites_untouched() -> Result<()> {
        let mut session = session(InstrumentConfig::default())?;
        let target = MethodTarget::new(0, Injection::ObjectAllocation(MemoryMode::Allocations));

        assert!(!session.instrument_method(NAME, 7, &target)?);

        let class = session.class(NAME, 7).unwrap();
        assert!(!class.state(0).contains(MethodState::INSTRUMENTED));
        assert!(!class.has_changes());

        Ok(())
    }

    #[test]
    fn it_reports_bad_regions_as_skipped() -> Result<()> {
        let mut session = session(InstrumentConfig::default())?;
        let result = session.instrument_class(
            NAME,
            7,
            &[
                MethodTarget::new(0, Injection::CodeRegion(2..2)),
                MethodTarget::new(1, Injection::CodeRegion(0..1)),
            ],
        )?;

        assert_eq!(result.instrumented, vec![1]);
        assert!(matches!(
            result.skipped.as_slice(),
            [(0, InstrumentError::Skipped { .. })]
        ));

        Ok(())
    }

    #[test]
    fn it_rejects_unknown_classes() {
        let mut session = Instrumentor::new(InstrumentConfig::default());
        let result = session.instrument_reachable(NAME, 7);
        assert!(matches!(result, Err(InstrumentError::Internal(_))));
    }

    #[test]
    fn it_forgets_instrumentation_on_reset() -> Result<()> {
        let mut session = session(InstrumentConfig::default())?;
        let target = MethodTarget::new(0, Injection::EntryExit(MethodRole::Normal));
        session.instrument_method(NAME, 7, &target)?;

        session.reset();

        let class = session.class(NAME, 7).unwrap();
        assert!(!class.has_changes());
        assert!(!class.state(0).contains(MethodState::INSTRUMENTED));
        assert_eq!(class.method_id(0), Some(0));

        assert!(session.instrument_method(NAME, 7, &target)?);
        Ok(())
    }

    #[test]
    fn it_dumps_classes_with_anomalies() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("instrument-session-{}", std::process::id()));

        let mut builder = ClassBuilder::new("demo/Broken", Some("java/lang/Object"));
        let widget = builder.class("demo/Widget");
        let [hi, lo] = widget.to_be_bytes();
        // new without a constructor call
        builder.method(
            MethodAccessFlags::STATIC,
            "make",
            "()Ljava/lang/Object;",
            Some(MethodBody::new(1, 0, vec![NEW, hi, lo, ARETURN])),
        );
        let bytes = builder.build();

        let mut session = Instrumentor::new(InstrumentConfig {
            dump_dir: Some(dir.clone()),
            ..InstrumentConfig::default()
        });
        session.load_class(&bytes, 0)?;

        let target = MethodTarget::new(0, Injection::ObjectAllocation(MemoryMode::Allocations));
        assert!(!session.instrument_method("demo/Broken", 0, &target)?);

        let dumped = dir.join("demo").join("Broken.class");
        assert_eq!(std::fs::read(&dumped)?, bytes);

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn it_reports_what_marker_methods_return() -> Result<()> {
        let mut session = session(InstrumentConfig::default())?;
        let target = MethodTarget::new(2, Injection::EntryExit(MethodRole::Marker));
        let result = session.instrument_class(NAME, 7, &[target])?;
        assert_eq!(result.instrumented, vec![2]);

        let class = session.class(NAME, 7).unwrap();
        let entry = class.index_of(InjectionKind::MarkerMethod, MARKER_ENTRY).unwrap();
        let exit = class
            .index_of(InjectionKind::MarkerMethod, MARKER_EXIT_WITH_RESULT)
            .unwrap();
        let add_int = class
            .index_of(InjectionKind::MarkerMethod, add_parameter(4))
            .unwrap();
        let [x_hi, x_lo] = exit.to_be_bytes();

        let rewritten = ClassInfo::parse(&result.bytes)?;
        let code = rewritten.code(2)?;

        // no arguments to hand over, straight to the entry call
        assert_eq!(&code[..8], &crate::strategy::call_with_id(0, entry));
        assert_eq!(&code[15..23], &[DUP, SIPUSH, 0, 0, INVOKESTATIC, x_hi, x_lo, NOP]);
        assert_eq!(code[23], ARETURN);

        let member = rewritten.member_ref(exit)?;
        assert_eq!(member.class, repository::CPU_FULL_RUNTIME);
        assert_eq!(member.name, "markerMethodExit");
        assert_eq!(member.descriptor, "(Ljava/lang/Object;C)V");

        let member = rewritten.member_ref(add_int)?;
        assert_eq!(member.class, repository::CPU_RUNTIME);
        assert_eq!(member.name, "addParameter");
        assert_eq!(member.descriptor, "(I)V");

        Ok(())
    }

    #[test]
    fn it_only_spends_method_ids_on_rewritten_methods() -> Result<()> {
        let mut huge = vec![NOP; 65530];
        huge.push(RETURN);

        let mut builder = ClassBuilder::new("demo/Huge", Some("java/lang/Object"));
        builder
            .method(
                MethodAccessFlags::STATIC,
                "huge",
                "()V",
                Some(MethodBody::new(0, 0, huge)),
            )
            .method(
                MethodAccessFlags::STATIC,
                "small",
                "()V",
                Some(MethodBody::new(0, 0, vec![RETURN])),
            );

        let mut session = Instrumentor::new(InstrumentConfig::default());
        session.load_class(&builder.build(), 0)?;

        let result = session.instrument_class(
            "demo/Huge",
            0,
            &[
                MethodTarget::new(0, Injection::EntryExit(MethodRole::Normal)),
                MethodTarget::new(1, Injection::EntryExit(MethodRole::Normal)),
            ],
        )?;

        assert!(matches!(
            result.skipped.as_slice(),
            [(0, InstrumentError::CodeTooLarge { .. })]
        ));
        assert_eq!(result.instrumented, vec![1]);
        assert_eq!(result.method_ids, vec![(1, 0)]);

        Ok(())
    }

    #[test]
    fn it_keeps_the_original_bytes_when_rewriting_fails() -> Result<()> {
        let session = session(InstrumentConfig::default())?;
        let class = session.class(NAME, 7).unwrap();

        let bytes = rewritten_or_original(class, Err(internal!("pool count overflows")));
        assert_eq!(bytes, class_bytes());
        Ok(())
    }

    #[test]
    fn it_has_no_hooks_for_plain_classes() -> Result<()> {
        let mut session = session(InstrumentConfig {
            servlet_tracking: true,
            ..InstrumentConfig::default()
        })?;

        assert!(session.instrument_runtime_hooks(NAME, 7)?.is_none());
        Ok(())
    }
}
