use bitflags::bitflags;
use bytes::Bytes;
use parse::classfile::ClassInfo;
use parse::constants::MAX_POOL_COUNT;
use tracing::debug;

use crate::cpool::{repository, ConstantPoolExtension};
use crate::error::{InstrumentError, InstrumentResult};
use crate::kind::InjectionKind;
use crate::opcode;
use crate::rewriter::rewrite_class;
use crate::bytecode;

bitflags! {
    pub struct MethodState: u8 {
        const REACHABLE    = 1 << 0;
        const INSTRUMENTED = 1 << 1;
        const ROOT         = 1 << 2;
        const MARKER       = 1 << 3;
        /// Makes no calls of its own.
        const LEAF         = 1 << 4;
        /// No bytecode to scan, either abstract or native.
        const UNSCANNABLE  = 1 << 5;
    }
}

/// A loaded class as seen by an instrumentation session: its parsed bytes,
/// per method state, the constant pool fragments added so far and the
/// method bodies rewritten so far.
#[derive(Debug)]
pub struct DynamicClass {
    info: ClassInfo,
    loader: u32,
    states: Vec<MethodState>,
    method_ids: Vec<Option<u16>>,
    bases: [Option<u16>; InjectionKind::COUNT],
    fragments: Vec<(u16, Bytes)>,
    pool_count: u16,
    replaced: Vec<Option<Bytes>>,
}

impl DynamicClass {
    pub fn new(info: ClassInfo, loader: u32) -> Self {
        let states = info
            .methods
            .iter()
            .map(|m| {
                if m.code.is_some() && m.flags.has_code() {
                    MethodState::empty()
                } else {
                    MethodState::UNSCANNABLE
                }
            })
            .collect::<Vec<_>>();

        let methods = states.len();
        let pool_count = info.pool_count();

        Self {
            info,
            loader,
            states,
            method_ids: vec![None; methods],
            bases: [None; InjectionKind::COUNT],
            fragments: Vec::new(),
            pool_count,
            replaced: vec![None; methods],
        }
    }

    pub fn info(&self) -> &ClassInfo {
        &self.info
    }

    pub fn name(&self) -> InstrumentResult<&str> {
        Ok(self.info.name()?)
    }

    pub fn loader(&self) -> u32 {
        self.loader
    }

    pub fn method_count(&self) -> usize {
        self.states.len()
    }

    pub fn state(&self, method: usize) -> MethodState {
        self.states.get(method).copied().unwrap_or_else(MethodState::empty)
    }

    pub fn set_state(&mut self, method: usize, state: MethodState) {
        if let Some(current) = self.states.get_mut(method) {
            current.insert(state);
        }
    }

    pub fn unset_state(&mut self, method: usize, state: MethodState) {
        if let Some(current) = self.states.get_mut(method) {
            current.remove(state);
        }
    }

    /// Marks every method with code as reachable.
    pub fn mark_all_reachable(&mut self) {
        for state in &mut self.states {
            if !state.contains(MethodState::UNSCANNABLE) {
                state.insert(MethodState::REACHABLE);
            }
        }
    }

    pub fn method_id(&self, method: usize) -> Option<u16> {
        self.method_ids.get(method).copied().flatten()
    }

    pub(crate) fn set_method_id(&mut self, method: usize, id: u16) {
        if let Some(slot) = self.method_ids.get_mut(method) {
            *slot = Some(id);
        }
    }

    /// Records whether a method calls anything, from its original code.
    pub fn detect_leaf(&mut self, method: usize) -> InstrumentResult<bool> {
        if self.state(method).contains(MethodState::UNSCANNABLE) {
            return Ok(false);
        }

        let code = self.info.code(method)?;
        let leaf = !bytecode::scan(code)?
            .iter()
            .any(|i| opcode::is_invoke(i.opcode));

        if leaf {
            self.set_state(method, MethodState::LEAF);
        }

        Ok(leaf)
    }

    /// Current number of pool slots, counting fragments already added.
    pub fn pool_count(&self) -> u16 {
        self.pool_count
    }

    /// Pool index of the first entry of a kind's fragment, if it was added.
    pub fn base(&self, kind: InjectionKind) -> Option<u16> {
        self.bases[kind.index()]
    }

    /// Index of an entry within a kind's fragment, once the fragment is
    /// in place.
    pub fn index_of(&self, kind: InjectionKind, offset: u16) -> Option<u16> {
        self.base(kind).map(|base| base + offset)
    }

    /// Adds a kind's constant pool fragment, placing its dependency first.
    /// Asking again for a kind already added yields an empty extension.
    pub fn fragment(&mut self, kind: InjectionKind) -> InstrumentResult<ConstantPoolExtension> {
        if self.base(kind).is_some() {
            return Ok(ConstantPoolExtension::empty());
        }

        let external_base = match kind.dependency() {
            Some(dependency) => {
                self.fragment(dependency)?;
                self.base(dependency)
            }
            None => None,
        };

        let packed = repository::fragment(kind);
        let base = self.pool_count;
        let count = base as usize + packed.count() as usize;

        if count > MAX_POOL_COUNT {
            return Err(InstrumentError::PoolExhausted {
                class: self.info.name()?.to_string(),
                requested: packed.count(),
            });
        }

        let bytes = packed.relocate(base, external_base)?;
        debug!(
            "{}: {} fragment placed at {} ({} entries)",
            self.info.name()?,
            kind,
            base,
            packed.count()
        );

        self.bases[kind.index()] = Some(base);
        self.pool_count = count as u16;
        self.fragments.push((base, bytes.clone()));

        Ok(ConstantPoolExtension {
            count: packed.count(),
            bytes,
        })
    }

    /// Every fragment added so far, in pool order.
    pub fn all_added_fragments(&self) -> ConstantPoolExtension {
        let mut fragments = self.fragments.iter().collect::<Vec<_>>();
        fragments.sort_by_key(|(base, _)| *base);

        let bytes = fragments
            .iter()
            .flat_map(|(_, bytes)| bytes.iter().copied())
            .collect::<Vec<_>>();

        ConstantPoolExtension {
            count: self.pool_count - self.info.pool_count(),
            bytes: Bytes::from(bytes),
        }
    }

    pub fn replace_method(&mut self, method: usize, info: Bytes) {
        if let Some(slot) = self.replaced.get_mut(method) {
            *slot = Some(info);
        }
    }

    pub fn replaced_method(&self, method: usize) -> Option<&Bytes> {
        self.replaced.get(method).and_then(Option::as_ref)
    }

    pub fn has_changes(&self) -> bool {
        self.replaced.iter().any(Option::is_some)
    }

    /// The class file with every fragment and rewritten method so far.
    pub fn rewrite(&self) -> InstrumentResult<Vec<u8>> {
        let added = self.all_added_fragments();
        rewrite_class(&self.info, &self.replaced, added.count, &added.bytes)
    }

    /// Forgets instrumentation, keeping what is known about the methods.
    pub fn reset(&mut self) {
        for state in &mut self.states {
            state.remove(MethodState::INSTRUMENTED | MethodState::REACHABLE);
        }

        self.bases = [None; InjectionKind::COUNT];
        self.fragments.clear();
        self.pool_count = self.info.pool_count();
        self.replaced.iter_mut().for_each(|r| *r = None);
    }
}
