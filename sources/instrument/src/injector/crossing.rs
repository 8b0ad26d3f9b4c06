//! Predicates deciding whether a jump from `bci` to `target` spans the point
//! where code grows. All positions are in the code as it is before the
//! growth, and a jump that spans it has its offset stretched.

/// Which instruction a jump to the insertion point lands on afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Jumps land on the injected code.
    Following,
    /// Jumps land on the original instruction, after the injected code.
    Previous,
}

/// What a relocation does to the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocation {
    /// New bytes inserted before the instruction at the point.
    Inject(Binding),
    /// The instruction at the point itself grows or shrinks.
    Widen,
}

impl Relocation {
    pub fn crosses(self, bci: usize, target: i64, at: usize) -> bool {
        let bci = bci as i64;
        let at = at as i64;

        match self {
            Relocation::Inject(_) if at == 0 => crosses_origin(bci, target, at),
            Relocation::Inject(Binding::Following) => crosses_following(bci, target, at),
            Relocation::Inject(Binding::Previous) => crosses_previous(bci, target, at),
            Relocation::Widen => crosses_widening(bci, target, at),
        }
    }

    /// Whether an instruction starting at `bci` is displaced.
    pub fn moves(self, bci: usize, at: usize) -> bool {
        match self {
            Relocation::Inject(_) => bci >= at,
            Relocation::Widen => bci > at,
        }
    }
}

/// Injected code becomes the target of jumps to the point.
pub fn crosses_following(bci: i64, target: i64, at: i64) -> bool {
    (bci < at && target > at) || (bci >= at && target <= at)
}

/// Jumps to the point keep landing on the instruction that was there.
pub fn crosses_previous(bci: i64, target: i64, at: i64) -> bool {
    (bci < at && target >= at) || (bci >= at && target < at)
}

/// The instruction at the point changes length. Jumps into it, including its
/// own backward jumps to itself, are left alone.
pub fn crosses_widening(bci: i64, target: i64, at: i64) -> bool {
    (bci <= at && target > at) || (bci > at && target <= at)
}

/// Code injected at the start of a method is only reachable by falling in,
/// every jump keeps its relative offset.
pub fn crosses_origin(_bci: i64, _target: i64, _at: i64) -> bool {
    false
}
