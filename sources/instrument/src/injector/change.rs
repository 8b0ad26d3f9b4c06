/// Work left over from a relocation, done once the relocation itself has
/// finished rewriting offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// A short branch whose offset no longer fits in 16 bits. `offset` is
    /// the offset it should have, kept current by later relocations.
    Widen { bci: usize, offset: i32 },
    /// A switch whose operands are no longer aligned. `padding` is what its
    /// operands are still laid out with.
    SwitchPadding {
        bci: usize,
        padding: usize,
        lookup: bool,
    },
}

impl Change {
    pub fn bci(&self) -> usize {
        match *self {
            Change::Widen { bci, .. } | Change::SwitchPadding { bci, .. } => bci,
        }
    }

    pub fn relocate(&mut self, delta: i32) {
        let bci = match self {
            Change::Widen { bci, .. } | Change::SwitchPadding { bci, .. } => bci,
        };

        *bci = (*bci as i64 + delta as i64) as usize;
    }
}
