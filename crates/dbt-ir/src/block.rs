use crate::op::{Instr, Terminator};
use crate::value::BlockId;

/// A block's lifecycle (spec.md §4.1 state-machine note): `Open` blocks
/// accept new instructions via [`crate::IrBuilder::emit`]; `terminate`
/// moves a block to `Sealed`, after which emitting into it is a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Open,
    Sealed,
}

/// One basic block: an ordered, append-only list of instructions plus the
/// single terminator that seals it (spec.md §3 "exactly one terminator per
/// block").
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub instrs: Vec<Instr>,
    pub terminator: Option<Terminator>,
    pub state: BlockState,
}

impl Block {
    #[must_use]
    pub fn new(id: BlockId) -> Self {
        Block { id, instrs: Vec::new(), terminator: None, state: BlockState::Open }
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.state == BlockState::Sealed
    }

    /// Forward iteration over this block's instructions; restartable and
    /// valid across emissions into *other* blocks per spec.md §4.1's
    /// `iter` contract (emitting into this same block while iterating it
    /// is still the caller's responsibility to avoid).
    pub fn iter(&self) -> std::slice::Iter<'_, Instr> {
        self.instrs.iter()
    }
}
