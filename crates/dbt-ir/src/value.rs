/// A stable reference to an SSA-defined value within a [`crate::Function`].
///
/// Values are numbered function-wide (not per-block), mirroring the
/// teacher's `ValueId` — IR compaction (the pass manager's last stage)
/// renumbers them densely but never reuses a live id within one pass run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(pub u32);

impl std::fmt::Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A reference to a [`crate::Block`] within a [`crate::Function`]'s block
/// list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// An instruction operand: either an immediate or a use of a prior value.
/// Collapsing "literal" and "prior node" into one sum type here is what
/// lets every arithmetic/memory op stay constant-propagation-friendly
/// without a separate `Instr::Const`-folding special case at every use
/// site (spec.md §4.4, constant propagation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Const(u64),
    Value(ValueId),
}

impl Operand {
    #[must_use]
    pub fn as_const(&self) -> Option<u64> {
        match self {
            Operand::Const(v) => Some(*v),
            Operand::Value(_) => None,
        }
    }

    #[must_use]
    pub fn is_const(&self) -> bool {
        matches!(self, Operand::Const(_))
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Const(v) => write!(f, "#{v:#x}"),
            Operand::Value(id) => write!(f, "{id}"),
        }
    }
}

impl std::str::FromStr for ValueId {
    type Err = crate::print::ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('v').ok_or_else(|| crate::print::ParseError(format!("bad value id {s}")))?;
        digits.parse().map(ValueId).map_err(|_| crate::print::ParseError(format!("bad value id {s}")))
    }
}

impl std::str::FromStr for BlockId {
    type Err = crate::print::ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("bb").ok_or_else(|| crate::print::ParseError(format!("bad block id {s}")))?;
        digits.parse().map(BlockId).map_err(|_| crate::print::ParseError(format!("bad block id {s}")))
    }
}

impl std::str::FromStr for Operand {
    type Err = crate::print::ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(hex) = s.strip_prefix("#0x") {
            return u64::from_str_radix(hex, 16)
                .map(Operand::Const)
                .map_err(|_| crate::print::ParseError(format!("bad const operand {s}")));
        }
        s.parse::<ValueId>().map(Operand::Value)
    }
}
