use bitflags::bitflags;

/// A single architectural arithmetic flag bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Cf,
    Pf,
    Af,
    Zf,
    Sf,
    Of,
}

bitflags! {
    /// A set of arithmetic flags, used by the front end to describe which
    /// flags a given ALU op defines (so the deferred-flag scheme in
    /// spec.md §3 knows which flag bytes a record invalidates) and by the
    /// pass manager to describe which flags a later instruction consumes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FlagSet: u8 {
        const CF = 1 << 0;
        const PF = 1 << 1;
        const AF = 1 << 2;
        const ZF = 1 << 3;
        const SF = 1 << 4;
        const OF = 1 << 5;

        const EMPTY = 0;
        /// The six flags a typical arithmetic op (ADD/SUB/CMP) defines.
        const ALU = Self::CF.bits() | Self::PF.bits() | Self::AF.bits() | Self::ZF.bits() | Self::SF.bits() | Self::OF.bits();
        /// The flags AND/OR/XOR/TEST define: CF/OF/AF are forced to fixed
        /// values rather than computed, per the NZ-zero-CV micro-protocol
        /// (spec.md §4.3).
        const NZ00 = Self::ZF.bits() | Self::SF.bits() | Self::PF.bits();
    }
}

impl FlagSet {
    #[must_use]
    pub const fn contains_flag(self, flag: Flag) -> bool {
        self.contains(Self::from_flag(flag))
    }

    #[must_use]
    pub const fn from_flag(flag: Flag) -> Self {
        match flag {
            Flag::Cf => FlagSet::CF,
            Flag::Pf => FlagSet::PF,
            Flag::Af => FlagSet::AF,
            Flag::Zf => FlagSet::ZF,
            Flag::Sf => FlagSet::SF,
            Flag::Of => FlagSet::OF,
        }
    }
}
