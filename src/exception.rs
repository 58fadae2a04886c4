//! Traps and interrupts: the vector table layout and the entry sequence.

#![allow(dead_code)]

/// The sources that can redirect the CPU through the PSAP vector table.
/// The discriminant is the `T` index used to compute `PSAP + 2*T` (FCW) and
/// `PSAP + 2*T + 2` (PC).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trap {
    Reset = 0,
    ExtendedInstruction = 1,
    PrivilegedInstruction = 2,
    SystemCall = 3,
    SegmentTrap = 4,
    Nmi = 5,
    NonVectoredInterrupt = 6,
    VectoredInterrupt = 7,
}

impl Trap {
    /// Byte offset of this trap's saved FCW within the PSAP-relative vector
    /// table; the saved PC immediately follows at `fcw_offset() + 2`.
    pub const fn fcw_offset(self) -> u16 {
        2 + self as u16 * 4
    }

    pub const fn pc_offset(self) -> u16 {
        self.fcw_offset() + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_offsets_match_layout_table() {
        assert_eq!(Trap::Reset.fcw_offset(), 0x02);
        assert_eq!(Trap::Reset.pc_offset(), 0x04);
        assert_eq!(Trap::ExtendedInstruction.fcw_offset(), 0x06);
        assert_eq!(Trap::PrivilegedInstruction.fcw_offset(), 0x0A);
        assert_eq!(Trap::SystemCall.fcw_offset(), 0x0E);
        assert_eq!(Trap::SegmentTrap.fcw_offset(), 0x12);
        assert_eq!(Trap::Nmi.fcw_offset(), 0x16);
        assert_eq!(Trap::NonVectoredInterrupt.fcw_offset(), 0x1A);
        assert_eq!(Trap::VectoredInterrupt.fcw_offset(), 0x1E);
    }
}
