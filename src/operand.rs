//! The resolved-operand abstraction consumed uniformly by instruction handlers.

use crate::Cpu;
use crate::instruction::Width;
use crate::exception::Trap;
use crate::memory_access::Bus;

/// A fully resolved operand: where a value comes from / goes to, already
/// stripped of its addressing mode. Handlers read and write through this
/// instead of re-deriving the addressing mode every time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    /// A general register, read/written at the given width.
    Reg(u8),
    /// An immediate value (only valid as a source).
    Imm(u32),
    /// A resolved memory address in program/data space.
    Mem(u16),
}

impl Cpu {
    #[must_use]
    pub(crate) fn read_operand(&mut self, bus: &mut impl Bus, op: Operand, width: Width) -> Result<u32, Trap> {
        match op {
            Operand::Reg(r) => Ok(match width {
                Width::Byte => self.regs.rb(r) as u32,
                Width::Word => self.regs.rw(r) as u32,
                Width::Long => self.regs.rl(r),
            }),
            Operand::Imm(v) => Ok(v),
            Operand::Mem(addr) => match width {
                Width::Byte => bus.read_byte(addr).map(|v| v as u32),
                Width::Word => bus.read_word(addr).map(|v| v as u32),
                Width::Long => bus.read_long(addr),
            }
            .map_err(|_| Trap::ExtendedInstruction),
        }
    }

    #[must_use]
    pub(crate) fn write_operand(&mut self, bus: &mut impl Bus, op: Operand, width: Width, value: u32) -> Result<(), Trap> {
        match op {
            Operand::Reg(r) => {
                match width {
                    Width::Byte => self.regs.set_rb(r, value as u8),
                    Width::Word => self.regs.set_rw(r, value as u16),
                    Width::Long => self.regs.set_rl(r, value),
                }
                Ok(())
            }
            Operand::Imm(_) => unreachable!("an immediate operand is never a write destination"),
            Operand::Mem(addr) => match width {
                Width::Byte => bus.write_byte(addr, value as u8),
                Width::Word => bus.write_word(addr, value as u16),
                Width::Long => bus.write_long(addr, value),
            }
            .map_err(|_| Trap::ExtendedInstruction),
        }
    }
}
