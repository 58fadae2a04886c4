//! The fetch/decode/dispatch loop: trap entry, the addressing-mode decode
//! shared by every multi-operand instruction, and one handler per
//! [`Dispatch`] variant.

use crate::addressing_modes::AddressingMode;
use crate::exception::Trap;
use crate::flags::{add_flags, com_flags, inc_dec_flags, logical_flags, neg_flags, shift_flags, sub_flags, FlagResult};
use crate::instruction::{StepInfo, Width};
use crate::isa::{AluLongOp, AluOp, BitOp, BlockDir, BlockOp, Dispatch, LdctlTarget, ModeCode, MulDivOp, RotateCarryOp, RotateOp, ShiftOp, UnaryOp};
use crate::memory_access::Bus;
use crate::operand::Operand;
use crate::registers::SP;
use crate::utils::sign_extend;
use crate::Cpu;

fn mode_nibble(opcode: u16) -> u8 {
    (opcode >> 4) as u8 & 0xF
}

fn reg_nibble(opcode: u16) -> u8 {
    opcode as u8 & 0xF
}

impl Cpu {
    fn push_word(&mut self, bus: &mut impl Bus, value: u16) -> Result<(), Trap> {
        let sp = self.regs.rw(SP).wrapping_sub(2);
        self.regs.set_rw(SP, sp);
        bus.write_word(sp, value).map_err(|_| Trap::ExtendedInstruction)
    }

    fn pop_word(&mut self, bus: &mut impl Bus) -> Result<u16, Trap> {
        let sp = self.regs.rw(SP);
        let value = bus.read_word(sp).map_err(|_| Trap::ExtendedInstruction)?;
        self.regs.set_rw(SP, sp.wrapping_add(2));
        Ok(value)
    }

    fn push_long(&mut self, bus: &mut impl Bus, value: u32) -> Result<(), Trap> {
        self.push_word(bus, value as u16)?;
        self.push_word(bus, (value >> 16) as u16)
    }

    fn pop_long(&mut self, bus: &mut impl Bus) -> Result<u32, Trap> {
        let hi = self.pop_word(bus)?;
        let lo = self.pop_word(bus)?;
        Ok((hi as u32) << 16 | lo as u32)
    }

    fn require_system(&self) -> Result<(), Trap> {
        if self.fcw.system {
            Ok(())
        } else {
            Err(Trap::PrivilegedInstruction)
        }
    }

    /// Pushes the old FCW then old PC, pushes `id` (extended to a word) for
    /// vectored interrupt / system call, then loads the new FCW/PC from the
    /// trap's PSAP-relative slot and clears the matching pending latch.
    fn enter_trap(&mut self, bus: &mut impl Bus, trap: Trap, id: Option<u8>) {
        let old_fcw: u16 = self.fcw.into();
        let old_pc = self.pc;
        // A bus error while saving context leaves the core halted rather
        // than recursing into another trap.
        if self.push_word(bus, old_fcw).is_err() || self.push_word(bus, old_pc).is_err() {
            self.halted = true;
            return;
        }
        if let Some(id) = id {
            if self.push_word(bus, id as u16).is_err() {
                self.halted = true;
                return;
            }
        }

        let fcw = bus.read_word(self.psap.wrapping_add(trap.fcw_offset())).unwrap_or(0);
        let pc = bus.read_word(self.psap.wrapping_add(trap.pc_offset())).unwrap_or(0);
        self.fcw = crate::flags::Fcw::from(fcw);
        self.pc = pc;

        match trap {
            Trap::Nmi => self.nmi_latched = false,
            Trap::NonVectoredInterrupt => self.nvi_asserted = false,
            Trap::VectoredInterrupt => self.vi_asserted = false,
            _ => {}
        }
    }

    /// Resolves the source operand of a two-operand instruction whose
    /// destination is always a register named in the opcode's low nibble.
    /// Every non-register mode consumes exactly one extension word.
    fn decode_binary_src(&mut self, bus: &mut impl Bus, opcode: u16, width: Width) -> Result<Operand, Trap> {
        let mode = ModeCode::from_nibble(mode_nibble(opcode)).ok_or(Trap::ExtendedInstruction)?;
        match mode {
            ModeCode::Reg => {
                let w = self.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
                Ok(Operand::Reg(w as u8 & 0xF))
            }
            ModeCode::Imm => match width {
                Width::Long => {
                    let hi = self.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
                    let lo = self.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
                    Ok(Operand::Imm((hi as u32) << 16 | lo as u32))
                }
                Width::Word => {
                    let w = self.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
                    Ok(Operand::Imm(w as u32))
                }
                Width::Byte => {
                    let w = self.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
                    Ok(Operand::Imm(w as u32 & 0xFF))
                }
            },
            ModeCode::Ir => {
                let w = self.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
                let reg = w as u8 & 0xF;
                Self::check_indirect_register(reg)?;
                Ok(Operand::Mem(self.regs.rw(reg)))
            }
            ModeCode::Da => {
                let addr = self.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
                Ok(Operand::Mem(addr))
            }
            ModeCode::X => {
                let w = self.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
                let reg = w as u8 & 0xF;
                Self::check_indirect_register(reg)?;
                let disp = (w >> 4) & 0x0FFF;
                Ok(Operand::Mem(disp.wrapping_add(self.regs.rw(reg))))
            }
            ModeCode::Ba => {
                let w = self.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
                let reg = w as u8 & 0xF;
                Self::check_indirect_register(reg)?;
                let disp12 = ((w >> 4) & 0x0FFF) as u32;
                let disp = sign_extend(disp12, 12) as u16;
                Ok(Operand::Mem(self.regs.rw(reg).wrapping_add(disp)))
            }
            ModeCode::Bx => {
                let addr = self.resolve_address_bx(bus)?;
                Ok(Operand::Mem(addr))
            }
        }
    }

    /// Resolves the single read-modify-write operand of a unary instruction.
    /// `ModeCode::Reg` needs no extension word (the opcode's register nibble
    /// already names the whole operand); the indirect modes reuse that same
    /// nibble as the address register and consume one extension word for
    /// whatever else the mode needs (a displacement, or a second register
    /// for `Bx`).
    fn decode_unary_operand(&mut self, bus: &mut impl Bus, opcode: u16) -> Result<Operand, Trap> {
        let mode = ModeCode::from_nibble(mode_nibble(opcode)).ok_or(Trap::ExtendedInstruction)?;
        let reg = reg_nibble(opcode);
        match mode {
            ModeCode::Reg => Ok(Operand::Reg(reg)),
            ModeCode::Imm => Err(Trap::ExtendedInstruction),
            ModeCode::Ir => {
                Self::check_indirect_register(reg)?;
                Ok(Operand::Mem(self.regs.rw(reg)))
            }
            ModeCode::Da => {
                let addr = self.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
                Ok(Operand::Mem(addr))
            }
            ModeCode::X => {
                Self::check_indirect_register(reg)?;
                let disp = self.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
                Ok(Operand::Mem(disp.wrapping_add(self.regs.rw(reg))))
            }
            ModeCode::Ba => {
                Self::check_indirect_register(reg)?;
                let disp = self.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)? as i16;
                Ok(Operand::Mem(self.regs.rw(reg).wrapping_add(disp as u16)))
            }
            ModeCode::Bx => {
                Self::check_indirect_register(reg)?;
                let w = self.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
                let index = w as u8 & 0xF;
                Self::check_indirect_register(index)?;
                Ok(Operand::Mem(self.regs.rw(reg).wrapping_add(self.regs.rw(index))))
            }
        }
    }

    /// Memory-only variant of [`Cpu::decode_unary_operand`], used by
    /// `StoreFromReg` where the destination can never be a register (that
    /// case is just `LoadToReg` in reverse).
    fn decode_store_dst(&mut self, bus: &mut impl Bus, opcode: u16) -> Result<Operand, Trap> {
        match self.decode_unary_operand(bus, opcode)? {
            Operand::Reg(_) => Err(Trap::ExtendedInstruction),
            other => Ok(other),
        }
    }
}

/// Runs exactly one instruction, or one iteration of a repeating block
/// instruction, honoring any pending interrupt first.
pub(crate) fn step(cpu: &mut Cpu, bus: &mut impl Bus) -> StepInfo {
    if let Some(trap_info) = check_pending_interrupts(cpu, bus) {
        return trap_info;
    }

    if cpu.is_halted() {
        return StepInfo::new(1);
    }

    let start_pc = cpu.pc;
    let opcode = match cpu.fetch_word(bus) {
        Ok(w) => w,
        Err(_) => return trap(cpu, bus, Trap::ExtendedInstruction),
    };
    cpu.tick_refresh();

    match execute(cpu, bus, start_pc, opcode) {
        Ok(info) => {
            cpu.bump_instructions();
            cpu.add_cycles(info.cycles);
            info
        }
        Err(t) => trap(cpu, bus, t),
    }
}

/// Enters every trap except `SystemCall`, which carries its own `id` byte
/// and is handled directly by [`exec_sc`] instead of going through here.
fn trap(cpu: &mut Cpu, bus: &mut impl Bus, t: Trap) -> StepInfo {
    cpu.enter_trap(bus, t, None);
    StepInfo::trapped(t)
}

fn check_pending_interrupts(cpu: &mut Cpu, bus: &mut impl Bus) -> Option<StepInfo> {
    if cpu.take_nmi() {
        cpu.set_halted(false);
        cpu.enter_trap(bus, Trap::Nmi, None);
        return Some(StepInfo::new(0));
    }
    if cpu.has_pending_interrupt() {
        cpu.set_halted(false);
        if cpu.fcw.nvie && cpu.nvi_pending() {
            cpu.enter_trap(bus, Trap::NonVectoredInterrupt, None);
            return Some(StepInfo::new(0));
        }
        if cpu.fcw.vie && cpu.vi_pending() {
            let vector = cpu.vi_vector();
            cpu.enter_trap(bus, Trap::VectoredInterrupt, Some(vector));
            return Some(StepInfo::new(0));
        }
    }
    None
}

const BASE_CYCLES: u32 = 4;

fn execute(cpu: &mut Cpu, bus: &mut impl Bus, start_pc: u16, opcode: u16) -> Result<StepInfo, Trap> {
    match cpu.dispatch(opcode) {
        Dispatch::Alu { op, width } => exec_alu(cpu, bus, opcode, op, width),
        Dispatch::AluLong { op } => exec_alu_long(cpu, bus, opcode, op),
        Dispatch::LoadToReg { width } => exec_load_to_reg(cpu, bus, opcode, width),
        Dispatch::StoreFromReg { width } => exec_store_from_reg(cpu, bus, opcode, width),
        Dispatch::LoadAddress => exec_load_address(cpu, bus, opcode),
        Dispatch::LoadRelative => exec_load_relative(cpu, bus, opcode, start_pc),
        Dispatch::LoadByteImmediate => exec_load_byte_immediate(cpu, opcode),
        Dispatch::LoadConstant => exec_load_constant(cpu, opcode),
        Dispatch::Push { width } => exec_push(cpu, bus, opcode, width),
        Dispatch::Pop { width } => exec_pop(cpu, bus, opcode, width),
        Dispatch::Unary { op, width } => exec_unary(cpu, bus, opcode, op, width),
        Dispatch::IncDec { is_inc, width } => exec_inc_dec(cpu, opcode, is_inc, width),
        Dispatch::MulDiv { op } => exec_muldiv(cpu, bus, opcode, op),
        Dispatch::BitImm { op, width } => exec_bit_imm(cpu, bus, opcode, op, width),
        Dispatch::BitReg { op, width } => exec_bit_reg(cpu, bus, opcode, op, width),
        Dispatch::Shift { op, width } => exec_shift(cpu, opcode, op, width),
        Dispatch::Rotate { op, width } => exec_rotate(cpu, opcode, op, width),
        Dispatch::RotateCarry { op, width } => exec_rotate_carry(cpu, opcode, op, width),
        Dispatch::RotateDigit { op } => exec_rotate_digit(cpu, bus, opcode, op),
        Dispatch::Jp { cc } => exec_jp(cpu, bus, cc),
        Dispatch::Jr { cc } => exec_jr(cpu, opcode, cc, start_pc),
        Dispatch::Call => exec_call(cpu, bus),
        Dispatch::Calr => exec_calr(cpu, bus, opcode, start_pc),
        Dispatch::Ret { cc } => exec_ret(cpu, bus, cc),
        Dispatch::Djnz => exec_djnz(cpu, opcode, start_pc),
        Dispatch::Dbjnz => exec_dbjnz(cpu, opcode, start_pc),
        Dispatch::Nop => Ok(StepInfo::new(BASE_CYCLES)),
        Dispatch::Halt => exec_halt(cpu),
        Dispatch::Di => exec_di_ei(cpu, opcode, false),
        Dispatch::Ei => exec_di_ei(cpu, opcode, true),
        Dispatch::Ldps => exec_ldps(cpu, bus),
        Dispatch::Ldctl { target, store } => exec_ldctl(cpu, opcode, target, store),
        Dispatch::Sc => exec_sc(cpu, bus, opcode),
        Dispatch::Reset => exec_reset(cpu, bus),
        Dispatch::Io { write, width, special } => exec_io(cpu, bus, opcode, write, width, special),
        Dispatch::Block { op, dir, repeat, width } => exec_block(cpu, bus, start_pc, op, dir, repeat, width),
        Dispatch::ExtendedInstructionTrap => Err(Trap::ExtendedInstruction),
    }
}

fn apply_flags(cpu: &mut Cpu, f: FlagResult) {
    cpu.fcw.apply(f);
}

fn width_of_operand(op: Operand, width: Width) -> Result<(), Trap> {
    if let Operand::Reg(r) = op {
        Cpu::check_long_register(r, width)
    } else {
        Ok(())
    }
}

fn exec_alu(cpu: &mut Cpu, bus: &mut impl Bus, opcode: u16, op: AluOp, width: Width) -> Result<StepInfo, Trap> {
    let dst_reg = reg_nibble(opcode);
    let src = cpu.decode_binary_src(bus, opcode, width)?;
    let a = cpu.read_operand(bus, Operand::Reg(dst_reg), width)?;
    let b = cpu.read_operand(bus, src, width)?;

    let (result, write_back) = match op {
        AluOp::Add => {
            let (r, f) = add_flags(a, b, false, width.bits());
            apply_flags(cpu, f);
            (r, true)
        }
        AluOp::Adc => {
            let (r, f) = add_flags(a, b, cpu.fcw.c, width.bits());
            apply_flags(cpu, f);
            (r, true)
        }
        AluOp::Sub => {
            let (r, f) = sub_flags(a, b, false, width.bits());
            apply_flags(cpu, f);
            (r, true)
        }
        AluOp::Sbc => {
            let (r, f) = sub_flags(a, b, cpu.fcw.c, width.bits());
            apply_flags(cpu, f);
            (r, true)
        }
        AluOp::And => {
            let r = a & b;
            apply_flags(cpu, logical_flags(r, width.bits()));
            (r, true)
        }
        AluOp::Or => {
            let r = a | b;
            apply_flags(cpu, logical_flags(r, width.bits()));
            (r, true)
        }
        AluOp::Xor => {
            let r = a ^ b;
            apply_flags(cpu, logical_flags(r, width.bits()));
            (r, true)
        }
        AluOp::Cp => {
            let (r, f) = sub_flags(a, b, false, width.bits());
            apply_flags(cpu, f);
            (r, false)
        }
        AluOp::Test => {
            let r = a & b;
            apply_flags(cpu, logical_flags(r, width.bits()));
            (r, false)
        }
    };
    if write_back {
        cpu.write_operand(bus, Operand::Reg(dst_reg), width, result)?;
    }
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_alu_long(cpu: &mut Cpu, bus: &mut impl Bus, opcode: u16, op: AluLongOp) -> Result<StepInfo, Trap> {
    let dst_reg = reg_nibble(opcode);
    Cpu::check_long_register(dst_reg, Width::Long)?;
    let src = cpu.decode_binary_src(bus, opcode, Width::Long)?;
    width_of_operand(src, Width::Long)?;
    let a = cpu.read_operand(bus, Operand::Reg(dst_reg), Width::Long)?;
    let b = cpu.read_operand(bus, src, Width::Long)?;

    let (result, write_back) = match op {
        AluLongOp::Add => {
            let (r, f) = add_flags(a, b, false, 32);
            apply_flags(cpu, f);
            (r, true)
        }
        AluLongOp::Sub => {
            let (r, f) = sub_flags(a, b, false, 32);
            apply_flags(cpu, f);
            (r, true)
        }
        AluLongOp::Cp => {
            let (r, f) = sub_flags(a, b, false, 32);
            apply_flags(cpu, f);
            (r, false)
        }
    };
    if write_back {
        cpu.write_operand(bus, Operand::Reg(dst_reg), Width::Long, result)?;
    }
    Ok(StepInfo::new(BASE_CYCLES * 2))
}

fn exec_load_to_reg(cpu: &mut Cpu, bus: &mut impl Bus, opcode: u16, width: Width) -> Result<StepInfo, Trap> {
    let dst_reg = reg_nibble(opcode);
    Cpu::check_long_register(dst_reg, width)?;
    let src = cpu.decode_binary_src(bus, opcode, width)?;
    width_of_operand(src, width)?;
    let value = cpu.read_operand(bus, src, width)?;
    cpu.write_operand(bus, Operand::Reg(dst_reg), width, value)?;
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_store_from_reg(cpu: &mut Cpu, bus: &mut impl Bus, opcode: u16, width: Width) -> Result<StepInfo, Trap> {
    let src_reg = reg_nibble(opcode);
    Cpu::check_long_register(src_reg, width)?;
    let dst = cpu.decode_store_dst(bus, opcode)?;
    let value = cpu.read_operand(bus, Operand::Reg(src_reg), width)?;
    cpu.write_operand(bus, dst, width, value)?;
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_load_address(cpu: &mut Cpu, bus: &mut impl Bus, opcode: u16) -> Result<StepInfo, Trap> {
    let dst_reg = reg_nibble(opcode);
    let mode = ModeCode::from_nibble(mode_nibble(opcode)).ok_or(Trap::ExtendedInstruction)?;
    let addr = match mode {
        ModeCode::Ir => {
            Cpu::check_indirect_register(dst_reg)?;
            cpu.regs.rw(dst_reg)
        }
        ModeCode::Da => cpu.resolve_address(bus, AddressingMode::Da, 0).map_err(|_| Trap::ExtendedInstruction)?,
        ModeCode::X => {
            let w = cpu.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
            let reg = w as u8 & 0xF;
            Cpu::check_indirect_register(reg)?;
            let disp = (w >> 4) & 0x0FFF;
            disp.wrapping_add(cpu.regs.rw(reg))
        }
        ModeCode::Ba => {
            let w = cpu.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
            let reg = w as u8 & 0xF;
            Cpu::check_indirect_register(reg)?;
            let disp12 = ((w >> 4) & 0x0FFF) as u32;
            let disp = sign_extend(disp12, 12) as u16;
            cpu.regs.rw(reg).wrapping_add(disp)
        }
        ModeCode::Bx => cpu.resolve_address_bx(bus)?,
        ModeCode::Reg | ModeCode::Imm => return Err(Trap::ExtendedInstruction),
    };
    cpu.regs.set_rw(dst_reg, addr);
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_load_relative(cpu: &mut Cpu, bus: &mut impl Bus, opcode: u16, start_pc: u16) -> Result<StepInfo, Trap> {
    let dst_reg = reg_nibble(opcode);
    let disp = cpu.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)? as i16;
    let addr = start_pc.wrapping_add(disp as u16);
    let value = bus.read_word(addr).map_err(|_| Trap::ExtendedInstruction)?;
    cpu.regs.set_rw(dst_reg, value);
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_load_byte_immediate(cpu: &mut Cpu, opcode: u16) -> Result<StepInfo, Trap> {
    let reg = (opcode >> 8) as u8 & 0xF;
    let imm = opcode as u8;
    cpu.regs.set_rb(reg, imm);
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_load_constant(cpu: &mut Cpu, opcode: u16) -> Result<StepInfo, Trap> {
    let reg = (opcode >> 4) as u8 & 0xF;
    let k = opcode as u8 & 0xF;
    cpu.regs.set_rw(reg, k as u16);
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_push(cpu: &mut Cpu, bus: &mut impl Bus, opcode: u16, width: Width) -> Result<StepInfo, Trap> {
    let reg = reg_nibble(opcode);
    match width {
        Width::Long => {
            Cpu::check_long_register(reg, width)?;
            let v = cpu.regs.rl(reg);
            cpu.push_long(bus, v)?;
        }
        _ => {
            let v = cpu.regs.rw(reg);
            cpu.push_word(bus, v)?;
        }
    }
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_pop(cpu: &mut Cpu, bus: &mut impl Bus, opcode: u16, width: Width) -> Result<StepInfo, Trap> {
    let reg = reg_nibble(opcode);
    match width {
        Width::Long => {
            Cpu::check_long_register(reg, width)?;
            let v = cpu.pop_long(bus)?;
            cpu.regs.set_rl(reg, v);
        }
        _ => {
            let v = cpu.pop_word(bus)?;
            cpu.regs.set_rw(reg, v);
        }
    }
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_unary(cpu: &mut Cpu, bus: &mut impl Bus, opcode: u16, op: UnaryOp, width: Width) -> Result<StepInfo, Trap> {
    let operand = cpu.decode_unary_operand(bus, opcode)?;
    width_of_operand(operand, width)?;
    let v = cpu.read_operand(bus, operand, width)?;
    let result = match op {
        UnaryOp::Neg => {
            let r = v.wrapping_neg() & mask_of(width);
            apply_flags(cpu, neg_flags(v, r, width.bits()));
            r
        }
        UnaryOp::Com => {
            let r = !v & mask_of(width);
            apply_flags(cpu, com_flags(r, width.bits()));
            r
        }
    };
    cpu.write_operand(bus, operand, width, result)?;
    Ok(StepInfo::new(BASE_CYCLES))
}

fn mask_of(width: Width) -> u32 {
    match width {
        Width::Byte => 0xFF,
        Width::Word => 0xFFFF,
        Width::Long => 0xFFFF_FFFF,
    }
}

fn exec_inc_dec(cpu: &mut Cpu, opcode: u16, is_inc: bool, width: Width) -> Result<StepInfo, Trap> {
    let reg = (opcode >> 4) as u8 & 0xF;
    let n = (opcode as u8 & 0xF) as u32 + 1;
    let before = match width {
        Width::Byte => cpu.regs.rb(reg) as u32,
        _ => cpu.regs.rw(reg) as u32,
    };
    let after = if is_inc { before.wrapping_add(n) } else { before.wrapping_sub(n) } & mask_of(width);
    apply_flags(cpu, inc_dec_flags(before, after, is_inc, width.bits()));
    match width {
        Width::Byte => cpu.regs.set_rb(reg, after as u8),
        _ => cpu.regs.set_rw(reg, after as u16),
    }
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_muldiv(cpu: &mut Cpu, bus: &mut impl Bus, opcode: u16, op: MulDivOp) -> Result<StepInfo, Trap> {
    let dst_reg = reg_nibble(opcode);
    let width = if matches!(op, MulDivOp::MultL | MulDivOp::DivL) { Width::Long } else { Width::Word };
    Cpu::check_long_register(dst_reg, Width::Long)?;
    let src = cpu.decode_binary_src(bus, opcode, width)?;
    let src_value = cpu.read_operand(bus, src, width)?;

    match op {
        MulDivOp::Mult => {
            let dividend = cpu.regs.rw(dst_reg.wrapping_add(1)) as i16 as i32;
            let product = dividend * src_value as i16 as i32;
            cpu.regs.set_rl(dst_reg, product as u32);
            apply_flags(cpu, logical_flags(product as u32, 32));
        }
        MulDivOp::MultL => {
            let dividend = cpu.regs.rl(dst_reg.wrapping_add(2)) as i32 as i64;
            let product = dividend * src_value as i32 as i64;
            // Written as two explicit long halves rather than `set_rq`: `dst_reg`
            // is only guaranteed even (checked above), not a multiple of 4.
            cpu.regs.set_rl(dst_reg, (product >> 32) as u32);
            cpu.regs.set_rl(dst_reg.wrapping_add(2), product as u32);
            apply_flags(cpu, logical_flags(product as u32, 32));
        }
        MulDivOp::Div => {
            if src_value == 0 {
                return Err(Trap::ExtendedInstruction);
            }
            let dividend = cpu.regs.rl(dst_reg) as i32;
            let divisor = src_value as i16 as i32;
            let quotient = dividend / divisor;
            if quotient > i16::MAX as i32 || quotient < i16::MIN as i32 {
                return Err(Trap::ExtendedInstruction);
            }
            let remainder = dividend % divisor;
            cpu.regs.set_rw(dst_reg, quotient as u16);
            cpu.regs.set_rw(dst_reg.wrapping_add(1), remainder as u16);
            apply_flags(cpu, logical_flags(quotient as u32, 16));
        }
        MulDivOp::DivL => {
            if src_value == 0 {
                return Err(Trap::ExtendedInstruction);
            }
            // Read as two explicit long halves rather than `rq`: `dst_reg` is
            // only guaranteed even (checked above), not a multiple of 4.
            let hi = cpu.regs.rl(dst_reg) as u64;
            let lo = cpu.regs.rl(dst_reg.wrapping_add(2)) as u64;
            let dividend = ((hi << 32) | lo) as i64;
            let divisor = src_value as i32 as i64;
            let quotient = dividend / divisor;
            if quotient > i32::MAX as i64 || quotient < i32::MIN as i64 {
                return Err(Trap::ExtendedInstruction);
            }
            let remainder = dividend % divisor;
            cpu.regs.set_rl(dst_reg, quotient as u32);
            cpu.regs.set_rl(dst_reg.wrapping_add(2), remainder as u32);
            apply_flags(cpu, logical_flags(quotient as u32, 32));
        }
    }
    Ok(StepInfo::new(BASE_CYCLES * 4))
}

/// The operand bit-manipulation instructions use a one-bit mode selector
/// (opcode bit 3) between register-direct and register-indirect, rather than
/// the full `ModeCode` space every other multi-operand family uses.
fn bit_operand(cpu: &Cpu, opcode: u16) -> Result<Operand, Trap> {
    let reg = reg_nibble(opcode);
    if (opcode >> 3) & 1 == 0 {
        Ok(Operand::Reg(reg))
    } else {
        Cpu::check_indirect_register(reg)?;
        Ok(Operand::Mem(cpu.regs.rw(reg)))
    }
}

fn exec_bit_imm(cpu: &mut Cpu, bus: &mut impl Bus, opcode: u16, op: BitOp, width: Width) -> Result<StepInfo, Trap> {
    let pos = ((opcode >> 4) & 0xF) as u32;
    let operand = bit_operand(cpu, opcode)?;
    let value = cpu.read_operand(bus, operand, width)?;
    let bit = value & (1 << pos) != 0;
    match op {
        BitOp::Bit => cpu.fcw.z = !bit,
        BitOp::Set => cpu.write_operand(bus, operand, width, value | (1 << pos))?,
        BitOp::Res => cpu.write_operand(bus, operand, width, value & !(1 << pos))?,
    }
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_bit_reg(cpu: &mut Cpu, bus: &mut impl Bus, opcode: u16, op: BitOp, width: Width) -> Result<StepInfo, Trap> {
    let pos_reg = ((opcode >> 4) & 0xF) as u8;
    let pos = (cpu.regs.rw(pos_reg) & (width.bits() - 1) as u16) as u32;
    let operand = bit_operand(cpu, opcode)?;
    let value = cpu.read_operand(bus, operand, width)?;
    let bit = value & (1 << pos) != 0;
    match op {
        BitOp::Bit => cpu.fcw.z = !bit,
        BitOp::Set => cpu.write_operand(bus, operand, width, value | (1 << pos))?,
        BitOp::Res => cpu.write_operand(bus, operand, width, value & !(1 << pos))?,
    }
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_shift(cpu: &mut Cpu, opcode: u16, op: ShiftOp, width: Width) -> Result<StepInfo, Trap> {
    let reg = reg_nibble(opcode);
    let count = (((opcode >> 4) & 0xF) + 1) as u32;
    let before = cpu.read_operand_reg(reg, width);
    let sign_bit = match width { Width::Byte => 0x80u32, Width::Word => 0x8000, Width::Long => 0x8000_0000 };
    let (result, bit_out) = match op {
        ShiftOp::Sla => {
            let r = (before << count) & mask_of(width);
            let bit_out = count > 0 && (before << (count - 1)) & sign_bit != 0;
            (r, bit_out)
        }
        ShiftOp::Sra => {
            let signed = sign_extend(before, width.bits());
            let r = (signed >> count) as u32 & mask_of(width);
            let bit_out = count > 0 && (before >> (count - 1)) & 1 != 0;
            (r, bit_out)
        }
        ShiftOp::Sll => {
            let r = (before << count) & mask_of(width);
            let bit_out = count > 0 && (before << (count - 1)) & sign_bit != 0;
            (r, bit_out)
        }
        ShiftOp::Srl => {
            let r = (before >> count) & mask_of(width);
            let bit_out = count > 0 && (before >> (count - 1)) & 1 != 0;
            (r, bit_out)
        }
    };
    let sign_changed = (before & sign_bit != 0) != (result & sign_bit != 0);
    apply_flags(cpu, shift_flags(result, bit_out, sign_changed, width.bits()));
    cpu.write_operand_reg(reg, width, result);
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_rotate(cpu: &mut Cpu, opcode: u16, op: RotateOp, width: Width) -> Result<StepInfo, Trap> {
    let reg = reg_nibble(opcode);
    let amount = if (opcode >> 4) & 1 == 0 { 1 } else { 2 };
    let before = cpu.read_operand_reg(reg, width);
    let bits = width.bits();
    let mask = mask_of(width);
    let mut v = before;
    let mut bit_out = false;
    for _ in 0..amount {
        v = match op {
            RotateOp::Rl => {
                bit_out = v & (1 << (bits - 1)) != 0;
                ((v << 1) | bit_out as u32) & mask
            }
            RotateOp::Rr => {
                bit_out = v & 1 != 0;
                ((v >> 1) | ((bit_out as u32) << (bits - 1))) & mask
            }
        };
    }
    apply_flags(cpu, shift_flags(v, bit_out, false, bits));
    cpu.write_operand_reg(reg, width, v);
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_rotate_carry(cpu: &mut Cpu, opcode: u16, op: RotateCarryOp, width: Width) -> Result<StepInfo, Trap> {
    let reg = reg_nibble(opcode);
    let before = cpu.read_operand_reg(reg, width);
    let bits = width.bits();
    let mask = mask_of(width);
    let carry_in = cpu.fcw.c as u32;
    let (result, bit_out) = match op {
        RotateCarryOp::Rlc => {
            let bit_out = before & (1 << (bits - 1)) != 0;
            (((before << 1) | carry_in) & mask, bit_out)
        }
        RotateCarryOp::Rrc => {
            let bit_out = before & 1 != 0;
            (((before >> 1) | (carry_in << (bits - 1))) & mask, bit_out)
        }
    };
    apply_flags(cpu, shift_flags(result, bit_out, false, bits));
    cpu.write_operand_reg(reg, width, result);
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_rotate_digit(cpu: &mut Cpu, bus: &mut impl Bus, opcode: u16, op: RotateCarryOp) -> Result<StepInfo, Trap> {
    let addr_reg = reg_nibble(opcode);
    Cpu::check_indirect_register(addr_reg)?;
    let addr = cpu.regs.rw(addr_reg);
    let mem = bus.read_byte(addr).map_err(|_| Trap::ExtendedInstruction)?;
    let acc_reg = 0u8; // RL0 low byte holds the accumulator nibble, by convention of this core.
    let acc = cpu.regs.rb(acc_reg.wrapping_add(1)) & 0xF;
    let (new_mem, new_acc) = match op {
        RotateCarryOp::Rlc => (((mem << 4) | acc) & 0xFF, mem >> 4),
        RotateCarryOp::Rrc => (((acc << 4) | (mem >> 4)) & 0xFF, mem & 0xF),
    };
    bus.write_byte(addr, new_mem).map_err(|_| Trap::ExtendedInstruction)?;
    cpu.regs.set_rb(1, new_acc);
    apply_flags(cpu, logical_flags(new_mem as u32, 8));
    Ok(StepInfo::new(BASE_CYCLES * 2))
}

fn exec_jp(cpu: &mut Cpu, bus: &mut impl Bus, cc: u8) -> Result<StepInfo, Trap> {
    let addr = cpu.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
    if cpu.condition(cc) {
        cpu.pc = addr;
    }
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_jr(cpu: &mut Cpu, opcode: u16, cc: u8, start_pc: u16) -> Result<StepInfo, Trap> {
    let disp = (opcode as u8 as i8 as i16) * 2;
    if cpu.condition(cc) {
        cpu.pc = start_pc.wrapping_add(disp as u16);
    }
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_call(cpu: &mut Cpu, bus: &mut impl Bus) -> Result<StepInfo, Trap> {
    let addr = cpu.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
    let ret = cpu.pc;
    cpu.push_word(bus, ret)?;
    cpu.pc = addr;
    Ok(StepInfo::new(BASE_CYCLES * 2))
}

fn exec_calr(cpu: &mut Cpu, bus: &mut impl Bus, opcode: u16, start_pc: u16) -> Result<StepInfo, Trap> {
    let disp = (opcode as u8 as i8 as i16) * 2;
    let ret = cpu.pc;
    cpu.push_word(bus, ret)?;
    cpu.pc = start_pc.wrapping_add(disp as u16);
    Ok(StepInfo::new(BASE_CYCLES * 2))
}

fn exec_ret(cpu: &mut Cpu, bus: &mut impl Bus, cc: u8) -> Result<StepInfo, Trap> {
    if cpu.condition(cc) {
        let addr = cpu.pop_word(bus)?;
        cpu.pc = addr;
    }
    Ok(StepInfo::new(BASE_CYCLES))
}

/// `DJNZ`/`DBJNZ` pack a 4-bit register and a 6-bit signed backward
/// displacement into the low 10 bits of the opcode word (register in bits
/// 9..6, displacement in bits 5..0) — see the dedicated high-byte block these
/// two families claim in [`crate::isa::build_dispatch_table`].
fn decode_djnz_fields(opcode: u16) -> (u8, i16) {
    let reg = ((opcode >> 6) & 0xF) as u8;
    let disp = sign_extend((opcode & 0x3F) as u32, 6) as i16 * 2;
    (reg, disp)
}

fn exec_djnz(cpu: &mut Cpu, opcode: u16, start_pc: u16) -> Result<StepInfo, Trap> {
    let (reg, disp) = decode_djnz_fields(opcode);
    let v = cpu.regs.rw(reg).wrapping_sub(1);
    cpu.regs.set_rw(reg, v);
    if v != 0 {
        cpu.pc = start_pc.wrapping_add(disp as u16);
    }
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_dbjnz(cpu: &mut Cpu, opcode: u16, start_pc: u16) -> Result<StepInfo, Trap> {
    let (reg, disp) = decode_djnz_fields(opcode);
    let v = cpu.regs.rb(reg).wrapping_sub(1);
    cpu.regs.set_rb(reg, v);
    if v != 0 {
        cpu.pc = start_pc.wrapping_add(disp as u16);
    }
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_halt(cpu: &mut Cpu) -> Result<StepInfo, Trap> {
    cpu.require_system()?;
    cpu.set_halted(true);
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_di_ei(cpu: &mut Cpu, opcode: u16, enable: bool) -> Result<StepInfo, Trap> {
    cpu.require_system()?;
    let mask = opcode as u8 & 0x3;
    if mask & 0b01 != 0 {
        cpu.fcw.vie = enable;
    }
    if mask & 0b10 != 0 {
        cpu.fcw.nvie = enable;
    }
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_ldps(cpu: &mut Cpu, bus: &mut impl Bus) -> Result<StepInfo, Trap> {
    cpu.require_system()?;
    let pc = cpu.pop_word(bus)?;
    let fcw = cpu.pop_word(bus)?;
    cpu.pc = pc;
    cpu.fcw = crate::flags::Fcw::from(fcw);
    Ok(StepInfo::new(BASE_CYCLES * 2))
}

fn exec_ldctl(cpu: &mut Cpu, opcode: u16, target: LdctlTarget, store: bool) -> Result<StepInfo, Trap> {
    cpu.require_system()?;
    let reg = reg_nibble(opcode);
    if store {
        let v = match target {
            LdctlTarget::Fcw => cpu.fcw.into(),
            LdctlTarget::FlagsByte => cpu.fcw.flags_byte() as u16,
            LdctlTarget::Refresh => cpu.refresh(),
            LdctlTarget::Psap => cpu.psap,
            LdctlTarget::Nsp => cpu.nsp(),
        };
        cpu.regs.set_rw(reg, v);
    } else {
        let v = cpu.regs.rw(reg);
        match target {
            LdctlTarget::Fcw => cpu.fcw = crate::flags::Fcw::from(v),
            LdctlTarget::FlagsByte => cpu.fcw.set_flags_byte(v as u8),
            LdctlTarget::Refresh => cpu.set_refresh(v),
            LdctlTarget::Psap => cpu.psap = v,
            LdctlTarget::Nsp => cpu.set_nsp(v),
        }
    }
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_sc(cpu: &mut Cpu, bus: &mut impl Bus, opcode: u16) -> Result<StepInfo, Trap> {
    let code = opcode as u8;
    cpu.enter_trap(bus, Trap::SystemCall, Some(code));
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_reset(cpu: &mut Cpu, bus: &mut impl Bus) -> Result<StepInfo, Trap> {
    cpu.require_system()?;
    bus.reset_instruction();
    cpu.reset(bus);
    Ok(StepInfo::new(BASE_CYCLES))
}

fn exec_io(cpu: &mut Cpu, bus: &mut impl Bus, opcode: u16, write: bool, width: Width, special: bool) -> Result<StepInfo, Trap> {
    cpu.require_system()?;
    let reg = reg_nibble(opcode);
    let port_is_reg = (opcode >> 4) & 1 != 0;
    let port = if port_is_reg {
        let w = cpu.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
        cpu.regs.rw(w as u8 & 0xF)
    } else {
        cpu.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?
    };

    if write {
        let value = cpu.read_operand_reg(reg, width);
        match (width, special) {
            (Width::Byte, false) => bus.io_write_byte(port, value as u8),
            (Width::Word, false) => bus.io_write_word(port, value as u16),
            (Width::Byte, true) => bus.sio_write_byte(port, value as u8),
            (Width::Word, true) => bus.sio_write_word(port, value as u16),
            (Width::Long, _) => return Err(Trap::ExtendedInstruction),
        }
        .map_err(|_| Trap::ExtendedInstruction)?;
    } else {
        let value = match (width, special) {
            (Width::Byte, false) => bus.io_read_byte(port).map(|v| v as u32),
            (Width::Word, false) => bus.io_read_word(port).map(|v| v as u32),
            (Width::Byte, true) => bus.sio_read_byte(port).map(|v| v as u32),
            (Width::Word, true) => bus.sio_read_word(port).map(|v| v as u32),
            (Width::Long, _) => return Err(Trap::ExtendedInstruction),
        }
        .map_err(|_| Trap::ExtendedInstruction)?;
        cpu.write_operand_reg(reg, width, value);
    }
    Ok(StepInfo::new(BASE_CYCLES * 2))
}

fn exec_block(
    cpu: &mut Cpu,
    bus: &mut impl Bus,
    start_pc: u16,
    op: BlockOp,
    dir: BlockDir,
    repeat: bool,
    width: Width,
) -> Result<StepInfo, Trap> {
    let fields = cpu.fetch_word(bus).map_err(|_| Trap::ExtendedInstruction)?;
    let dst_reg = (fields >> 12) as u8 & 0xF;
    let src_reg = (fields >> 8) as u8 & 0xF;
    let cnt_reg = (fields >> 4) as u8 & 0xF;
    let cc = fields as u8 & 0xF;

    let step: u16 = match (width, dir) {
        (Width::Byte, BlockDir::Inc) => 1,
        (Width::Byte, BlockDir::Dec) => 0u16.wrapping_sub(1),
        (_, BlockDir::Inc) => 2,
        (_, BlockDir::Dec) => 0u16.wrapping_sub(2),
    };

    let mut terminate_on_cc_match = false;
    match op {
        BlockOp::Ld => {
            let src_addr = cpu.regs.rw(src_reg);
            let dst_addr = cpu.regs.rw(dst_reg);
            let value = cpu.read_operand(bus, Operand::Mem(src_addr), width)?;
            cpu.write_operand(bus, Operand::Mem(dst_addr), width, value)?;
            cpu.regs.set_rw(src_reg, src_addr.wrapping_add(step));
            cpu.regs.set_rw(dst_reg, dst_addr.wrapping_add(step));
        }
        BlockOp::Cp => {
            // The "destination" register here holds the comparand value
            // itself, not an address — CPIR R3,@R4,R5 compares memory at
            // @R4 against the literal value in R3.
            let src_addr = cpu.regs.rw(src_reg);
            let comparand = cpu.read_operand_reg(dst_reg, width);
            let b = cpu.read_operand(bus, Operand::Mem(src_addr), width)?;
            let (_, f) = sub_flags(comparand, b, false, width.bits());
            apply_flags(cpu, f);
            cpu.regs.set_rw(src_reg, src_addr.wrapping_add(step));
            terminate_on_cc_match = repeat && cpu.condition(cc);
        }
        BlockOp::In => {
            let port_addr = cpu.regs.rw(src_reg);
            let dst_addr = cpu.regs.rw(dst_reg);
            let value = match width {
                Width::Byte => bus.io_read_byte(port_addr).map(|v| v as u32),
                _ => bus.io_read_word(port_addr).map(|v| v as u32),
            }
            .map_err(|_| Trap::ExtendedInstruction)?;
            cpu.write_operand(bus, Operand::Mem(dst_addr), width, value)?;
            cpu.regs.set_rw(dst_reg, dst_addr.wrapping_add(step));
        }
        BlockOp::Out => {
            let src_addr = cpu.regs.rw(src_reg);
            let port_addr = cpu.regs.rw(dst_reg);
            let value = cpu.read_operand(bus, Operand::Mem(src_addr), width)?;
            match width {
                Width::Byte => bus.io_write_byte(port_addr, value as u8),
                _ => bus.io_write_word(port_addr, value as u16),
            }
            .map_err(|_| Trap::ExtendedInstruction)?;
            cpu.regs.set_rw(src_reg, src_addr.wrapping_add(step));
        }
    }

    let cnt = cpu.regs.rw(cnt_reg).wrapping_sub(1);
    cpu.regs.set_rw(cnt_reg, cnt);
    cpu.fcw.pv = cnt == 0;

    let terminated = !repeat || cnt == 0 || terminate_on_cc_match;
    if !terminated {
        cpu.pc = start_pc;
    }
    Ok(StepInfo::new(BASE_CYCLES * 2))
}

impl Cpu {
    fn read_operand_reg(&self, reg: u8, width: Width) -> u32 {
        match width {
            Width::Byte => self.regs.rb(reg) as u32,
            Width::Word => self.regs.rw(reg) as u32,
            Width::Long => self.regs.rl(reg),
        }
    }

    fn write_operand_reg(&mut self, reg: u8, width: Width, value: u32) {
        match width {
            Width::Byte => self.regs.set_rb(reg, value as u8),
            Width::Word => self.regs.set_rw(reg, value as u16),
            Width::Long => self.regs.set_rl(reg, value),
        }
    }

    fn nvi_pending(&self) -> bool {
        self.nvi_asserted
    }

    fn vi_pending(&self) -> bool {
        self.vi_asserted
    }
}
