//! Register-file aliasing and reset/snapshot behavior, exercised through the
//! public [`Cpu`] API rather than [`z8000::registers`] directly.

mod harness;

use harness::Memory;
use z8000::Cpu;

#[test]
fn reset_loads_fcw_and_pc_from_psap() {
    let mut mem = Memory::new();
    mem.load(0x02, &[0x4000, 0x1234]);

    let mut cpu = Cpu::new();
    cpu.reset(&mut mem);

    assert_eq!(cpu.pc(), 0x1234);
    assert_eq!(cpu.snapshot().fcw, 0x4000);
}

#[test]
fn set_register_is_visible_through_snapshot() {
    let mut cpu = Cpu::new();
    cpu.set_register(3, 0xBEEF);
    assert_eq!(cpu.register(3), 0xBEEF);
    assert_eq!(cpu.snapshot().words[3], 0xBEEF);
}

#[test]
fn stack_pointer_is_r15() {
    let mut cpu = Cpu::new();
    cpu.set_register(15, 0x2000);
    assert_eq!(cpu.register(15), 0x2000);
}
