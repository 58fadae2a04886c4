//! End-to-end instruction coverage driven entirely through the public
//! [`Cpu`] API and the shared [`harness::Memory`] bus.

mod harness;

use harness::{set_vector, Memory};
use z8000::{Cpu, InputLine, LineState};

fn boot(mem: &mut Memory, fcw: u16, pc: u16) -> Cpu {
    set_vector(mem, 0x02, fcw, pc);
    let mut cpu = Cpu::new();
    cpu.set_register(15, 0x3000); // give every test a usable stack
    cpu.reset(mem);
    cpu
}

#[test]
fn add_updates_registers_and_flags() {
    let mut mem = Memory::new();
    let mut cpu = boot(&mut mem, 0x4000, 0x1000);
    mem.load(
        0x1000,
        &[
            0x2111, 0x0005, // LD R1, #5
            0x2112, 0x0007, // LD R2, #7
            0x0101, 0x0002, // ADD R1, R2
        ],
    );

    cpu.execute_instruction(&mut mem);
    cpu.execute_instruction(&mut mem);
    let step = cpu.execute_instruction(&mut mem);

    assert!(step.trap.is_none());
    assert_eq!(cpu.register(1), 12);
    assert_eq!(cpu.register(2), 7);
}

#[test]
fn add_sets_carry_and_zero_on_wraparound() {
    let mut mem = Memory::new();
    let mut cpu = boot(&mut mem, 0x4000, 0x1000);
    mem.load(
        0x1000,
        &[
            0x2111, 0xFFFF, // LD R1, #0xFFFF
            0x2112, 0x0001, // LD R2, #1
            0x0101, 0x0002, // ADD R1, R2
        ],
    );
    cpu.execute_instruction(&mut mem);
    cpu.execute_instruction(&mut mem);
    cpu.execute_instruction(&mut mem);

    assert_eq!(cpu.register(1), 0);
}

#[test]
fn neg_is_its_own_inverse() {
    let mut mem = Memory::new();
    let mut cpu = boot(&mut mem, 0x4000, 0x1000);
    mem.load(
        0x1000,
        &[
            0x2111, 0x1234, // LD R1, #0x1234
            0x2201, // NEG R1
            0x2201, // NEG R1
        ],
    );
    cpu.execute_instruction(&mut mem);
    cpu.execute_instruction(&mut mem);
    cpu.execute_instruction(&mut mem);
    assert_eq!(cpu.register(1), 0x1234);
}

#[test]
fn com_is_its_own_inverse() {
    let mut mem = Memory::new();
    let mut cpu = boot(&mut mem, 0x4000, 0x1000);
    mem.load(
        0x1000,
        &[
            0x2111, 0x1234, // LD R1, #0x1234
            0x2401, // COM R1
            0x2401, // COM R1
        ],
    );
    cpu.execute_instruction(&mut mem);
    cpu.execute_instruction(&mut mem);
    cpu.execute_instruction(&mut mem);
    assert_eq!(cpu.register(1), 0x1234);
}

#[test]
fn push_pop_round_trips_through_the_stack() {
    let mut mem = Memory::new();
    let mut cpu = boot(&mut mem, 0x4000, 0x1000);
    mem.load(
        0x1000,
        &[
            0x2111, 0xCAFE, // LD R1, #0xCAFE
            0x1C01, // PUSH R1
            0x1D02, // POP R2
        ],
    );
    let sp_before = cpu.register(15);
    cpu.execute_instruction(&mut mem);
    cpu.execute_instruction(&mut mem);
    cpu.execute_instruction(&mut mem);

    assert_eq!(cpu.register(2), 0xCAFE);
    assert_eq!(cpu.register(15), sp_before);
}

#[test]
fn call_then_ret_restores_pc() {
    let mut mem = Memory::new();
    let mut cpu = boot(&mut mem, 0x4000, 0x1000);
    mem.load(0x1000, &[0x6A00, 0x2000]); // CALL 0x2000
    mem.load(0x2000, &[0x6C00]); // RET (always)
    mem.load(0x1004, &[0x7D00]); // NOP, the landing spot after RET

    cpu.execute_instruction(&mut mem); // CALL
    assert_eq!(cpu.pc(), 0x2000);
    cpu.execute_instruction(&mut mem); // RET
    assert_eq!(cpu.pc(), 0x1004);
}

#[test]
fn djnz_loops_until_the_counter_hits_zero() {
    let mut mem = Memory::new();
    let mut cpu = boot(&mut mem, 0x4000, 0x1000);
    mem.load(
        0x1000,
        &[
            0x2110, 0x0003, // LD R0, #3
            0x7D00, // NOP  (loop body)
            0xF83F, // DJNZ R0, back to the NOP
            0x7A00, // HALT
        ],
    );

    cpu.execute_instruction(&mut mem); // LD
    for _ in 0..16 {
        if cpu.register(0) == 0 {
            break;
        }
        cpu.execute_instruction(&mut mem); // NOP
        cpu.execute_instruction(&mut mem); // DJNZ
    }

    assert_eq!(cpu.register(0), 0);
    assert_eq!(cpu.pc(), 0x1008);
}

#[test]
fn block_load_copies_a_run_of_words_and_terminates_on_zero_count() {
    let mut mem = Memory::new();
    let mut cpu = boot(&mut mem, 0x4000, 0x1000);
    mem.load(0x1000, &[0x9900, 0x5460]); // LDIRW R5,R4,R6 (dst=5,src=4,cnt=6)
    mem.load(0x3000, &[0xAAAA, 0xBBBB]);
    cpu.set_register(4, 0x3000); // src
    cpu.set_register(5, 0x3100); // dst
    cpu.set_register(6, 2); // count

    // One iteration per step(); the handler rewinds PC until the count hits zero.
    cpu.execute_instruction(&mut mem);
    assert_eq!(cpu.pc(), 0x1000); // not done yet, rewound
    cpu.execute_instruction(&mut mem);
    assert_eq!(cpu.pc(), 0x1004); // second and final word copied

    assert_eq!(cpu.register(6), 0);
    assert_eq!(mem.read_word_for_test(0x3100), 0xAAAA);
    assert_eq!(mem.read_word_for_test(0x3102), 0xBBBB);
}

#[test]
fn cpir_stops_early_on_the_first_matching_word() {
    let mut mem = Memory::new();
    let mut cpu = boot(&mut mem, 0x4000, 0x2000);
    mem.load(0x2000, &[0xA100, 0x3456]); // CPIR R3,@R4,R5,eq (dst=3,src=4,cnt=5,cc=eq)
    mem.load(0x1000, &[0x1111, 0x2222, 0x3333, 0x4444, 0x5555]);
    cpu.set_register(3, 0x3333); // comparand
    cpu.set_register(4, 0x1000); // source pointer
    cpu.set_register(5, 5); // count

    cpu.execute_instruction(&mut mem); // 0x1111 != 0x3333
    assert_eq!(cpu.pc(), 0x2000);
    cpu.execute_instruction(&mut mem); // 0x2222 != 0x3333
    assert_eq!(cpu.pc(), 0x2000);
    cpu.execute_instruction(&mut mem); // 0x3333 == 0x3333, stops before exhausting the count

    assert!(cpu.condition(6)); // eq
    assert_eq!(cpu.pc(), 0x2004);
    assert_eq!(cpu.register(4), 0x1006);
    assert_eq!(cpu.register(5), 2);
}

#[test]
fn multl_works_with_a_destination_register_that_is_even_but_not_a_multiple_of_four() {
    let mut mem = Memory::new();
    let mut cpu = boot(&mut mem, 0x4000, 0x1000);
    mem.load(
        0x1000,
        &[
            0x2912, 0x0000, 0x0003, // MULTL R2, #3
        ],
    );
    cpu.set_register(4, 0x0001); // dividend high word (R4:R5 = 0x000186A0)
    cpu.set_register(5, 0x86A0);

    let step = cpu.execute_instruction(&mut mem);

    assert!(step.trap.is_none());
    assert_eq!(cpu.register(2), 0x0000);
    assert_eq!(cpu.register(3), 0x0000);
    assert_eq!(cpu.register(4), 0x0004);
    assert_eq!(cpu.register(5), 0x93E0);
}

#[test]
fn shift_left_sets_carry_from_the_bit_shifted_out() {
    let mut mem = Memory::new();
    let mut cpu = boot(&mut mem, 0x4000, 0x1000);
    mem.load(
        0x1000,
        &[
            0x2111, 0x8001, // LD R1, #0x8001
            0x3901, // SLA R1, #1
        ],
    );
    cpu.execute_instruction(&mut mem);
    cpu.execute_instruction(&mut mem);
    assert_eq!(cpu.register(1), 0x0002);
}

#[test]
fn undefined_opcode_enters_extended_instruction_trap() {
    let mut mem = Memory::new();
    let mut cpu = boot(&mut mem, 0x4000, 0x1000);
    set_vector(&mut mem, 0x06, 0x4000, 0x5000); // ExtendedInstruction vector
    mem.load(0x1000, &[0xFF00]); // no descriptor claims this high byte

    let step = cpu.execute_instruction(&mut mem);

    assert!(step.trap.is_some());
    assert_eq!(cpu.pc(), 0x5000);
    assert_eq!(mem.read_word_for_test(0x2FFC), 0x1002); // saved PC
    assert_eq!(mem.read_word_for_test(0x2FFE), 0x4000); // saved FCW
}

#[test]
fn halt_in_normal_mode_is_a_privileged_instruction_trap() {
    let mut mem = Memory::new();
    let mut cpu = boot(&mut mem, 0x0000, 0x1000); // system bit clear: normal mode
    set_vector(&mut mem, 0x0A, 0x4000, 0x6000); // PrivilegedInstruction vector
    mem.load(0x1000, &[0x7A00]); // HALT

    let step = cpu.execute_instruction(&mut mem);

    assert!(step.trap.is_some());
    assert_eq!(cpu.pc(), 0x6000);
    assert!(cpu.snapshot().fcw & 0x4000 != 0); // now in system mode
}

#[test]
fn halt_in_system_mode_stops_the_core_until_an_interrupt() {
    let mut mem = Memory::new();
    let mut cpu = boot(&mut mem, 0x4000, 0x1000);
    mem.load(0x1000, &[0x7A00]);

    let step = cpu.execute_instruction(&mut mem);
    assert!(step.trap.is_none());
    assert_eq!(cpu.pc(), 0x1002);

    // A second step while halted consumes a cycle but does not advance PC.
    cpu.execute_instruction(&mut mem);
    assert_eq!(cpu.pc(), 0x1002);
}

#[test]
fn vectored_interrupt_is_taken_before_the_next_instruction() {
    let mut mem = Memory::new();
    let mut cpu = boot(&mut mem, 0x1000, 0x1000); // VIE bit set (0x1000)
    set_vector(&mut mem, 0x1E, 0x4000, 0x7000); // VectoredInterrupt vector
    mem.load(0x1000, &[0x7D00]); // NOP that must never run

    cpu.set_irq_vector(5);
    cpu.set_input_line(InputLine::Vectored, LineState::Assert);

    let step = cpu.execute_instruction(&mut mem);

    assert!(step.trap.is_some());
    assert_eq!(cpu.pc(), 0x7000);
    assert_eq!(mem.read_word_for_test(0x2FFA), 5); // pushed id, extended to a word
}

#[test]
fn ldctl_psap_round_trips() {
    let mut mem = Memory::new();
    let mut cpu = boot(&mut mem, 0x4000, 0x1000);
    mem.load(
        0x1000,
        &[
            0x2110, 0x9000, // LD R0, #0x9000
            0x8800, // LDCTL PSAP, R0  (general register -> control register)
            0x2111, 0x0000, // LD R1, #0
            0x8901, // LDCTL R1, PSAP  (control register -> general register)
        ],
    );
    cpu.execute_instruction(&mut mem);
    cpu.execute_instruction(&mut mem);
    cpu.execute_instruction(&mut mem);
    cpu.execute_instruction(&mut mem);
    assert_eq!(cpu.register(1), 0x9000);
}

#[test]
fn io_write_then_read_round_trips_through_the_port_space() {
    let mut mem = Memory::new();
    let mut cpu = boot(&mut mem, 0x4000, 0x1000);
    mem.load(
        0x1000,
        &[
            0x2112, 0xBEEF, // LD R2, #0xBEEF
            0x9402, 0x0010, // OUT @0x10, R2
            0x9003, 0x0010, // IN R3, @0x10
        ],
    );
    cpu.execute_instruction(&mut mem);
    cpu.execute_instruction(&mut mem);
    cpu.execute_instruction(&mut mem);
    assert_eq!(cpu.register(3), 0xBEEF);
}
