//! Runs a small fixed Z8002 program end to end, printing the register state
//! after each instruction. Exercises [`Cpu`] the way an embedder would: own
//! the memory, implement [`Bus`] over it, drive the core one step at a time.

use z8000::memory_access::{Bus, BusError, GetResult, SetResult};
use z8000::{Cpu, InputLine, LineState};

struct Memory {
    ram: Box<[u8; 0x10000]>,
}

impl Memory {
    fn new() -> Self {
        Self { ram: Box::new([0; 0x10000]) }
    }

    fn load(&mut self, addr: u16, words: &[u16]) {
        let mut a = addr;
        for &w in words {
            let b = w.to_be_bytes();
            self.ram[a as usize] = b[0];
            self.ram[a.wrapping_add(1) as usize] = b[1];
            a = a.wrapping_add(2);
        }
    }
}

impl Bus for Memory {
    fn read_byte(&mut self, addr: u16) -> GetResult<u8> {
        Ok(self.ram[addr as usize])
    }

    fn read_word(&mut self, addr: u16) -> GetResult<u16> {
        Ok(u16::from_be_bytes([self.ram[addr as usize], self.ram[addr.wrapping_add(1) as usize]]))
    }

    fn write_byte(&mut self, addr: u16, value: u8) -> SetResult {
        self.ram[addr as usize] = value;
        Ok(())
    }

    fn write_word(&mut self, addr: u16, value: u16) -> SetResult {
        let b = value.to_be_bytes();
        self.ram[addr as usize] = b[0];
        self.ram[addr.wrapping_add(1) as usize] = b[1];
        Ok(())
    }

    fn io_read_byte(&mut self, _port: u16) -> GetResult<u8> {
        Err(BusError)
    }

    fn io_read_word(&mut self, _port: u16) -> GetResult<u16> {
        Err(BusError)
    }

    fn io_write_byte(&mut self, _port: u16, _value: u8) -> SetResult {
        Err(BusError)
    }

    fn io_write_word(&mut self, _port: u16, _value: u16) -> SetResult {
        Err(BusError)
    }
}

fn main() {
    let mut memory = Memory::new();

    // Reset vector: system mode FCW, PC = 0x1000.
    memory.load(0x02, &[0x4000, 0x1000]);

    // LD R1, #0x0005   (LoadToReg/Word, ModeCode::Imm)
    // LD R2, #0x0007
    // ADD R1, R2       (Alu Add/Word, ModeCode::Reg over an extension word naming R2)
    // HALT requires system mode, which the reset FCW already grants.
    memory.load(
        0x1000,
        &[
            0x2111, 0x0005, // LD R1, #5   (mode=Imm, dst=R1)
            0x2112, 0x0007, // LD R2, #7   (mode=Imm, dst=R2)
            0x0101, 0x0002, // ADD R1, R2  (mode=Reg, dst=R1, src=R2)
            0x7A00, // HALT
        ],
    );

    let mut cpu = Cpu::new();
    cpu.set_psap(0);
    cpu.reset(&mut memory);
    cpu.set_input_line(InputLine::Vectored, LineState::Clear);

    loop {
        let step = cpu.execute_instruction(&mut memory);
        println!("pc={:#06x} r1={:#06x} r2={:#06x}", cpu.pc(), cpu.register(1), cpu.register(2));
        if step.trap.is_some() {
            break;
        }
        if cpu.register(1) == 0x000C {
            break;
        }
    }
}
