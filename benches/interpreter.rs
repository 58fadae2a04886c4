use criterion::{black_box, criterion_group, criterion_main, Criterion};

use z8000::memory_access::{Bus, BusError, GetResult, SetResult};
use z8000::Cpu;

struct Memory(Box<[u8; 0x10000]>);

impl Memory {
    fn new() -> Self {
        Self(Box::new([0; 0x10000]))
    }

    fn load(&mut self, addr: u16, words: &[u16]) {
        let mut a = addr;
        for &w in words {
            let b = w.to_be_bytes();
            self.0[a as usize] = b[0];
            self.0[a.wrapping_add(1) as usize] = b[1];
            a = a.wrapping_add(2);
        }
    }
}

impl Bus for Memory {
    fn read_byte(&mut self, addr: u16) -> GetResult<u8> {
        Ok(self.0[addr as usize])
    }

    fn read_word(&mut self, addr: u16) -> GetResult<u16> {
        Ok(u16::from_be_bytes([self.0[addr as usize], self.0[addr.wrapping_add(1) as usize]]))
    }

    fn write_byte(&mut self, addr: u16, value: u8) -> SetResult {
        self.0[addr as usize] = value;
        Ok(())
    }

    fn write_word(&mut self, addr: u16, value: u16) -> SetResult {
        let b = value.to_be_bytes();
        self.0[addr as usize] = b[0];
        self.0[addr.wrapping_add(1) as usize] = b[1];
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

/// A tight ADD/DJNZ loop: decrements R0 and branches back until it hits zero.
fn loop_program(c: &mut Criterion) {
    // LD R0, #0x00FF ; ADD R1, R2 ; DJNZ R0, back to the ADD ; HALT
    let program: [u16; 6] = [0x2110, 0x00FF, 0x0101, 0x0002, 0xF83E, 0x7A00];

    c.bench_function("add_djnz_loop", |b| {
        b.iter(|| {
            let mut mem = Memory::new();
            mem.load(0x02, &[0x4000, 0x1000]);
            mem.load(0x1000, &program);
            let mut cpu = Cpu::new();
            cpu.reset(&mut mem);
            black_box(cpu.run(&mut mem, 1_000_000));
        })
    });
}

criterion_group!(benches, loop_program);
criterion_main!(benches);
