//! The [`Bus`] trait implemented by the embedder's memory/IO system.

/// Returns the value asked on success, `Err(BusError)` if the embedder's
/// backing store rejected the access. Alias for `Result<T, BusError>`.
pub type GetResult<T> = Result<T, BusError>;
/// Alias for `Result<(), BusError>`.
pub type SetResult = Result<(), BusError>;

/// Raised by a [`Bus`] implementation when it cannot satisfy an access (for
/// example, an address outside the embedder's mapped range). The core
/// treats this the same way hardware treats a bus error: as an
/// extended-instruction trap, never by unwrapping the `Result` itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusError;

/// The interface the CPU core requires of its memory and I/O collaborator.
///
/// Multi-byte accesses are big-endian: the high byte of a word is stored at
/// the lower address. Unlike on some 16-bit architectures, this core does
/// not itself reject odd addresses for word/long accesses; it is up to the
/// implementor to decide whether misaligned accesses are legal on their
/// simulated bus.
pub trait Bus {
    /// Reads a byte from program/data space.
    fn read_byte(&mut self, addr: u16) -> GetResult<u8>;
    /// Reads a big-endian word from program/data space.
    fn read_word(&mut self, addr: u16) -> GetResult<u16>;

    /// Writes a byte to program/data space.
    fn write_byte(&mut self, addr: u16, value: u8) -> SetResult;
    /// Writes a big-endian word to program/data space.
    fn write_word(&mut self, addr: u16, value: u16) -> SetResult;

    /// Reads a big-endian long (two consecutive words, high word first).
    fn read_long(&mut self, addr: u16) -> GetResult<u32> {
        let hi = self.read_word(addr)?;
        let lo = self.read_word(addr.wrapping_add(2))?;
        Ok((hi as u32) << 16 | lo as u32)
    }

    /// Writes a big-endian long (two consecutive words, high word first).
    fn write_long(&mut self, addr: u16, value: u32) -> SetResult {
        self.write_word(addr, (value >> 16) as u16)?;
        self.write_word(addr.wrapping_add(2), value as u16)
    }

    /// Reads a byte from the standard I/O port space.
    fn io_read_byte(&mut self, port: u16) -> GetResult<u8>;
    /// Reads a word from the standard I/O port space.
    fn io_read_word(&mut self, port: u16) -> GetResult<u16>;
    /// Writes a byte to the standard I/O port space.
    fn io_write_byte(&mut self, port: u16, value: u8) -> SetResult;
    /// Writes a word to the standard I/O port space.
    fn io_write_word(&mut self, port: u16, value: u16) -> SetResult;

    /// Reads a byte from the special-I/O port space (`SIN`/`SINB`). Defaults
    /// to the standard I/O space for embedders that don't distinguish them.
    fn sio_read_byte(&mut self, port: u16) -> GetResult<u8> {
        self.io_read_byte(port)
    }
    /// Reads a word from the special-I/O port space.
    fn sio_read_word(&mut self, port: u16) -> GetResult<u16> {
        self.io_read_word(port)
    }
    /// Writes a byte to the special-I/O port space.
    fn sio_write_byte(&mut self, port: u16, value: u8) -> SetResult {
        self.io_write_byte(port, value)
    }
    /// Writes a word to the special-I/O port space.
    fn sio_write_word(&mut self, port: u16, value: u16) -> SetResult {
        self.io_write_word(port, value)
    }

    /// Called when the CPU executes a `RESET` instruction, to let the
    /// embedder reset any of its own peripheral state.
    fn reset_instruction(&mut self) {}
}
